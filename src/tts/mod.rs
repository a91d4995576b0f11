//! Speech-synthesis adapter.
//!
//! One production backend (OpenAI speech) plus a deterministic mock whose
//! estimated durations track word count, so assembly tests run without a
//! network or an API key.

pub mod mock;
pub mod openai;

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::database::Seconds;
use crate::error::PipelineError;

pub use mock::MockSynthesizer;
pub use openai::OpenAiTts;

#[derive(Debug, Clone, Default)]
pub struct SynthesisOptions {
    pub voice: Option<String>,
    pub model: Option<String>,
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisResult {
    pub audio_path: PathBuf,
    pub duration: Seconds,
    pub format: String,
}

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize `text` into `output_path`.
    async fn generate(
        &self,
        text: &str,
        output_path: &Path,
        options: &SynthesisOptions,
    ) -> Result<SynthesisResult, PipelineError>;

    /// Voices the backend exposes, when it supports listing them.
    fn voices(&self) -> Vec<String> {
        Vec::new()
    }
}

/// Spoken-duration estimate at a typical narration pace of ~150 words/minute.
pub(crate) fn estimate_spoken_duration(text: &str) -> Seconds {
    let words = text.split_whitespace().count();
    Seconds(words as f64 * 60.0 / 150.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spoken_duration_tracks_word_count() {
        // 150 words is one minute
        let text = "word ".repeat(150);
        assert_eq!(estimate_spoken_duration(&text), Seconds(60.0));

        let text = "one two three four five";
        assert_eq!(estimate_spoken_duration(text), Seconds(2.0));

        assert_eq!(estimate_spoken_duration(""), Seconds(0.0));
    }
}
