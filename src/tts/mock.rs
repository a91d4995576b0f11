use async_trait::async_trait;
use std::path::Path;

use super::{estimate_spoken_duration, SpeechSynthesizer, SynthesisOptions, SynthesisResult};
use crate::error::PipelineError;

/// Bytes per second of 128 kbps MP3; the mock sizes its output so the
/// size-derived duration matches the word-count estimate.
const BYTES_PER_SECOND: f64 = 128.0 * 1024.0 / 8.0;

/// Deterministic test backend: no network, no audio decoding.
///
/// Writes a placeholder file whose length encodes the estimated spoken
/// duration (~150 words/minute), so downstream size arithmetic behaves like
/// real narration.
#[derive(Debug, Default, Clone)]
pub struct MockSynthesizer;

impl MockSynthesizer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn generate(
        &self,
        text: &str,
        output_path: &Path,
        _options: &SynthesisOptions,
    ) -> Result<SynthesisResult, PipelineError> {
        let duration = estimate_spoken_duration(text);
        let size = ((duration.get() * BYTES_PER_SECOND) as usize).max(1);

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_path, vec![0u8; size]).await?;

        log::debug!(
            "Mock TTS wrote {:?}: {} words, {}",
            output_path,
            text.split_whitespace().count(),
            duration
        );

        Ok(SynthesisResult {
            audio_path: output_path.to_path_buf(),
            duration,
            format: "mp3".to_string(),
        })
    }

    fn voices(&self) -> Vec<String> {
        vec!["mock".to_string()]
    }
}
