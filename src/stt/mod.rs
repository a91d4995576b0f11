//! Speech-to-text adapter.
//!
//! Two variants: a remote transcription API and a local whisper wrapper.
//! Neither chunks input; chunking is the transcription stage's job. Segment
//! timestamps are always seconds relative to the input file's start.

pub mod api;
pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::database::{Seconds, TranscriptSegment};
use crate::error::PipelineError;

pub use api::ApiStt;
pub use local::LocalStt;

#[derive(Debug, Clone, Default)]
pub struct TranscribeOptions {
    /// Pin the language instead of auto-detecting (BCP-47-ish tag).
    pub language: Option<String>,
    pub model: Option<String>,
}

/// Transcription of one audio file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SttResult {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: Option<String>,
    pub duration: Option<Seconds>,
}

#[async_trait]
pub trait SpeechToText: Send + Sync {
    async fn transcribe(
        &self,
        path: &Path,
        options: &TranscribeOptions,
    ) -> Result<SttResult, PipelineError>;
}
