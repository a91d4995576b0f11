use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use super::{SpeechToText, SttResult, TranscribeOptions};
use crate::database::{Seconds, TranscriptSegment};
use crate::error::PipelineError;

/// Local transcription via a whisper wrapper subprocess.
///
/// The wrapper prints one JSON document on stdout:
/// `{"text": …, "language": …, "duration": …, "segments": [{start, end, text}]}`
/// with timestamps in seconds. Diagnostics go to stderr.
pub struct LocalStt {
    command: PathBuf,
    model: String,
    model_path: Option<PathBuf>,
}

impl LocalStt {
    pub fn new(command: impl Into<PathBuf>, model: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            model: model.into(),
            model_path: None,
        }
    }

    /// Pin a model file on disk; it takes precedence over any model name.
    pub fn with_model_path(mut self, model_path: Option<PathBuf>) -> Self {
        self.model_path = model_path;
        self
    }

    fn model_argument(&self, options: &TranscribeOptions) -> std::ffi::OsString {
        match &self.model_path {
            Some(path) => path.clone().into_os_string(),
            None => options
                .model
                .clone()
                .unwrap_or_else(|| self.model.clone())
                .into(),
        }
    }
}

#[async_trait]
impl SpeechToText for LocalStt {
    async fn transcribe(
        &self,
        path: &Path,
        options: &TranscribeOptions,
    ) -> Result<SttResult, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::NotFound(format!(
                "audio file {}",
                path.display()
            )));
        }

        let mut command = Command::new(&self.command);
        command
            .arg(path)
            .arg("--model")
            .arg(self.model_argument(options))
            .args(["--output", "json"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(language) = &options.language {
            command.args(["--language", language]);
        }

        log::info!("Running local transcription: {:?}", path);
        let output = command.output().await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PipelineError::Unavailable(format!(
                    "transcription command {} not installed",
                    self.command.display()
                ))
            } else {
                e.into()
            }
        })?;

        if !output.status.success() {
            return Err(PipelineError::Subprocess {
                program: self.command.to_string_lossy().into_owned(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let parsed: WhisperOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Parse(format!("whisper output: {e}")))?;

        Ok(SttResult {
            text: parsed.text.trim().to_string(),
            segments: parsed
                .segments
                .into_iter()
                .map(|s| TranscriptSegment {
                    start: Seconds(s.start),
                    end: Seconds(s.end),
                    text: s.text.trim().to_string(),
                })
                .collect(),
            language: parsed.language,
            duration: parsed.duration.map(Seconds),
        })
    }
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    text: String,
    language: Option<String>,
    duration: Option<f64>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
}
