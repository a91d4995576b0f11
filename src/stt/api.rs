use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use super::{SpeechToText, SttResult, TranscribeOptions};
use crate::database::{Seconds, TranscriptSegment};
use crate::error::PipelineError;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Remote transcription over an OpenAI-compatible `audio/transcriptions`
/// endpoint, requesting `verbose_json` for segment timestamps.
pub struct ApiStt {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ApiStt {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    #[allow(dead_code)]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl SpeechToText for ApiStt {
    async fn transcribe(
        &self,
        path: &Path,
        options: &TranscribeOptions,
    ) -> Result<SttResult, PipelineError> {
        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio.mp3".to_string());

        log::info!(
            "Transcribing {} ({} bytes) via API",
            file_name,
            bytes.len()
        );

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("audio/mpeg")
            .map_err(|e| PipelineError::Transport(e.to_string()))?;
        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", options.model.clone().unwrap_or_else(|| self.model.clone()))
            .text("response_format", "verbose_json");
        if let Some(language) = &options.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.base_url))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let parsed: VerboseTranscription = response
            .json()
            .await
            .map_err(|e| PipelineError::Parse(format!("transcription response: {e}")))?;

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
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    language: Option<String>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    text: String,
}
