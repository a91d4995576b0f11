use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

use super::{estimate_spoken_duration, SpeechSynthesizer, SynthesisOptions, SynthesisResult};
use crate::error::PipelineError;

const BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "tts-1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// OpenAI speech backend; writes MP3 responses straight to disk.
pub struct OpenAiTts {
    client: reqwest::Client,
    api_key: String,
    default_voice: String,
}

impl OpenAiTts {
    pub fn new(api_key: impl Into<String>, default_voice: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key: api_key.into(),
            default_voice: default_voice.into(),
        }
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiTts {
    async fn generate(
        &self,
        text: &str,
        output_path: &Path,
        options: &SynthesisOptions,
    ) -> Result<SynthesisResult, PipelineError> {
        let voice = options.voice.as_deref().unwrap_or(&self.default_voice);
        let model = options.model.as_deref().unwrap_or(DEFAULT_MODEL);

        log::info!(
            "Synthesizing {} chars with voice {} to {:?}",
            text.len(),
            voice,
            output_path
        );

        let body = SpeechRequest {
            model,
            input: text,
            voice,
            response_format: "mp3",
            speed: options.speed,
        };
        let response = self
            .client
            .post(format!("{BASE_URL}/audio/speech"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::HttpStatus {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let bytes = response.bytes().await?;
        if bytes.is_empty() {
            return Err(PipelineError::NoContent("tts returned empty audio".into()));
        }

        if let Some(parent) = output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_path, &bytes).await?;

        Ok(SynthesisResult {
            audio_path: output_path.to_path_buf(),
            duration: estimate_spoken_duration(text),
            format: "mp3".to_string(),
        })
    }

    fn voices(&self) -> Vec<String> {
        ["alloy", "echo", "fable", "onyx", "nova", "shimmer"]
            .iter()
            .map(|v| v.to_string())
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_is_omitted_when_unset() {
        let body = SpeechRequest {
            model: "tts-1",
            input: "hello",
            voice: "alloy",
            response_format: "mp3",
            speed: None,
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(!json.contains("speed"));
        assert!(json.contains(r#""voice":"alloy""#));
    }
}
