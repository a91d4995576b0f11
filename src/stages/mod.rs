//! Pipeline stage handlers and their job payloads.
//!
//! Payload field names are camelCase on the wire so job rows stay readable
//! alongside the API surface that enqueues them.

pub mod analysis;
pub mod assembly;
pub mod curation;
pub mod prompts;
pub mod transcription;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::database::{EnqueueOptions, Frequency};

pub use analysis::AnalysisStage;
pub use assembly::AssemblyStage;
pub use curation::CurationStage;
pub use transcription::TranscriptionStage;

pub const TRANSCRIPTION_QUEUE: &str = "transcription";
pub const ANALYSIS_QUEUE: &str = "analysis";
pub const CURATION_QUEUE: &str = "curation";
pub const DIGEST_QUEUE: &str = "digest";
pub const ORCHESTRATOR_QUEUE: &str = "orchestrator";

const DEFAULT_ATTEMPTS: i64 = 3;
const DEFAULT_BACKOFF_MS: i64 = 5_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptionPayload {
    pub episode_id: String,
    pub audio_url: String,
}

impl TranscriptionPayload {
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            job_id: Some(format!("transcription-{}", self.episode_id)),
            max_attempts: DEFAULT_ATTEMPTS,
            backoff_delay_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisPayload {
    pub episode_id: String,
    pub user_id: String,
    pub user_interests: Vec<String>,
}

impl AnalysisPayload {
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            job_id: Some(format!("analysis-{}-{}", self.episode_id, self.user_id)),
            max_attempts: DEFAULT_ATTEMPTS,
            backoff_delay_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ClipCountRange {
    pub min: usize,
    pub max: usize,
}

impl Default for ClipCountRange {
    fn default() -> Self {
        Self { min: 6, max: 8 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurationPayload {
    pub digest_id: String,
    pub user_id: String,
    pub episode_ids: Vec<String>,
    pub user_interests: Vec<String>,
    /// Target total clip duration in seconds (default 420).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_clip_count: Option<ClipCountRange>,
}

impl CurationPayload {
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            job_id: Some(format!("curation-{}", self.digest_id)),
            max_attempts: DEFAULT_ATTEMPTS,
            backoff_delay_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

/// Narrator files from a previous partially-complete run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExistingTtsPaths {
    pub intro: PathBuf,
    pub transitions: Vec<PathBuf>,
    pub outro: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestPayload {
    pub digest_id: String,
    pub user_id: String,
    #[serde(default)]
    pub clip_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub podcast_id: Option<String>,
    #[serde(default)]
    pub episode_ids: Vec<String>,
    #[serde(default)]
    pub skip_script_generation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_tts_paths: Option<ExistingTtsPaths>,
}

impl DigestPayload {
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            job_id: Some(format!("digest-{}", self.digest_id)),
            max_attempts: DEFAULT_ATTEMPTS,
            backoff_delay_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrchestratorPayload {
    pub user_id: String,
    pub frequency: Frequency,
}

impl OrchestratorPayload {
    /// Orchestrator runs are not deduplicated and get a single attempt.
    pub fn enqueue_options(&self) -> EnqueueOptions {
        EnqueueOptions {
            job_id: None,
            max_attempts: 1,
            backoff_delay_ms: DEFAULT_BACKOFF_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_are_camel_case_on_the_wire() {
        let payload = TranscriptionPayload {
            episode_id: "e1".into(),
            audio_url: "http://x/a.mp3".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["episodeId"], "e1");
        assert_eq!(json["audioUrl"], "http://x/a.mp3");
    }

    #[test]
    fn dedup_keys_follow_the_queue_contract() {
        let t = TranscriptionPayload {
            episode_id: "e1".into(),
            audio_url: String::new(),
        };
        assert_eq!(
            t.enqueue_options().job_id.as_deref(),
            Some("transcription-e1")
        );
        assert_eq!(t.enqueue_options().max_attempts, 3);
        assert_eq!(t.enqueue_options().backoff_delay_ms, 5_000);

        let a = AnalysisPayload {
            episode_id: "e1".into(),
            user_id: "u1".into(),
            user_interests: vec![],
        };
        assert_eq!(a.enqueue_options().job_id.as_deref(), Some("analysis-e1-u1"));

        let o = OrchestratorPayload {
            user_id: "u1".into(),
            frequency: Frequency::Daily,
        };
        assert_eq!(o.enqueue_options().job_id, None);
        assert_eq!(o.enqueue_options().max_attempts, 1);
    }

    #[test]
    fn digest_payload_defaults_optional_fields() {
        let parsed: DigestPayload =
            serde_json::from_str(r#"{"digestId": "d1", "userId": "u1"}"#).unwrap();
        assert!(!parsed.skip_script_generation);
        assert!(parsed.existing_tts_paths.is_none());
        assert!(parsed.clip_ids.is_empty());
    }
}
