//! Stage-level flows against a real SQLite store with scripted adapters:
//! no network, no ffmpeg, no API keys.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use sifter::audio::AudioToolkit;
use sifter::cache::BlobCache;
use sifter::config::Config;
use sifter::database::{
    Database, DigestStatus, EpisodeStatus, Frequency, NewClip, Seconds, Transcript,
    TranscriptSegment,
};
use sifter::download::Downloader;
use sifter::error::PipelineError;
use sifter::llm::{ChatCompleter, CompletionRequest, CompletionResponse, Provider, TokenUsage};
use sifter::queue::{InlineContext, JobHandler};
use sifter::services::Services;
use sifter::stages::{
    AnalysisPayload, AnalysisStage, CurationPayload, CurationStage, TranscriptionPayload,
    TranscriptionStage,
};
use sifter::stt::{SpeechToText, SttResult, TranscribeOptions};
use sifter::tts::MockSynthesizer;

/// Replays canned completions in order and counts calls.
struct ScriptedChat {
    responses: Mutex<VecDeque<String>>,
    calls: AtomicU32,
}

impl ScriptedChat {
    fn new(responses: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            calls: AtomicU32::new(0),
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatCompleter for ScriptedChat {
    async fn complete(
        &self,
        _request: &CompletionRequest,
    ) -> Result<CompletionResponse, PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| PipelineError::NoContent("scripted chat exhausted".into()))?;
        Ok(CompletionResponse {
            content,
            model: "scripted".to_string(),
            usage: TokenUsage::default(),
            provider: Provider::OpenAi,
        })
    }
}

struct FixedStt;

#[async_trait]
impl SpeechToText for FixedStt {
    async fn transcribe(
        &self,
        _path: &Path,
        _options: &TranscribeOptions,
    ) -> Result<SttResult, PipelineError> {
        Err(PipelineError::Unavailable("not under test".into()))
    }
}

fn test_services(temp: &TempDir, llm: Arc<ScriptedChat>) -> Arc<Services> {
    let config = Config {
        database_path: temp.path().join("test.db"),
        temp_root: temp.path().join("tmp"),
        digest_root: temp.path().join("digests"),
        ..Config::default()
    };
    let db = Arc::new(Database::new(&config.database_path).unwrap());
    Arc::new(Services {
        db,
        cache: BlobCache::new(config.temp_root.clone()),
        audio: Arc::new(AudioToolkit::new("ffmpeg", "ffprobe")),
        downloader: Downloader::new(Duration::from_secs(5)).unwrap(),
        stt: Arc::new(FixedStt),
        llm,
        tts: Arc::new(MockSynthesizer::new()),
        config,
    })
}

fn seed_transcribed_episode(db: &Database) -> (String, String) {
    let user = db
        .create_user(
            "listener@example.com",
            Some("Sam"),
            &["ai".to_string(), "startups".to_string()],
            Frequency::Daily,
            7,
        )
        .unwrap();
    let podcast = db
        .create_podcast("http://example.com/feed.xml", "Deep Dive", None, None)
        .unwrap();
    let (episode, _) = db
        .upsert_episode(
            &podcast.id,
            "guid-1",
            "Episode One",
            "http://example.com/ep1.mp3",
            chrono::Utc::now(),
            None,
        )
        .unwrap();

    let segments: Vec<TranscriptSegment> = (0..60)
        .map(|i| TranscriptSegment {
            start: Seconds(i as f64 * 20.0),
            end: Seconds((i + 1) as f64 * 20.0),
            text: format!("segment {i}"),
        })
        .collect();
    let transcript = Transcript {
        text: segments
            .iter()
            .map(|s| s.text.clone())
            .collect::<Vec<_>>()
            .join(" "),
        segments,
        language: "en".to_string(),
        duration: Seconds(1200.0),
    };
    db.save_transcript(&episode.id, &transcript).unwrap();
    (user.id, episode.id)
}

fn analysis_ctx(episode_id: &str, user_id: &str) -> InlineContext {
    let payload = AnalysisPayload {
        episode_id: episode_id.to_string(),
        user_id: user_id.to_string(),
        user_interests: vec!["ai".to_string()],
    };
    InlineContext::new("test-analysis", serde_json::to_value(&payload).unwrap())
}

#[tokio::test]
async fn analysis_persists_validated_clips_and_is_idempotent() {
    let temp = TempDir::new().unwrap();
    // Three in-range clips plus one past the transcript end, fenced like a
    // real model reply
    let reply = r#"Here are the clips:
```json
{"clips": [
  {"startTime": 20, "endTime": 140, "transcript": "a", "relevanceScore": 92, "reasoning": "deep story", "summary": "story"},
  {"startTime": 400, "endTime": 520, "transcript": "b", "relevanceScore": 85, "reasoning": "case study", "summary": "case"},
  {"startTime": 900, "endTime": 1020, "transcript": "c", "relevanceScore": 78, "reasoning": "numbers", "summary": "numbers"},
  {"startTime": 1150, "endTime": 1350, "transcript": "d", "relevanceScore": 99, "reasoning": "past the end", "summary": "invalid"}
]}
```"#;
    let llm = ScriptedChat::new(&[reply]);
    let services = test_services(&temp, llm.clone());
    let (user_id, episode_id) = seed_transcribed_episode(&services.db);

    let stage = AnalysisStage::new(services.clone());
    stage
        .handle(&analysis_ctx(&episode_id, &user_id))
        .await
        .unwrap();

    let clips = services.db.get_clips_for_episode(&episode_id).unwrap();
    assert_eq!(clips.len(), 3, "out-of-range clip must be dropped");
    assert!(clips
        .iter()
        .all(|c| c.end_time.get() <= 1200.0 && c.start_time < c.end_time));
    let episode = services.db.get_episode(&episode_id).unwrap().unwrap();
    assert_eq!(episode.status, EpisodeStatus::Analyzed);

    // Re-enqueueing analysis for an analyzed episode returns the existing
    // clips without another model call
    assert_eq!(llm.call_count(), 1);
    stage
        .handle(&analysis_ctx(&episode_id, &user_id))
        .await
        .unwrap();
    assert_eq!(llm.call_count(), 1);
    assert_eq!(services.db.get_clips_for_episode(&episode_id).unwrap().len(), 3);
}

fn transcription_ctx(episode_id: &str) -> InlineContext {
    let payload = TranscriptionPayload {
        episode_id: episode_id.to_string(),
        audio_url: "http://192.0.2.1:9/never-fetched.mp3".to_string(),
    };
    InlineContext::new("test-transcription", serde_json::to_value(&payload).unwrap())
}

#[tokio::test]
async fn transcription_is_a_noop_for_a_transcribed_episode() {
    let temp = TempDir::new().unwrap();
    let services = test_services(&temp, ScriptedChat::new(&[]));
    let (_, episode_id) = seed_transcribed_episode(&services.db);
    let before = services.db.get_episode(&episode_id).unwrap().unwrap();

    // The payload points at an unreachable URL: a no-op must never download
    TranscriptionStage::new(services.clone())
        .handle(&transcription_ctx(&episode_id))
        .await
        .unwrap();

    let after = services.db.get_episode(&episode_id).unwrap().unwrap();
    assert_eq!(after.status, EpisodeStatus::Transcribed);
    assert_eq!(after.transcript, before.transcript);
}

#[tokio::test]
async fn transcription_fails_fast_when_episode_is_claimed() {
    let temp = TempDir::new().unwrap();
    let services = test_services(&temp, ScriptedChat::new(&[]));
    let db = &services.db;

    let podcast = db
        .create_podcast("http://example.com/f2.xml", "Pod", None, None)
        .unwrap();
    let (episode, _) = db
        .upsert_episode(
            &podcast.id,
            "g2",
            "Ep",
            "http://example.com/e2.mp3",
            chrono::Utc::now(),
            None,
        )
        .unwrap();
    db.transition_episode(
        &episode.id,
        &[EpisodeStatus::Pending],
        EpisodeStatus::Downloading,
    )
    .unwrap();

    let err = TranscriptionStage::new(services.clone())
        .handle(&transcription_ctx(&episode.id))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Busy(_)));
    // A busy conflict must not clobber the owner's status
    assert_eq!(
        db.get_episode(&episode.id).unwrap().unwrap().status,
        EpisodeStatus::Downloading
    );
}

#[tokio::test]
async fn analysis_fails_fast_when_already_analyzing() {
    let temp = TempDir::new().unwrap();
    let llm = ScriptedChat::new(&[]);
    let services = test_services(&temp, llm.clone());
    let (user_id, episode_id) = seed_transcribed_episode(&services.db);

    services
        .db
        .transition_episode(
            &episode_id,
            &[EpisodeStatus::Transcribed],
            EpisodeStatus::Analyzing,
        )
        .unwrap();

    let err = AnalysisStage::new(services.clone())
        .handle(&analysis_ctx(&episode_id, &user_id))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Busy(_)));
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn analysis_requires_a_transcript() {
    let temp = TempDir::new().unwrap();
    let llm = ScriptedChat::new(&[]);
    let services = test_services(&temp, llm);
    let db = &services.db;

    let user = db
        .create_user("u@example.com", None, &[], Frequency::Daily, 7)
        .unwrap();
    let podcast = db
        .create_podcast("http://example.com/f.xml", "Pod", None, None)
        .unwrap();
    let (episode, _) = db
        .upsert_episode(
            &podcast.id,
            "g1",
            "Ep",
            "http://example.com/e.mp3",
            chrono::Utc::now(),
            None,
        )
        .unwrap();

    let err = AnalysisStage::new(services.clone())
        .handle(&analysis_ctx(&episode.id, &user.id))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvariantViolation(_)));
}

fn seed_digest_with_candidates(db: &Database) -> (String, String, Vec<String>) {
    let (user_id, episode_id) = seed_transcribed_episode(db);
    let candidates: Vec<NewClip> = (0..10)
        .map(|i| NewClip {
            start_time: Seconds(i as f64 * 100.0),
            end_time: Seconds(i as f64 * 100.0 + 90.0),
            transcript: format!("clip text {i}"),
            relevance_score: 100.0 - i as f64,
            reasoning: String::new(),
            summary: format!("summary {i}"),
        })
        .collect();
    let clips = db.replace_clips(&episode_id, &candidates).unwrap();
    let digest = db
        .create_digest(&user_id, DigestStatus::Curating, None, &[episode_id.clone()])
        .unwrap();
    (
        digest.id,
        episode_id,
        clips.into_iter().map(|c| c.id).collect(),
    )
}

fn curation_ctx(digest_id: &str, episode_id: &str) -> InlineContext {
    let payload = CurationPayload {
        digest_id: digest_id.to_string(),
        user_id: "u".to_string(),
        episode_ids: vec![episode_id.to_string()],
        user_interests: vec!["ai".to_string()],
        target_duration: None,
        target_clip_count: None,
    };
    InlineContext::new("test-curation", serde_json::to_value(&payload).unwrap())
}

#[tokio::test]
async fn curation_backfills_to_the_minimum_clip_count() {
    let temp = TempDir::new().unwrap();
    // Response ids are patched in after we know the real clip ids
    let placeholder_llm = ScriptedChat::new(&[]);
    let services = test_services(&temp, placeholder_llm);
    let (digest_id, episode_id, clip_ids) = seed_digest_with_candidates(&services.db);

    // Model picks 3 real clips and hallucinates 2 ids
    let reply = format!(
        r#"{{"selectedClipIds": ["{}", "ghost-a", "{}", "ghost-b", "{}"],
            "reasoning": "diverse picks", "estimatedDuration": 270, "topicCoverage": ["ai"]}}"#,
        clip_ids[4], clip_ids[7], clip_ids[2]
    );
    let llm = ScriptedChat::new(&[reply.as_str()]);
    let services = Arc::new(Services {
        db: services.db.clone(),
        cache: BlobCache::new(services.config.temp_root.clone()),
        audio: Arc::new(AudioToolkit::new("ffmpeg", "ffprobe")),
        downloader: Downloader::new(Duration::from_secs(5)).unwrap(),
        stt: Arc::new(FixedStt),
        llm: llm.clone(),
        tts: Arc::new(MockSynthesizer::new()),
        config: services.config.clone(),
    });

    CurationStage::new(services.clone())
        .handle(&curation_ctx(&digest_id, &episode_id))
        .await
        .unwrap();

    let details = services.db.get_digest_clip_details(&digest_id).unwrap();
    assert_eq!(details.len(), 6, "greedy fill must reach the minimum");
    // Positions are a contiguous 0-based range
    assert_eq!(
        details.iter().map(|d| d.position).collect::<Vec<_>>(),
        vec![0, 1, 2, 3, 4, 5]
    );
    // Model picks survive in order, then highest-scored fill
    assert_eq!(details[0].clip.id, clip_ids[4]);
    assert_eq!(details[1].clip.id, clip_ids[7]);
    assert_eq!(details[2].clip.id, clip_ids[2]);
    assert_eq!(details[3].clip.id, clip_ids[0]);

    let digest = services.db.get_digest(&digest_id).unwrap().unwrap();
    assert_eq!(digest.status, DigestStatus::Pending);
    assert!(digest.narrator_script.is_none());
    // Selected clips carry the digest back-reference
    assert!(details
        .iter()
        .all(|d| d.clip.digest_id.as_deref() == Some(digest_id.as_str())));
}

#[tokio::test]
async fn curation_is_a_noop_once_clips_and_script_exist() {
    let temp = TempDir::new().unwrap();
    let llm = ScriptedChat::new(&[]);
    let services = test_services(&temp, llm.clone());
    let (digest_id, episode_id, clip_ids) = seed_digest_with_candidates(&services.db);

    services
        .db
        .replace_digest_clips(&digest_id, &clip_ids[..6])
        .unwrap();
    services
        .db
        .set_digest_script(
            &digest_id,
            r#"{"intro":"hi","transitions":["a","b","c","d","e"],"outro":"bye"}"#,
        )
        .unwrap();

    CurationStage::new(services.clone())
        .handle(&curation_ctx(&digest_id, &episode_id))
        .await
        .unwrap();

    assert_eq!(llm.call_count(), 0, "no model call for a curated digest");
    let digest = services.db.get_digest(&digest_id).unwrap().unwrap();
    assert!(digest.narrator_script.is_some());
    assert_eq!(services.db.count_digest_clips(&digest_id).unwrap(), 6);
}

#[tokio::test]
async fn curation_without_candidates_marks_the_digest_failed() {
    let temp = TempDir::new().unwrap();
    let llm = ScriptedChat::new(&[]);
    let services = test_services(&temp, llm);
    let db = &services.db;

    let user = db
        .create_user("x@example.com", None, &[], Frequency::Weekly, 7)
        .unwrap();
    let podcast = db
        .create_podcast("http://example.com/f.xml", "Pod", None, None)
        .unwrap();
    let (episode, _) = db
        .upsert_episode(
            &podcast.id,
            "g1",
            "Ep",
            "http://example.com/e.mp3",
            chrono::Utc::now(),
            None,
        )
        .unwrap();
    let digest = db
        .create_digest(&user.id, DigestStatus::Curating, None, &[episode.id.clone()])
        .unwrap();

    let err = CurationStage::new(services.clone())
        .handle(&curation_ctx(&digest.id, &episode.id))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::InvariantViolation(_)));
    assert_eq!(
        db.get_digest(&digest.id).unwrap().unwrap().status,
        DigestStatus::Failed
    );
}
