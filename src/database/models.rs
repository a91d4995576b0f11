use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// A duration or timestamp offset in seconds.
///
/// Transparent over `f64` so transcripts serialize as plain numbers, but the
/// chunk-merge arithmetic only ever adds and subtracts typed quantities.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Seconds(pub f64);

impl Seconds {
    pub const ZERO: Seconds = Seconds(0.0);

    pub fn get(self) -> f64 {
        self.0
    }

    pub fn max(self, other: Seconds) -> Seconds {
        Seconds(self.0.max(other.0))
    }

    pub fn min(self, other: Seconds) -> Seconds {
        Seconds(self.0.min(other.0))
    }
}

impl Add for Seconds {
    type Output = Seconds;
    fn add(self, rhs: Seconds) -> Seconds {
        Seconds(self.0 + rhs.0)
    }
}

impl Sub for Seconds {
    type Output = Seconds;
    fn sub(self, rhs: Seconds) -> Seconds {
        Seconds(self.0 - rhs.0)
    }
}

impl fmt::Display for Seconds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}s", self.0)
    }
}

impl ToSql for Seconds {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.0))
    }
}

impl FromSql for Seconds {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        f64::column_result(value).map(Seconds)
    }
}

/// How often a user receives a digest; determines the episode lookback window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Daily,
    Weekly,
}

impl Frequency {
    /// Episode lookback window for a digest run.
    pub fn window(self) -> chrono::Duration {
        match self {
            Frequency::Daily => chrono::Duration::hours(24),
            Frequency::Weekly => chrono::Duration::days(7),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Frequency::Daily => "daily",
            Frequency::Weekly => "weekly",
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for Frequency {
    fn from(s: String) -> Self {
        match s.as_str() {
            "weekly" => Frequency::Weekly,
            _ => Frequency::Daily,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeStatus {
    Pending,
    Downloading,
    Transcribing,
    Transcribed,
    Analyzing,
    Analyzed,
    Failed,
}

impl EpisodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EpisodeStatus::Pending => "pending",
            EpisodeStatus::Downloading => "downloading",
            EpisodeStatus::Transcribing => "transcribing",
            EpisodeStatus::Transcribed => "transcribed",
            EpisodeStatus::Analyzing => "analyzing",
            EpisodeStatus::Analyzed => "analyzed",
            EpisodeStatus::Failed => "failed",
        }
    }

    /// True while a pipeline stage still owns the episode.
    pub fn is_processing(self) -> bool {
        !matches!(self, EpisodeStatus::Analyzed | EpisodeStatus::Failed)
    }
}

impl Default for EpisodeStatus {
    fn default() -> Self {
        EpisodeStatus::Pending
    }
}

impl fmt::Display for EpisodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EpisodeStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "downloading" => EpisodeStatus::Downloading,
            "transcribing" => EpisodeStatus::Transcribing,
            "transcribed" => EpisodeStatus::Transcribed,
            "analyzing" => EpisodeStatus::Analyzing,
            "analyzed" => EpisodeStatus::Analyzed,
            "failed" => EpisodeStatus::Failed,
            _ => EpisodeStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DigestStatus {
    Curating,
    Pending,
    GeneratingScript,
    GeneratingAudio,
    Stitching,
    Ready,
    Failed,
}

impl DigestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DigestStatus::Curating => "curating",
            DigestStatus::Pending => "pending",
            DigestStatus::GeneratingScript => "generating_script",
            DigestStatus::GeneratingAudio => "generating_audio",
            DigestStatus::Stitching => "stitching",
            DigestStatus::Ready => "ready",
            DigestStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DigestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for DigestStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "curating" => DigestStatus::Curating,
            "generating_script" => DigestStatus::GeneratingScript,
            "generating_audio" => DigestStatus::GeneratingAudio,
            "stitching" => DigestStatus::Stitching,
            "ready" => DigestStatus::Ready,
            "failed" => DigestStatus::Failed,
            _ => DigestStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: Option<String>,
    /// Free-text topic tags, unordered.
    pub interests: Vec<String>,
    pub frequency: Frequency,
    pub digest_duration_minutes: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Podcast {
    pub id: String,
    pub rss_url: String,
    pub title: String,
    pub author: Option<String>,
    pub image_url: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: String,
    pub podcast_id: String,
    pub guid: String,
    pub title: String,
    pub audio_url: String,
    pub published_at: DateTime<Utc>,
    pub duration: Option<Seconds>,
    pub status: EpisodeStatus,
    pub transcript: Option<Transcript>,
    pub last_error: Option<String>,
}

/// One timestamped speech-to-text unit, seconds relative to the episode audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: Seconds,
    pub end: Seconds,
    pub text: String,
}

/// The canonical per-episode transcript document, persisted as JSON.
///
/// Segments are sorted by `start` ascending once persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    pub text: String,
    pub segments: Vec<TranscriptSegment>,
    pub language: String,
    pub duration: Seconds,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Clip {
    pub id: String,
    pub episode_id: String,
    pub start_time: Seconds,
    pub end_time: Seconds,
    pub duration: Seconds,
    /// Text of the covered segments, concatenated.
    pub transcript: String,
    /// Combined topic-match × depth score, 0–100.
    pub relevance_score: f64,
    pub reasoning: String,
    pub summary: String,
    /// Set once a digest adopts the clip.
    pub digest_id: Option<String>,
}

/// Clip candidate payload produced by the analysis stage before ids exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewClip {
    pub start_time: Seconds,
    pub end_time: Seconds,
    pub transcript: String,
    pub relevance_score: f64,
    pub reasoning: String,
    pub summary: String,
}

/// A clip joined with its episode and podcast for curation prompts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipWithEpisode {
    pub clip: Clip,
    pub episode_title: String,
    pub podcast_title: String,
    pub episode_audio_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    pub id: String,
    pub user_id: String,
    pub status: DigestStatus,
    /// Primary source podcast, if one dominates.
    pub podcast_id: Option<String>,
    pub episode_ids: Vec<String>,
    /// Serialized [`NarratorScript`] JSON.
    pub narrator_script: Option<String>,
    pub audio_url: Option<String>,
    pub duration: Option<Seconds>,
    pub is_public: bool,
    pub share_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestClip {
    pub id: String,
    pub digest_id: String,
    pub clip_id: String,
    /// 0-based playback position, contiguous per digest.
    pub position: i64,
}

/// A digest clip joined through to its clip, episode and podcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DigestClipDetail {
    pub position: i64,
    pub clip: Clip,
    pub episode_title: String,
    pub episode_audio_url: String,
    pub podcast_title: String,
}

/// Narration pieces wrapped around the clips, persisted as a JSON string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NarratorScript {
    pub intro: String,
    pub transitions: Vec<String>,
    pub outro: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Waiting,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "active" => JobStatus::Active,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Waiting,
        }
    }
}

/// One durable queue entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub queue: String,
    pub name: String,
    /// Caller-supplied dedup key; at most one waiting/active job per key.
    pub dedup_key: Option<String>,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub attempts_made: i64,
    pub max_attempts: i64,
    pub backoff_delay_ms: i64,
    pub progress: i64,
    pub last_error: Option<String>,
    pub run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Wall-clock of the completed run, for observability.
    pub duration_ms: Option<i64>,
}
