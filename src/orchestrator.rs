//! End-to-end driver: from "user wants a digest" to a published MP3.
//!
//! Fans episodes out to the transcription and analysis queues, polls until
//! the fan-out settles (or the ceiling hits), then runs curation and assembly
//! inline through the same stage bodies the queue workers use.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;

use crate::database::{DigestStatus, Episode, EpisodeStatus, Frequency, Seconds};
use crate::error::PipelineError;
use crate::queue::{payload, InlineContext, JobHandler, JobQueue, StageContext};
use crate::services::Services;
use crate::stages::{
    AnalysisPayload, AssemblyStage, CurationPayload, CurationStage, DigestPayload,
    OrchestratorPayload, TranscriptionPayload, ANALYSIS_QUEUE, TRANSCRIPTION_QUEUE,
};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DigestSummary {
    pub digest_id: String,
    pub audio_url: String,
    pub duration: Seconds,
    pub episode_count: usize,
    pub clip_count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DigestOutcome {
    NoEpisodes,
    Completed(DigestSummary),
}

/// Episodes split by where they stand in the per-episode pipeline.
#[derive(Debug, Default)]
struct EpisodePartition {
    analyzed: Vec<Episode>,
    failed: Vec<Episode>,
    processing: Vec<Episode>,
}

fn partition_episodes(episodes: Vec<Episode>) -> EpisodePartition {
    let mut partition = EpisodePartition::default();
    for episode in episodes {
        match episode.status {
            EpisodeStatus::Analyzed => partition.analyzed.push(episode),
            EpisodeStatus::Failed => partition.failed.push(episode),
            _ => partition.processing.push(episode),
        }
    }
    partition
}

/// Most frequent podcast among the source episodes becomes the digest's
/// primary source.
fn primary_podcast_id(episodes: &[Episode]) -> Option<String> {
    let mut counts: Vec<(&str, usize)> = Vec::new();
    for episode in episodes {
        match counts.iter_mut().find(|(id, _)| *id == episode.podcast_id) {
            Some((_, n)) => *n += 1,
            None => counts.push((&episode.podcast_id, 1)),
        }
    }
    counts
        .into_iter()
        .max_by_key(|(_, n)| *n)
        .map(|(id, _)| id.to_string())
}

pub struct OrchestratorStage {
    services: Arc<Services>,
}

impl OrchestratorStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    pub async fn run_digest(
        &self,
        ctx: &dyn StageContext,
        user_id: &str,
        frequency: Frequency,
    ) -> Result<DigestOutcome, PipelineError> {
        let services = &self.services;
        let db = &services.db;
        let queue = JobQueue::new(db.clone());

        let user = db
            .get_user(user_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("user {user_id}")))?;

        // 1. Collect the episode window across subscriptions
        let podcast_ids = db.subscribed_podcast_ids(&user.id)?;
        let since = chrono::Utc::now() - frequency.window();
        let episodes = db.recent_episodes(&podcast_ids, since)?;
        if episodes.is_empty() {
            ctx.log("No recent episodes in the window");
            return Ok(DigestOutcome::NoEpisodes);
        }
        ctx.log(&format!(
            "Found {} episodes across {} podcasts",
            episodes.len(),
            podcast_ids.len()
        ));

        // 2. Fan out transcription and analysis
        let mut analysis_enqueued: HashSet<String> = HashSet::new();
        for episode in &episodes {
            match episode.status {
                EpisodeStatus::Pending | EpisodeStatus::Failed => {
                    if episode.status == EpisodeStatus::Failed {
                        db.transition_episode(
                            &episode.id,
                            &[EpisodeStatus::Failed],
                            EpisodeStatus::Pending,
                        )?;
                    }
                    let job = TranscriptionPayload {
                        episode_id: episode.id.clone(),
                        audio_url: episode.audio_url.clone(),
                    };
                    queue.add(
                        TRANSCRIPTION_QUEUE,
                        "transcribe-episode",
                        &serde_json::to_value(&job)?,
                        &job.enqueue_options(),
                    )?;
                }
                EpisodeStatus::Transcribed => {
                    self.enqueue_analysis(&queue, episode, &user.id, &user.interests)?;
                    analysis_enqueued.insert(episode.id.clone());
                }
                _ => {}
            }
        }

        // 3. Poll until the fan-out settles or the ceiling hits
        let episode_ids: Vec<String> = episodes.iter().map(|e| e.id.clone()).collect();
        let total = episode_ids.len();
        let deadline = Instant::now() + services.config.poll_ceiling;
        let partition = loop {
            tokio::time::sleep(services.config.poll_interval).await;

            let current = db.get_episodes_by_ids(&episode_ids)?;
            for episode in &current {
                if episode.status == EpisodeStatus::Transcribed
                    && !analysis_enqueued.contains(&episode.id)
                {
                    self.enqueue_analysis(&queue, episode, &user.id, &user.interests)?;
                    analysis_enqueued.insert(episode.id.clone());
                }
            }

            let partition = partition_episodes(current);
            let settled = partition.analyzed.len() + partition.failed.len();
            ctx.update_progress(((settled * 50).div_ceil(total)).min(50) as u8);

            if partition.processing.is_empty() {
                break partition;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "Poll ceiling reached with {} episodes still processing",
                    partition.processing.len()
                );
                break partition;
            }
        };

        if partition.analyzed.is_empty() {
            return Err(PipelineError::InvariantViolation(format!(
                "no episodes reached analysis for user {} ({} failed)",
                user.id,
                partition.failed.len()
            )));
        }
        ctx.log(&format!(
            "{} analyzed, {} failed, {} still processing",
            partition.analyzed.len(),
            partition.failed.len(),
            partition.processing.len()
        ));

        // 4. Create the digest and finish inline
        let analyzed_ids: Vec<String> =
            partition.analyzed.iter().map(|e| e.id.clone()).collect();
        let digest = db.create_digest(
            &user.id,
            DigestStatus::Curating,
            primary_podcast_id(&partition.analyzed).as_deref(),
            &analyzed_ids,
        )?;
        ctx.log(&format!("Created digest {}", digest.id));

        let curation_job = CurationPayload {
            digest_id: digest.id.clone(),
            user_id: user.id.clone(),
            episode_ids: analyzed_ids.clone(),
            user_interests: user.interests.clone(),
            target_duration: None,
            target_clip_count: None,
        };
        let curation_ctx = InlineContext::new(
            format!("inline-curation-{}", digest.id),
            serde_json::to_value(&curation_job)?,
        );
        let result = CurationStage::new(services.clone())
            .handle(&curation_ctx)
            .await;
        self.fail_digest_on_error(&digest.id, result)?;
        ctx.update_progress(65);

        let clip_ids: Vec<String> = db
            .get_digest_clip_details(&digest.id)?
            .into_iter()
            .map(|d| d.clip.id)
            .collect();
        let assembly_job = DigestPayload {
            digest_id: digest.id.clone(),
            user_id: user.id.clone(),
            clip_ids,
            podcast_id: digest.podcast_id.clone(),
            episode_ids: analyzed_ids,
            skip_script_generation: false,
            existing_tts_paths: None,
        };
        let assembly_ctx = InlineContext::new(
            format!("inline-digest-{}", digest.id),
            serde_json::to_value(&assembly_job)?,
        );
        let result = AssemblyStage::new(services.clone())
            .handle(&assembly_ctx)
            .await;
        self.fail_digest_on_error(&digest.id, result)?;
        ctx.update_progress(100);

        let finished = db
            .get_digest(&digest.id)?
            .ok_or_else(|| PipelineError::NotFound(format!("digest {}", digest.id)))?;
        Ok(DigestOutcome::Completed(DigestSummary {
            clip_count: db.count_digest_clips(&finished.id)?,
            audio_url: finished.audio_url.unwrap_or_default(),
            duration: finished.duration.unwrap_or(Seconds::ZERO),
            episode_count: partition.analyzed.len(),
            digest_id: finished.id,
        }))
    }

    fn enqueue_analysis(
        &self,
        queue: &JobQueue,
        episode: &Episode,
        user_id: &str,
        interests: &[String],
    ) -> Result<(), PipelineError> {
        let job = AnalysisPayload {
            episode_id: episode.id.clone(),
            user_id: user_id.to_string(),
            user_interests: interests.to_vec(),
        };
        queue.add(
            ANALYSIS_QUEUE,
            "analyze-episode",
            &serde_json::to_value(&job)?,
            &job.enqueue_options(),
        )?;
        Ok(())
    }

    fn fail_digest_on_error(
        &self,
        digest_id: &str,
        result: Result<(), PipelineError>,
    ) -> Result<(), PipelineError> {
        if result.is_err() {
            if let Err(e) = self
                .services
                .db
                .set_digest_status(digest_id, DigestStatus::Failed)
            {
                log::error!("Failed to mark digest {} failed: {}", digest_id, e);
            }
        }
        result
    }
}

#[async_trait::async_trait]
impl JobHandler for OrchestratorStage {
    async fn handle(&self, ctx: &dyn StageContext) -> Result<(), PipelineError> {
        let job: OrchestratorPayload = payload(ctx)?;
        let outcome = self.run_digest(ctx, &job.user_id, job.frequency).await?;
        match &outcome {
            DigestOutcome::NoEpisodes => ctx.log("Digest run finished: no episodes"),
            DigestOutcome::Completed(summary) => ctx.log(&format!(
                "Digest run finished: {} ({} clips, {})",
                summary.digest_id, summary.clip_count, summary.duration
            )),
        }
        Ok(())
    }
}
