//! Analysis stage: per-episode clip extraction via the LLM.
//!
//! Clips are a per-episode resource shared by all users: re-analysis replaces
//! the episode's clip set wholesale, keyed by whichever user's interests
//! triggered the run.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;

use crate::database::{Episode, EpisodeStatus, NewClip, Seconds, Transcript};
use crate::error::PipelineError;
use crate::llm::{parse_json_response, ChatMessage, CompletionRequest};
use crate::queue::{payload, JobHandler, StageContext};
use crate::services::Services;

use super::prompts::ANALYSIS_SYSTEM_PROMPT;
use super::AnalysisPayload;

const ANALYSIS_TEMPERATURE: f32 = 0.7;
const ANALYSIS_MAX_TOKENS: u32 = 4_000;

/// Clip candidates as the model returns them.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClipEnvelope {
    #[serde(default)]
    clips: Vec<ClipCandidate>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ClipCandidate {
    start_time: f64,
    end_time: f64,
    #[serde(default)]
    transcript: String,
    #[serde(default)]
    relevance_score: f64,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    summary: String,
}

/// Drop candidates that fall outside the transcript or are inverted.
fn validate_candidates(candidates: Vec<ClipCandidate>, duration: Seconds) -> Vec<NewClip> {
    candidates
        .into_iter()
        .filter_map(|c| {
            let valid = c.start_time >= 0.0
                && c.end_time > c.start_time
                && c.end_time <= duration.get();
            if !valid {
                log::warn!(
                    "Dropping clip outside transcript range: {}-{} (duration {})",
                    c.start_time,
                    c.end_time,
                    duration
                );
                return None;
            }
            Some(NewClip {
                start_time: Seconds(c.start_time),
                end_time: Seconds(c.end_time),
                transcript: c.transcript,
                relevance_score: c.relevance_score.clamp(0.0, 100.0),
                reasoning: c.reasoning,
                summary: c.summary,
            })
        })
        .collect()
}

/// Transcript rendered one segment per line: `[start-end]: text`.
fn annotated_transcript(transcript: &Transcript) -> String {
    transcript
        .segments
        .iter()
        .map(|s| format!("[{:.0}-{:.0}]: {}", s.start.get(), s.end.get(), s.text))
        .collect::<Vec<_>>()
        .join("\n")
}

fn build_user_prompt(
    interests: &[String],
    podcast_title: &str,
    episode: &Episode,
    transcript: &Transcript,
) -> String {
    format!(
        "Listener interests: {}\n\
         Podcast: {}\n\
         Episode: {}\n\
         Episode duration: {:.0} seconds\n\n\
         Transcript with [start-end] second markers:\n{}",
        if interests.is_empty() {
            "general".to_string()
        } else {
            interests.join(", ")
        },
        podcast_title,
        episode.title,
        transcript.duration.get(),
        annotated_transcript(transcript)
    )
}

pub struct AnalysisStage {
    services: Arc<Services>,
}

impl AnalysisStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn run(
        &self,
        ctx: &dyn StageContext,
        job: &AnalysisPayload,
        episode: &Episode,
        transcript: &Transcript,
    ) -> Result<(), PipelineError> {
        let services = &self.services;

        let podcast_title = services
            .db
            .get_podcast(&episode.podcast_id)?
            .map(|p| p.title)
            .unwrap_or_else(|| "Unknown podcast".to_string());

        let request = CompletionRequest {
            model: services.config.default_llm_model.clone(),
            messages: vec![
                ChatMessage::system(ANALYSIS_SYSTEM_PROMPT),
                ChatMessage::user(build_user_prompt(
                    &job.user_interests,
                    &podcast_title,
                    episode,
                    transcript,
                )),
            ],
            temperature: Some(ANALYSIS_TEMPERATURE),
            max_tokens: Some(ANALYSIS_MAX_TOKENS),
        };
        ctx.update_progress(20);

        let response = services.llm.complete(&request).await?;
        ctx.log(&format!(
            "Analysis used {} tokens via {}",
            response.usage.total_tokens, response.provider
        ));
        ctx.update_progress(70);

        let envelope: ClipEnvelope = parse_json_response(&response.content)?;
        let clips = validate_candidates(envelope.clips, transcript.duration);
        if clips.is_empty() {
            log::warn!("Analysis produced no valid clips for episode {}", episode.id);
        }

        let inserted = services.db.replace_clips(&episode.id, &clips)?;
        ctx.log(&format!("Stored {} clips", inserted.len()));
        Ok(())
    }
}

#[async_trait]
impl JobHandler for AnalysisStage {
    async fn handle(&self, ctx: &dyn StageContext) -> Result<(), PipelineError> {
        let job: AnalysisPayload = payload(ctx)?;
        let db = &self.services.db;

        let episode = db
            .get_episode(&job.episode_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("episode {}", job.episode_id)))?;

        match episode.status {
            EpisodeStatus::Analyzed => {
                let existing = db.get_clips_for_episode(&episode.id)?;
                ctx.log(&format!(
                    "Episode already analyzed with {} clips, nothing to do",
                    existing.len()
                ));
                return Ok(());
            }
            EpisodeStatus::Analyzing => {
                return Err(PipelineError::Busy(format!(
                    "episode {} is already being analyzed",
                    episode.id
                )));
            }
            _ => {}
        }

        let transcript = episode.transcript.clone().ok_or_else(|| {
            PipelineError::InvariantViolation(format!(
                "episode {} has no transcript to analyze",
                episode.id
            ))
        })?;

        if !db.transition_episode(
            &episode.id,
            &[EpisodeStatus::Transcribed],
            EpisodeStatus::Analyzing,
        )? {
            return Err(PipelineError::Busy(format!(
                "episode {} was claimed concurrently",
                episode.id
            )));
        }

        let result = self.run(ctx, &job, &episode, &transcript).await;
        match &result {
            Ok(()) => {
                db.transition_episode(
                    &episode.id,
                    &[EpisodeStatus::Analyzing],
                    EpisodeStatus::Analyzed,
                )?;
            }
            Err(error) => {
                if !matches!(error, PipelineError::Busy(_)) {
                    if let Err(e) = db.set_episode_failed(&episode.id, &error.to_string()) {
                        log::error!("Failed to mark episode {} failed: {}", episode.id, e);
                    }
                }
            }
        }
        result
    }
}
