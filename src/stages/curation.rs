//! Curation stage: cross-episode clip selection under a duration budget.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::database::{ClipWithEpisode, DigestStatus};
use crate::error::PipelineError;
use crate::llm::{parse_json_response, ChatMessage, CompletionRequest};
use crate::queue::{payload, JobHandler, StageContext};
use crate::services::Services;

use super::prompts::CURATION_SYSTEM_PROMPT;
use super::{ClipCountRange, CurationPayload};

const DEFAULT_TARGET_DURATION_SECONDS: f64 = 420.0;
const CURATION_TEMPERATURE: f32 = 0.7;
const CURATION_MAX_TOKENS: u32 = 2_000;
const TRANSCRIPT_PREVIEW_CHARS: usize = 600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Selection {
    #[serde(default)]
    selected_clip_ids: Vec<String>,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    estimated_duration: Option<f64>,
    #[serde(default)]
    topic_coverage: Vec<String>,
}

/// Keep only ids from the candidate set (LLM order, duplicates removed), then
/// greedily fill with the highest-scored unselected candidates until `min`.
fn validate_selection(
    selected: Vec<String>,
    candidates: &[ClipWithEpisode],
    min: usize,
) -> Vec<String> {
    let known: HashSet<&str> = candidates.iter().map(|c| c.clip.id.as_str()).collect();
    let mut seen = HashSet::new();
    let mut result: Vec<String> = selected
        .into_iter()
        .filter(|id| known.contains(id.as_str()) && seen.insert(id.clone()))
        .collect();

    if result.len() < min {
        // Candidates arrive ordered by relevance descending
        for candidate in candidates {
            if result.len() >= min {
                break;
            }
            if !seen.contains(&candidate.clip.id) {
                seen.insert(candidate.clip.id.clone());
                result.push(candidate.clip.id.clone());
            }
        }
    }
    result
}

fn build_user_prompt(
    interests: &[String],
    candidates: &[ClipWithEpisode],
    target_duration: f64,
    range: ClipCountRange,
) -> String {
    let mut prompt = format!(
        "Target digest duration: {:.0} seconds (within ±60 s).\n\
         Select between {} and {} clips.\n\
         Listener interests: {}\n\n\
         Candidates:\n",
        target_duration,
        range.min,
        range.max,
        if interests.is_empty() {
            "general".to_string()
        } else {
            interests.join(", ")
        },
    );

    for candidate in candidates {
        let preview: String = candidate
            .clip
            .transcript
            .chars()
            .take(TRANSCRIPT_PREVIEW_CHARS)
            .collect();
        prompt.push_str(&format!(
            "- id: {}\n  source: {} / {}\n  score: {:.0}\n  duration: {:.0}s\n  summary: {}\n  transcript: {}\n",
            candidate.clip.id,
            candidate.podcast_title,
            candidate.episode_title,
            candidate.clip.relevance_score,
            candidate.clip.duration.get(),
            candidate.clip.summary,
            preview,
        ));
    }
    prompt
}

pub struct CurationStage {
    services: Arc<Services>,
}

impl CurationStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn run(&self, ctx: &dyn StageContext, job: &CurationPayload) -> Result<(), PipelineError> {
        let services = &self.services;
        let db = &services.db;

        let candidates = db.get_clips_for_episodes(&job.episode_ids)?;
        if candidates.is_empty() {
            return Err(PipelineError::InvariantViolation(format!(
                "no clip candidates for digest {}",
                job.digest_id
            )));
        }
        ctx.log(&format!("Curating from {} candidates", candidates.len()));
        ctx.update_progress(20);

        let target_duration = job.target_duration.unwrap_or(DEFAULT_TARGET_DURATION_SECONDS);
        let range = job.target_clip_count.unwrap_or_default();

        let request = CompletionRequest {
            model: services.config.default_llm_model.clone(),
            messages: vec![
                ChatMessage::system(CURATION_SYSTEM_PROMPT),
                ChatMessage::user(build_user_prompt(
                    &job.user_interests,
                    &candidates,
                    target_duration,
                    range,
                )),
            ],
            temperature: Some(CURATION_TEMPERATURE),
            max_tokens: Some(CURATION_MAX_TOKENS),
        };
        let response = services.llm.complete(&request).await?;
        ctx.update_progress(60);

        let selection: Selection = parse_json_response(&response.content)?;
        if !selection.reasoning.is_empty() {
            ctx.log(&format!("Selection reasoning: {}", selection.reasoning));
        }
        if let Some(estimate) = selection.estimated_duration {
            log::debug!(
                "Model estimated {estimate:.0}s across topics {:?}",
                selection.topic_coverage
            );
        }

        let chosen = validate_selection(selection.selected_clip_ids, &candidates, range.min);
        ctx.log(&format!("Selected {} clips", chosen.len()));

        db.replace_digest_clips(&job.digest_id, &chosen)?;
        db.mark_clips_adopted(&job.digest_id, &chosen)?;
        // Clip count or order may have changed; any old narration is stale
        db.clear_digest_script(&job.digest_id)?;
        db.set_digest_status(&job.digest_id, DigestStatus::Pending)?;
        ctx.update_progress(100);
        Ok(())
    }
}

#[async_trait]
impl JobHandler for CurationStage {
    async fn handle(&self, ctx: &dyn StageContext) -> Result<(), PipelineError> {
        let job: CurationPayload = payload(ctx)?;
        let db = &self.services.db;

        let digest = db
            .get_digest(&job.digest_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("digest {}", job.digest_id)))?;

        // Dedup: selected clips plus a script means curation already ran to
        // completion; clips without a script mean only assembly remains.
        let existing_clips = db.count_digest_clips(&digest.id)?;
        if existing_clips > 0 {
            if digest.narrator_script.is_some() {
                ctx.log("Digest already curated with script, nothing to do");
            } else {
                ctx.log("Reusing existing clip selection, assembly will proceed");
                db.set_digest_status(&digest.id, DigestStatus::Pending)?;
            }
            return Ok(());
        }

        db.set_digest_status(&digest.id, DigestStatus::Curating)?;

        let result = self.run(ctx, &job).await;
        if let Err(error) = &result {
            if !matches!(error, PipelineError::Busy(_)) {
                if let Err(e) = db.set_digest_status(&digest.id, DigestStatus::Failed) {
                    log::error!("Failed to mark digest {} failed: {}", digest.id, e);
                }
            }
        }
        result
    }
}
