//! Digest assembly: narration script, TTS synthesis, clip extraction, and
//! sample-accurate concatenation into the published MP3.
//!
//! Sub-stages write deterministic file names into the digest work dir, so a
//! re-run after a crash recomputes earlier sub-stages unless the caller
//! passes `skipScriptGeneration` / `existingTtsPaths`.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::audio::SliceOptions;
use crate::database::{DigestClipDetail, DigestStatus, NarratorScript, Seconds};
use crate::error::PipelineError;
use crate::llm::{parse_json_response, ChatMessage, CompletionRequest};
use crate::queue::{payload, JobHandler, StageContext};
use crate::services::Services;
use crate::tts::SynthesisOptions;

use super::prompts::SCRIPT_SYSTEM_PROMPT;
use super::{DigestPayload, ExistingTtsPaths};

const CLIP_FADE: Seconds = Seconds(0.3);
const SCRIPT_TEMPERATURE: f32 = 0.7;
const SCRIPT_MAX_TOKENS: u32 = 2_000;

/// 128 kbps in bytes per second, for the size-derived duration.
const CANONICAL_BYTES_PER_SECOND: f64 = 128.0 * 1024.0 / 8.0;

/// Published digest duration estimated from file size at the canonical
/// bitrate.
pub fn duration_from_file_size(bytes: u64) -> Seconds {
    Seconds(bytes as f64 / CANONICAL_BYTES_PER_SECOND)
}

/// Interleave narrator pieces and clips:
/// `intro, clip0, t0, clip1, t1, …, clipN-1, outro`.
///
/// A transition slot with no transition (script came back short) is skipped:
/// those clips play back-to-back. Extra transitions are ignored.
pub fn build_playback_sequence(
    intro: &Path,
    clips: &[PathBuf],
    transitions: &[PathBuf],
    outro: &Path,
) -> Vec<PathBuf> {
    let mut sequence = Vec::with_capacity(clips.len() * 2 + 2);
    sequence.push(intro.to_path_buf());
    for (i, clip) in clips.iter().enumerate() {
        sequence.push(clip.clone());
        if i + 1 < clips.len() {
            if let Some(transition) = transitions.get(i) {
                sequence.push(transition.clone());
            }
        }
    }
    sequence.push(outro.to_path_buf());
    sequence
}

fn build_script_prompt(
    clips: &[DigestClipDetail],
    total_duration: Seconds,
    user_name: Option<&str>,
) -> String {
    let mut prompt = format!(
        "Write the narration for a digest of {} clips, {:.1} minutes of clip audio total.\n",
        clips.len(),
        total_duration.get() / 60.0
    );
    if let Some(name) = user_name {
        prompt.push_str(&format!("Address the listener by name: {name}.\n"));
    }
    prompt.push_str("\nClips in playback order:\n");
    for clip in clips {
        prompt.push_str(&format!(
            "{}. {} / {} — {} ({:.0}s)\n",
            clip.position + 1,
            clip.podcast_title,
            clip.episode_title,
            if clip.clip.summary.is_empty() {
                "no summary"
            } else {
                clip.clip.summary.as_str()
            },
            clip.clip.duration.get(),
        ));
    }
    prompt
}

/// Narrator file paths inside the digest work dir.
struct NarratorFiles {
    intro: PathBuf,
    transitions: Vec<PathBuf>,
    outro: PathBuf,
}

impl NarratorFiles {
    fn in_dir(work_dir: &Path, transition_count: usize) -> Self {
        Self {
            intro: work_dir.join("narrator_intro.mp3"),
            transitions: (0..transition_count)
                .map(|i| work_dir.join(format!("narrator_transition_{i}.mp3")))
                .collect(),
            outro: work_dir.join("narrator_outro.mp3"),
        }
    }

    fn from_existing(existing: &ExistingTtsPaths) -> Self {
        Self {
            intro: existing.intro.clone(),
            transitions: existing.transitions.clone(),
            outro: existing.outro.clone(),
        }
    }

    fn all(&self) -> impl Iterator<Item = &PathBuf> {
        std::iter::once(&self.intro)
            .chain(self.transitions.iter())
            .chain(std::iter::once(&self.outro))
    }
}

pub struct AssemblyStage {
    services: Arc<Services>,
}

impl AssemblyStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn run(
        &self,
        ctx: &dyn StageContext,
        job: &DigestPayload,
        clips: &[DigestClipDetail],
        work_dir: &Path,
    ) -> Result<(), PipelineError> {
        let services = &self.services;
        let db = &services.db;
        let digest_id = &job.digest_id;

        // 1. Script
        db.set_digest_status(digest_id, DigestStatus::GeneratingScript)?;
        let script = self.obtain_script(ctx, job, clips).await?;
        if script.transitions.len() != clips.len().saturating_sub(1) {
            log::warn!(
                "Script has {} transitions for {} clips (expected {}), proceeding anyway",
                script.transitions.len(),
                clips.len(),
                clips.len().saturating_sub(1)
            );
        }
        ctx.update_progress(10);

        // 2. Narrator audio
        db.set_digest_status(digest_id, DigestStatus::GeneratingAudio)?;
        services.cache.ensure_dir(work_dir).await?;
        let narrator = self
            .obtain_narrator_audio(ctx, job, &script, work_dir)
            .await?;
        ctx.update_progress(50);

        // 3. Clip audio
        let clip_paths = self.extract_clips(ctx, clips, work_dir).await?;

        // 4. Stitch
        db.set_digest_status(digest_id, DigestStatus::Stitching)?;
        ctx.update_progress(85);
        let sequence = build_playback_sequence(
            &narrator.intro,
            &clip_paths,
            &narrator.transitions,
            &narrator.outro,
        );
        let final_path = work_dir.join("final_digest.mp3");
        services.audio.concatenate(&sequence, &final_path).await?;

        // 5. Publish
        let published = services.config.digest_root.join(format!("{digest_id}.mp3"));
        if let Some(parent) = published.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::copy(&final_path, &published).await?;
        let bytes = tokio::fs::metadata(&published).await?.len();
        let duration = duration_from_file_size(bytes);
        let audio_url = format!("/audio/digests/{digest_id}.mp3");
        db.set_digest_ready(digest_id, &audio_url, duration)?;

        ctx.log(&format!(
            "Published {} ({} bytes, {}) with {} clips",
            audio_url,
            bytes,
            duration,
            clips.len()
        ));
        ctx.update_progress(100);
        Ok(())
    }

    /// Reuse the persisted script when asked to, else generate and persist.
    async fn obtain_script(
        &self,
        ctx: &dyn StageContext,
        job: &DigestPayload,
        clips: &[DigestClipDetail],
    ) -> Result<NarratorScript, PipelineError> {
        let services = &self.services;

        if job.skip_script_generation {
            let digest = services
                .db
                .get_digest(&job.digest_id)?
                .ok_or_else(|| PipelineError::NotFound(format!("digest {}", job.digest_id)))?;
            if let Some(stored) = digest.narrator_script {
                ctx.log("Reusing persisted narrator script");
                return serde_json::from_str(&stored)
                    .map_err(|e| PipelineError::Parse(format!("stored narrator script: {e}")));
            }
            log::warn!("skipScriptGeneration set but no stored script, generating fresh");
        }

        let user_name = services
            .db
            .get_user(&job.user_id)?
            .and_then(|u| u.name);
        let total_duration = clips
            .iter()
            .fold(Seconds::ZERO, |acc, c| acc + c.clip.duration);

        let request = CompletionRequest {
            model: services.config.default_llm_model.clone(),
            messages: vec![
                ChatMessage::system(SCRIPT_SYSTEM_PROMPT),
                ChatMessage::user(build_script_prompt(clips, total_duration, user_name.as_deref())),
            ],
            temperature: Some(SCRIPT_TEMPERATURE),
            max_tokens: Some(SCRIPT_MAX_TOKENS),
        };
        let response = services.llm.complete(&request).await?;
        let script: NarratorScript = parse_json_response(&response.content)?;

        services
            .db
            .set_digest_script(&job.digest_id, &serde_json::to_string(&script)?)?;
        ctx.log(&format!(
            "Generated script: intro {} words, {} transitions",
            script.intro.split_whitespace().count(),
            script.transitions.len()
        ));
        Ok(script)
    }

    /// Either verify the caller-provided narrator files or synthesize fresh
    /// ones into the work dir.
    async fn obtain_narrator_audio(
        &self,
        ctx: &dyn StageContext,
        job: &DigestPayload,
        script: &NarratorScript,
        work_dir: &Path,
    ) -> Result<NarratorFiles, PipelineError> {
        if let Some(existing) = &job.existing_tts_paths {
            let files = NarratorFiles::from_existing(existing);
            for path in files.all() {
                if !path.exists() {
                    return Err(PipelineError::NotFound(format!(
                        "existing TTS file {}",
                        path.display()
                    )));
                }
            }
            ctx.log("Reusing narrator audio from previous run");
            return Ok(files);
        }

        let services = &self.services;
        let options = SynthesisOptions {
            voice: Some(services.config.tts_default_voice.clone()),
            ..SynthesisOptions::default()
        };
        let files = NarratorFiles::in_dir(work_dir, script.transitions.len());

        services
            .tts
            .generate(&script.intro, &files.intro, &options)
            .await?;
        for (i, transition) in script.transitions.iter().enumerate() {
            services
                .tts
                .generate(transition, &files.transitions[i], &options)
                .await?;
            ctx.update_progress(10 + (((i + 1) * 30) / (script.transitions.len() + 2)) as u8);
        }
        services
            .tts
            .generate(&script.outro, &files.outro, &options)
            .await?;
        ctx.log(&format!(
            "Synthesized {} narrator pieces",
            script.transitions.len() + 2
        ));
        Ok(files)
    }

    /// Download each source episode and slice its clip with short fades.
    /// Sequential on purpose: one full episode on disk at a time.
    async fn extract_clips(
        &self,
        ctx: &dyn StageContext,
        clips: &[DigestClipDetail],
        work_dir: &Path,
    ) -> Result<Vec<PathBuf>, PipelineError> {
        let services = &self.services;
        let total = clips.len();
        let mut clip_paths = Vec::with_capacity(total);

        for (i, detail) in clips.iter().enumerate() {
            ctx.update_progress(50 + ((i * 30).div_ceil(total)) as u8);

            let episode_temp = work_dir.join(format!("episode_{i}.mp3"));
            services
                .downloader
                .download_to_file(&detail.episode_audio_url, &episode_temp)
                .await?;

            let clip_path = work_dir.join(format!("clip_{i}.mp3"));
            services
                .audio
                .slice_clip(
                    &episode_temp,
                    &clip_path,
                    &SliceOptions {
                        start: detail.clip.start_time,
                        end: detail.clip.end_time,
                        fade_in: CLIP_FADE,
                        fade_out: CLIP_FADE,
                    },
                )
                .await?;

            // The full episode is large; drop it as soon as the clip is cut
            services.cache.cleanup(&episode_temp).await?;
            clip_paths.push(clip_path);
        }
        Ok(clip_paths)
    }
}

#[async_trait]
impl JobHandler for AssemblyStage {
    async fn handle(&self, ctx: &dyn StageContext) -> Result<(), PipelineError> {
        let job: DigestPayload = payload(ctx)?;
        let services = &self.services;
        let db = &services.db;

        let digest = db
            .get_digest(&job.digest_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("digest {}", job.digest_id)))?;

        let clips = db.get_digest_clip_details(&digest.id)?;
        if clips.is_empty() {
            return Err(PipelineError::InvariantViolation(format!(
                "digest {} has no clips to assemble",
                digest.id
            )));
        }

        let work_dir = services.cache.digest_work_dir(&digest.id);
        let result = self.run(ctx, &job, &clips, &work_dir).await;

        // Work-dir intermediates go away on success and failure alike; the
        // published artifact lives outside it
        if let Err(e) = services.cache.cleanup(&work_dir).await {
            log::warn!("Failed to clean up {:?}: {}", work_dir, e);
        }

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

#[cfg(test)]
mod tests {
    use super::*;

    fn paths(prefix: &str, n: usize) -> Vec<PathBuf> {
        (0..n).map(|i| PathBuf::from(format!("/{prefix}_{i}.mp3"))).collect()
    }

    #[test]
    fn sequence_interleaves_clips_and_transitions() {
        let intro = PathBuf::from("/narrator_intro.mp3");
        let outro = PathBuf::from("/narrator_outro.mp3");
        let clips = paths("clip", 6);
        let transitions = paths("narrator_transition", 5);

        let sequence = build_playback_sequence(&intro, &clips, &transitions, &outro);

        // intro + 6 clips + 5 transitions + outro
        assert_eq!(sequence.len(), 13);
        assert_eq!(sequence[0], intro);
        assert_eq!(sequence[1], clips[0]);
        assert_eq!(sequence[2], transitions[0]);
        assert_eq!(sequence[3], clips[1]);
        assert_eq!(sequence[11], clips[5]);
        assert_eq!(sequence[12], outro);
        // No transition after the last clip
        assert_eq!(sequence[sequence.len() - 2], clips[5]);
    }

    #[test]
    fn short_transition_list_pairs_clips_back_to_back() {
        let intro = PathBuf::from("/i.mp3");
        let outro = PathBuf::from("/o.mp3");
        let clips = paths("clip", 3);
        let transitions = paths("t", 1);

        let sequence = build_playback_sequence(&intro, &clips, &transitions, &outro);
        // intro, c0, t0, c1, c2, outro — missing second transition is skipped
        assert_eq!(
            sequence,
            vec![
                intro,
                clips[0].clone(),
                transitions[0].clone(),
                clips[1].clone(),
                clips[2].clone(),
                outro
            ]
        );
    }

    #[test]
    fn extra_transitions_are_ignored() {
        let intro = PathBuf::from("/i.mp3");
        let outro = PathBuf::from("/o.mp3");
        let clips = paths("clip", 2);
        let transitions = paths("t", 4);

        let sequence = build_playback_sequence(&intro, &clips, &transitions, &outro);
        assert_eq!(sequence.len(), 5);
    }

    #[test]
    fn single_clip_has_no_transitions() {
        let sequence = build_playback_sequence(
            &PathBuf::from("/i.mp3"),
            &paths("clip", 1),
            &[],
            &PathBuf::from("/o.mp3"),
        );
        assert_eq!(sequence.len(), 3);
    }

    #[test]
    fn size_derived_duration_assumes_128_kbps() {
        // One minute of 128 kbps audio is 983,040 bytes
        assert_eq!(duration_from_file_size(983_040), Seconds(60.0));
        assert_eq!(duration_from_file_size(0), Seconds(0.0));
        // 16384 bytes per second
        assert_eq!(duration_from_file_size(16_384), Seconds(1.0));
    }

    #[test]
    fn narrator_files_follow_work_dir_naming() {
        let files = NarratorFiles::in_dir(Path::new("/work/d1_chunks"), 5);
        assert_eq!(files.intro, PathBuf::from("/work/d1_chunks/narrator_intro.mp3"));
        assert_eq!(
            files.transitions[4],
            PathBuf::from("/work/d1_chunks/narrator_transition_4.mp3")
        );
        assert_eq!(files.outro, PathBuf::from("/work/d1_chunks/narrator_outro.mp3"));
        assert_eq!(files.all().count(), 7);
    }

    #[test]
    fn script_json_round_trips() {
        let script = NarratorScript {
            intro: "Welcome back.".to_string(),
            transitions: vec!["Next up.".to_string()],
            outro: "That's all.".to_string(),
        };
        let json = serde_json::to_string(&script).unwrap();
        let parsed: NarratorScript = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, script);
        assert!(json.contains("\"transitions\""));
    }
}
