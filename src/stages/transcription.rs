//! Transcription stage: download, size-check, compress/chunk, transcribe,
//! merge, persist.
//!
//! Chunk windows overlap by a couple of seconds as a safety margin against
//! STT cutoffs at window edges; the merge keeps overlap-region words from
//! both sides rather than trying to deduplicate them.

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;

use crate::audio::Bitrate;
use crate::database::{EpisodeStatus, Seconds, Transcript, TranscriptSegment};
use crate::error::PipelineError;
use crate::queue::{payload, JobHandler, StageContext};
use crate::services::Services;
use crate::stt::{SttResult, TranscribeOptions};

use super::TranscriptionPayload;

/// A chunk boundary on the original episode timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkSpec {
    pub index: usize,
    pub start: Seconds,
    pub end: Seconds,
}

impl ChunkSpec {
    pub fn duration(&self) -> Seconds {
        self.end - self.start
    }
}

/// A chunk file ready for the STT adapter.
#[derive(Debug, Clone)]
struct ChunkFile {
    path: PathBuf,
    start: Seconds,
    duration: Seconds,
}

/// One chunk's transcription plus its placement on the original timeline.
#[derive(Debug, Clone)]
pub struct ChunkTranscript {
    pub start: Seconds,
    pub window: Seconds,
    pub result: SttResult,
}

/// Whether a file must be compressed or sliced before upload. The limit is
/// strict: a file exactly at the limit goes through as-is.
pub fn needs_chunking(size_bytes: u64, limit_bytes: u64) -> bool {
    size_bytes > limit_bytes
}

/// Window length bounded by the soft per-chunk size target.
///
/// Windows re-encode at the canonical 128 kbps, so the size target caps how
/// long a window may run regardless of the configured duration.
pub fn chunk_window(duration_seconds: f64, target_chunk_bytes: u64) -> Seconds {
    let size_capped = target_chunk_bytes as f64 / (128.0 * 1024.0 / 8.0);
    Seconds(duration_seconds.min(size_capped))
}

/// Overlapping windows covering `[0, total]`.
pub fn plan_windows(total: Seconds, window: Seconds, overlap: Seconds) -> Vec<ChunkSpec> {
    let mut specs = Vec::new();
    if total <= Seconds::ZERO || window <= Seconds::ZERO {
        return specs;
    }

    let stride = (window - overlap).max(Seconds(1.0));
    let mut start = Seconds::ZERO;
    let mut index = 0;
    loop {
        let end = (start + window).min(total);
        specs.push(ChunkSpec { index, start, end });
        if end >= total {
            break;
        }
        start = start + stride;
        index += 1;
    }
    specs
}

/// Merge chunk transcripts into one episode transcript.
///
/// Segment timestamps are offset by each chunk's start, the aggregate is
/// sorted by start, chunk texts are joined with a single space, and the
/// merged duration is the maximum of `start + reported-or-window duration`
/// across chunks.
pub fn merge_chunks(chunks: &[ChunkTranscript]) -> Transcript {
    let text = chunks
        .iter()
        .map(|c| c.result.text.trim())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");

    let mut segments: Vec<TranscriptSegment> = chunks
        .iter()
        .flat_map(|chunk| {
            chunk.result.segments.iter().map(move |segment| TranscriptSegment {
                start: segment.start + chunk.start,
                end: segment.end + chunk.start,
                text: segment.text.clone(),
            })
        })
        .collect();
    segments.sort_by(|a, b| {
        a.start
            .partial_cmp(&b.start)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let language = chunks
        .iter()
        .find_map(|c| c.result.language.clone())
        .unwrap_or_else(|| "en".to_string());

    let duration = chunks
        .iter()
        .map(|c| c.start + c.result.duration.unwrap_or(c.window))
        .fold(Seconds::ZERO, Seconds::max);

    Transcript {
        text,
        segments,
        language,
        duration,
    }
}

pub struct TranscriptionStage {
    services: Arc<Services>,
}

impl TranscriptionStage {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services }
    }

    async fn run(
        &self,
        ctx: &dyn StageContext,
        episode_id: &str,
        audio_url: &str,
    ) -> Result<(), PipelineError> {
        let services = &self.services;
        let temp_audio = services.cache.episode_temp(episode_id, "mp3");
        let chunk_dir = services.cache.chunk_dir(episode_id);

        let outcome = self
            .transcribe_episode(ctx, episode_id, audio_url, &temp_audio, &chunk_dir)
            .await;

        // Temp and chunk files go away no matter how the attempt ended
        if let Err(e) = services.cache.cleanup(&temp_audio).await {
            log::warn!("Failed to clean up {:?}: {}", temp_audio, e);
        }
        if let Err(e) = services.cache.cleanup(&chunk_dir).await {
            log::warn!("Failed to clean up {:?}: {}", chunk_dir, e);
        }

        outcome
    }

    async fn transcribe_episode(
        &self,
        ctx: &dyn StageContext,
        episode_id: &str,
        audio_url: &str,
        temp_audio: &PathBuf,
        chunk_dir: &PathBuf,
    ) -> Result<(), PipelineError> {
        let services = &self.services;

        let size = services
            .downloader
            .download_to_file(audio_url, temp_audio)
            .await?;
        ctx.log(&format!("Downloaded {size} bytes"));
        ctx.update_progress(10);

        if !services.db.transition_episode(
            episode_id,
            &[EpisodeStatus::Downloading],
            EpisodeStatus::Transcribing,
        )? {
            return Err(PipelineError::Busy(format!(
                "episode {episode_id} left downloading state mid-job"
            )));
        }

        let chunks = self.prepare_chunks(ctx, temp_audio, chunk_dir, size).await?;
        let total = chunks.len();

        let mut language: Option<String> = None;
        let mut chunk_transcripts = Vec::with_capacity(total);
        for (i, chunk) in chunks.iter().enumerate() {
            let options = TranscribeOptions {
                language: language.clone(),
                model: None,
            };
            let result = services.stt.transcribe(&chunk.path, &options).await?;
            // First chunk pins the language for the rest
            if language.is_none() {
                language = result.language.clone();
            }
            chunk_transcripts.push(ChunkTranscript {
                start: chunk.start,
                window: chunk.duration,
                result,
            });
            ctx.update_progress(progress_pct(i + 1, total));
        }

        let transcript = merge_chunks(&chunk_transcripts);
        ctx.log(&format!(
            "Merged {} chunks: {} segments, {} total",
            total,
            transcript.segments.len(),
            transcript.duration
        ));

        services.db.save_transcript(episode_id, &transcript)?;
        Ok(())
    }

    /// The size ladder: pass through, single compressed chunk, or overlapping
    /// windows sliced from the compressed stream.
    async fn prepare_chunks(
        &self,
        ctx: &dyn StageContext,
        temp_audio: &PathBuf,
        chunk_dir: &PathBuf,
        size: u64,
    ) -> Result<Vec<ChunkFile>, PipelineError> {
        let services = &self.services;
        let limit = services.config.stt_max_file_size;

        if !needs_chunking(size, limit) {
            let duration = match services.audio.probe(temp_audio).await {
                Ok(probe) => probe.duration,
                Err(e) => {
                    log::warn!("Probe failed, merge will rely on STT duration: {}", e);
                    Seconds::ZERO
                }
            };
            return Ok(vec![ChunkFile {
                path: temp_audio.clone(),
                start: Seconds::ZERO,
                duration,
            }]);
        }

        services.cache.ensure_dir(chunk_dir).await?;
        let compressed = chunk_dir.join("compressed.mp3");
        services
            .audio
            .compress(temp_audio, &compressed, Bitrate::Kbps64)
            .await?;
        let compressed_size = tokio::fs::metadata(&compressed).await?.len();
        ctx.log(&format!(
            "Compressed {size} -> {compressed_size} bytes at 64 kbps"
        ));

        if !needs_chunking(compressed_size, limit) {
            let duration = services.audio.probe(&compressed).await?.duration;
            return Ok(vec![ChunkFile {
                path: compressed,
                start: Seconds::ZERO,
                duration,
            }]);
        }

        let total = services.audio.probe(&compressed).await?.duration;
        let window = chunk_window(
            services.config.compressed_chunk_duration_seconds(),
            services.config.target_chunk_size,
        );
        let overlap = Seconds(services.config.chunk_overlap_seconds);
        let specs = plan_windows(total, window, overlap);
        ctx.log(&format!(
            "Slicing {} into {} windows of {} with {} overlap",
            total,
            specs.len(),
            window,
            overlap
        ));

        let mut chunks = Vec::with_capacity(specs.len());
        for spec in &specs {
            let path = chunk_dir.join(format!("chunk_{:03}.mp3", spec.index));
            services
                .audio
                .slice_window(&compressed, &path, spec.start, spec.duration())
                .await?;
            chunks.push(ChunkFile {
                path,
                start: spec.start,
                duration: spec.duration(),
            });
        }
        Ok(chunks)
    }
}

/// Monotonic chunk progress: `⌈(done/total)·100⌉`.
fn progress_pct(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done * 100).div_ceil(total)).min(100) as u8
}

#[async_trait]
impl JobHandler for TranscriptionStage {
    async fn handle(&self, ctx: &dyn StageContext) -> Result<(), PipelineError> {
        let job: TranscriptionPayload = payload(ctx)?;
        let db = &self.services.db;

        let episode = db
            .get_episode(&job.episode_id)?
            .ok_or_else(|| PipelineError::NotFound(format!("episode {}", job.episode_id)))?;

        // Shared-transcript dedup: done or in the analysis phase means the
        // transcript already exists
        match episode.status {
            EpisodeStatus::Transcribed | EpisodeStatus::Analyzing | EpisodeStatus::Analyzed => {
                ctx.log("Episode already transcribed, nothing to do");
                return Ok(());
            }
            EpisodeStatus::Downloading | EpisodeStatus::Transcribing => {
                return Err(PipelineError::Busy(format!(
                    "episode {} is already being processed",
                    episode.id
                )));
            }
            EpisodeStatus::Pending | EpisodeStatus::Failed => {}
        }
        if episode.transcript.is_some() {
            ctx.log("Transcript already present, nothing to do");
            return Ok(());
        }

        if !db.transition_episode(
            &episode.id,
            &[EpisodeStatus::Pending, EpisodeStatus::Failed],
            EpisodeStatus::Downloading,
        )? {
            return Err(PipelineError::Busy(format!(
                "episode {} was claimed concurrently",
                episode.id
            )));
        }

        let result = self.run(ctx, &episode.id, &job.audio_url).await;
        if let Err(error) = &result {
            if !matches!(error, PipelineError::Busy(_)) {
                if let Err(e) = db.set_episode_failed(&episode.id, &error.to_string()) {
                    log::error!("Failed to mark episode {} failed: {}", episode.id, e);
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stt(text: &str, segments: &[(f64, f64)], duration: Option<f64>) -> SttResult {
        SttResult {
            text: text.to_string(),
            segments: segments
                .iter()
                .map(|(start, end)| TranscriptSegment {
                    start: Seconds(*start),
                    end: Seconds(*end),
                    text: format!("seg {start}"),
                })
                .collect(),
            language: Some("en".to_string()),
            duration: duration.map(Seconds),
        }
    }

    #[test]
    fn limit_is_strict_greater_than() {
        let limit = 25 * 1024 * 1024;
        assert!(!needs_chunking(limit - 1, limit));
        // Exactly at the limit does not need chunking
        assert!(!needs_chunking(limit, limit));
        assert!(needs_chunking(limit + 1, limit));
    }

    #[test]
    fn windows_cover_the_whole_timeline_with_overlap() {
        // One hour at 25-minute windows, 2 s overlap
        let specs = plan_windows(Seconds(3600.0), Seconds(1500.0), Seconds(2.0));
        assert_eq!(specs.len(), 3);

        assert_eq!(specs[0].start, Seconds(0.0));
        assert_eq!(specs[0].end, Seconds(1500.0));
        assert_eq!(specs[1].start, Seconds(1498.0));
        assert_eq!(specs[1].end, Seconds(2998.0));
        assert_eq!(specs[2].start, Seconds(2996.0));
        assert_eq!(specs[2].end, Seconds(3600.0));

        // Adjacent windows overlap; the union spans [0, total]
        for pair in specs.windows(2) {
            assert!(pair[1].start < pair[0].end);
        }
        assert_eq!(specs.last().unwrap().end, Seconds(3600.0));
    }

    #[test]
    fn window_is_capped_by_the_chunk_size_target() {
        // 22 MiB at 128 kbps is ~1408 s, under the 25-minute duration default
        let window = chunk_window(1500.0, 22 * 1024 * 1024);
        assert!(window < Seconds(1500.0));
        assert!((window.get() - 1408.0).abs() < 1.0);

        // A generous size target leaves the duration in charge
        assert_eq!(chunk_window(1500.0, 100 * 1024 * 1024), Seconds(1500.0));
    }

    #[test]
    fn short_audio_is_a_single_window() {
        let specs = plan_windows(Seconds(600.0), Seconds(1500.0), Seconds(2.0));
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].start, Seconds(0.0));
        assert_eq!(specs[0].end, Seconds(600.0));
    }

    #[test]
    fn merge_offsets_sorts_and_joins() {
        let chunks = vec![
            ChunkTranscript {
                start: Seconds(0.0),
                window: Seconds(1500.0),
                result: stt("first chunk", &[(0.0, 5.0), (5.0, 1499.0)], Some(1500.0)),
            },
            ChunkTranscript {
                start: Seconds(1498.0),
                window: Seconds(1500.0),
                result: stt("second chunk", &[(0.0, 4.0), (4.0, 1500.0)], Some(1500.0)),
            },
        ];
        let merged = merge_chunks(&chunks);

        assert_eq!(merged.text, "first chunk second chunk");
        assert_eq!(merged.segments.len(), 4);
        // Offsets applied: second chunk's first segment starts at 1498
        assert_eq!(merged.segments[2].start, Seconds(1498.0));
        assert_eq!(merged.segments[3].end, Seconds(2998.0));
        // Sorted by start
        assert!(merged.segments.windows(2).all(|w| w[0].start <= w[1].start));
        // Every merged segment starts at or after its chunk's offset
        assert!(merged.segments.iter().all(|s| s.start >= Seconds(0.0)));
        assert_eq!(merged.duration, Seconds(2998.0));
        assert_eq!(merged.language, "en");
    }

    #[test]
    fn merge_falls_back_to_window_duration() {
        let chunks = vec![ChunkTranscript {
            start: Seconds(3000.0),
            window: Seconds(600.0),
            result: stt("tail", &[(0.0, 595.0)], None),
        }];
        let merged = merge_chunks(&chunks);
        assert_eq!(merged.duration, Seconds(3600.0));
    }

    #[test]
    fn merge_single_chunk_is_identity_on_timestamps() {
        let chunks = vec![ChunkTranscript {
            start: Seconds(0.0),
            window: Seconds(1080.0),
            result: stt("whole episode", &[(0.0, 540.0), (540.0, 1080.0)], Some(1080.0)),
        }];
        let merged = merge_chunks(&chunks);
        assert_eq!(merged.segments[0].start, Seconds(0.0));
        assert_eq!(merged.segments[1].end, Seconds(1080.0));
        assert_eq!(merged.duration, Seconds(1080.0));
    }

    #[test]
    fn merge_skips_empty_chunk_text() {
        let chunks = vec![
            ChunkTranscript {
                start: Seconds(0.0),
                window: Seconds(10.0),
                result: stt("  ", &[], Some(10.0)),
            },
            ChunkTranscript {
                start: Seconds(8.0),
                window: Seconds(10.0),
                result: stt("words", &[(0.0, 10.0)], Some(10.0)),
            },
        ];
        assert_eq!(merge_chunks(&chunks).text, "words");
    }

    #[test]
    fn progress_is_ceiled_and_monotonic() {
        assert_eq!(progress_pct(1, 3), 34);
        assert_eq!(progress_pct(2, 3), 67);
        assert_eq!(progress_pct(3, 3), 100);
        assert_eq!(progress_pct(1, 1), 100);
        let values: Vec<u8> = (1..=7).map(|i| progress_pct(i, 7)).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
    }
}
