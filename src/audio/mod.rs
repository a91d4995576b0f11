//! Thin, stateless wrapper around ffmpeg/ffprobe.
//!
//! Every intermediate file the pipeline produces is re-encoded to one
//! canonical format (128 kbps, 44.1 kHz, stereo MP3) so concatenation is
//! lossless at the container level. Binary paths come from configuration;
//! nothing here depends on an install location.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::database::Seconds;
use crate::error::PipelineError;

pub const CANONICAL_BITRATE_KBPS: u32 = 128;
pub const CANONICAL_SAMPLE_RATE: u32 = 44_100;
pub const CANONICAL_CHANNELS: u32 = 2;

/// Output bitrates supported by [`AudioToolkit::compress`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bitrate {
    Kbps64,
    Kbps96,
    Kbps128,
}

impl Bitrate {
    pub fn as_arg(self) -> &'static str {
        match self {
            Bitrate::Kbps64 => "64k",
            Bitrate::Kbps96 => "96k",
            Bitrate::Kbps128 => "128k",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub duration: Seconds,
    pub sample_rate: u32,
    pub channels: u32,
    pub codec: String,
    pub bitrate_kbps: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SliceOptions {
    pub start: Seconds,
    pub end: Seconds,
    pub fade_in: Seconds,
    pub fade_out: Seconds,
}

#[derive(Debug, Clone)]
pub struct MixTrack {
    pub path: PathBuf,
    pub volume: f64,
}

/// Argument builder for one ffmpeg invocation.
///
/// Seek offsets are pushed before the input they apply to, which is what
/// makes the seek a cheap demuxer-level skip instead of a full decode; the
/// builder makes that ordering explicit rather than relying on callers
/// arranging a flat arg list correctly.
#[derive(Debug, Default)]
struct FfmpegCommand {
    args: Vec<String>,
}

impl FfmpegCommand {
    fn new() -> Self {
        Self {
            args: vec![
                "-hide_banner".into(),
                "-loglevel".into(),
                "error".into(),
                "-y".into(),
            ],
        }
    }

    /// Fast seek: must precede [`FfmpegCommand::input`].
    fn seek(mut self, at: Seconds) -> Self {
        self.args.push("-ss".into());
        self.args.push(format!("{:.3}", at.get()));
        self
    }

    fn input(mut self, path: &Path) -> Self {
        self.args.push("-i".into());
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    fn limit_duration(mut self, duration: Seconds) -> Self {
        self.args.push("-t".into());
        self.args.push(format!("{:.3}", duration.get()));
        self
    }

    fn audio_filter(mut self, filter: &str) -> Self {
        self.args.push("-af".into());
        self.args.push(filter.into());
        self
    }

    fn filter_complex(mut self, filter: &str, map: &str) -> Self {
        self.args.push("-filter_complex".into());
        self.args.push(filter.into());
        self.args.push("-map".into());
        self.args.push(map.into());
        self
    }

    fn copy_codec(mut self) -> Self {
        self.args.push("-c".into());
        self.args.push("copy".into());
        self
    }

    /// Re-encode to the canonical digest format at the given bitrate.
    fn mp3(mut self, bitrate: Bitrate) -> Self {
        self.args.extend(
            [
                "-codec:a",
                "libmp3lame",
                "-b:a",
                bitrate.as_arg(),
                "-ar",
                "44100",
                "-ac",
                "2",
            ]
            .map(String::from),
        );
        self
    }

    fn canonical(self) -> Self {
        self.mp3(Bitrate::Kbps128)
    }

    fn raw(mut self, args: &[&str]) -> Self {
        self.args.extend(args.iter().map(|s| s.to_string()));
        self
    }

    fn output(mut self, path: &Path) -> Vec<String> {
        self.args.push(path.to_string_lossy().into_owned());
        self.args
    }
}

pub struct AudioToolkit {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl AudioToolkit {
    pub fn new(ffmpeg: impl Into<PathBuf>, ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            ffprobe: ffprobe.into(),
        }
    }

    /// Whether the configured ffmpeg binary responds at all.
    pub async fn available(&self) -> bool {
        Command::new(&self.ffmpeg)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Inspect a media file; fails if ffprobe cannot parse it.
    pub async fn probe(&self, path: &Path) -> Result<ProbeResult, PipelineError> {
        let output = Command::new(&self.ffprobe)
            .args([
                "-v",
                "error",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .output()
            .await?;

        if !output.status.success() {
            return Err(subprocess_error(&self.ffprobe, &output));
        }

        let report: FfprobeReport = serde_json::from_slice(&output.stdout)
            .map_err(|e| PipelineError::Parse(format!("ffprobe output: {e}")))?;
        let stream = report
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some("audio"))
            .ok_or_else(|| PipelineError::Parse("no audio stream".into()))?;

        let duration = report
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .ok_or_else(|| PipelineError::Parse("missing duration".into()))?;
        let bitrate = report
            .format
            .bit_rate
            .as_deref()
            .and_then(|b| b.parse::<u32>().ok())
            .unwrap_or(0);

        Ok(ProbeResult {
            duration: Seconds(duration),
            sample_rate: stream
                .sample_rate
                .as_deref()
                .and_then(|r| r.parse().ok())
                .unwrap_or(0),
            channels: stream.channels.unwrap_or(0),
            codec: stream.codec_name.clone().unwrap_or_default(),
            bitrate_kbps: bitrate / 1000,
        })
    }

    /// Cut `[start, end]` out of `input` with symmetric fades, re-encoded to
    /// the canonical format. The seek happens before the input is opened.
    pub async fn slice_clip(
        &self,
        input: &Path,
        output: &Path,
        options: &SliceOptions,
    ) -> Result<(), PipelineError> {
        let length = options.end - options.start;
        let filter = fade_filter(length, options.fade_in, options.fade_out);
        let args = FfmpegCommand::new()
            .seek(options.start)
            .input(input)
            .limit_duration(length)
            .audio_filter(&filter)
            .canonical()
            .output(output);
        self.run_ffmpeg(args, output).await
    }

    /// Re-encode `input` at the given bitrate (canonical rate and channels).
    pub async fn compress(
        &self,
        input: &Path,
        output: &Path,
        bitrate: Bitrate,
    ) -> Result<(), PipelineError> {
        let args = FfmpegCommand::new().input(input).mp3(bitrate).output(output);
        self.run_ffmpeg(args, output).await
    }

    /// Extract a window of `input` starting at `start`, re-encoded to the
    /// canonical format with fast seek so output timestamps stay monotonic.
    pub async fn slice_window(
        &self,
        input: &Path,
        output: &Path,
        start: Seconds,
        duration: Seconds,
    ) -> Result<(), PipelineError> {
        let args = FfmpegCommand::new()
            .seek(start)
            .input(input)
            .limit_duration(duration)
            .canonical()
            .output(output);
        self.run_ffmpeg(args, output).await
    }

    /// Concatenate canonical-format files. A single input is copied verbatim.
    pub async fn concatenate(
        &self,
        inputs: &[PathBuf],
        output: &Path,
    ) -> Result<(), PipelineError> {
        match inputs {
            [] => Err(PipelineError::InvariantViolation(
                "concatenate requires at least one input".into(),
            )),
            [single] => {
                ensure_parent(output).await?;
                tokio::fs::copy(single, output).await?;
                Ok(())
            }
            many => {
                ensure_parent(output).await?;
                let list_path = output.with_extension("concat.txt");
                let mut list = String::new();
                for input in many {
                    // concat demuxer quoting: single quotes, escaped inline
                    let escaped = input.to_string_lossy().replace('\'', "'\\''");
                    list.push_str(&format!("file '{escaped}'\n"));
                }
                tokio::fs::write(&list_path, list).await?;

                let args = FfmpegCommand::new()
                    .raw(&["-f", "concat", "-safe", "0"])
                    .input(&list_path)
                    .copy_codec()
                    .output(output);
                let result = self.run_ffmpeg(args, output).await;
                let _ = tokio::fs::remove_file(&list_path).await;
                result
            }
        }
    }

    /// Apply fade-in/out to a whole file (probes for the fade-out anchor).
    pub async fn add_fades(
        &self,
        input: &Path,
        output: &Path,
        fade_in: Seconds,
        fade_out: Seconds,
    ) -> Result<(), PipelineError> {
        let probe = self.probe(input).await?;
        let filter = fade_filter(probe.duration, fade_in, fade_out);
        let args = FfmpegCommand::new()
            .input(input)
            .audio_filter(&filter)
            .canonical()
            .output(output);
        self.run_ffmpeg(args, output).await
    }

    /// Mix tracks with per-track gain; output lasts as long as the longest.
    pub async fn mix_tracks(
        &self,
        tracks: &[MixTrack],
        output: &Path,
    ) -> Result<(), PipelineError> {
        if tracks.is_empty() {
            return Err(PipelineError::InvariantViolation(
                "mix_tracks requires at least one track".into(),
            ));
        }

        let mut command = FfmpegCommand::new();
        for track in tracks {
            command = command.input(&track.path);
        }

        let mut filter = String::new();
        for (i, track) in tracks.iter().enumerate() {
            filter.push_str(&format!("[{i}:a]volume={:.3}[a{i}];", track.volume));
        }
        for i in 0..tracks.len() {
            filter.push_str(&format!("[a{i}]"));
        }
        filter.push_str(&format!("amix=inputs={}:duration=longest[out]", tracks.len()));

        let args = command.filter_complex(&filter, "[out]").canonical().output(output);
        self.run_ffmpeg(args, output).await
    }

    async fn run_ffmpeg(&self, args: Vec<String>, output: &Path) -> Result<(), PipelineError> {
        ensure_parent(output).await?;
        log::debug!("ffmpeg {}", args.join(" "));

        let result = Command::new(&self.ffmpeg)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !result.status.success() {
            return Err(subprocess_error(&self.ffmpeg, &result));
        }
        Ok(())
    }
}

/// `afade` pair: in from 0, out ending exactly at `length`.
fn fade_filter(length: Seconds, fade_in: Seconds, fade_out: Seconds) -> String {
    let out_start = (length - fade_out).max(Seconds::ZERO);
    format!(
        "afade=t=in:st=0:d={:.3},afade=t=out:st={:.3}:d={:.3}",
        fade_in.get(),
        out_start.get(),
        fade_out.get()
    )
}

async fn ensure_parent(path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

fn subprocess_error(program: &Path, output: &std::process::Output) -> PipelineError {
    PipelineError::Subprocess {
        program: program.to_string_lossy().into_owned(),
        status: output.status.to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeReport {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    format: FfprobeFormat,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    sample_rate: Option<String>,
    channels: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
    bit_rate: Option<String>,
}
