use std::path::{Path, PathBuf};
use std::time::Duration;

/// Which speech-to-text backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SttMode {
    Api,
    Local,
}

/// Which text-to-speech backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtsProvider {
    OpenAi,
    Mock,
}

/// Runtime configuration, resolved once at startup from the environment.
///
/// Every knob has a default so a bare `sifter serve` works against local
/// binaries and /tmp paths; credentials are the only values that must come
/// from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database file backing both entity state and the job queue.
    pub database_path: PathBuf,
    /// Root for all transient audio (episode downloads, chunks, work dirs).
    pub temp_root: PathBuf,
    /// Durable location for published digest MP3s.
    pub digest_root: PathBuf,

    /// Per-call upload limit of the STT service, in bytes.
    pub stt_max_file_size: u64,
    /// Soft target for an individual chunk file, in bytes.
    pub target_chunk_size: u64,
    /// Window length when slicing an uncompressed source, in seconds.
    pub chunk_duration_seconds: f64,
    /// Overlap between adjacent chunk windows, in seconds.
    pub chunk_overlap_seconds: f64,

    pub stt_mode: SttMode,
    pub stt_model: String,
    /// Command invoked for local transcription (emits transcript JSON on stdout).
    pub whisper_cli_path: PathBuf,
    /// Model file handed to the local transcription command; when set it
    /// overrides the `stt_model` catalog name.
    pub whisper_model_path: Option<PathBuf>,

    pub llm_provider: String,
    pub default_llm_model: String,
    pub llm_fallback_to_openai: bool,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,

    pub tts_provider: TtsProvider,
    pub tts_default_voice: String,

    pub ffmpeg_path: PathBuf,
    pub ffprobe_path: PathBuf,

    /// Wall-clock limit for a single episode download.
    pub download_timeout: Duration,
    /// Orchestrator delay between readiness polls.
    pub poll_interval: Duration,
    /// Orchestrator total polling ceiling.
    pub poll_ceiling: Duration,

    /// Concurrent transcription jobs per worker process.
    pub transcription_concurrency: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("sifter.db"),
            temp_root: PathBuf::from("/tmp/sifter"),
            digest_root: PathBuf::from("/tmp/sifter/digests"),
            stt_max_file_size: 25 * 1024 * 1024,
            target_chunk_size: 22 * 1024 * 1024,
            chunk_duration_seconds: 1200.0,
            chunk_overlap_seconds: 2.0,
            stt_mode: SttMode::Api,
            stt_model: "whisper-1".to_string(),
            whisper_cli_path: PathBuf::from("whisper-transcribe"),
            whisper_model_path: None,
            llm_provider: "anthropic".to_string(),
            default_llm_model: "claude-sonnet-4".to_string(),
            llm_fallback_to_openai: true,
            openai_api_key: None,
            anthropic_api_key: None,
            tts_provider: TtsProvider::OpenAi,
            tts_default_voice: "alloy".to_string(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            ffprobe_path: PathBuf::from("ffprobe"),
            download_timeout: Duration::from_secs(30 * 60),
            poll_interval: Duration::from_secs(5),
            poll_ceiling: Duration::from_secs(20 * 60),
            transcription_concurrency: 2,
        }
    }
}

impl Config {
    /// Build a config from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            database_path: env_path("DATABASE_URL", defaults.database_path),
            temp_root: env_path("SIFTER_TEMP_ROOT", defaults.temp_root),
            digest_root: env_path("SIFTER_DIGEST_ROOT", defaults.digest_root),
            stt_max_file_size: env_parse("STT_MAX_FILE_SIZE", defaults.stt_max_file_size),
            target_chunk_size: env_parse("TARGET_CHUNK_SIZE", defaults.target_chunk_size),
            chunk_duration_seconds: env_parse(
                "DEFAULT_CHUNK_DURATION_SECONDS",
                defaults.chunk_duration_seconds,
            ),
            chunk_overlap_seconds: env_parse(
                "CHUNK_OVERLAP_SECONDS",
                defaults.chunk_overlap_seconds,
            ),
            stt_mode: match env_string("STT_MODE").as_deref() {
                Some("local") => SttMode::Local,
                Some("api") | None => SttMode::Api,
                Some(other) => {
                    log::warn!("Unknown STT_MODE '{}', using api", other);
                    SttMode::Api
                }
            },
            stt_model: env_string("STT_MODEL").unwrap_or(defaults.stt_model),
            whisper_cli_path: env_path("WHISPER_CLI_PATH", defaults.whisper_cli_path),
            whisper_model_path: env_string("WHISPER_MODEL_PATH").map(PathBuf::from),
            llm_provider: env_string("LLM_PROVIDER").unwrap_or(defaults.llm_provider),
            default_llm_model: env_string("DEFAULT_LLM_MODEL").unwrap_or(defaults.default_llm_model),
            llm_fallback_to_openai: env_string("LLM_FALLBACK_TO_OPENAI")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.llm_fallback_to_openai),
            openai_api_key: env_string("OPENAI_API_KEY"),
            anthropic_api_key: env_string("ANTHROPIC_API_KEY"),
            tts_provider: match env_string("TTS_PROVIDER").as_deref() {
                Some("mock") => TtsProvider::Mock,
                Some("openai") | None => TtsProvider::OpenAi,
                Some(other) => {
                    log::warn!("Unknown TTS_PROVIDER '{}', using openai", other);
                    TtsProvider::OpenAi
                }
            },
            tts_default_voice: env_string("TTS_DEFAULT_VOICE").unwrap_or(defaults.tts_default_voice),
            ffmpeg_path: env_path("FFMPEG_PATH", defaults.ffmpeg_path),
            ffprobe_path: env_path("FFPROBE_PATH", defaults.ffprobe_path),
            download_timeout: Duration::from_secs(env_parse(
                "DOWNLOAD_TIMEOUT_SECONDS",
                defaults.download_timeout.as_secs(),
            )),
            poll_interval: Duration::from_secs(env_parse(
                "ORCHESTRATOR_POLL_INTERVAL_SECONDS",
                defaults.poll_interval.as_secs(),
            )),
            poll_ceiling: Duration::from_secs(env_parse(
                "ORCHESTRATOR_POLL_CEILING_SECONDS",
                defaults.poll_ceiling.as_secs(),
            )),
            transcription_concurrency: env_parse(
                "TRANSCRIPTION_CONCURRENCY",
                defaults.transcription_concurrency,
            ),
        }
    }

    /// Window length when slicing the 64 kbps compressed stream.
    ///
    /// Scaled up from the uncompressed default (20 minutes) to 25 minutes: a
    /// 25-minute window at the canonical re-encode bitrate stays under the
    /// 25 MiB STT limit.
    pub fn compressed_chunk_duration_seconds(&self) -> f64 {
        self.chunk_duration_seconds * 1.25
    }
}

/// Load `KEY=VALUE` lines from a `.env` file into the process environment.
///
/// Existing variables win; quotes around values are stripped. Missing file is
/// not an error.
pub fn load_dotenv(path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else {
        return;
    };

    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let Some((key, value)) = trimmed.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if std::env::var(key).is_err() {
            std::env::set_var(key, value);
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env_string(key).map(PathBuf::from).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_string(key) {
        Some(raw) => match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("Could not parse {}='{}', using default", key, raw);
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let config = Config::default();
        assert_eq!(config.stt_max_file_size, 25 * 1024 * 1024);
        assert_eq!(config.whisper_model_path, None);
        assert_eq!(config.chunk_duration_seconds, 1200.0);
        assert_eq!(config.compressed_chunk_duration_seconds(), 1500.0);
        assert_eq!(config.chunk_overlap_seconds, 2.0);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.poll_ceiling, Duration::from_secs(1200));
    }

    #[test]
    fn dotenv_does_not_override_existing_vars() {
        let dir = tempfile::TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "SIFTER_TEST_DOTENV_A=file\n# comment\nbad line\n").unwrap();

        std::env::set_var("SIFTER_TEST_DOTENV_A", "process");
        load_dotenv(&env_path);
        assert_eq!(std::env::var("SIFTER_TEST_DOTENV_A").unwrap(), "process");
    }

    #[test]
    fn dotenv_strips_quotes() {
        let dir = tempfile::TempDir::new().unwrap();
        let env_path = dir.path().join(".env");
        std::fs::write(&env_path, "SIFTER_TEST_DOTENV_B=\"quoted value\"\n").unwrap();

        load_dotenv(&env_path);
        assert_eq!(
            std::env::var("SIFTER_TEST_DOTENV_B").unwrap(),
            "quoted value"
        );
    }
}
