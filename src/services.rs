use std::sync::Arc;

use crate::audio::AudioToolkit;
use crate::cache::BlobCache;
use crate::config::{Config, SttMode, TtsProvider};
use crate::database::Database;
use crate::download::Downloader;
use crate::error::PipelineError;
use crate::llm::{ChatCompleter, LlmClient};
use crate::stt::{ApiStt, LocalStt, SpeechToText};
use crate::tts::{MockSynthesizer, OpenAiTts, SpeechSynthesizer};

/// Every dependency a stage handler needs, constructed once at startup and
/// injected explicitly — no lazy module-level singletons.
pub struct Services {
    pub config: Config,
    pub db: Arc<Database>,
    pub cache: BlobCache,
    pub audio: Arc<AudioToolkit>,
    pub downloader: Downloader,
    pub stt: Arc<dyn SpeechToText>,
    pub llm: Arc<dyn ChatCompleter>,
    pub tts: Arc<dyn SpeechSynthesizer>,
}

impl Services {
    pub fn from_config(config: Config) -> Result<Arc<Self>, PipelineError> {
        let db = Arc::new(Database::new(&config.database_path)?);

        let stt: Arc<dyn SpeechToText> = match config.stt_mode {
            SttMode::Api => {
                let api_key = config.openai_api_key.clone().ok_or_else(|| {
                    PipelineError::Unavailable("STT_MODE=api requires OPENAI_API_KEY".into())
                })?;
                Arc::new(ApiStt::new(api_key, config.stt_model.clone()))
            }
            SttMode::Local => Arc::new(
                LocalStt::new(config.whisper_cli_path.clone(), config.stt_model.clone())
                    .with_model_path(config.whisper_model_path.clone()),
            ),
        };

        let tts: Arc<dyn SpeechSynthesizer> = match config.tts_provider {
            TtsProvider::OpenAi => {
                let api_key = config.openai_api_key.clone().ok_or_else(|| {
                    PipelineError::Unavailable("TTS_PROVIDER=openai requires OPENAI_API_KEY".into())
                })?;
                Arc::new(OpenAiTts::new(api_key, config.tts_default_voice.clone()))
            }
            TtsProvider::Mock => Arc::new(MockSynthesizer::new()),
        };

        Ok(Arc::new(Self {
            db,
            cache: BlobCache::new(config.temp_root.clone()),
            audio: Arc::new(AudioToolkit::new(
                config.ffmpeg_path.clone(),
                config.ffprobe_path.clone(),
            )),
            downloader: Downloader::new(config.download_timeout)?,
            stt,
            llm: Arc::new(LlmClient::from_config(&config)),
            tts,
            config,
        }))
    }
}
