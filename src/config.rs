//! Service configuration, read from the process environment.

use std::path::PathBuf;
use std::time::Duration;

use crate::llm::LlmProtocol;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind address.
    pub bind_addr: String,

    /// HTTP port.
    pub port: u16,

    /// SQLite database file.
    pub database_path: PathBuf,

    pub llm: LlmConfig,
    pub google: GoogleOAuthConfig,
    pub speech: SpeechConfig,
    pub vision: VisionConfig,

    /// Lifetime of assistant sessions.
    pub session_ttl: Duration,

    /// How long finished STT jobs stay queryable.
    pub stt_job_ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_url: String,
    pub api_key: Option<String>,
    pub system_prompt: Option<String>,
    pub protocol: LlmProtocol,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct GoogleOAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub tts_api_url: Option<String>,
    pub tts_api_key: Option<String>,
    pub voicebox_url: Option<String>,
    pub voicebox_speaker: u32,
    pub stt_api_url: Option<String>,
    pub stt_api_key: Option<String>,
    pub vosk_script: Option<PathBuf>,
    pub vosk_model_path: Option<PathBuf>,
    pub python_bin: String,
    pub openai_api_key: Option<String>,
}

/// LM Studio style multimodal endpoint used for image descriptions.
#[derive(Debug, Clone)]
pub struct VisionConfig {
    pub api_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3000,
            database_path: PathBuf::from("lumimei.db"),
            llm: LlmConfig::default(),
            google: GoogleOAuthConfig::default(),
            speech: SpeechConfig::default(),
            vision: VisionConfig::default(),
            session_ttl: Duration::from_secs(30 * 60),
            stt_job_ttl: Duration::from_secs(60 * 60),
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        let api_url = "http://127.0.0.1:8000/chat".to_string();
        Self {
            protocol: LlmProtocol::infer_from_url(&api_url),
            api_url,
            api_key: None,
            system_prompt: None,
            timeout: Duration::from_secs(60),
        }
    }
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            tts_api_url: None,
            tts_api_key: None,
            voicebox_url: None,
            voicebox_speaker: 1,
            stt_api_url: None,
            stt_api_key: None,
            vosk_script: None,
            vosk_model_path: None,
            python_bin: "python3".to_string(),
            openai_api_key: None,
        }
    }
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8080/v1/generate".to_string(),
            model: "gemma-3-12b-it@q4_k_m".to_string(),
            api_key: None,
            timeout: Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Build the configuration from environment variables, falling back to
    /// [`Config::default`] for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Config::default();

        let port = match var("PORT") {
            Some(p) => p
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT {:?}: {}", p, e))?,
            None => defaults.port,
        };

        let database_path = match var("DATABASE_PATH") {
            Some(p) => PathBuf::from(p),
            None => {
                let home_dir = var("HOME").unwrap_or_else(|| ".".into());
                PathBuf::from(home_dir).join(".lumimei").join("lumimei.db")
            }
        };

        let api_url = var("LLM_API_URL").unwrap_or(defaults.llm.api_url);
        let protocol = match var("LLM_PROTOCOL") {
            Some(p) => p.parse()?,
            None => LlmProtocol::infer_from_url(&api_url),
        };

        let llm = LlmConfig {
            api_url,
            api_key: var("LLM_API_KEY"),
            system_prompt: var("LLM_SYSTEM_PROMPT"),
            protocol,
            timeout: secs(var("LLM_TIMEOUT_SECS"), defaults.llm.timeout)?,
        };

        let google = GoogleOAuthConfig {
            client_id: var("GCP_OAUTH2_CLIENT_ID"),
            client_secret: var("GCP_OAUTH2_CLIENT_SECRET"),
        };

        let voicebox_speaker = match var("VOICEBOX_SPEAKER") {
            Some(s) => s
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid VOICEBOX_SPEAKER {:?}: {}", s, e))?,
            None => defaults.speech.voicebox_speaker,
        };

        let speech = SpeechConfig {
            tts_api_url: var("TTS_API_URL"),
            tts_api_key: var("TTS_API_KEY"),
            voicebox_url: var("VOICEBOX_URL"),
            voicebox_speaker,
            stt_api_url: var("STT_API_URL"),
            stt_api_key: var("STT_API_KEY"),
            vosk_script: var("VOSK_SCRIPT").map(PathBuf::from),
            vosk_model_path: var("VOSK_MODEL_PATH").map(PathBuf::from),
            python_bin: var("PYTHON_BIN").unwrap_or(defaults.speech.python_bin),
            openai_api_key: var("OPENAI_API_KEY"),
        };

        let vision = VisionConfig {
            api_url: var("LMSTUDIO_API_URL").unwrap_or(defaults.vision.api_url),
            model: var("LMSTUDIO_MODEL").unwrap_or(defaults.vision.model),
            api_key: var("LMSTUDIO_API_KEY"),
            timeout: secs(var("VISION_TIMEOUT_SECS"), defaults.vision.timeout)?,
        };

        Ok(Self {
            bind_addr: var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            port,
            database_path,
            llm,
            google,
            speech,
            vision,
            session_ttl: secs(var("SESSION_TTL_SECS"), defaults.session_ttl)?,
            stt_job_ttl: secs(var("STT_JOB_TTL_SECS"), defaults.stt_job_ttl)?,
        })
    }
}

fn secs(value: Option<String>, default: Duration) -> anyhow::Result<Duration> {
    match value {
        Some(v) => {
            let n: u64 = v
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid duration {:?}: {}", v, e))?;
            Ok(Duration::from_secs(n))
        }
        None => Ok(default),
    }
}
