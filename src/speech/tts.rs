use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::{ensure_success, wav, SpeechError};
use crate::config::SpeechConfig;

#[derive(Debug, Clone)]
pub struct TtsRequest {
    pub text: String,
    pub voice: Option<String>,
    pub format: String,
    pub speed: f64,
    pub pitch: f64,
}

#[derive(Debug, Clone)]
pub struct TtsAudio {
    /// Base64 encoded audio.
    pub audio_base64: String,
    pub format: String,
    pub duration: f64,
    pub voice: String,
    pub provider: &'static str,
    pub processing_time_ms: u64,
}

#[async_trait]
pub trait TtsProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsAudio, SpeechError>;
}

// -----------------------------------------------------------------------------
// External API
// -----------------------------------------------------------------------------

/// Any HTTP TTS service accepting a Cloud-TTS style body.
pub struct ExternalTts {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl ExternalTts {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            api_key,
        }
    }
}

#[async_trait]
impl TtsProvider for ExternalTts {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsAudio, SpeechError> {
        let started = Instant::now();
        let voice = request
            .voice
            .clone()
            .unwrap_or_else(|| "ja-JP-Wavenet-A".to_string());
        let payload = json!({
            "text": request.text,
            "voice": voice,
            "audioConfig": {
                "audioEncoding": request.format.to_uppercase(),
                "speakingRate": request.speed,
                "pitch": request.pitch,
                "sampleRateHertz": wav::SAMPLE_RATE,
            }
        });

        let mut builder = self
            .client
            .post(&self.url)
            .timeout(Duration::from_secs(30))
            .json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;
        let body: Value = ensure_success(self.name(), response)
            .await?
            .json()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;

        let audio = ["audioContent", "audio", "data"]
            .iter()
            .find_map(|k| body.get(*k).and_then(Value::as_str))
            .filter(|a| !a.is_empty())
            .ok_or_else(|| SpeechError::provider(self.name(), "response carried no audio"))?;

        Ok(TtsAudio {
            audio_base64: audio.to_string(),
            format: request.format.clone(),
            duration: wav::estimate_duration_secs(&request.text),
            voice,
            provider: self.name(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

// -----------------------------------------------------------------------------
// VOICEBOX engine (audio_query -> synthesis)
// -----------------------------------------------------------------------------

pub struct VoiceboxTts {
    client: reqwest::Client,
    base_url: String,
    speaker: u32,
}

impl VoiceboxTts {
    pub fn new(client: reqwest::Client, base_url: String, speaker: u32) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            speaker,
        }
    }
}

#[async_trait]
impl TtsProvider for VoiceboxTts {
    fn name(&self) -> &'static str {
        "voicebox"
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsAudio, SpeechError> {
        let started = Instant::now();
        let speaker = request
            .voice
            .as_deref()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(self.speaker)
            .to_string();

        let response = self
            .client
            .post(format!("{}/audio_query", self.base_url))
            .query(&[("text", request.text.as_str()), ("speaker", speaker.as_str())])
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;
        let mut query: Value = ensure_success(self.name(), response)
            .await?
            .json()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;

        if let Some(obj) = query.as_object_mut() {
            obj.insert("speedScale".to_string(), json!(request.speed));
        }

        let response = self
            .client
            .post(format!("{}/synthesis", self.base_url))
            .query(&[("speaker", speaker.as_str())])
            .timeout(Duration::from_secs(120))
            .json(&query)
            .send()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;
        let audio = ensure_success(self.name(), response)
            .await?
            .bytes()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;

        if audio.is_empty() {
            return Err(SpeechError::provider(self.name(), "empty synthesis result"));
        }

        Ok(TtsAudio {
            audio_base64: STANDARD.encode(&audio),
            format: "wav".to_string(),
            duration: wav::estimate_duration_secs(&request.text),
            voice: format!("voicebox-{}", speaker),
            provider: self.name(),
            processing_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}

// -----------------------------------------------------------------------------
// Offline tone
// -----------------------------------------------------------------------------

/// Last resort: a tone so clients can still exercise their playback path.
pub struct ToneTts;

#[async_trait]
impl TtsProvider for ToneTts {
    fn name(&self) -> &'static str {
        "tone"
    }

    async fn synthesize(&self, request: &TtsRequest) -> Result<TtsAudio, SpeechError> {
        Ok(TtsAudio {
            audio_base64: STANDARD.encode(wav::tone_for_text(&request.text)),
            format: "wav".to_string(),
            duration: wav::estimate_duration_secs(&request.text),
            voice: "tone".to_string(),
            provider: self.name(),
            processing_time_ms: 0,
        })
    }
}

// -----------------------------------------------------------------------------
// Chain
// -----------------------------------------------------------------------------

pub struct TtsChain {
    providers: Vec<Arc<dyn TtsProvider>>,
}

impl TtsChain {
    pub fn new(providers: Vec<Arc<dyn TtsProvider>>) -> Self {
        Self { providers }
    }

    /// External API, then VOICEBOX, then the tone; unconfigured providers are
    /// left out.
    pub fn from_config(config: &SpeechConfig, client: reqwest::Client) -> Self {
        let mut providers: Vec<Arc<dyn TtsProvider>> = Vec::new();
        if let Some(url) = &config.tts_api_url {
            providers.push(Arc::new(ExternalTts::new(
                client.clone(),
                url.clone(),
                config.tts_api_key.clone(),
            )));
        }
        if let Some(url) = &config.voicebox_url {
            providers.push(Arc::new(VoiceboxTts::new(
                client.clone(),
                url.clone(),
                config.voicebox_speaker,
            )));
        }
        providers.push(Arc::new(ToneTts));
        Self::new(providers)
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub async fn synthesize(&self, request: &TtsRequest) -> Result<TtsAudio, SpeechError> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.synthesize(request).await {
                Ok(audio) => {
                    debug!("TTS served by {}", provider.name());
                    return Ok(audio);
                }
                Err(e) => {
                    warn!("TTS provider {} failed: {}", provider.name(), e);
                    failures.push(e.to_string());
                }
            }
        }
        Err(SpeechError::Exhausted(failures))
    }
}
