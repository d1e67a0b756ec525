use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::process::Command;
use tracing::{debug, warn};

use super::{ensure_success, wav, SpeechError};
use crate::config::SpeechConfig;

const WHISPER_URL: &str = "https://api.openai.com/v1/audio/transcriptions";

#[derive(Debug, Clone)]
pub struct SttRequest {
    pub audio: Vec<u8>,
    pub format: String,
    /// BCP-47 tag such as `ja-JP`.
    pub language: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transcript {
    pub text: String,
    pub confidence: Option<f64>,
    pub provider: &'static str,
}

#[async_trait]
pub trait SttProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn transcribe(&self, request: &SttRequest) -> Result<Transcript, SpeechError>;
}

// -----------------------------------------------------------------------------
// External API
// -----------------------------------------------------------------------------

pub struct ExternalStt {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl ExternalStt {
    pub fn new(client: reqwest::Client, url: String, api_key: Option<String>) -> Self {
        Self {
            client,
            url,
            api_key,
        }
    }
}

#[async_trait]
impl SttProvider for ExternalStt {
    fn name(&self) -> &'static str {
        "external"
    }

    async fn transcribe(&self, request: &SttRequest) -> Result<Transcript, SpeechError> {
        let payload = json!({
            "audio": STANDARD.encode(&request.audio),
            "format": request.format,
            "language": request.language,
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

        let text = ["transcript", "text"]
            .iter()
            .find_map(|k| body.get(*k).and_then(Value::as_str))
            .ok_or_else(|| SpeechError::provider(self.name(), "response carried no transcript"))?;

        Ok(Transcript {
            text: text.trim().to_string(),
            confidence: body.get("confidence").and_then(Value::as_f64),
            provider: self.name(),
        })
    }
}

// -----------------------------------------------------------------------------
// Local VOSK helper
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum VoskOutput {
    Failure { error: String, message: Option<String> },
    Success { text: String, confidence: Option<f64> },
}

/// Runs the VOSK helper script: `<python> <script> <wav> <model> <rate>`,
/// which prints one JSON object on stdout.
pub struct VoskStt {
    python_bin: String,
    script: PathBuf,
    model_path: PathBuf,
    timeout: Duration,
}

impl VoskStt {
    pub fn new(python_bin: String, script: PathBuf, model_path: PathBuf) -> Self {
        Self {
            python_bin,
            script,
            model_path,
            timeout: Duration::from_secs(60),
        }
    }

    async fn run(&self, wav_path: &std::path::Path) -> Result<Transcript, SpeechError> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.python_bin)
                .arg(&self.script)
                .arg(wav_path)
                .arg(&self.model_path)
                .arg(wav::SAMPLE_RATE.to_string())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| SpeechError::provider(self.name(), "helper timed out"))?
        .map_err(|e| SpeechError::provider(self.name(), e))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");

        match serde_json::from_str::<VoskOutput>(line) {
            Ok(VoskOutput::Success { text, confidence }) if !text.trim().is_empty() => Ok(Transcript {
                text: text.trim().to_string(),
                confidence,
                provider: self.name(),
            }),
            Ok(VoskOutput::Success { .. }) => {
                Err(SpeechError::provider(self.name(), "empty transcript"))
            }
            Ok(VoskOutput::Failure { error, message }) => Err(SpeechError::provider(
                self.name(),
                format!("{}: {}", error, message.unwrap_or_default()),
            )),
            Err(_) => Err(SpeechError::provider(
                self.name(),
                format!(
                    "unreadable helper output (exit {}): {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            )),
        }
    }
}

#[async_trait]
impl SttProvider for VoskStt {
    fn name(&self) -> &'static str {
        "vosk"
    }

    async fn transcribe(&self, request: &SttRequest) -> Result<Transcript, SpeechError> {
        if !request.format.eq_ignore_ascii_case("wav") {
            return Err(SpeechError::provider(self.name(), "only wav input is supported"));
        }

        // Removed on drop, including when the request future is cancelled.
        let wav_file = tempfile::Builder::new()
            .prefix("lumimei_stt_")
            .suffix(".wav")
            .tempfile()
            .map_err(|e| SpeechError::provider(self.name(), e))?;
        tokio::fs::write(wav_file.path(), &request.audio)
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;

        self.run(wav_file.path()).await
    }
}

// -----------------------------------------------------------------------------
// OpenAI Whisper
// -----------------------------------------------------------------------------

pub struct WhisperStt {
    client: reqwest::Client,
    url: String,
    api_key: String,
}

impl WhisperStt {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            url: WHISPER_URL.to_string(),
            api_key,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }
}

#[async_trait]
impl SttProvider for WhisperStt {
    fn name(&self) -> &'static str {
        "whisper"
    }

    async fn transcribe(&self, request: &SttRequest) -> Result<Transcript, SpeechError> {
        // Whisper takes ISO-639-1, so `ja-JP` becomes `ja`.
        let language = request
            .language
            .split(['-', '_'])
            .next()
            .unwrap_or("ja")
            .to_lowercase();

        let file = reqwest::multipart::Part::bytes(request.audio.clone())
            .file_name(format!("audio.{}", request.format));
        let form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", "whisper-1")
            .text("language", language);

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(120))
            .multipart(form)
            .send()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;
        let body: Value = ensure_success(self.name(), response)
            .await?
            .json()
            .await
            .map_err(|e| SpeechError::provider(self.name(), e))?;

        let text = body
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| SpeechError::provider(self.name(), "response carried no text"))?;

        Ok(Transcript {
            text: text.trim().to_string(),
            confidence: None,
            provider: self.name(),
        })
    }
}

// -----------------------------------------------------------------------------
// Chain
// -----------------------------------------------------------------------------

pub struct SttChain {
    providers: Vec<Arc<dyn SttProvider>>,
}

impl SttChain {
    pub fn new(providers: Vec<Arc<dyn SttProvider>>) -> Self {
        Self { providers }
    }

    /// External API, then the local VOSK helper, then Whisper; providers
    /// missing configuration are left out.
    pub fn from_config(config: &SpeechConfig, client: reqwest::Client) -> Self {
        let mut providers: Vec<Arc<dyn SttProvider>> = Vec::new();
        if let Some(url) = &config.stt_api_url {
            providers.push(Arc::new(ExternalStt::new(
                client.clone(),
                url.clone(),
                config.stt_api_key.clone(),
            )));
        }
        if let (Some(script), Some(model)) = (&config.vosk_script, &config.vosk_model_path) {
            providers.push(Arc::new(VoskStt::new(
                config.python_bin.clone(),
                script.clone(),
                model.clone(),
            )));
        }
        if let Some(key) = &config.openai_api_key {
            providers.push(Arc::new(WhisperStt::new(client.clone(), key.clone())));
        }
        Self::new(providers)
    }

    pub fn provider_names(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub async fn transcribe(&self, request: &SttRequest) -> Result<Transcript, SpeechError> {
        let mut failures = Vec::new();
        for provider in &self.providers {
            match provider.transcribe(request).await {
                Ok(transcript) => {
                    debug!("STT served by {}", provider.name());
                    return Ok(transcript);
                }
                Err(e) => {
                    warn!("STT provider {} failed: {}", provider.name(), e);
                    failures.push(e.to_string());
                }
            }
        }
        Err(SpeechError::Exhausted(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{spawn_upstream, FakeStt};
    use axum::{routing::post, Json, Router};

    fn request() -> SttRequest {
        SttRequest {
            audio: b"RIFF....".to_vec(),
            format: "wav".to_string(),
            language: "ja-JP".to_string(),
        }
    }

    #[tokio::test]
    async fn test_chain_stops_at_first_success() {
        let first = Arc::new(FakeStt::failing("first"));
        let second = Arc::new(FakeStt::ok("second", "こんにちは"));
        let third = Arc::new(FakeStt::ok("third", "unused"));
        let chain = SttChain::new(vec![first.clone(), second.clone(), third.clone()]);

        let transcript = chain.transcribe(&request()).await.unwrap();
        assert_eq!(transcript.text, "こんにちは");
        assert_eq!(transcript.provider, "second");
        assert_eq!(first.calls(), 1);
        assert_eq!(third.calls(), 0);
    }

    #[tokio::test]
    async fn test_chain_reports_every_failure() {
        let chain = SttChain::new(vec![
            Arc::new(FakeStt::failing("a")),
            Arc::new(FakeStt::failing("b")),
        ]);
        match chain.transcribe(&request()).await {
            Err(SpeechError::Exhausted(failures)) => assert_eq!(failures.len(), 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_from_config_order() {
        let config = SpeechConfig {
            stt_api_url: Some("http://stt.example".into()),
            vosk_script: Some("vosk_stt.py".into()),
            vosk_model_path: Some("model".into()),
            openai_api_key: Some("key".into()),
            ..SpeechConfig::default()
        };
        let chain = SttChain::from_config(&config, reqwest::Client::new());
        assert_eq!(chain.provider_names(), ["external", "vosk", "whisper"]);

        let empty = SttChain::from_config(&SpeechConfig::default(), reqwest::Client::new());
        assert!(empty.provider_names().is_empty());
    }

    #[tokio::test]
    async fn test_external_stt() {
        let router = Router::new().route(
            "/stt",
            post(|Json(body): Json<Value>| async move {
                assert_eq!(body["language"], "ja-JP");
                assert!(body["audio"].as_str().is_some());
                Json(json!({ "transcript": " おはよう ", "confidence": 0.92 }))
            }),
        );
        let base = spawn_upstream(router).await;
        let stt = ExternalStt::new(reqwest::Client::new(), format!("{}/stt", base), None);

        let transcript = stt.transcribe(&request()).await.unwrap();
        assert_eq!(transcript.text, "おはよう");
        assert_eq!(transcript.confidence, Some(0.92));
    }

    #[tokio::test]
    async fn test_whisper_multipart() {
        let router = Router::new().route(
            "/v1/audio/transcriptions",
            post(|body: String| async move {
                assert!(body.contains("whisper-1"));
                assert!(body.contains("audio.wav"));
                Json(json!({ "text": "テスト" }))
            }),
        );
        let base = spawn_upstream(router).await;
        let stt = WhisperStt::new(reqwest::Client::new(), "key".into())
            .with_url(format!("{}/v1/audio/transcriptions", base));

        let transcript = stt.transcribe(&request()).await.unwrap();
        assert_eq!(transcript.text, "テスト");
        assert_eq!(transcript.provider, "whisper");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_vosk_helper_protocol() {
        let dir = tempfile::tempdir().unwrap();
        let ok_script = dir.path().join("ok.sh");
        std::fs::write(&ok_script, "echo '{\"text\": \"もしもし\", \"confidence\": 0.85}'\n").unwrap();
        let bad_script = dir.path().join("bad.sh");
        std::fs::write(
            &bad_script,
            "echo '{\"error\": \"model_not_found\", \"message\": \"missing\"}'\nexit 1\n",
        )
        .unwrap();

        let ok = VoskStt::new("sh".into(), ok_script, "model".into());
        let transcript = ok.transcribe(&request()).await.unwrap();
        assert_eq!(transcript.text, "もしもし");
        assert_eq!(transcript.confidence, Some(0.85));

        let bad = VoskStt::new("sh".into(), bad_script, "model".into());
        let err = bad.transcribe(&request()).await.unwrap_err();
        assert!(err.to_string().contains("model_not_found"));

        let mut mp3 = request();
        mp3.format = "mp3".into();
        assert!(ok.transcribe(&mp3).await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_vosk_input_file_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("echo_path.sh");
        std::fs::write(&script, "test -f \"$1\" && echo \"{\\\"text\\\": \\\"$1\\\"}\"\n").unwrap();

        let stt = VoskStt::new("sh".into(), script, "model".into());
        let transcript = stt.transcribe(&request()).await.unwrap();

        let wav_path = std::path::PathBuf::from(&transcript.text);
        assert!(wav_path.file_name().unwrap().to_string_lossy().starts_with("lumimei_stt_"));
        assert!(!wav_path.exists());
    }
}
