//! Image descriptions from a multimodal model served by LM Studio.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::VisionConfig;
use crate::llm::gateway::extract_reply_text;

const SYSTEM_PROMPT: &str = "あなたは画像説明を行うアシスタントです。簡潔に、丁寧に答えてください。";
pub const DEFAULT_PROMPT: &str = "この画像について説明してください。";

#[derive(Debug, thiserror::Error)]
pub enum VisionError {
    #[error("vision request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("vision endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("vision response contained no text")]
    EmptyReply,
}

#[derive(Debug, Clone)]
pub struct VisionRequest {
    pub image: Vec<u8>,
    pub mime_type: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VisionAnalysis {
    pub description: String,
    pub model: String,
}

#[async_trait]
pub trait VisionProvider: Send + Sync {
    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis, VisionError>;
}

pub struct LmStudioVision {
    client: reqwest::Client,
    config: VisionConfig,
}

impl LmStudioVision {
    pub fn new(config: VisionConfig) -> Result<Self, VisionError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    /// OpenAI style chat payload with the image inlined as a data URI.
    pub fn build_payload(&self, request: &VisionRequest) -> Value {
        let image_url = format!("data:{};base64,{}", request.mime_type, STANDARD.encode(&request.image));
        json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": SYSTEM_PROMPT },
                {
                    "role": "user",
                    "content": [
                        { "type": "text", "text": request.prompt },
                        { "type": "image_url", "image_url": { "url": image_url } },
                    ],
                },
            ],
            "max_tokens": request.max_tokens,
            "temperature": request.temperature,
        })
    }
}

#[async_trait]
impl VisionProvider for LmStudioVision {
    async fn analyze(&self, request: &VisionRequest) -> Result<VisionAnalysis, VisionError> {
        debug!(
            "-> vision {} ({} bytes of {})",
            self.config.api_url,
            request.image.len(),
            request.mime_type
        );

        let mut builder = self.client.post(&self.config.api_url).json(&self.build_payload(request));
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(VisionError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let description = reply_text(&body).ok_or(VisionError::EmptyReply)?;
        Ok(VisionAnalysis {
            description,
            model: self.config.model.clone(),
        })
    }
}

/// LM Studio's generate endpoint answers in `result`; everything else reads
/// like a chat reply.
fn reply_text(body: &str) -> Option<String> {
    if let Ok(Value::Object(obj)) = serde_json::from_str::<Value>(body) {
        if let Some(text) = obj.get("result").and_then(Value::as_str) {
            if !text.trim().is_empty() {
                return Some(text.to_string());
            }
        }
    }
    extract_reply_text(body)
}

/// Split an optional `data:<mime>;base64,` prefix off an upload. Bare
/// base64 is taken as JPEG.
pub fn split_data_uri(data: &str) -> (&str, &str) {
    let data = data.trim();
    data.strip_prefix("data:")
        .and_then(|rest| rest.split_once(','))
        .map(|(header, payload)| {
            let mime = header.trim_end_matches(";base64");
            (if mime.is_empty() { "image/jpeg" } else { mime }, payload)
        })
        .unwrap_or(("image/jpeg", data))
}
