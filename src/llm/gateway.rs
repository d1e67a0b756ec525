use std::str::FromStr;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::config::LlmConfig;

const DEFAULT_SYSTEM_PROMPT: &str = "あなたはユーザーの生活をサポートするアシスタント「メイ」です。\
丁寧で親しみやすい日本語で答えてください。\n\
返答の1行目には必ず `LLM-TAGS:` で始まる行を出力し、バックエンドに依頼したい処理を \
`key=value` を `;` で区切って列挙してください（例: `LLM-TAGS: calendar_api=true;date=2024-05-01`）。\
依頼がなければ `LLM-TAGS:` のみを出力してください。2行目以降がユーザーへの返答です。";

/// Keys searched, in order, for the reply text of a JSON response.
const REPLY_FIELDS: [&str; 6] = ["reply", "text", "response", "content", "output", "message"];

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("LLM endpoint returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("LLM response contained no reply text")]
    EmptyReply,
}

impl LlmError {
    /// Short code for API clients; the upstream body stays in the logs.
    pub fn code(&self) -> String {
        match self {
            LlmError::Transport(e) if e.is_timeout() => "llm_timeout".to_string(),
            LlmError::Transport(_) => "llm_unreachable".to_string(),
            LlmError::Status { status, .. } => format!("llm_http_{}", status),
            LlmError::EmptyReply => "llm_empty_reply".to_string(),
        }
    }
}

/// Request body shape understood by the configured endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProtocol {
    /// `{user_id, text, role_sheet, history, compressed_memory}` used by the
    /// local chat server.
    Legacy,
    /// `{system, input, context, options}`.
    Generic,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown LLM protocol {0:?}, expected \"legacy\" or \"generic\"")]
pub struct UnknownProtocol(pub String);

impl FromStr for LlmProtocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "legacy" => Ok(LlmProtocol::Legacy),
            "generic" => Ok(LlmProtocol::Generic),
            other => Err(UnknownProtocol(other.to_string())),
        }
    }
}

impl LlmProtocol {
    /// Default used when `LLM_PROTOCOL` is not set: loopback URLs speak the
    /// legacy shape.
    pub fn infer_from_url(url: &str) -> Self {
        if url.contains("127.0.0.1") || url.contains("localhost") {
            LlmProtocol::Legacy
        } else {
            LlmProtocol::Generic
        }
    }
}

/// One chat turn handed to the gateway.
#[derive(Debug, Clone, Copy)]
pub struct LlmRequest<'a> {
    pub user_id: &'a str,
    pub message: &'a str,
    pub context: &'a Map<String, Value>,
    pub options: &'a Map<String, Value>,
}

#[async_trait]
pub trait LlmGateway: Send + Sync {
    /// Returns the raw reply text, tag line included.
    async fn complete(&self, request: LlmRequest<'_>) -> Result<String, LlmError>;
}

pub struct HttpLlmGateway {
    client: reqwest::Client,
    config: LlmConfig,
}

impl HttpLlmGateway {
    pub fn new(config: LlmConfig) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;
        Ok(Self { client, config })
    }

    pub fn system_prompt(&self, request: &LlmRequest<'_>) -> String {
        let mut prompt = self
            .config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());

        let tone = [request.options, request.context]
            .into_iter()
            .find_map(|m| m.get("tone").and_then(Value::as_str))
            .map(str::trim)
            .filter(|t| !t.is_empty());
        if let Some(tone) = tone {
            prompt.push_str("\n口調: ");
            prompt.push_str(tone);
        }
        prompt
    }

    pub fn build_payload(&self, request: &LlmRequest<'_>) -> Value {
        let system = self.system_prompt(request);
        match self.config.protocol {
            LlmProtocol::Legacy => json!({
                "user_id": request.user_id,
                "text": request.message,
                "role_sheet": { "system": system },
                "history": request
                    .context
                    .get("history")
                    .filter(|h| h.is_array())
                    .cloned()
                    .unwrap_or_else(|| json!([])),
                "compressed_memory": request
                    .context
                    .get("compressed_memory")
                    .and_then(Value::as_str)
                    .unwrap_or(""),
            }),
            LlmProtocol::Generic => json!({
                "system": system,
                "input": request.message,
                "context": request.context,
                "options": request.options,
            }),
        }
    }
}

#[async_trait]
impl LlmGateway for HttpLlmGateway {
    async fn complete(&self, request: LlmRequest<'_>) -> Result<String, LlmError> {
        let payload = self.build_payload(&request);
        debug!(
            "-> LLM {} ({:?}) for user {}",
            self.config.api_url, self.config.protocol, request.user_id
        );

        let mut builder = self.client.post(&self.config.api_url).json(&payload);
        if let Some(key) = &self.config.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        extract_reply_text(&body).ok_or(LlmError::EmptyReply)
    }
}

/// Pull the reply out of a JSON or plain text response body.
pub fn extract_reply_text(body: &str) -> Option<String> {
    let text = match serde_json::from_str::<Value>(body) {
        Ok(Value::Object(obj)) => REPLY_FIELDS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str))
            .or_else(|| {
                let choice = obj.get("choices")?.get(0)?;
                choice
                    .pointer("/message/content")
                    .and_then(Value::as_str)
                    .or_else(|| choice.get("text").and_then(Value::as_str))
            })
            .map(str::to_string),
        Ok(Value::String(s)) => Some(s),
        Ok(_) => None,
        Err(_) => Some(body.to_string()),
    }?;

    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
