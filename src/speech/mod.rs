//! Text-to-speech and speech-to-text collaborators. Each direction is a chain
//! of providers tried in a fixed order; the first success wins.

pub mod jobs;
pub mod stt;
pub mod tts;
pub mod wav;

pub use stt::{SttChain, SttRequest};
pub use tts::{TtsChain, TtsRequest};

#[derive(Debug, thiserror::Error)]
pub enum SpeechError {
    #[error("{provider}: {message}")]
    Provider {
        provider: &'static str,
        message: String,
    },

    #[error("all speech providers failed: {}", .0.join("; "))]
    Exhausted(Vec<String>),
}

impl SpeechError {
    pub(crate) fn provider(provider: &'static str, message: impl ToString) -> Self {
        SpeechError::Provider {
            provider,
            message: message.to_string(),
        }
    }
}

/// Fail with the upstream status unless the response is 2xx.
pub(crate) async fn ensure_success(
    provider: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, SpeechError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(SpeechError::provider(
        provider,
        format!("HTTP {}: {}", status.as_u16(), body),
    ))
}
