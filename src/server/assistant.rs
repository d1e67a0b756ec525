use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use super::AppState;
use crate::entity::UsageKind;
use crate::error::ApiError;
use crate::session::AssistantSession;
use crate::speech::jobs::{spawn_stt_job, SttJob};
use crate::speech::{wav, SttRequest, TtsRequest};

const DEFAULT_LOCALE: &str = "ja-JP";

/// Upper bound for a client supplied `options.ttlMs`.
const MAX_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

// -----------------------------------------------------------------------------
// Sessions
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBody {
    user_id: Option<String>,
    locale: Option<String>,
    model: Option<String>,
    #[serde(default)]
    options: Map<String, Value>,
}

pub(super) async fn start_session(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SessionBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let user_id = body
        .user_id
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| ApiError::field("userId", "\"userId\" is required"))?;

    let ttl = session_ttl(&body.options, state.config.session_ttl)?;

    let session = AssistantSession::new(
        user_id,
        body.locale.unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
        body.model.unwrap_or_else(|| "default".to_string()),
        body.options,
        ttl,
    );
    state.sessions.put(&session.session_id, session.clone(), ttl);
    info!("Opened assistant session {} for {}", session.session_id, session.user_id);

    Ok(Json(json!({
        "success": true,
        "sessionId": session.session_id,
        "expiresAt": session.expires_at.to_rfc3339(),
    })))
}

/// `options.ttlMs` when present, which must lie in `1..=MAX_SESSION_TTL`.
fn session_ttl(options: &Map<String, Value>, default: Duration) -> Result<Duration, ApiError> {
    let max_ms = MAX_SESSION_TTL.as_millis() as u64;
    match options.get("ttlMs") {
        None | Some(Value::Null) => Ok(default.min(MAX_SESSION_TTL)),
        Some(value) => value
            .as_u64()
            .filter(|ms| (1..=max_ms).contains(ms))
            .map(Duration::from_millis)
            .ok_or_else(|| {
                ApiError::field(
                    "options.ttlMs",
                    format!("\"options.ttlMs\" must be an integer between 1 and {}", max_ms),
                )
            }),
    }
}

pub(super) async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<AssistantSession>, ApiError> {
    state
        .sessions
        .get(&session_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Session not found or expired".to_string()))
}

pub(super) async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let session = state
        .sessions
        .remove(&session_id)
        .ok_or_else(|| ApiError::NotFound("Session not found or expired".to_string()))?;
    info!("Closed assistant session {} for {}", session.session_id, session.user_id);

    Ok(Json(json!({
        "success": true,
        "sessionId": session.session_id,
    })))
}

// -----------------------------------------------------------------------------
// Text-to-speech
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TtsBody {
    text: Option<String>,
    voice: Option<String>,
    format: Option<String>,
    speed: Option<f64>,
    pitch: Option<f64>,
}

pub(super) async fn synthesize(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<TtsBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let text = body
        .text
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::field("text", "\"text\" is required"))?;

    let request = TtsRequest {
        text,
        voice: body.voice,
        format: body.format.unwrap_or_else(|| "wav".to_string()),
        speed: body.speed.unwrap_or(1.0),
        pitch: body.pitch.unwrap_or(1.0),
    };
    let audio = state
        .tts
        .synthesize(&request)
        .await
        .map_err(|e| ApiError::upstream("Speech synthesis failed", e))?;

    Ok(Json(json!({
        "success": true,
        "audioData": audio.audio_base64,
        "format": audio.format,
        "duration": audio.duration,
        "voice": audio.voice,
        "provider": audio.provider,
        "metadata": {
            "textLength": request.text.chars().count(),
            "processingTime": audio.processing_time_ms,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        },
    })))
}

// -----------------------------------------------------------------------------
// Speech-to-text
// -----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SttBody {
    audio_data: Option<String>,
    format: Option<String>,
    language: Option<String>,
    user_id: Option<String>,
}

impl SttBody {
    fn into_request(self) -> Result<(Option<String>, SttRequest), ApiError> {
        let encoded = self
            .audio_data
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| ApiError::field("audioData", "\"audioData\" is required"))?;
        let audio = STANDARD
            .decode(encoded.trim())
            .map_err(|e| ApiError::field("audioData", format!("\"audioData\" is not valid base64: {}", e)))?;
        if audio.is_empty() {
            return Err(ApiError::field("audioData", "\"audioData\" is empty"));
        }

        let request = SttRequest {
            audio,
            format: self.format.unwrap_or_else(|| "wav".to_string()),
            language: self.language.unwrap_or_else(|| DEFAULT_LOCALE.to_string()),
        };
        Ok((self.user_id, request))
    }
}

pub(super) async fn transcribe(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SttBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let (user_id, request) = body.into_request()?;

    let transcript = state.stt.transcribe(&request).await.map_err(|e| {
        warn!("Transcription failed: {}", e);
        ApiError::upstream("Speech recognition failed", e)
    })?;

    if let Some(user_id) = user_id {
        let minutes = wav::pcm_minutes(request.audio.len());
        if let Err(e) = state.store.increment_usage(&user_id, UsageKind::Voice, minutes).await {
            warn!("Failed to record voice usage for {}: {:#}", user_id, e);
        }
    }

    Ok(Json(json!({
        "success": true,
        "transcript": transcript.text,
        "confidence": transcript.confidence,
        "provider": transcript.provider,
    })))
}

pub(super) async fn create_stt_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<SttBody>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let Json(body) = payload?;
    let (user_id, request) = body.into_request()?;

    let job = spawn_stt_job(
        state.stt.clone(),
        state.store.clone(),
        state.stt_jobs.clone(),
        state.bus.clone(),
        state.config.stt_job_ttl,
        user_id,
        request,
    );
    info!("Queued STT job {}", job.job_id);

    Ok(Json(json!({
        "success": true,
        "jobId": job.job_id,
    })))
}

pub(super) async fn get_stt_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<Json<SttJob>, ApiError> {
    state
        .stt_jobs
        .get(&job_id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound("Job not found".to_string()))
}
