//! Background transcription jobs polled by clients.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use super::{wav, SttChain, SttRequest};
use crate::bus::{Event, EventBus};
use crate::entity::UsageKind;
use crate::kv::TtlStore;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SttJobStatus {
    Queued,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SttJob {
    pub job_id: String,
    pub user_id: Option<String>,
    pub status: SttJobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SttJob {
    pub fn queued(user_id: Option<String>) -> Self {
        Self {
            job_id: format!("stt_{}", Uuid::new_v4().simple()),
            user_id,
            status: SttJobStatus::Queued,
            result: None,
            confidence: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Queue a transcription and run it in the background. The finished job is
/// written back to `jobs` and published on `bus`; a successful job also adds
/// voice minutes to its user.
pub fn spawn_stt_job(
    stt: Arc<SttChain>,
    store: Store,
    jobs: Arc<dyn TtlStore<SttJob>>,
    bus: Arc<EventBus>,
    ttl: Duration,
    user_id: Option<String>,
    request: SttRequest,
) -> SttJob {
    let job = SttJob::queued(user_id);
    jobs.put(&job.job_id, job.clone(), ttl);

    let mut finished = job.clone();
    tokio::spawn(async move {
        match stt.transcribe(&request).await {
            Ok(transcript) => {
                info!("STT job {} done via {}", finished.job_id, transcript.provider);
                finished.status = SttJobStatus::Done;
                finished.result = Some(transcript.text);
                finished.confidence = transcript.confidence;

                if let Some(user_id) = &finished.user_id {
                    let minutes = wav::pcm_minutes(request.audio.len());
                    if let Err(e) = store.increment_usage(user_id, UsageKind::Voice, minutes).await {
                        warn!("Failed to record voice usage for {}: {:#}", user_id, e);
                    }
                }
            }
            Err(e) => {
                warn!("STT job {} failed: {}", finished.job_id, e);
                finished.status = SttJobStatus::Failed;
                finished.error = Some(e.to_string());
            }
        }
        finished.completed_at = Some(Utc::now());

        if !jobs.update(&finished.job_id, finished.clone()) {
            warn!("STT job {} expired before completion", finished.job_id);
        }
        bus.publish(Event::SttJob(finished));
    });

    job
}
