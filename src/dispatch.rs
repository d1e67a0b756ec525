//! Acts on the tags of a parsed LLM reply before the reply reaches the user.

use std::sync::Arc;

use chrono::{Local, NaiveDate};
use serde::Serialize;
use tracing::{info, warn};

use crate::calendar::{CalendarEvent, CalendarProvider};
use crate::entity::User;
use crate::llm::ParsedTags;

pub const CALENDAR_TAG: &str = "calendar_api";
pub const DATE_TAG: &str = "date";

const PERMISSION_MISSING_SUFFIX: &str =
    "（カレンダーを確認するには、Googleアカウントの連携とカレンダー閲覧の許可が必要です。設定画面から連携してください。）";
const CALENDAR_FAILED_SUFFIX: &str =
    "（申し訳ありません、カレンダーの取得中にエラーが発生しました。時間をおいてもう一度お試しください。）";
pub const LLM_FAILED_REPLY: &str =
    "申し訳ありません、ただいま応答を生成できませんでした。少し時間をおいてもう一度話しかけてください。";

/// Calendar data attached to the response metadata.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalendarExtra {
    pub date: String,
    pub total: usize,
    pub events: Vec<CalendarEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DegradedReason {
    PermissionMissing,
    CalendarFailed(String),
}

impl DegradedReason {
    pub fn code(&self) -> &'static str {
        match self {
            DegradedReason::PermissionMissing => "calendar_permission_missing",
            DegradedReason::CalendarFailed(_) => "calendar_failed",
        }
    }
}

/// What the user gets back and whether it is the full answer.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    Ok {
        content: String,
        calendar: Option<CalendarExtra>,
    },
    /// The reply is usable but a requested side effect did not happen.
    Degraded {
        content: String,
        reason: DegradedReason,
    },
    /// No reply could be produced; `content` is the fallback apology.
    Failed { content: String, reason: String },
}

impl DispatchOutcome {
    pub fn failed(reason: impl Into<String>) -> Self {
        DispatchOutcome::Failed {
            content: LLM_FAILED_REPLY.to_string(),
            reason: reason.into(),
        }
    }

    pub fn content(&self) -> &str {
        match self {
            DispatchOutcome::Ok { content, .. }
            | DispatchOutcome::Degraded { content, .. }
            | DispatchOutcome::Failed { content, .. } => content,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            DispatchOutcome::Ok { .. } => "ok",
            DispatchOutcome::Degraded { .. } => "degraded",
            DispatchOutcome::Failed { .. } => "failed",
        }
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            DispatchOutcome::Ok { .. } => None,
            DispatchOutcome::Degraded { reason, .. } => Some(reason.code().to_string()),
            DispatchOutcome::Failed { reason, .. } => Some(reason.clone()),
        }
    }

    pub fn calendar(&self) -> Option<&CalendarExtra> {
        match self {
            DispatchOutcome::Ok { calendar, .. } => calendar.as_ref(),
            _ => None,
        }
    }
}

pub struct Dispatcher {
    calendar: Arc<dyn CalendarProvider>,
}

impl Dispatcher {
    pub fn new(calendar: Arc<dyn CalendarProvider>) -> Self {
        Self { calendar }
    }

    pub async fn dispatch(&self, parsed: &ParsedTags, user: Option<&User>) -> DispatchOutcome {
        if !parsed.flag(CALENDAR_TAG) {
            return DispatchOutcome::Ok {
                content: parsed.body.clone(),
                calendar: None,
            };
        }

        let Some(user) = user.filter(|u| u.can_read_calendar()) else {
            info!("Calendar requested but user lacks Google link or calendar.read");
            return DispatchOutcome::Degraded {
                content: append(&parsed.body, PERMISSION_MISSING_SUFFIX),
                reason: DegradedReason::PermissionMissing,
            };
        };

        let date = requested_date(parsed);
        match self.calendar.events_for_day(user, date).await {
            Ok(events) => {
                let date = date.format("%Y-%m-%d").to_string();
                let total = events.len();
                let suffix = format!("（{}の予定は{}件です。）", date, total);
                DispatchOutcome::Ok {
                    content: append(&parsed.body, &suffix),
                    calendar: Some(CalendarExtra {
                        date,
                        total,
                        events,
                    }),
                }
            }
            Err(e) => {
                warn!("Calendar lookup failed for {}: {}", user.user_id, e);
                DispatchOutcome::Degraded {
                    content: append(&parsed.body, CALENDAR_FAILED_SUFFIX),
                    reason: DegradedReason::CalendarFailed(e.to_string()),
                }
            }
        }
    }
}

/// `date` tag as `YYYY-MM-DD`, today when absent or unparseable.
fn requested_date(parsed: &ParsedTags) -> NaiveDate {
    parsed
        .get(DATE_TAG)
        .and_then(|d| NaiveDate::parse_from_str(d, "%Y-%m-%d").ok())
        .unwrap_or_else(|| Local::now().date_naive())
}

fn append(body: &str, suffix: &str) -> String {
    if body.is_empty() {
        suffix.to_string()
    } else {
        format!("{}\n\n{}", body, suffix)
    }
}
