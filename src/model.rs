use crate::error::EngineError;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of mutating intents the engine knows how to replay.
/// Never inferred from payload shape; unknown strings fail at enqueue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionType {
    MarkAttendance,
    StartDutySession,
    EndDutySession,
    SubmitHourlyLog,
    RequestLeave,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::MarkAttendance => "mark_attendance",
            ActionType::StartDutySession => "start_duty_session",
            ActionType::EndDutySession => "end_duty_session",
            ActionType::SubmitHourlyLog => "submit_hourly_log",
            ActionType::RequestLeave => "request_leave",
        }
    }

    pub fn parse(s: &str) -> Result<Self, EngineError> {
        match s {
            "mark_attendance" => Ok(ActionType::MarkAttendance),
            "start_duty_session" => Ok(ActionType::StartDutySession),
            "end_duty_session" => Ok(ActionType::EndDutySession),
            "submit_hourly_log" => Ok(ActionType::SubmitHourlyLog),
            "request_leave" => Ok(ActionType::RequestLeave),
            other => Err(EngineError::InvalidActionType(other.to_string())),
        }
    }

    /// Session lifecycle actions and attendance marks outrank hourly logs.
    pub fn default_priority(&self) -> i64 {
        match self {
            ActionType::MarkAttendance
            | ActionType::StartDutySession
            | ActionType::EndDutySession => 1,
            ActionType::SubmitHourlyLog => 2,
            ActionType::RequestLeave => 3,
        }
    }

    pub fn record_type(&self) -> &'static str {
        match self {
            ActionType::MarkAttendance => "attendance",
            ActionType::StartDutySession | ActionType::EndDutySession => "duty_session",
            ActionType::SubmitHourlyLog => "hourly_log",
            ActionType::RequestLeave => "leave_request",
        }
    }

    pub fn is_session_lifecycle(&self) -> bool {
        matches!(
            self,
            ActionType::StartDutySession | ActionType::EndDutySession
        )
    }

    /// The session a lifecycle action operates on, if any.
    pub fn session_id<'a>(&self, payload: &'a Value) -> Option<&'a str> {
        if self.is_session_lifecycle() {
            payload.get("session_id").and_then(Value::as_str)
        } else {
            None
        }
    }

    /// Cache key of the entity this action mutates. Computed once at enqueue
    /// time and stored on the action so reconciliation targets the exact key
    /// the optimistic write used.
    pub fn affected_key(
        &self,
        payload: &Value,
        action_id: &str,
        today: NaiveDate,
    ) -> Result<String, EngineError> {
        let key = match self {
            ActionType::MarkAttendance => {
                let date = payload
                    .get("date")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| today.to_string());
                format!("attendance:{date}")
            }
            ActionType::StartDutySession | ActionType::EndDutySession => {
                let session_id = self
                    .session_id(payload)
                    .ok_or(EngineError::InvalidPayload {
                        action: self.as_str(),
                        reason: "missing session_id",
                    })?;
                format!("duty_session:{session_id}")
            }
            ActionType::SubmitHourlyLog => {
                let log_id = payload
                    .get("log_id")
                    .and_then(Value::as_str)
                    .unwrap_or(action_id);
                format!("hourly_log:{log_id}")
            }
            ActionType::RequestLeave => {
                let leave_id = payload
                    .get("leave_id")
                    .and_then(Value::as_str)
                    .unwrap_or(action_id);
                format!("leave_request:{leave_id}")
            }
        };
        Ok(key)
    }
}

/// Replay lifecycle of a queued action.
/// `pending → in_flight → {done | failed_retryable → pending | failed_terminal}`;
/// terminal states leave the queue only through explicit discard or retry.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionStatus {
    Pending,
    InFlight,
    FailedRetryable,
    FailedTerminal,
    Done,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Pending => "pending",
            ActionStatus::InFlight => "in_flight",
            ActionStatus::FailedRetryable => "failed_retryable",
            ActionStatus::FailedTerminal => "failed_terminal",
            ActionStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ActionStatus::Pending),
            "in_flight" => Some(ActionStatus::InFlight),
            "failed_retryable" => Some(ActionStatus::FailedRetryable),
            "failed_terminal" => Some(ActionStatus::FailedTerminal),
            "done" => Some(ActionStatus::Done),
            _ => None,
        }
    }
}

/// A durable record of user intent, replayed by the sync coordinator once
/// connectivity returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedAction {
    pub id: String,
    pub action_type: ActionType,
    pub payload: Value,
    pub priority: i64,
    pub created_at: DateTime<Utc>,
    pub attempts: i32,
    pub status: ActionStatus,
    pub due_at: DateTime<Utc>,
    pub record_key: String,
    pub last_error: Option<String>,
}

/// The user's best-known view of one entity: an optimistic projection while a
/// queued action backs it, the server's authoritative value once confirmed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OptimisticRecord {
    pub key: String,
    pub record_type: String,
    pub data: Value,
    pub updated_at: DateTime<Utc>,
    pub synced: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Syncing,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncError {
    pub action_id: String,
    pub message: String,
}

/// Reactive state consumed by UI components through `SyncService::subscribe`.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EngineSnapshot {
    pub is_online: bool,
    pub sync_phase: SyncPhase,
    /// Integer percent of the current drain, 0-100.
    pub sync_progress: u8,
    pub pending_actions: i64,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub sync_errors: Vec<SyncError>,
    /// Bumped on every cache write so subscribers know to re-pull records
    /// via `load_offline_data`. The snapshot itself stays record-free.
    pub cache_generation: u64,
}

impl EngineSnapshot {
    pub fn initial(pending_actions: i64) -> Self {
        Self {
            is_online: false,
            sync_phase: SyncPhase::Idle,
            sync_progress: 0,
            pending_actions,
            last_sync_time: None,
            sync_errors: Vec::new(),
            cache_generation: 0,
        }
    }
}
