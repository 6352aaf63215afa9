//! The engine's only window onto the REST layer: one request per action
//! type, with outcomes classified into the transport error taxonomy. The
//! engine itself never sees HTTP.

use crate::config::Config;
use crate::error::TransportError;
use crate::model::{ActionType, QueuedAction};
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde_json::Value;
use std::fmt;
use tracing::{info, warn};

#[async_trait]
pub trait SyncTransport: Send + Sync {
    /// Replay one queued action against the server. `Ok` carries the
    /// authoritative entity (or `Null` for a bodyless confirmation).
    async fn replay(&self, action: &QueuedAction) -> Result<Value, TransportError>;
}

/// Route for each action kind, relative to the API base URL.
pub fn route(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::MarkAttendance => "v1/attendance/mark",
        ActionType::StartDutySession => "v1/duty-sessions/start",
        ActionType::EndDutySession => "v1/duty-sessions/end",
        ActionType::SubmitHourlyLog => "v1/hourly-logs",
        ActionType::RequestLeave => "v1/leave-requests",
    }
}

#[derive(Clone)]
pub struct RestTransport {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for RestTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestTransport")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl RestTransport {
    pub fn new(base_url: Url, token: String) -> Self {
        let http = Client::builder()
            .user_agent("dutysync/0.1")
            .build()
            .expect("reqwest client");
        Self {
            http,
            base_url,
            token,
        }
    }

    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let base_url = Url::parse(&cfg.api.base_url)?;
        Ok(Self::new(base_url, cfg.api.token.clone()))
    }
}

#[async_trait]
impl SyncTransport for RestTransport {
    async fn replay(&self, action: &QueuedAction) -> Result<Value, TransportError> {
        let endpoint = self
            .base_url
            .join(route(action.action_type))
            .map_err(|e| TransportError::Network(format!("invalid endpoint: {e}")))?;

        let res = self
            .http
            .post(endpoint.clone())
            .header("Authorization", format!("Bearer {}", self.token))
            // The local action id doubles as the idempotency key, so a
            // replayed attempt the server already applied is recognizable.
            .header("Idempotency-Key", &action.id)
            .json(&action.payload)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = res.status();
        let body = res.text().await.unwrap_or_default();

        if status.is_success() {
            info!(url = %endpoint, id = %action.id, "replay accepted");
            let value = serde_json::from_str(&body).unwrap_or(Value::Null);
            return Ok(value);
        }

        warn!(url = %endpoint, id = %action.id, %status, "replay not accepted");
        if status == StatusCode::CONFLICT {
            if let Ok(parsed) = serde_json::from_str::<Value>(&body) {
                if parsed.get("already_applied").and_then(Value::as_bool) == Some(true) {
                    let current = parsed.get("record").cloned().unwrap_or(Value::Null);
                    return Err(TransportError::AlreadyApplied { current });
                }
            }
        }
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(TransportError::ServerTransient {
                status: status.as_u16(),
                message: body,
            });
        }
        Err(TransportError::ServerRejection {
            status: status.as_u16(),
            message: body,
        })
    }
}
