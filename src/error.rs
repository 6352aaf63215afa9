use thiserror::Error;

/// Errors surfaced by the engine's public API.
///
/// Only `InvalidActionType`, `InvalidPayload` and `SessionActionPending` are
/// raised from the enqueue path; persistence failures there degrade into the
/// reactive `sync_errors` list instead of breaking the calling flow.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown action type: {0}")]
    InvalidActionType(String),
    #[error("invalid payload for {action}: {reason}")]
    InvalidPayload {
        action: &'static str,
        reason: &'static str,
    },
    #[error("a {kind} action for session {session_id} is already queued")]
    SessionActionPending {
        kind: &'static str,
        session_id: String,
    },
    #[error("no queued action with id {0}")]
    UnknownAction(String),
    #[error("action {0} is not in a terminal state")]
    NotTerminal(String),
    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

/// Outcome taxonomy of a single replay attempt against the REST layer.
///
/// The engine never inspects HTTP beyond this classification; the transport
/// implementation owns the mapping from wire-level outcomes.
#[derive(Debug, Error)]
pub enum TransportError {
    /// No response at all: DNS, refused connection, timeout, dropped mid-call.
    #[error("network error: {0}")]
    Network(String),
    /// The server answered but is temporarily unable (5xx, 429).
    #[error("server error {status}: {message}")]
    ServerTransient { status: u16, message: String },
    /// The server understood and refused (4xx business rejection).
    #[error("rejected ({status}): {message}")]
    ServerRejection { status: u16, message: String },
    /// The server reports the mutation was already applied by an earlier
    /// attempt and returns its current authoritative value.
    #[error("already applied")]
    AlreadyApplied { current: serde_json::Value },
}
