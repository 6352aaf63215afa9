//! Conflict/failure classification of replay outcomes.

use crate::error::TransportError;
use serde_json::Value;

/// What the coordinator should do with a replay outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// The mutation holds server-side; reconcile the cache with this value
    /// (`Null` means keep the optimistic data and only flip the synced flag).
    Confirmed(Value),
    /// Transient failure: requeue with backoff.
    Retry { message: String },
    /// The server refused the mutation; keep it visible for the user to
    /// discard or resubmit, never retry automatically.
    Terminal { message: String },
}

pub fn classify(outcome: Result<Value, TransportError>) -> Verdict {
    match outcome {
        Ok(value) => Verdict::Confirmed(value),
        // An offline double-submission the server already recorded is a
        // success, not an error the user has to see.
        Err(TransportError::AlreadyApplied { current }) => Verdict::Confirmed(current),
        Err(err @ TransportError::Network(_)) => Verdict::Retry {
            message: err.to_string(),
        },
        Err(err @ TransportError::ServerTransient { .. }) => Verdict::Retry {
            message: err.to_string(),
        },
        Err(err @ TransportError::ServerRejection { .. }) => Verdict::Terminal {
            message: err.to_string(),
        },
    }
}
