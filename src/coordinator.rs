//! The sync coordinator: drains the durable queue serially against the
//! transport, one drain at a time, and keeps the reactive snapshot current.

use crate::classify::{classify, Verdict};
use crate::clock::Clock;
use crate::db::{self, Pool, RetryPolicy};
use crate::model::{
    ActionStatus, EngineSnapshot, OptimisticRecord, QueuedAction, SyncError, SyncPhase,
};
use crate::transport::SyncTransport;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, instrument, warn};

/// State shared between the service front-end, the connectivity task and the
/// coordinator. Only the coordinator moves action statuses or writes
/// authoritative cache data.
pub(crate) struct EngineShared {
    pub(crate) pool: Pool,
    pub(crate) transport: Arc<dyn SyncTransport>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) policy: RetryPolicy,
    pub(crate) state: watch::Sender<EngineSnapshot>,
    syncing: AtomicBool,
    rerun: AtomicBool,
}

impl EngineShared {
    pub(crate) fn new(
        pool: Pool,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
        policy: RetryPolicy,
        initial: EngineSnapshot,
    ) -> Self {
        Self {
            pool,
            transport,
            clock,
            policy,
            state: watch::channel(initial).0,
            syncing: AtomicBool::new(false),
            rerun: AtomicBool::new(false),
        }
    }

    pub(crate) fn update<F: FnOnce(&mut EngineSnapshot)>(&self, f: F) {
        self.state.send_modify(f);
    }

    pub(crate) fn is_online(&self) -> bool {
        self.state.borrow().is_online
    }

    pub(crate) async fn refresh_pending(&self) -> sqlx::Result<i64> {
        let pending = db::count_pending(&self.pool).await?;
        self.update(|s| s.pending_actions = pending);
        Ok(pending)
    }
}

/// Wake the coordinator. Exactly one drain runs at a time; a trigger while a
/// drain is in progress coalesces into one follow-up pass instead of
/// interleaving. Idempotent, so `force_sync` can call it freely.
#[instrument(skip_all)]
pub(crate) async fn sync_now(shared: &EngineShared) -> sqlx::Result<()> {
    if !shared.is_online() {
        return Ok(());
    }
    if shared.syncing.swap(true, Ordering::SeqCst) {
        shared.rerun.store(true, Ordering::SeqCst);
        return Ok(());
    }
    // A trigger can land after the drain's last queue check but before the
    // guard is released; consume it here so no wake is ever lost.
    let mut res = drain(shared).await;
    while res.is_ok() && shared.rerun.swap(false, Ordering::SeqCst) && shared.is_online() {
        res = drain(shared).await;
    }
    shared.syncing.store(false, Ordering::SeqCst);
    res
}

async fn drain(shared: &EngineShared) -> sqlx::Result<()> {
    shared.update(|s| {
        s.sync_phase = SyncPhase::Syncing;
        s.sync_progress = 0;
        s.sync_errors.clear();
    });
    let mut any_terminal = false;

    loop {
        let batch = db::due_actions(&shared.pool, shared.clock.now()).await?;
        if batch.is_empty() {
            // New actions may have been enqueued, or a trigger coalesced,
            // while the previous pass ran.
            if shared.rerun.swap(false, Ordering::SeqCst) && shared.is_online() {
                continue;
            }
            break;
        }

        let total = batch.len();
        for (done, action) in batch.iter().enumerate() {
            if !shared.is_online() {
                info!("went offline mid-drain; leaving remaining actions queued");
                break;
            }
            let status = replay_one(shared, action).await?;
            any_terminal |= status == ActionStatus::FailedTerminal;
            shared.refresh_pending().await?;
            shared.update(|s| s.sync_progress = ((done + 1) * 100 / total) as u8);
        }

        if !shared.is_online() {
            break;
        }
    }
    let aborted_offline = !shared.is_online();

    // Terminal failures outlive the drain that produced them: rebuild the
    // error list from the queue so the badge persists until discard/retry.
    let terminal = db::terminal_actions(&shared.pool).await?;
    let errors: Vec<SyncError> = terminal
        .iter()
        .map(|a| SyncError {
            action_id: a.id.clone(),
            message: a
                .last_error
                .clone()
                .unwrap_or_else(|| "replay failed".to_string()),
        })
        .collect();
    let finished_at = shared.clock.now();
    shared.update(|s| {
        // An offline abort leaves work queued; claiming completion there
        // would be a lie, so the phase falls back to idle.
        s.sync_phase = if !errors.is_empty() {
            SyncPhase::Error
        } else if aborted_offline {
            SyncPhase::Idle
        } else {
            SyncPhase::Completed
        };
        s.sync_errors = errors;
        if !aborted_offline {
            s.last_sync_time = Some(finished_at);
        }
    });
    info!(new_failures = any_terminal, "drain finished");
    Ok(())
}

/// Replay a single action and apply the classifier's verdict. Returns the
/// status the action ended in.
#[instrument(skip_all, fields(id = %action.id, kind = action.action_type.as_str()))]
async fn replay_one(shared: &EngineShared, action: &QueuedAction) -> sqlx::Result<ActionStatus> {
    db::mark_in_flight(&shared.pool, &action.id).await?;
    let outcome = shared.transport.replay(action).await;

    match classify(outcome) {
        Verdict::Confirmed(value) => {
            reconcile(shared, action, value).await?;
            db::mark_done(&shared.pool, &action.id).await?;
            info!("replay confirmed");
            Ok(ActionStatus::Done)
        }
        Verdict::Retry { message } => {
            let status = db::mark_failed(
                &shared.pool,
                &action.id,
                true,
                &message,
                shared.clock.now(),
                &shared.policy,
            )
            .await?;
            warn!(%message, attempts = action.attempts + 1, "replay failed; backoff");
            if status == ActionStatus::FailedTerminal {
                // Attempts ceiling reached; surfaced like any terminal failure.
                record_terminal(shared, action, &message);
            }
            Ok(status)
        }
        Verdict::Terminal { message } => {
            db::mark_failed(
                &shared.pool,
                &action.id,
                false,
                &message,
                shared.clock.now(),
                &shared.policy,
            )
            .await?;
            warn!(%message, "replay rejected; kept for manual resolution");
            record_terminal(shared, action, &message);
            Ok(ActionStatus::FailedTerminal)
        }
    }
}

/// Replace the optimistic projection with the server's authoritative value.
/// A `Null` confirmation keeps the local data and only flips the flag.
async fn reconcile(shared: &EngineShared, action: &QueuedAction, value: Value) -> sqlx::Result<()> {
    if value.is_null() {
        db::mark_record_synced(&shared.pool, &action.record_key).await?;
    } else {
        let record = OptimisticRecord {
            key: action.record_key.clone(),
            record_type: action.action_type.record_type().to_string(),
            data: value,
            updated_at: shared.clock.now(),
            synced: true,
        };
        db::put_record(&shared.pool, &record).await?;
    }
    shared.update(|s| s.cache_generation += 1);
    Ok(())
}

fn record_terminal(shared: &EngineShared, action: &QueuedAction, message: &str) {
    shared.update(|s| {
        s.sync_errors.push(SyncError {
            action_id: action.id.clone(),
            message: message.to_string(),
        });
    });
}
