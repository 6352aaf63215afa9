//! `SyncService` is the process-wide engine object the UI talks to: it owns
//! the persisted queue and cache, the connectivity debounce task and the
//! reactive snapshot. Constructed once at startup from the persisted state.

use crate::clock::Clock;
use crate::coordinator::{self, EngineShared};
use crate::db::{self, Pool, RetryPolicy};
use crate::error::EngineError;
use crate::model::{
    ActionStatus, ActionType, EngineSnapshot, OptimisticRecord, QueuedAction, SyncError,
};
use crate::transport::SyncTransport;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How long a raw connectivity signal must hold before the transition is
    /// committed; blips shorter than this are swallowed.
    pub settle_window: Duration,
    pub retry: RetryPolicy,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            settle_window: Duration::from_millis(750),
            retry: RetryPolicy::default(),
        }
    }
}

pub struct SyncService {
    shared: Arc<EngineShared>,
    raw_connectivity: watch::Sender<bool>,
}

impl SyncService {
    /// Build the engine from persisted state and spawn the connectivity
    /// debounce task. The engine starts offline until told otherwise.
    pub async fn start(
        pool: Pool,
        transport: Arc<dyn SyncTransport>,
        clock: Arc<dyn Clock>,
        options: SyncOptions,
    ) -> Result<Self, EngineError> {
        let pending = db::count_pending(&pool).await?;
        let shared = Arc::new(EngineShared::new(
            pool,
            transport,
            clock,
            options.retry,
            EngineSnapshot::initial(pending),
        ));
        let (raw_tx, raw_rx) = watch::channel(false);
        tokio::spawn(connectivity_task(
            shared.clone(),
            raw_rx,
            options.settle_window,
        ));
        Ok(Self {
            shared,
            raw_connectivity: raw_tx,
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.shared.state.subscribe()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.shared.state.borrow().clone()
    }

    /// Feed a raw reachability observation. Transitions are debounced and
    /// committed by the connectivity task; the offline→online edge triggers a
    /// drain when the queue is non-empty.
    pub fn report_connectivity(&self, online: bool) {
        let _ = self.raw_connectivity.send(online);
    }

    /// Persist a mutating intent and mirror it into the optimistic cache.
    ///
    /// Returns the locally assigned action id immediately. Only integration
    /// bugs raise: an unknown `action_type` or a payload missing required
    /// fields. Storage failures degrade into `sync_errors` so a full disk
    /// never breaks the user's flow mid-tap.
    #[instrument(skip_all, fields(action_type = action_type))]
    pub async fn queue_action(
        &self,
        action_type: &str,
        payload: Value,
        priority: Option<i64>,
    ) -> Result<String, EngineError> {
        let ty = ActionType::parse(action_type)?;
        let id = Uuid::new_v4().to_string();
        let now = self.shared.clock.now();
        let record_key = ty.affected_key(&payload, &id, now.date_naive())?;
        let mut priority = priority.unwrap_or_else(|| ty.default_priority());

        if let Some(session_id) = ty.session_id(&payload) {
            match db::open_session_action(&self.shared.pool, session_id).await {
                Ok(Some(existing)) => {
                    // Second start (or second end) for the same session is a
                    // duplicate; an end behind a queued start is legal but
                    // must never sort ahead of it.
                    if existing.action_type == ty || ty == ActionType::StartDutySession {
                        return Err(EngineError::SessionActionPending {
                            kind: existing.action_type.as_str(),
                            session_id: session_id.to_string(),
                        });
                    }
                    priority = priority.max(existing.priority);
                }
                Ok(None) => {}
                Err(err) => warn!(?err, "session invariant check unavailable"),
            }
        }

        let action = QueuedAction {
            id: id.clone(),
            action_type: ty,
            payload: payload.clone(),
            priority,
            created_at: now,
            attempts: 0,
            status: ActionStatus::Pending,
            due_at: now,
            record_key: record_key.clone(),
            last_error: None,
        };
        let record = OptimisticRecord {
            key: record_key,
            record_type: ty.record_type().to_string(),
            data: payload,
            updated_at: now,
            synced: false,
        };

        match db::enqueue_with_record(&self.shared.pool, &action, &record).await {
            Ok(()) => {
                self.shared.update(|s| {
                    s.pending_actions += 1;
                    s.cache_generation += 1;
                });
                info!(id = %id, key = %action.record_key, "action queued");
            }
            Err(err) => {
                warn!(?err, id = %id, "failed to persist queued action");
                self.shared.update(|s| {
                    s.sync_errors.push(SyncError {
                        action_id: id.clone(),
                        message: format!("persist failed: {err}"),
                    });
                });
            }
        }
        Ok(id)
    }

    /// Trigger a drain now. A no-op while offline; coalesced if a drain is
    /// already running.
    pub async fn force_sync(&self) -> Result<(), EngineError> {
        coordinator::sync_now(&self.shared).await?;
        Ok(())
    }

    /// Re-read the full optimistic cache from persistent storage.
    pub async fn load_offline_data(&self) -> Result<Vec<OptimisticRecord>, EngineError> {
        let records = db::all_records(&self.shared.pool).await?;
        self.shared.refresh_pending().await?;
        Ok(records)
    }

    pub async fn get_record(&self, key: &str) -> Result<Option<OptimisticRecord>, EngineError> {
        Ok(db::get_record(&self.shared.pool, key).await?)
    }

    pub async fn get_action(&self, id: &str) -> Result<Option<QueuedAction>, EngineError> {
        Ok(db::get_action(&self.shared.pool, id).await?)
    }

    /// Drop a terminally failed action the user chose not to resubmit. Its
    /// optimistic record stays in the cache, unsynced and visible.
    pub async fn discard_action(&self, id: &str) -> Result<(), EngineError> {
        let action = db::get_action(&self.shared.pool, id)
            .await?
            .ok_or_else(|| EngineError::UnknownAction(id.to_string()))?;
        if action.status != ActionStatus::FailedTerminal {
            return Err(EngineError::NotTerminal(id.to_string()));
        }
        db::delete_action(&self.shared.pool, id).await?;
        self.shared
            .update(|s| s.sync_errors.retain(|e| e.action_id != id));
        info!(id, "terminal action discarded");
        Ok(())
    }

    /// Manual retry of a terminally failed action: back to `pending` with a
    /// fresh attempt budget, replayed immediately if online.
    pub async fn retry_action(&self, id: &str) -> Result<(), EngineError> {
        let reset = db::reset_for_retry(&self.shared.pool, id, self.shared.clock.now()).await?;
        if reset == 0 {
            return match db::get_action(&self.shared.pool, id).await? {
                None => Err(EngineError::UnknownAction(id.to_string())),
                Some(_) => Err(EngineError::NotTerminal(id.to_string())),
            };
        }
        self.shared
            .update(|s| s.sync_errors.retain(|e| e.action_id != id));
        self.shared.refresh_pending().await?;
        coordinator::sync_now(&self.shared).await?;
        Ok(())
    }
}

/// Debounce raw connectivity edges into committed transitions: a signal must
/// hold for the settle window before it counts, so a blip never produces two
/// transitions. Exactly one committed event per stable edge.
async fn connectivity_task(
    shared: Arc<EngineShared>,
    mut raw: watch::Receiver<bool>,
    settle: Duration,
) {
    let mut committed = false;
    loop {
        if raw.changed().await.is_err() {
            break;
        }
        let mut target = *raw.borrow_and_update();
        loop {
            let timer = tokio::time::sleep(settle);
            tokio::pin!(timer);
            tokio::select! {
                _ = &mut timer => break,
                changed = raw.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    target = *raw.borrow_and_update();
                }
            }
        }
        if target == committed {
            continue;
        }
        committed = target;
        shared.update(|s| s.is_online = target);
        info!(online = target, "connectivity transition");
        if !target {
            // In-flight replays are left to fail naturally and reclassify.
            continue;
        }
        match shared.refresh_pending().await {
            Ok(pending) if pending > 0 => {
                if let Err(err) = coordinator::sync_now(&shared).await {
                    warn!(?err, "drain after reconnect failed");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(?err, "failed to read pending count after reconnect"),
        }
    }
}
