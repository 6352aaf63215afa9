//! SQLite persistence for the two durable collections: the action queue and
//! the optimistic record cache. They live in separate tables so a failure
//! affecting one cannot silently corrupt the other.

use crate::model::{ActionStatus, ActionType, OptimisticRecord, QueuedAction};
use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options =
        sqlx::sqlite::SqliteConnectOptions::from_str(&normalized)?.create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    // WAL plus full fsync: queued intent must survive a crash mid-write.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// For file-backed SQLite URLs, expand a leading `~/` and create the parent
/// directory. In-memory URLs and non-sqlite schemes pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match path_part.strip_prefix("~/") {
        Some(tail) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), tail),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

fn action_from_row(row: &SqliteRow) -> sqlx::Result<QueuedAction> {
    let type_str: String = row.get("action_type");
    let action_type = ActionType::parse(&type_str)
        .map_err(|_| sqlx::Error::Decode(format!("unknown action type: {type_str}").into()))?;
    let status_str: String = row.get("status");
    let status = ActionStatus::parse(&status_str)
        .ok_or_else(|| sqlx::Error::Decode(format!("unknown status: {status_str}").into()))?;
    let payload_str: String = row.get("payload");
    let payload = serde_json::from_str(&payload_str)
        .map_err(|e| sqlx::Error::Decode(format!("bad payload json: {e}").into()))?;
    Ok(QueuedAction {
        id: row.get("id"),
        action_type,
        payload,
        priority: row.get("priority"),
        created_at: row.get("created_at"),
        attempts: row.get("attempts"),
        status,
        due_at: row.get("due_at"),
        record_key: row.get("record_key"),
        last_error: row.get("last_error"),
    })
}

fn record_from_row(row: &SqliteRow) -> sqlx::Result<OptimisticRecord> {
    let data_str: String = row.get("data");
    let data = serde_json::from_str(&data_str)
        .map_err(|e| sqlx::Error::Decode(format!("bad record json: {e}").into()))?;
    Ok(OptimisticRecord {
        key: row.get("key"),
        record_type: row.get("record_type"),
        data,
        updated_at: row.get("updated_at"),
        synced: row.get("synced"),
    })
}

/// Persist a new action together with its optimistic record in one
/// transaction, so a crash cannot leave intent without its projection.
#[instrument(skip_all, fields(id = %action.id, kind = action.action_type.as_str()))]
pub async fn enqueue_with_record(
    pool: &Pool,
    action: &QueuedAction,
    record: &OptimisticRecord,
) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query(
        "INSERT INTO action_queue \
         (id, action_type, payload, priority, created_at, attempts, status, due_at, record_key, last_error) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&action.id)
    .bind(action.action_type.as_str())
    .bind(action.payload.to_string())
    .bind(action.priority)
    .bind(action.created_at)
    .bind(action.attempts)
    .bind(action.status.as_str())
    .bind(action.due_at)
    .bind(&action.record_key)
    .bind(&action.last_error)
    .execute(&mut *tx)
    .await?;
    put_record_tx(&mut tx, record).await?;
    tx.commit().await?;
    Ok(())
}

/// Actions eligible for the next drain: pending or retryable with an elapsed
/// backoff, ordered by priority then FIFO. `in_flight` rows are excluded so a
/// re-entered coordinator can never double-send.
///
/// A session lifecycle action is held back while an earlier unconfirmed
/// lifecycle action for the same session exists, even when backoff parked
/// that earlier action past its due time. Due-time alignment alone would let
/// an `end` overtake a `start` stuck in retry.
#[instrument(skip_all)]
pub async fn due_actions(pool: &Pool, now: DateTime<Utc>) -> sqlx::Result<Vec<QueuedAction>> {
    let rows = sqlx::query(
        "SELECT q.* FROM action_queue AS q \
         WHERE q.status IN ('pending', 'failed_retryable') \
           AND datetime(q.due_at) <= datetime(?) \
           AND NOT EXISTS ( \
             SELECT 1 FROM action_queue AS prior \
             WHERE q.action_type IN ('start_duty_session', 'end_duty_session') \
               AND prior.action_type IN ('start_duty_session', 'end_duty_session') \
               AND prior.record_key = q.record_key \
               AND prior.status != 'done' \
               AND prior.rowid < q.rowid \
           ) \
         ORDER BY q.priority ASC, datetime(q.created_at) ASC, q.rowid ASC",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    rows.iter().map(action_from_row).collect()
}

pub async fn get_action(pool: &Pool, id: &str) -> sqlx::Result<Option<QueuedAction>> {
    let row = sqlx::query("SELECT * FROM action_queue WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(action_from_row).transpose()
}

/// Pending work from the UI's perspective: everything not yet confirmed and
/// not parked in a terminal state.
pub async fn count_pending(pool: &Pool) -> sqlx::Result<i64> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM action_queue \
         WHERE status IN ('pending', 'in_flight', 'failed_retryable')",
    )
    .fetch_one(pool)
    .await
}

/// The queued lifecycle action (start/end) still open for a session, if any.
/// Enforces the at-most-one-open-session-action invariant at enqueue time.
pub async fn open_session_action(
    pool: &Pool,
    session_id: &str,
) -> sqlx::Result<Option<QueuedAction>> {
    let row = sqlx::query(
        "SELECT * FROM action_queue \
         WHERE action_type IN ('start_duty_session', 'end_duty_session') \
           AND status IN ('pending', 'in_flight', 'failed_retryable') \
           AND json_extract(payload, '$.session_id') = ? \
         ORDER BY datetime(created_at) ASC LIMIT 1",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(action_from_row).transpose()
}

/// All actions parked in `failed_terminal`, oldest first. These stay on the
/// reactive surface until the user discards or retries them.
pub async fn terminal_actions(pool: &Pool) -> sqlx::Result<Vec<QueuedAction>> {
    let rows = sqlx::query(
        "SELECT * FROM action_queue WHERE status = 'failed_terminal' \
         ORDER BY datetime(created_at) ASC, rowid ASC",
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(action_from_row).collect()
}

pub async fn mark_in_flight(pool: &Pool, id: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE action_queue SET status = 'in_flight' WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn mark_done(pool: &Pool, id: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE action_queue SET status = 'done', last_error = NULL WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Retry/backoff knobs shared by the queue and the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts ceiling; reaching it forces a terminal failure regardless of
    /// classifier verdict, so no action retries forever.
    pub max_attempts: i32,
    pub base_delay_secs: i64,
    pub max_backoff_secs: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_secs: 5,
            max_backoff_secs: 3600,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff with a cap: `base * 2^attempts`, attempts counted
    /// before the increment for this failure.
    pub fn backoff_secs(&self, attempts: i32) -> i64 {
        let secs = self.base_delay_secs * (1_i64 << attempts.clamp(0, 10));
        secs.min(self.max_backoff_secs.max(self.base_delay_secs))
    }
}

/// Record a failed replay attempt. Returns the status the action ended in:
/// `failed_retryable` with a scheduled backoff, or `failed_terminal` when the
/// classifier said so or the attempts ceiling is reached.
#[instrument(skip_all, fields(id = id))]
pub async fn mark_failed(
    pool: &Pool,
    id: &str,
    retryable: bool,
    message: &str,
    now: DateTime<Utc>,
    policy: &RetryPolicy,
) -> sqlx::Result<ActionStatus> {
    let mut tx = pool.begin().await?;
    let attempts: i32 = sqlx::query_scalar("SELECT attempts FROM action_queue WHERE id = ?")
        .bind(id)
        .fetch_one(&mut *tx)
        .await?;
    let attempts_after = attempts + 1;
    let status = if retryable && attempts_after < policy.max_attempts {
        ActionStatus::FailedRetryable
    } else {
        ActionStatus::FailedTerminal
    };
    let due_at = now + chrono::Duration::seconds(policy.backoff_secs(attempts));
    sqlx::query(
        "UPDATE action_queue SET status = ?, attempts = ?, due_at = ?, last_error = ? WHERE id = ?",
    )
    .bind(status.as_str())
    .bind(attempts_after)
    .bind(due_at)
    .bind(message)
    .bind(id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(status)
}

pub async fn delete_action(pool: &Pool, id: &str) -> sqlx::Result<u64> {
    let res = sqlx::query("DELETE FROM action_queue WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Manual retry of a terminal failure: back to `pending` with a fresh attempt
/// budget, due immediately.
pub async fn reset_for_retry(pool: &Pool, id: &str, now: DateTime<Utc>) -> sqlx::Result<u64> {
    let res = sqlx::query(
        "UPDATE action_queue \
         SET status = 'pending', attempts = 0, due_at = ?, last_error = NULL \
         WHERE id = ? AND status = 'failed_terminal'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

async fn put_record_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    record: &OptimisticRecord,
) -> sqlx::Result<()> {
    sqlx::query(
        "INSERT INTO record_cache (key, record_type, data, updated_at, synced) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET \
           record_type = excluded.record_type, data = excluded.data, \
           updated_at = excluded.updated_at, synced = excluded.synced",
    )
    .bind(&record.key)
    .bind(&record.record_type)
    .bind(record.data.to_string())
    .bind(record.updated_at)
    .bind(record.synced)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Unconditional overwrite: the cache is a last-write-wins projection, not a
/// merge structure. Single-writer discipline lives in the service layer.
pub async fn put_record(pool: &Pool, record: &OptimisticRecord) -> sqlx::Result<()> {
    let mut tx = pool.begin().await?;
    put_record_tx(&mut tx, record).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn get_record(pool: &Pool, key: &str) -> sqlx::Result<Option<OptimisticRecord>> {
    let row = sqlx::query("SELECT * FROM record_cache WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(record_from_row).transpose()
}

/// Stable snapshot of the whole cache, ordered by key.
pub async fn all_records(pool: &Pool) -> sqlx::Result<Vec<OptimisticRecord>> {
    let rows = sqlx::query("SELECT * FROM record_cache ORDER BY key ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(record_from_row).collect()
}

/// Flip the synced flag without touching data; used after a no-op
/// confirmation where the server returned no body.
pub async fn mark_record_synced(pool: &Pool, key: &str) -> sqlx::Result<()> {
    sqlx::query("UPDATE record_cache SET synced = 1 WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(())
}
