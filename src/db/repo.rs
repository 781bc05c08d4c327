use super::model::{LockRow, PendingChangeRow, SubscriptionRow};
use crate::model::ChangeAction;
use anyhow::{Context, Result};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/`, ensure the parent
/// directory exists and ask SQLite to create the file. Leaves in-memory URLs
/// untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") {
        return url.to_string();
    }
    if url.starts_with("sqlite::memory") {
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
        Some(rest) => match std::env::var("HOME") {
            Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
            Err(_) => path_part.to_string(),
        },
        None => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    match query_part {
        Some(q) if q.contains("mode=") => {
            rebuilt.push('?');
            rebuilt.push_str(q);
        }
        Some(q) => {
            rebuilt.push('?');
            rebuilt.push_str(q);
            rebuilt.push_str("&mode=rwc");
        }
        None => rebuilt.push_str("?mode=rwc"),
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Change ledger
// ---------------------------------------------------------------------------

pub async fn pending_action_tx(
    tx: &mut Transaction<'_, Sqlite>,
    content_id: i64,
) -> Result<Option<String>> {
    let action = sqlx::query_scalar::<_, String>(
        "SELECT action FROM pending_changes WHERE content_id = ?",
    )
    .bind(content_id)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(action)
}

/// Insert or overwrite the ledger row for a content id. `first_seen` is only
/// set on insert, so drain order within an action class survives overwrites.
pub async fn upsert_pending_change_tx(
    tx: &mut Transaction<'_, Sqlite>,
    content_id: i64,
    action: ChangeAction,
    content_type: &str,
    record_json: &str,
) -> Result<i64> {
    let revision: i64 =
        sqlx::query_scalar("SELECT COALESCE(MAX(revision), 0) + 1 FROM pending_changes")
            .fetch_one(&mut **tx)
            .await?;
    sqlx::query(
        "INSERT INTO pending_changes \
            (content_id, action, content_type, record, revision, first_seen, recorded_at) \
         VALUES (?, ?, ?, ?, ?, ?, CURRENT_TIMESTAMP) \
         ON CONFLICT(content_id) DO UPDATE SET \
            action = excluded.action, \
            content_type = excluded.content_type, \
            record = excluded.record, \
            revision = excluded.revision, \
            recorded_at = excluded.recorded_at",
    )
    .bind(content_id)
    .bind(action.as_str())
    .bind(content_type)
    .bind(record_json)
    .bind(revision)
    .bind(revision)
    .execute(&mut **tx)
    .await?;
    Ok(revision)
}

/// All pending rows: deletions, then creations, then updates.
#[instrument(skip_all)]
pub async fn list_pending_changes(pool: &Pool) -> Result<Vec<PendingChangeRow>> {
    let rows = sqlx::query_as::<_, PendingChangeRow>(
        "SELECT content_id, action, content_type, record, revision FROM pending_changes \
         ORDER BY (CASE action WHEN 'delete' THEN 0 WHEN 'create' THEN 1 ELSE 2 END), \
            first_seen ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn get_pending_change(pool: &Pool, content_id: i64) -> Result<Option<PendingChangeRow>> {
    let row = sqlx::query_as::<_, PendingChangeRow>(
        "SELECT content_id, action, content_type, record, revision FROM pending_changes \
         WHERE content_id = ?",
    )
    .bind(content_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn count_pending_changes(pool: &Pool, action: ChangeAction) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pending_changes WHERE action = ?")
        .bind(action.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[instrument(skip_all)]
pub async fn delete_pending_through(pool: &Pool, revision: i64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM pending_changes WHERE revision <= ?")
        .bind(revision)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

#[instrument(skip_all)]
pub async fn delete_all_pending(pool: &Pool) -> Result<u64> {
    let res = sqlx::query("DELETE FROM pending_changes")
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

// ---------------------------------------------------------------------------
// Subscription registry
// ---------------------------------------------------------------------------

const SUBSCRIPTION_COLUMNS: &str = "id, target, content_type, content_id, events, signature_digest";

#[instrument(skip_all)]
pub async fn insert_subscription(
    pool: &Pool,
    target: &str,
    content_type: &str,
    content_id: Option<i64>,
    events: &str,
    signature_digest: &str,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO subscriptions (target, content_type, content_id, events, signature_digest) \
         VALUES (?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(target)
    .bind(content_type)
    .bind(content_id)
    .bind(events)
    .bind(signature_digest)
    .fetch_one(pool)
    .await
    .context("failed to insert subscription")?;
    Ok(rec.get("id"))
}

pub async fn get_subscription(pool: &Pool, id: i64) -> Result<Option<SubscriptionRow>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {} FROM subscriptions WHERE id = ?",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn find_subscription(
    pool: &Pool,
    content_type: &str,
    content_id: Option<i64>,
    target: &str,
) -> Result<Option<SubscriptionRow>> {
    let row = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {} FROM subscriptions \
         WHERE content_type = ? AND IFNULL(content_id, 0) = IFNULL(?, 0) AND target = ?",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(content_type)
    .bind(content_id)
    .bind(target)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn list_subscriptions_for_scope(
    pool: &Pool,
    content_type: &str,
    content_id: Option<i64>,
) -> Result<Vec<SubscriptionRow>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {} FROM subscriptions \
         WHERE content_type = ? AND IFNULL(content_id, 0) = IFNULL(?, 0) ORDER BY id",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(content_type)
    .bind(content_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Collection-level subscriptions for a content type.
#[instrument(skip_all)]
pub async fn list_collection_subscriptions(
    pool: &Pool,
    content_type: &str,
) -> Result<Vec<SubscriptionRow>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {} FROM subscriptions WHERE content_type = ? AND content_id IS NULL ORDER BY id",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(content_type)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Item-level subscriptions for one content id, whatever type they were
/// registered under.
#[instrument(skip_all)]
pub async fn list_item_subscriptions(pool: &Pool, content_id: i64) -> Result<Vec<SubscriptionRow>> {
    let rows = sqlx::query_as::<_, SubscriptionRow>(&format!(
        "SELECT {} FROM subscriptions WHERE content_id = ? ORDER BY id",
        SUBSCRIPTION_COLUMNS
    ))
    .bind(content_id)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn update_subscription_events(pool: &Pool, id: i64, events: &str) -> Result<()> {
    sqlx::query(
        "UPDATE subscriptions SET events = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(events)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update subscription events")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn delete_subscription(pool: &Pool, id: i64) -> Result<bool> {
    let res = sqlx::query("DELETE FROM subscriptions WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn count_subscriptions(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM subscriptions")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Run-locks
// ---------------------------------------------------------------------------

/// Take the named lock unless a live lease holds it. Returns whether this call
/// won. A lease with no expiry is only ever freed by deleting it.
#[instrument(skip_all)]
pub async fn try_acquire_lock(
    pool: &Pool,
    name: &str,
    token: &str,
    now_ms: i64,
    expires_at_ms: Option<i64>,
) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO run_locks (name, token, acquired_at, expires_at) VALUES (?, ?, ?, ?) \
         ON CONFLICT(name) DO UPDATE SET \
            token = excluded.token, \
            acquired_at = excluded.acquired_at, \
            expires_at = excluded.expires_at \
         WHERE run_locks.expires_at IS NOT NULL AND run_locks.expires_at <= ?",
    )
    .bind(name)
    .bind(token)
    .bind(now_ms)
    .bind(expires_at_ms)
    .bind(now_ms)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

pub async fn get_lock(pool: &Pool, name: &str) -> Result<Option<LockRow>> {
    let row = sqlx::query_as::<_, LockRow>(
        "SELECT name, token, acquired_at, expires_at FROM run_locks WHERE name = ?",
    )
    .bind(name)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Move the expiry of a lease still held under `token`. Returns whether it was.
#[instrument(skip_all)]
pub async fn renew_lock(
    pool: &Pool,
    name: &str,
    token: &str,
    expires_at_ms: Option<i64>,
) -> Result<bool> {
    let res = sqlx::query("UPDATE run_locks SET expires_at = ? WHERE name = ? AND token = ?")
        .bind(expires_at_ms)
        .bind(name)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() == 1)
}

#[instrument(skip_all)]
pub async fn release_lock(pool: &Pool, name: &str, token: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM run_locks WHERE name = ? AND token = ?")
        .bind(name)
        .bind(token)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn force_release_lock(pool: &Pool, name: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM run_locks WHERE name = ?")
        .bind(name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}
