//! Change ledger: the persisted set of content changes waiting for the next
//! dispatch cycle.
//!
//! Each content id holds at most one pending action. A later mutation
//! reclassifies the id instead of appending a second entry.

use crate::db::{self, Pool};
use crate::model::{ChangeAction, ChangeRecord, PendingChange};
use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

/// What a new write does to an id that may already be pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Store the snapshot under this action.
    Store(ChangeAction),
    /// Leave the existing entry untouched.
    Keep,
}

/// Net effect of recording `incoming` on top of `existing`.
///
/// A pending delete is terminal for the window; a pending create absorbs
/// later updates.
pub fn resolve(existing: Option<ChangeAction>, incoming: ChangeAction) -> Resolution {
    use crate::model::ChangeAction::*;
    match (existing, incoming) {
        (None, action) => Resolution::Store(action),
        (Some(Delete), Delete) => Resolution::Store(Delete),
        (Some(Delete), _) => Resolution::Keep,
        (Some(Create), Update) => Resolution::Store(Create),
        (Some(_), action) => Resolution::Store(action),
    }
}

/// Everything drained in one pass plus the revision watermark to clear through.
#[derive(Debug, Clone, Default)]
pub struct Drained {
    pub changes: Vec<PendingChange>,
    pub watermark: i64,
    /// Rows that no longer decode. They still count toward `watermark`.
    pub skipped: usize,
}

#[derive(Clone, Debug)]
pub struct ChangeLedger {
    pool: Pool,
}

impl ChangeLedger {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Record a change, applying [`resolve`] against whatever is pending for
    /// the same id. Returns the action the id is now pending under.
    #[instrument(skip_all, fields(content_id = record.content_id(), action = %action))]
    pub async fn record(
        &self,
        action: ChangeAction,
        record: &ChangeRecord,
    ) -> Result<Option<ChangeAction>> {
        let record_json = serde_json::to_string(record).context("failed to encode change record")?;
        let mut tx = self.pool.begin().await?;
        let existing = db::pending_action_tx(&mut tx, record.content_id())
            .await?
            .and_then(|s| ChangeAction::parse_action(&s));

        let stored = match resolve(existing, action) {
            Resolution::Store(stored) => {
                db::upsert_pending_change_tx(
                    &mut tx,
                    record.content_id(),
                    stored,
                    record.content_type(),
                    &record_json,
                )
                .await?;
                Some(stored)
            }
            Resolution::Keep => existing,
        };
        tx.commit().await?;

        debug!(?existing, ?stored, "change recorded");
        Ok(stored)
    }

    /// Every pending change, deletions first, then creations, then updates.
    /// Undecodable rows are logged and skipped so clearing still removes them.
    pub async fn drain_all(&self) -> Result<Drained> {
        let rows = db::list_pending_changes(&self.pool).await?;
        let mut drained = Drained::default();
        for row in rows {
            drained.watermark = drained.watermark.max(row.revision);
            let content_id = row.content_id;
            match row.into_pending() {
                Ok(change) => drained.changes.push(change),
                Err(err) => {
                    warn!(?err, content_id, "skipping undecodable pending change");
                    drained.skipped += 1;
                }
            }
        }
        Ok(drained)
    }

    /// Drop everything pending.
    pub async fn clear(&self) -> Result<u64> {
        db::delete_all_pending(&self.pool).await
    }

    /// Drop every entry written at or before `watermark`. Entries recorded
    /// after a drain carry a higher revision and survive.
    pub async fn clear_through(&self, watermark: i64) -> Result<u64> {
        db::delete_pending_through(&self.pool, watermark).await
    }

    pub async fn count(&self, action: ChangeAction) -> Result<i64> {
        db::count_pending_changes(&self.pool, action).await
    }

    pub async fn get(&self, content_id: i64) -> Result<Option<PendingChange>> {
        db::get_pending_change(&self.pool, content_id)
            .await?
            .map(|row| row.into_pending())
            .transpose()
    }
}
