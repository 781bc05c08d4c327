//! Row models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! lives in the ledger, registry and lock layers.

use crate::model::{events_from_str, ChangeAction, ChangeRecord, PendingChange, Scope, Subscription};
use anyhow::{anyhow, Context, Result};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PendingChangeRow {
    pub content_id: i64,
    pub action: String,
    pub content_type: String,
    pub record: String,
    pub revision: i64,
}

impl PendingChangeRow {
    pub fn into_pending(self) -> Result<PendingChange> {
        let action = ChangeAction::parse_action(&self.action).ok_or_else(|| {
            anyhow!("pending change {} has unknown action {}", self.content_id, self.action)
        })?;
        let record: ChangeRecord = serde_json::from_str(&self.record)
            .with_context(|| format!("pending change {} has a corrupt snapshot", self.content_id))?;
        Ok(PendingChange {
            action,
            record,
            revision: self.revision,
        })
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubscriptionRow {
    pub id: i64,
    pub target: String,
    pub content_type: String,
    pub content_id: Option<i64>,
    pub events: String,
    pub signature_digest: String,
}

impl From<SubscriptionRow> for Subscription {
    fn from(row: SubscriptionRow) -> Self {
        let scope = match row.content_id {
            Some(content_id) => Scope::Item {
                content_type: row.content_type,
                content_id,
            },
            None => Scope::Collection {
                content_type: row.content_type,
            },
        };
        Subscription {
            id: row.id,
            target: row.target,
            events: events_from_str(&row.events),
            scope,
            signature_digest: row.signature_digest,
        }
    }
}

/// Run-lock lease row. Times are unix milliseconds.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockRow {
    pub name: String,
    pub token: String,
    pub acquired_at: i64,
    pub expires_at: Option<i64>,
}
