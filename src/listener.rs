use crate::content::{ContentDirectory, ContentEntry};
use crate::ledger::ChangeLedger;
use crate::model::{ChangeAction, ChangeRecord, Content};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Who and what triggered a mutation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationContext {
    /// A bulk import is running.
    #[serde(default)]
    pub importing: bool,
    /// The write is an autosave.
    #[serde(default)]
    pub autosave: bool,
    /// Unattended background job; trusted for status transitions.
    #[serde(default)]
    pub background: bool,
    /// The acting principal may edit the item.
    #[serde(default)]
    pub can_edit: bool,
}

impl MutationContext {
    pub fn editor() -> Self {
        Self {
            can_edit: true,
            ..Self::default()
        }
    }

    pub fn background() -> Self {
        Self {
            background: true,
            ..Self::default()
        }
    }
}

/// A mutation reported by the content-storage system, one per JSON line.
///
/// The new status of a transition is the status carried by `entry.content`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MutationEvent {
    Transition {
        #[serde(default)]
        context: MutationContext,
        old_status: String,
        entry: ContentEntry,
    },
    Deleted {
        #[serde(default)]
        context: MutationContext,
        entry: ContentEntry,
    },
}

impl MutationEvent {
    pub fn entry(&self) -> &ContentEntry {
        match self {
            MutationEvent::Transition { entry, .. } | MutationEvent::Deleted { entry, .. } => entry,
        }
    }
}

/// Observes content lifecycle events and records eligible ones in the ledger.
///
/// Entry points never return errors: a failure to record is logged and the
/// content mutation that triggered it goes ahead.
pub struct MutationListener {
    ledger: ChangeLedger,
    directory: Arc<dyn ContentDirectory>,
    trackable: BTreeSet<String>,
}

impl MutationListener {
    pub fn new(
        ledger: ChangeLedger,
        directory: Arc<dyn ContentDirectory>,
        trackable: BTreeSet<String>,
    ) -> Self {
        Self {
            ledger,
            directory,
            trackable,
        }
    }

    pub fn tracks(&self, content_type: &str) -> bool {
        self.trackable.contains(content_type)
    }

    /// A content item moved from `old_status` to `new_status`. Returns the
    /// action the item is now pending under, if anything was recorded.
    #[instrument(skip_all, fields(content_id = content.id))]
    pub async fn status_transitioned(
        &self,
        ctx: &MutationContext,
        new_status: &str,
        old_status: &str,
        content: &Content,
    ) -> Option<ChangeAction> {
        if ctx.importing || ctx.autosave {
            return None;
        }
        if !ctx.can_edit && !ctx.background {
            debug!("transition by principal without edit rights ignored");
            return None;
        }
        if !self.tracks(&content.content_type) {
            return None;
        }
        let action = ChangeAction::classify(old_status, new_status)?;

        match self.capture_and_record(action, content.clone()).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(?err, %action, "failed to record status transition");
                None
            }
        }
    }

    /// A content item is about to be permanently removed from storage.
    #[instrument(skip_all, fields(content_id = content_id))]
    pub async fn content_deleted(
        &self,
        ctx: &MutationContext,
        content_id: i64,
    ) -> Option<ChangeAction> {
        if !ctx.can_edit {
            return None;
        }
        let content = match self.directory.content(content_id).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                debug!("deleted content not found in storage");
                return None;
            }
            Err(err) => {
                warn!(?err, "failed to load deleted content");
                return None;
            }
        };
        if !self.tracks(&content.content_type) {
            return None;
        }

        match self.capture_and_record(ChangeAction::Delete, content).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(?err, "failed to record deletion");
                None
            }
        }
    }

    async fn capture_and_record(
        &self,
        action: ChangeAction,
        content: Content,
    ) -> Result<Option<ChangeAction>> {
        let record = self.capture(content).await?;
        self.ledger.record(action, &record).await
    }

    /// Snapshot everything a later delivery needs while the row still exists.
    async fn capture(&self, content: Content) -> Result<ChangeRecord> {
        let permalink = self.directory.permalink(content.id).await?;
        let featured_image = self.directory.featured_image(content.id).await?;
        let author = self.directory.author(content.author_id).await?;
        Ok(ChangeRecord::new(content, permalink, featured_image, author))
    }
}
