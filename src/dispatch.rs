//! Dispatch engine: one notify cycle drains the ledger and fans each change out
//! to matching subscribers.

use crate::delivery::Notifier;
use crate::ledger::ChangeLedger;
use crate::lock::{Lease, RunLock};
use crate::model::{ChangeAction, ChangeRecord, PendingChange, Subscription};
use crate::registry::Registry;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub drained: usize,
    pub deliveries: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Item subscriptions dropped because their content was deleted.
    pub removed: usize,
    /// Storage errors and undecodable rows passed over during the cycle.
    pub errors: usize,
    pub cleared: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Another worker holds the run-lock.
    Skipped,
    Completed(CycleStats),
    /// The lease expired and another worker took it over mid-cycle. The
    /// ledger is left for the new holder.
    LeaseLost(CycleStats),
}

pub struct Dispatcher {
    ledger: ChangeLedger,
    registry: Registry,
    lock: Arc<dyn RunLock>,
    notifier: Notifier,
}

impl Dispatcher {
    pub fn new(
        ledger: ChangeLedger,
        registry: Registry,
        lock: Arc<dyn RunLock>,
        notifier: Notifier,
    ) -> Self {
        Self {
            ledger,
            registry,
            lock,
            notifier,
        }
    }

    pub fn lock(&self) -> &Arc<dyn RunLock> {
        &self.lock
    }

    /// Run one cycle under the run-lock. The lease is renewed before each
    /// change and released at the end, even when processing fails.
    #[instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let Some(lease) = self.lock.try_acquire().await? else {
            info!("dispatch cycle already running; skipping");
            return Ok(CycleOutcome::Skipped);
        };

        let mut held = lease;
        let result = self.process(&mut held).await;
        if let Ok(CycleOutcome::LeaseLost(stats)) = &result {
            warn!(?stats, "run-lock lost mid-cycle; stopping");
        } else if let Err(err) = self.lock.release(&held).await {
            error!(?err, "failed to release run-lock");
        }

        let outcome = result?;
        if let CycleOutcome::Completed(stats) = &outcome {
            info!(
                drained = stats.drained,
                deliveries = stats.deliveries,
                succeeded = stats.succeeded,
                failed = stats.failed,
                removed = stats.removed,
                errors = stats.errors,
                "dispatch cycle completed"
            );
        }
        Ok(outcome)
    }

    async fn process(&self, lease: &mut Lease) -> Result<CycleOutcome> {
        let drained = self.ledger.drain_all().await.context("failed to drain ledger")?;
        let mut stats = CycleStats {
            drained: drained.changes.len(),
            errors: drained.skipped,
            ..CycleStats::default()
        };

        let mut processed: HashSet<i64> = HashSet::new();
        let mut delete_notified: HashSet<(i64, String)> = HashSet::new();
        for change in &drained.changes {
            if !processed.insert(change.record.content_id()) {
                debug!(content_id = change.record.content_id(), "already processed this cycle");
                continue;
            }
            match self.lock.renew(lease).await.context("failed to renew run-lock")? {
                Some(renewed) => *lease = renewed,
                None => return Ok(CycleOutcome::LeaseLost(stats)),
            }
            if let Err(err) = self.fan_out(change, &mut delete_notified, &mut stats).await {
                warn!(?err, content_id = change.record.content_id(), "change fan-out failed");
                stats.errors += 1;
            }
        }

        stats.cleared = self
            .ledger
            .clear_through(drained.watermark)
            .await
            .context("failed to clear ledger")?;
        Ok(CycleOutcome::Completed(stats))
    }

    /// Deliver and tally. A storage error is logged and counted instead of
    /// ending the fan-out for the other subscribers.
    async fn deliver_one(
        &self,
        subscription: &Subscription,
        record: &ChangeRecord,
        action: ChangeAction,
        stats: &mut CycleStats,
    ) -> bool {
        match self.notifier.deliver(subscription, record, action).await {
            Ok(outcome) => {
                stats.tally(outcome.is_success());
                outcome.is_success()
            }
            Err(err) => {
                warn!(?err, subscription_id = subscription.id, "delivery aborted");
                stats.errors += 1;
                false
            }
        }
    }

    #[instrument(
        skip_all,
        fields(content_id = change.record.content_id(), action = %change.action)
    )]
    async fn fan_out(
        &self,
        change: &PendingChange,
        delete_notified: &mut HashSet<(i64, String)>,
        stats: &mut CycleStats,
    ) -> Result<()> {
        let action = change.action;
        let record = &change.record;
        let content_id = record.content_id();

        let collection = self
            .registry
            .collection_matches(record.content_type(), action)
            .await?;
        for subscription in &collection {
            let delivered = self.deliver_one(subscription, record, action, stats).await;
            if delivered && action == ChangeAction::Delete {
                delete_notified.insert((content_id, subscription.target.clone()));
            }
        }

        let items = self.registry.item_matches(content_id, action).await?;
        for subscription in &items {
            let key = (content_id, subscription.target.clone());
            if action == ChangeAction::Delete && delete_notified.contains(&key) {
                debug!(target = %subscription.target, "delete already notified");
            } else {
                let delivered = self.deliver_one(subscription, record, action, stats).await;
                if delivered && action == ChangeAction::Delete {
                    delete_notified.insert(key);
                }
            }
            if action == ChangeAction::Delete {
                // Gone already when the delivery failed.
                match self.registry.delete(subscription.id).await {
                    Ok(true) => stats.removed += 1,
                    Ok(false) => {}
                    Err(err) => {
                        warn!(?err, subscription_id = subscription.id, "cascade delete failed");
                        stats.errors += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

impl CycleStats {
    fn tally(&mut self, success: bool) {
        self.deliveries += 1;
        if success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }
}

/// Run a cycle on every tick until the task is dropped. Errors are logged and
/// the next tick tries again.
pub async fn run_forever(dispatcher: Arc<Dispatcher>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        match dispatcher.run_cycle().await {
            Ok(CycleOutcome::Skipped) | Ok(CycleOutcome::LeaseLost(_)) => {}
            Ok(CycleOutcome::Completed(stats)) => {
                debug!(?stats, "tick finished");
            }
            Err(err) => {
                warn!(?err, "dispatch cycle failed");
            }
        }
    }
}
