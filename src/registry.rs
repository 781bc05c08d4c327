//! Subscription registry.
//!
//! Subscribers register a target URL for a scope and a set of events. At
//! creation they receive a random signature; only its digest is stored. Every
//! delivery response, and every later change to the subscription, must present
//! the plain signature again.

use crate::db::{self, Pool};
use crate::model::{events_to_string, ChangeAction, Scope, Subscription};
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::{info, instrument};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("invalid target URL: {0}")]
    InvalidTarget(String),
    #[error("no valid subscription events")]
    NoEvents,
    #[error("subscription target already exists")]
    AlreadyExists,
    #[error("subscription target not found")]
    NotFound,
    #[error("subscription signature mismatch")]
    SignatureMismatch,
    #[error("registry storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

pub type RegistryResult<T> = Result<T, RegistryError>;

/// Lowercase hex SHA-256 of a plain signature.
pub fn signature_digest(signature: &str) -> String {
    format!("{:x}", Sha256::digest(signature.as_bytes()))
}

/// Whether `presented` hashes to the stored digest. An empty digest never
/// matches.
pub fn signature_matches(stored_digest: &str, presented: &str) -> bool {
    !stored_digest.is_empty() && signature_digest(presented) == stored_digest
}

fn generate_signature() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Trim and drop trailing slashes; the result must be an absolute http(s) URL.
pub fn normalize_target(raw: &str) -> RegistryResult<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let url = Url::parse(trimmed).map_err(|_| RegistryError::InvalidTarget(raw.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(RegistryError::InvalidTarget(raw.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Keep recognized event names, whitespace removed. `create` makes no sense
/// for an item that already exists, so item scopes drop it.
pub fn clean_events<S: AsRef<str>>(
    scope: &Scope,
    events: &[S],
) -> RegistryResult<BTreeSet<ChangeAction>> {
    let cleaned: BTreeSet<ChangeAction> = events
        .iter()
        .flat_map(|e| e.as_ref().split(','))
        .map(|e| e.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter_map(|e| ChangeAction::parse_action(&e))
        .filter(|action| !(scope.content_id().is_some() && *action == ChangeAction::Create))
        .collect();
    if cleaned.is_empty() {
        return Err(RegistryError::NoEvents);
    }
    Ok(cleaned)
}

/// A freshly created subscription and the plain signature to hand back once.
#[derive(Debug, Clone)]
pub struct Created {
    pub subscription: Subscription,
    pub signature: String,
}

#[derive(Clone, Debug)]
pub struct Registry {
    pool: Pool,
}

impl Registry {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn create<S: AsRef<str>>(
        &self,
        scope: &Scope,
        target: &str,
        events: &[S],
    ) -> RegistryResult<Created> {
        let events = clean_events(scope, events)?;
        let target = normalize_target(target)?;
        if db::find_subscription(&self.pool, scope.content_type(), scope.content_id(), &target)
            .await?
            .is_some()
        {
            return Err(RegistryError::AlreadyExists);
        }

        let signature = generate_signature();
        let digest = signature_digest(&signature);
        let id = db::insert_subscription(
            &self.pool,
            &target,
            scope.content_type(),
            scope.content_id(),
            &events_to_string(&events),
            &digest,
        )
        .await?;
        info!(id, %target, "subscription created");

        Ok(Created {
            subscription: Subscription {
                id,
                target,
                events,
                scope: scope.clone(),
                signature_digest: digest,
            },
            signature,
        })
    }

    /// Replace the event set of an existing subscription.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn update_events<S: AsRef<str>>(
        &self,
        scope: &Scope,
        target: &str,
        events: &[S],
        presented_signature: &str,
    ) -> RegistryResult<Subscription> {
        let events = clean_events(scope, events)?;
        let mut subscription = self.verified(scope, target, presented_signature).await?;
        db::update_subscription_events(&self.pool, subscription.id, &events_to_string(&events))
            .await?;
        info!(id = subscription.id, "subscription events updated");
        subscription.events = events;
        Ok(subscription)
    }

    /// Subscriber-initiated removal.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn unsubscribe(
        &self,
        scope: &Scope,
        target: &str,
        presented_signature: &str,
    ) -> RegistryResult<Subscription> {
        let subscription = self.verified(scope, target, presented_signature).await?;
        db::delete_subscription(&self.pool, subscription.id).await?;
        info!(id = subscription.id, "subscription removed by subscriber");
        Ok(subscription)
    }

    async fn verified(
        &self,
        scope: &Scope,
        target: &str,
        presented_signature: &str,
    ) -> RegistryResult<Subscription> {
        let target = normalize_target(target)?;
        let row =
            db::find_subscription(&self.pool, scope.content_type(), scope.content_id(), &target)
                .await?
            .ok_or(RegistryError::NotFound)?;
        let subscription = Subscription::from(row);
        if !signature_matches(&subscription.signature_digest, presented_signature) {
            return Err(RegistryError::SignatureMismatch);
        }
        Ok(subscription)
    }

    pub async fn list(&self, scope: &Scope) -> RegistryResult<Vec<Subscription>> {
        let rows =
            db::list_subscriptions_for_scope(&self.pool, scope.content_type(), scope.content_id())
                .await?;
        Ok(rows.into_iter().map(Subscription::from).collect())
    }

    pub async fn get(&self, id: i64) -> RegistryResult<Option<Subscription>> {
        Ok(db::get_subscription(&self.pool, id).await?.map(Subscription::from))
    }

    /// Unconditional removal. Idempotent; returns whether a row was removed.
    pub async fn delete(&self, id: i64) -> RegistryResult<bool> {
        Ok(db::delete_subscription(&self.pool, id).await?)
    }

    /// Collection-level subscriptions for `content_type` that want `action`.
    pub async fn collection_matches(
        &self,
        content_type: &str,
        action: ChangeAction,
    ) -> RegistryResult<Vec<Subscription>> {
        let rows = db::list_collection_subscriptions(&self.pool, content_type).await?;
        Ok(rows
            .into_iter()
            .map(Subscription::from)
            .filter(|s| s.wants(action))
            .collect())
    }

    /// Item-level subscriptions for `content_id` that want `action`.
    pub async fn item_matches(
        &self,
        content_id: i64,
        action: ChangeAction,
    ) -> RegistryResult<Vec<Subscription>> {
        let rows = db::list_item_subscriptions(&self.pool, content_id).await?;
        Ok(rows
            .into_iter()
            .map(Subscription::from)
            .filter(|s| s.wants(action))
            .collect())
    }
}
