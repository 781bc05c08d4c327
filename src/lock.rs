//! Dispatch run-lock.
//!
//! A cycle only runs while it holds the lease. Leases live in the database so
//! several workers or hosts sharing it exclude each other. A lease may carry an
//! expiry; once expired any worker can take it over. Without an expiry a crashed
//! holder keeps the lock until an operator calls [`RunLock::force_release`].

use crate::db::{self, Pool};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

pub const DISPATCH_LOCK: &str = "dispatch";

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<T: Clock + ?Sized> Clock for std::sync::Arc<T> {
    fn now(&self) -> DateTime<Utc> {
        (**self).now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Saturates at the latest representable instant.
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now = chrono::Duration::from_std(by)
            .ok()
            .and_then(|step| now.checked_add_signed(step))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Lease {
    fn from_row(row: db::LockRow) -> Self {
        Self {
            name: row.name,
            token: row.token,
            acquired_at: from_millis(row.acquired_at),
            expires_at: row.expires_at.map(from_millis),
        }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Capability to hold the single dispatch slot.
#[async_trait]
pub trait RunLock: Send + Sync {
    /// `None` when another holder owns a live lease.
    async fn try_acquire(&self) -> Result<Option<Lease>>;

    /// Push the expiry of a held lease forward. `None` when the lease was
    /// released or taken over in the meantime.
    async fn renew(&self, lease: &Lease) -> Result<Option<Lease>>;

    async fn release(&self, lease: &Lease) -> Result<()>;

    /// Drop whatever lease is held. Returns whether one existed.
    async fn force_release(&self) -> Result<bool>;

    async fn current(&self) -> Result<Option<Lease>>;
}

pub struct SqliteRunLock<C: Clock = SystemClock> {
    pool: Pool,
    name: String,
    lease: Option<Duration>,
    clock: C,
}

impl SqliteRunLock<SystemClock> {
    pub fn new(pool: Pool, lease: Option<Duration>) -> Self {
        Self::with_clock(pool, DISPATCH_LOCK, lease, SystemClock)
    }
}

impl<C: Clock> SqliteRunLock<C> {
    pub fn with_clock(
        pool: Pool,
        name: impl Into<String>,
        lease: Option<Duration>,
        clock: C,
    ) -> Self {
        Self {
            pool,
            name: name.into(),
            lease,
            clock,
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    fn expiry_from(&self, now: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        Ok(match self.lease {
            Some(lease) => Some(now + chrono::Duration::from_std(lease)?),
            None => None,
        })
    }
}

#[async_trait]
impl<C: Clock> RunLock for SqliteRunLock<C> {
    async fn try_acquire(&self) -> Result<Option<Lease>> {
        let now = self.clock.now();
        let expires_at = self.expiry_from(now)?;
        let token = Uuid::new_v4().to_string();
        let won = db::try_acquire_lock(
            &self.pool,
            &self.name,
            &token,
            now.timestamp_millis(),
            expires_at.map(|t| t.timestamp_millis()),
        )
        .await?;
        if !won {
            return Ok(None);
        }
        Ok(Some(Lease {
            name: self.name.clone(),
            token,
            acquired_at: now,
            expires_at,
        }))
    }

    async fn renew(&self, lease: &Lease) -> Result<Option<Lease>> {
        let expires_at = self.expiry_from(self.clock.now())?;
        let kept = db::renew_lock(
            &self.pool,
            &lease.name,
            &lease.token,
            expires_at.map(|t| t.timestamp_millis()),
        )
        .await?;
        if !kept {
            warn!(lock = %lease.name, "lease lost before renewal");
            return Ok(None);
        }
        Ok(Some(Lease {
            expires_at,
            ..lease.clone()
        }))
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        if !db::release_lock(&self.pool, &lease.name, &lease.token).await? {
            warn!(lock = %lease.name, "lease was already released or taken over");
        }
        Ok(())
    }

    async fn force_release(&self) -> Result<bool> {
        let existed = db::force_release_lock(&self.pool, &self.name).await?;
        if existed {
            info!(lock = %self.name, "run-lock force-released");
        }
        Ok(existed)
    }

    async fn current(&self) -> Result<Option<Lease>> {
        Ok(db::get_lock(&self.pool, &self.name)
            .await?
            .map(Lease::from_row))
    }
}
