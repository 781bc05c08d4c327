use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use content_hooks::config;
use content_hooks::db;
use content_hooks::delivery::{ConfiguredPolicy, HttpTransport, Notifier};
use content_hooks::dispatch::{self, CycleOutcome, Dispatcher};
use content_hooks::ledger::ChangeLedger;
use content_hooks::lock::{RunLock, SqliteRunLock};
use content_hooks::registry::Registry;

#[derive(Debug, Parser)]
#[command(author, version, about = "Deliver queued content changes to subscribed webhooks")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Run a single dispatch cycle and exit
    #[arg(long)]
    once: bool,

    /// Force-release a stuck dispatch run-lock and exit
    #[arg(long, conflicts_with = "once")]
    clear_lock: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let lock: Arc<dyn RunLock> = Arc::new(SqliteRunLock::new(pool.clone(), cfg.app.lock_lease()));
    if args.clear_lock {
        if lock.force_release().await? {
            info!("run-lock cleared");
        } else {
            info!("run-lock was not held");
        }
        return Ok(());
    }

    let registry = Registry::new(pool.clone());
    let transport = HttpTransport::from_config(&cfg.delivery)?;
    let notifier = Notifier::new(
        Arc::new(transport),
        Arc::new(ConfiguredPolicy::from_config(&cfg.delivery)),
        registry.clone(),
        cfg.app.site_url.clone(),
        cfg.delivery.request_timeout(),
    );
    let dispatcher = Arc::new(Dispatcher::new(
        ChangeLedger::new(pool.clone()),
        registry,
        lock,
        notifier,
    ));

    if args.once {
        match dispatcher.run_cycle().await? {
            CycleOutcome::Skipped => info!("another cycle holds the run-lock; nothing done"),
            CycleOutcome::Completed(stats) => info!(?stats, "single cycle finished"),
            CycleOutcome::LeaseLost(stats) => warn!(?stats, "run-lock taken over mid-cycle"),
        }
        return Ok(());
    }

    let interval = cfg.app.dispatch_interval();
    info!(interval_secs = interval.as_secs(), "starting dispatch worker");
    tokio::select! {
        _ = dispatch::run_forever(dispatcher, interval) => {}
        res = tokio::signal::ctrl_c() => {
            if let Err(err) = res {
                error!(?err, "failed to listen for shutdown signal");
            }
            info!("shutting down");
        }
    }

    Ok(())
}
