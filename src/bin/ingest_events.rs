use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use content_hooks::config;
use content_hooks::content::MemoryDirectory;
use content_hooks::db;
use content_hooks::ledger::ChangeLedger;
use content_hooks::listener::{MutationEvent, MutationListener};
use content_hooks::model::ChangeAction;

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Feed JSON-lines content mutation events into the change ledger"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Events file; reads stdin when omitted
    #[arg(long)]
    input: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct Totals {
    lines: usize,
    recorded: usize,
    ignored: usize,
    malformed: usize,
}

async fn ingest<R: AsyncBufRead + Unpin>(
    reader: R,
    listener: &MutationListener,
    directory: &MemoryDirectory,
) -> Result<Totals> {
    let mut totals = Totals::default();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        totals.lines += 1;
        let event: MutationEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                warn!(?err, line = totals.lines, "skipping malformed event");
                totals.malformed += 1;
                continue;
            }
        };

        directory.put(event.entry().clone());
        let stored: Option<ChangeAction> = match &event {
            MutationEvent::Transition {
                context,
                old_status,
                entry,
            } => {
                listener
                    .status_transitioned(context, &entry.content.status, old_status, &entry.content)
                    .await
            }
            MutationEvent::Deleted { context, entry } => {
                let stored = listener.content_deleted(context, entry.content.id).await;
                directory.remove(entry.content.id);
                stored
            }
        };
        match stored {
            Some(_) => totals.recorded += 1,
            None => totals.ignored += 1,
        }
    }
    Ok(totals)
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

    let ledger = ChangeLedger::new(pool);
    let directory = Arc::new(MemoryDirectory::new());
    let listener = MutationListener::new(
        ledger.clone(),
        directory.clone(),
        cfg.tracking.content_types.clone(),
    );

    let totals = match &args.input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("failed to open {}", path.display()))?;
            ingest(BufReader::new(file), &listener, &directory).await?
        }
        None => ingest(BufReader::new(tokio::io::stdin()), &listener, &directory).await?,
    };

    info!(
        lines = totals.lines,
        recorded = totals.recorded,
        ignored = totals.ignored,
        malformed = totals.malformed,
        "ingest finished"
    );
    for action in ChangeAction::ALL {
        info!(%action, pending = ledger.count(action).await?, "ledger");
    }
    Ok(())
}
