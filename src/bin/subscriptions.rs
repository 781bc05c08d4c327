use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use content_hooks::config;
use content_hooks::db;
use content_hooks::model::{events_to_string, Scope, Subscription};
use content_hooks::registry::Registry;

#[derive(Debug, Parser)]
#[command(author, version, about = "Manage webhook subscriptions")]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, clap::Args)]
struct ScopeOpts {
    /// Content type the subscription covers
    #[arg(long)]
    content_type: String,

    /// Restrict to one content item
    #[arg(long)]
    content_id: Option<i64>,
}

impl ScopeOpts {
    fn scope(&self) -> Scope {
        match self.content_id {
            Some(id) => Scope::item(self.content_type.clone(), id),
            None => Scope::collection(self.content_type.clone()),
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register a target; prints the signature once
    Create {
        #[command(flatten)]
        scope: ScopeOpts,
        #[arg(long)]
        target: String,
        /// Comma-separated: create, update, delete
        #[arg(long, value_delimiter = ',', required = true)]
        events: Vec<String>,
    },
    /// List subscriptions for a scope
    List {
        #[command(flatten)]
        scope: ScopeOpts,
    },
    /// Replace the event set of a subscription
    Update {
        #[command(flatten)]
        scope: ScopeOpts,
        #[arg(long)]
        target: String,
        #[arg(long, value_delimiter = ',', required = true)]
        events: Vec<String>,
        #[arg(long)]
        signature: String,
    },
    /// Remove a subscription after checking its signature
    Delete {
        #[command(flatten)]
        scope: ScopeOpts,
        #[arg(long)]
        target: String,
        #[arg(long)]
        signature: String,
    },
    /// Remove a subscription by id without a signature
    Purge {
        id: i64,
    },
}

fn print_subscription(sub: &Subscription) {
    println!(
        "#{} {} [{}] scope={}",
        sub.id,
        sub.target,
        events_to_string(&sub.events),
        sub.scope
    );
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
    let registry = Registry::new(pool);

    match args.command {
        Command::Create {
            scope,
            target,
            events,
        } => {
            let created = registry.create(&scope.scope(), &target, &events).await?;
            print_subscription(&created.subscription);
            println!("signature: {}", created.signature);
        }
        Command::List { scope } => {
            let subs = registry.list(&scope.scope()).await?;
            if subs.is_empty() {
                println!("no subscriptions for {}", scope.scope());
            }
            for sub in &subs {
                print_subscription(sub);
            }
        }
        Command::Update {
            scope,
            target,
            events,
            signature,
        } => {
            let sub = registry
                .update_events(&scope.scope(), &target, &events, &signature)
                .await?;
            print_subscription(&sub);
        }
        Command::Delete {
            scope,
            target,
            signature,
        } => {
            let sub = registry.unsubscribe(&scope.scope(), &target, &signature).await?;
            println!("removed #{}", sub.id);
        }
        Command::Purge { id } => {
            if registry.delete(id).await? {
                println!("removed #{}", id);
            } else {
                println!("no subscription #{}", id);
            }
        }
    }
    Ok(())
}
