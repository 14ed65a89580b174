//! Message Cluster Store maintenance tool
//!
//! ## Usage
//!
//! ```bash
//! # Create the database and write a default config
//! mcstore init
//!
//! # Totals per status
//! mcstore stats
//!
//! # Top blacklisted clusters by report count, then the next page
//! mcstore top blacklisted --order report_count --limit 20
//! mcstore top blacklisted --cursor <token>
//!
//! # Audit trail of one cluster
//! mcstore history 42
//!
//! # Rebuild ranking indexes / repair cached counters
//! mcstore reindex
//! mcstore reconcile --batch-size 1000
//! ```
//!
//! Output is JSON on stdout; logs go to stderr (`RUST_LOG` controls the filter).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use message_cluster_store::services::spawn_logging_listener;
use message_cluster_store::{Config, Services};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mcstore")]
#[command(about = "Maintenance tool for the message cluster moderation store")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "MCSTORE_CONFIG")]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and write a default config if missing
    Init,

    /// Print cluster, membership and ledger totals
    Stats,

    /// List clusters in a status, highest count first
    Top {
        /// blacklisted | whitelisted | unclassified | hidden
        status: String,

        /// report_count | entity_count
        #[arg(long, default_value = "report_count")]
        order: String,

        #[arg(long)]
        limit: Option<i64>,

        /// Token from a previous page's `next_cursor`
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Print the status history of a cluster, newest first
    History {
        cluster_id: i64,

        /// Stop after this many rows
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Rebuild the ranking indexes without blocking writers
    Reindex,

    /// Recompute entity counts and cached statuses from physical data
    Reconcile {
        #[arg(long)]
        batch_size: Option<i64>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("message_cluster_store=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }

    info!(
        storage_dir = %config.storage_dir.display(),
        database = %config.database_path().display(),
        "Opening message cluster store"
    );

    let command = args.command;
    let services = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || Services::open(&config)).await??
    };
    let services = Arc::new(services);
    let listener = spawn_logging_listener(services.events.clone());

    let output = tokio::task::spawn_blocking({
        let services = services.clone();
        move || run(&services, &config, command)
    })
    .await??;

    println!("{}", serde_json::to_string_pretty(&output)?);

    // Dropping the last handle closes the bus; the listener drains and exits
    drop(services);
    let _ = tokio::time::timeout(Duration::from_secs(1), listener).await;
    Ok(())
}

fn run(services: &Services, config: &Config, command: Command) -> anyhow::Result<serde_json::Value> {
    let value = match command {
        Command::Init => {
            let config_path = config.config_path();
            if !config_path.exists() {
                config.save(&config_path)?;
                info!(path = %config_path.display(), "Created default config");
            }
            json!({
                "database": config.database_path(),
                "config": config_path,
            })
        }
        Command::Stats => serde_json::to_value(services.db.stats()?)?,
        Command::Top {
            status,
            order,
            limit,
            cursor,
        } => {
            let page = services
                .ranking
                .top_clusters_by_token(&status, &order, limit, cursor.as_deref())?;
            json!({
                "clusters": page.clusters,
                "next_cursor": page.next_cursor.map(|c| c.encode()),
            })
        }
        Command::History { cluster_id, limit } => {
            let history = services.ledger.history(cluster_id)?;
            let rows = history
                .take(limit.unwrap_or(usize::MAX))
                .collect::<Result<Vec<_>, _>>()?;
            serde_json::to_value(rows)?
        }
        Command::Reindex => {
            services.ranking.ensure_ranking_indexes()?;
            let rebuilt = services.ranking.rebuild_ranking_indexes()?;
            json!({ "rebuilt_indexes": rebuilt })
        }
        Command::Reconcile { batch_size } => {
            serde_json::to_value(services.ranking.reconcile_counters(batch_size)?)?
        }
    };
    Ok(value)
}
