//! Pledge Scheduler Daemon
//!
//! Charges due pledges and retries failed ones against the sandbox gateway.
//!
//! ## Usage
//!
//! ```bash
//! # Sweep once and exit
//! pledge-scheduler --once
//!
//! # Run every 10 minutes for one tenant
//! pledge-scheduler --tenant grace-chapel --interval-secs 600
//!
//! # Custom config and database
//! pledge-scheduler --config /etc/pledges.toml --db-path /data/pledges.db
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pledge_scheduler::events::spawn_logging_listener;
use pledge_scheduler::{
    Config, EventBus, LogNotifier, PledgeDb, PledgeProcessor, PledgeScheduler, SandboxGateway,
    SettingsCache,
};
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pledge-scheduler")]
#[command(about = "Recurring pledge billing scheduler")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database path
    #[arg(long, env = "PLEDGE_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Only process pledges for this tenant
    #[arg(long, env = "PLEDGE_TENANT")]
    tenant: Option<String>,

    /// Run one due sweep and one retry sweep, then exit
    #[arg(long)]
    once: bool,

    /// Seconds between sweeps in daemon mode
    #[arg(long)]
    interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("pledge_scheduler=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("Failed to load config {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(db_path) = args.db_path {
        config.db_path = Some(db_path);
    }
    if let Some(secs) = args.interval_secs {
        config.sweep_interval_secs = secs;
    }

    let db_path = config.database_path();
    info!(
        db_path = %db_path.display(),
        worker_count = config.worker_count,
        tenant = ?args.tenant,
        "Starting pledge-scheduler"
    );

    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    if args.config.is_none() {
        tokio::fs::create_dir_all(&config.storage_dir).await?;
        let config_path = config.config_path();
        if !config_path.exists() {
            config.save(&config_path)?;
            info!(path = %config_path.display(), "Created default config");
        }
    }

    let db = Arc::new(PledgeDb::open(&db_path).context("Failed to open pledge database")?);
    let events = Arc::new(EventBus::new());
    let listener = spawn_logging_listener(Arc::clone(&events));

    let settings = Arc::new(SettingsCache::new(
        config.settings_cache_ttl(),
        config.default_tenant_settings,
    ));
    let processor = Arc::new(PledgeProcessor::new(
        Arc::clone(&db),
        Arc::new(SandboxGateway),
        Arc::new(LogNotifier),
        settings,
        Arc::clone(&events),
        config.processor_config(),
    ));
    let scheduler = PledgeScheduler::new(processor, config.worker_count);

    if args.once {
        let report = scheduler.run_once(args.tenant.as_deref()).await?;
        let summary = report.summary();
        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Sweep complete"
        );
    } else {
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        });

        // An in-flight sweep finishes before the loop exits
        scheduler
            .run(args.tenant.clone(), config.sweep_interval(), shutdown_rx)
            .await;
    }

    let stats = db.stats()?;
    info!(
        pledges = stats.pledge_count,
        active = stats.active_pledges,
        charges = stats.charge_count,
        pending = stats.pending_charges,
        donations = stats.donation_count,
        "Final database stats"
    );

    listener.abort();
    Ok(())
}
