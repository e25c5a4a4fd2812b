//! Arena - Timed Contest Lifecycle & Settlement Engine
//!
//! Runs the tick loop that advances every active cycle through its phases,
//! settles finished cycles exactly once, refunds cancelled ones, and keeps
//! recurring templates supplied with fresh cycles.

use anyhow::{Context, Result};
use chrono::Utc;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::{env, sync::Arc, time::Duration};
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arena_backend::{
    cycles::TickProcessor,
    models::{EngineConfig, Template},
    AccountStore, CycleStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    info!("🏟️ Arena contest engine starting");

    let config = EngineConfig::from_env();
    info!(
        tick_interval_ms = config.tick_interval_ms,
        stuck_grace_secs = config.stuck_grace_secs,
        "engine configuration loaded"
    );

    let cycle_db_path = resolve_data_path(env::var("CYCLE_DB_PATH").ok(), "arena_cycles.db");
    let wallet_db_path = resolve_data_path(env::var("WALLET_DB_PATH").ok(), "arena_wallet.db");

    let cycles = Arc::new(CycleStore::new(&cycle_db_path).context("open cycle store")?);
    let accounts = Arc::new(AccountStore::new(&wallet_db_path).context("open account store")?);

    info!("📊 Cycle store initialized at: {}", cycle_db_path);
    info!("💰 Wallet store initialized at: {}", wallet_db_path);

    if let Ok(seed_path) = env::var("TEMPLATE_SEED_PATH") {
        match seed_templates(&cycles, &seed_path).await {
            Ok(count) => info!(count, path = %seed_path, "templates seeded"),
            Err(e) => warn!(path = %seed_path, error = %e, "template seeding failed"),
        }
    }

    let processor = Arc::new(TickProcessor::new(cycles.clone(), accounts.clone()));

    // Stand-in for the external timer trigger. The processor tolerates
    // duplicated, skipped, or overlapping invocations, so the interval's
    // behavior under delay does not matter for correctness.
    let tick_processor = processor.clone();
    let tick_interval_ms = config.tick_interval_ms;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(tick_interval_ms));
        loop {
            ticker.tick().await;
            let summary = tick_processor.run_tick(Utc::now().timestamp()).await;
            if summary.failed > 0 {
                warn!(
                    processed = summary.processed,
                    failed = summary.failed,
                    "tick completed with failures"
                );
            }
        }
    });

    // Stuck-cycle watch: the one externally observable failure symptom is a
    // cycle making no phase progress long after its hard stop.
    let watch_cycles = cycles.clone();
    let stuck_grace_secs = config.stuck_grace_secs;
    let stuck_check_secs = config.stuck_check_secs;
    tokio::spawn(async move {
        let mut ticker = interval(Duration::from_secs(stuck_check_secs));
        loop {
            ticker.tick().await;
            match watch_cycles
                .stuck_cycles(Utc::now().timestamp(), stuck_grace_secs)
                .await
            {
                Ok(stuck) => {
                    for cycle in stuck {
                        error!(
                            cycle_id = %cycle.id,
                            phase = cycle.phase.as_str(),
                            live_end_at = cycle.live_end_at,
                            settled_at = ?cycle.settled_at,
                            "stuck cycle detected; inspect settlement snapshot before retrying"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "stuck cycle check failed"),
            }
        }
    });

    info!("✅ Tick loop running");
    tokio::signal::ctrl_c().await?;
    info!("👋 Shutting down");
    Ok(())
}

/// Load a JSON array of templates, inserting any whose name is not already
/// present. Existing templates are never modified from here.
async fn seed_templates(cycles: &CycleStore, path: &str) -> Result<usize> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
    let templates: Vec<Template> = serde_json::from_str(&raw).context("parse template seed")?;
    let mut inserted = 0;
    for template in &templates {
        template.validate()?;
        cycles.insert_template_if_absent(template).await?;
        inserted += 1;
    }
    Ok(inserted)
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arena_backend=debug,arena=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn default_data_path(filename: &str) -> String {
    // Anchor defaults to the crate directory so running from elsewhere
    // doesn't create a new empty DB in a different working directory.
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    base.join(filename).to_string_lossy().to_string()
}

fn resolve_data_path(env_value: Option<String>, default_filename: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return default_data_path(default_filename);
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() {
        return p.to_string_lossy().to_string();
    }

    base.join(p).to_string_lossy().to_string()
}

fn load_env() {
    // Standard dotenv search (cwd + parents), plus the crate directory for
    // runs via --manifest-path from elsewhere.
    let _ = dotenv();

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidate = manifest_dir.join(".env");
    if candidate.exists() {
        let _ = dotenv::from_path(&candidate);
    }
}
