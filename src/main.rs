//! # Autopilot — automation replay tool
//!
//! Loads schedules into the persistent store, replays a JSON-lines event log
//! through the engine, and prints what is left.
//!
//! Usage:
//!   autopilot --schedules schedules.json --events events.jsonl
//!   autopilot --db /tmp/automation.db --events events.jsonl --wait-secs 5
//!   autopilot --paused --events events.jsonl   # count progress only

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use autopilot_core::{AutopilotConfig, JsonValue};
use autopilot_scheduler::{
    AutomationDriver, AutomationEngine, AutomationEvent, ExecuteCallback, PrepareCallback,
    PrepareResult, Schedule, ScheduleListener, SqliteScheduleStore,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "autopilot", version, about = "🤖 Autopilot — automation engine replay tool")]
struct Cli {
    /// Config file (default: ~/.autopilot/config.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Schedule database, overrides the config
    #[arg(long)]
    db: Option<String>,

    /// JSON array of schedule definitions to import
    #[arg(short, long)]
    schedules: Option<String>,

    /// JSON-lines file of events to replay
    #[arg(short, long)]
    events: Option<String>,

    /// Start with the engine paused
    #[arg(long)]
    paused: bool,

    /// Keep running this long after replay so delays and cooldowns can fire
    #[arg(long, default_value = "0")]
    wait_secs: u64,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

/// Continues every preparation and finishes every execution, logging both.
struct LoggingDriver;

impl AutomationDriver for LoggingDriver {
    fn on_prepare_schedule(&self, schedule: &Schedule, callback: PrepareCallback) {
        tracing::info!(schedule_id = %schedule.id, "📋 prepare");
        callback.finish(PrepareResult::Continue);
    }

    fn on_execute_schedule(&self, schedule: &Schedule, callback: ExecuteCallback) {
        tracing::info!(schedule_id = %schedule.id, data = %schedule.data, "🚀 execute");
        println!("▶️  {} {}", schedule.id, schedule.data);
        callback.finish();
    }
}

struct LoggingListener;

impl ScheduleListener for LoggingListener {
    fn on_schedule_expired(&self, schedule: &Schedule) {
        println!("⌛ {} expired", schedule.id);
    }

    fn on_schedule_limit_reached(&self, schedule: &Schedule) {
        println!("🏁 {} reached its limit", schedule.id);
    }

    fn on_schedule_cancelled(&self, schedule: &Schedule) {
        println!("🗑️  {} cancelled", schedule.id);
    }
}

fn read_schedules(path: &Path) -> Result<Vec<Schedule>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading schedules from {}", path.display()))?;
    let schedules: Vec<Schedule> = serde_json::from_str(&text)
        .with_context(|| format!("parsing schedules in {}", path.display()))?;
    Ok(schedules)
}

fn read_events(path: &Path) -> Result<Vec<AutomationEvent>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading events from {}", path.display()))?;
    text.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .map(|(n, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("{}:{}: invalid event", path.display(), n + 1))
        })
        .collect()
}

/// Round-trip through the queue until callback-driven work has drained.
async fn settle(engine: &AutomationEngine) -> Result<()> {
    for _ in 0..32 {
        engine.get_state("").await?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => AutopilotConfig::load_from(&expand_path(path))?,
        None => AutopilotConfig::load()?,
    };

    // Initialize logging
    let filter = if cli.verbose {
        "autopilot=debug".to_string()
    } else {
        config.logging.filter.clone()
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter));
    if config.logging.json {
        tracing_subscriber::fmt().json().with_env_filter(env_filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .init();
    }

    let db_path = match &cli.db {
        Some(path) => expand_path(path),
        None => expand_path(&config.database_path().to_string_lossy()),
    };
    let store = SqliteScheduleStore::open(&db_path)?;

    println!("🤖 Autopilot v{}", env!("CARGO_PKG_VERSION"));
    println!("   🗄️  Database: {}", db_path.display());
    println!();

    let engine = AutomationEngine::builder()
        .store(store)
        .driver(Arc::new(LoggingDriver))
        .listener(Arc::new(LoggingListener))
        .start_paused(cli.paused || config.engine.start_paused)
        .start()?;

    if let Some(path) = &cli.schedules {
        let schedules = read_schedules(&expand_path(path))?;
        let total = schedules.len();
        let accepted = engine.schedule_multiple(schedules, JsonValue::Null).await?;
        println!("📅 Imported {}/{} schedule(s)", accepted.len(), total);
    }

    if let Some(path) = &cli.events {
        let events = read_events(&expand_path(path))?;
        println!("📨 Replaying {} event(s)", events.len());
        for event in events {
            engine.add_event(event)?;
        }
    }
    settle(&engine).await?;

    if cli.wait_secs > 0 {
        tokio::time::sleep(Duration::from_secs(cli.wait_secs)).await;
        settle(&engine).await?;
    }

    let schedules = engine.get_schedules().await?;
    println!();
    println!("{} schedule(s) remaining", schedules.len());
    for schedule in &schedules {
        let state = engine
            .get_state(&schedule.id)
            .await?
            .map(|s| s.to_string())
            .unwrap_or_else(|| "gone".into());
        println!(
            "   {:<32} {:<28} priority={} group={}",
            schedule.id,
            state,
            schedule.priority,
            schedule.group.as_deref().unwrap_or("-")
        );
    }

    engine.shutdown().await?;
    Ok(())
}
