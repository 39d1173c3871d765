//! rustpapercollect - Checkpointed paper collection sessions
//!
//! Inspect and recover collection sessions from the command line.
//!
//! ## Usage
//!
//! ```bash
//! rustpapercollect create --venues CVPR,ICLR --years 2022-2024
//! rustpapercollect plan session_20250101_120000_1a2b3c4d
//! rustpapercollect recover session_20250101_120000_1a2b3c4d
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rustpapercollect::checkpoint_manager::CheckpointManager;
use rustpapercollect::{InterruptionRecoveryEngine, StateConfig, StateManager, VenueConfig};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{fmt, EnvFilter};

// ============================================================================
// CLI Definition
// ============================================================================

/// Checkpointed paper collection sessions with interruption recovery
#[derive(Parser)]
#[command(name = "rustpapercollect")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json: bool,

    /// State directory (overrides the config file)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new collection session
    Create {
        /// Venues in priority order (e.g., "CVPR,ICLR,NeurIPS")
        #[arg(long, value_delimiter = ',', required = true)]
        venues: Vec<String>,

        /// Year range (e.g., "2024", "2020-2024", "2021,2023")
        #[arg(long)]
        years: String,

        /// Maximum papers per venue and year
        #[arg(long)]
        max_papers: Option<u64>,

        /// Session id (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },

    /// List sessions
    Sessions,

    /// Show a session's progress
    Status {
        session_id: String,
    },

    /// List a session's checkpoints
    Checkpoints {
        session_id: String,

        /// Also write the listing as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },

    /// Validate one checkpoint in detail
    Validate {
        session_id: String,
        checkpoint_id: String,
    },

    /// Analyse an interruption and print the recovery plan
    Plan {
        session_id: String,
    },

    /// Recover an interrupted session
    Recover {
        session_id: String,
    },

    /// Delete all but the newest checkpoints of a session
    Prune {
        session_id: String,

        /// Checkpoints to keep (defaults to the configured retention)
        #[arg(long)]
        keep: Option<usize>,
    },

    /// Delete sessions inactive for longer than the given age
    Cleanup {
        #[arg(long, default_value = "30")]
        max_age_days: u32,
    },
}

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.debug { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level.to_string()));

    if cli.json {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_thread_ids(false)
            .init();
    }

    let config = load_config(cli.config.as_deref(), cli.state_dir)?;
    info!(state_dir = %config.base_state_dir.display(), "Using state directory");
    let manager = Arc::new(StateManager::new(config));

    match cli.command {
        Commands::Create {
            venues,
            years,
            max_papers,
            id,
        } => create_session(&manager, venues, &years, max_papers, id),
        Commands::Sessions => list_sessions(&manager),
        Commands::Status { session_id } => show_status(&manager, &session_id),
        Commands::Checkpoints { session_id, csv } => {
            list_checkpoints(&manager.checkpoint_manager(), &session_id, csv.as_deref())
        }
        Commands::Validate {
            session_id,
            checkpoint_id,
        } => {
            let result = manager
                .checkpoint_manager()
                .validate_checkpoint(&session_id, &checkpoint_id);
            print_json(&result)
        }
        Commands::Plan { session_id } => {
            let analysis = manager
                .analyze_interruption(&session_id)
                .with_context(|| format!("Session not found: {}", session_id))?;
            let plan = manager.plan_recovery(&analysis);
            print_json(&serde_json::json!({ "analysis": analysis, "plan": plan }))
        }
        Commands::Recover { session_id } => {
            let engine = InterruptionRecoveryEngine::new(Arc::clone(&manager));
            let result = engine.resume_interrupted_session(&session_id);
            print_json(&result)?;
            if !result.success {
                bail!("Recovery failed: {}", result.resume_errors.join("; "));
            }
            Ok(())
        }
        Commands::Prune { session_id, keep } => {
            let keep = keep.unwrap_or(manager.config().keep_latest_checkpoints);
            let removed = manager
                .checkpoint_manager()
                .cleanup_session_checkpoints(&session_id, keep);
            println!("Removed {} checkpoint(s), kept up to {}", removed, keep);
            Ok(())
        }
        Commands::Cleanup { max_age_days } => {
            let removed = manager.cleanup_old_sessions(max_age_days);
            println!("Removed {} session(s) older than {} days", removed, max_age_days);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>, state_dir: Option<PathBuf>) -> Result<StateConfig> {
    let mut config = match path {
        Some(path) => StateConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {:?}", path))?,
        None => StateConfig::default(),
    };
    if let Some(dir) = state_dir {
        config.base_state_dir = dir;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

// ============================================================================
// Sessions
// ============================================================================

fn create_session(
    manager: &StateManager,
    venues: Vec<String>,
    years: &str,
    max_papers: Option<u64>,
    id: Option<String>,
) -> Result<()> {
    let years = parse_years(years)?;
    let venues: Vec<VenueConfig> = venues
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .enumerate()
        .map(|(idx, name)| {
            let mut venue = VenueConfig::new(name, Vec::new()).with_priority(idx as i32 + 1);
            if let Some(max) = max_papers {
                venue.max_papers_per_year = max;
            }
            venue
        })
        .collect();
    if venues.is_empty() {
        bail!("At least one venue is required");
    }

    let session_id = manager
        .create_session(venues, years, BTreeMap::new(), id)
        .context("Failed to create session")?;
    println!("{}", session_id);
    Ok(())
}

fn list_sessions(manager: &StateManager) -> Result<()> {
    let ids = manager.list_sessions();
    if ids.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for id in ids {
        match manager.get_session_status(&id) {
            Some(session) => println!(
                "{}  {:?}  papers={}  completed={}/{}  last_activity={}",
                id,
                session.status,
                session.total_papers_collected,
                session.venues_completed.len(),
                session.venue_grid().len(),
                session.last_activity_time.format("%Y-%m-%d %H:%M:%S")
            ),
            None => println!("{}  (unreadable)", id),
        }
    }
    Ok(())
}

fn show_status(manager: &StateManager, session_id: &str) -> Result<()> {
    let session = manager
        .get_session_status(session_id)
        .with_context(|| format!("Session not found: {}", session_id))?;
    let statistics = manager.checkpoint_manager().get_checkpoint_statistics(session_id);
    print_json(&serde_json::json!({
        "config": session.config_record(),
        "status": session.status_record(),
        "checkpoints": statistics,
    }))
}

// ============================================================================
// Checkpoints
// ============================================================================

/// One row of the checkpoint listing
#[derive(Serialize)]
struct CheckpointRow {
    checkpoint_id: String,
    checkpoint_type: String,
    timestamp: String,
    papers_collected: u64,
    venues_completed: usize,
    venues_in_progress: usize,
    venues_not_started: usize,
    valid: bool,
}

fn list_checkpoints(manager: &CheckpointManager, session_id: &str, csv_path: Option<&Path>) -> Result<()> {
    let rows: Vec<CheckpointRow> = manager
        .list_checkpoints(session_id)
        .iter()
        .map(|c| CheckpointRow {
            checkpoint_id: c.checkpoint_id.clone(),
            checkpoint_type: c.checkpoint_type.as_str().to_string(),
            timestamp: c.timestamp.to_rfc3339(),
            papers_collected: c.papers_collected,
            venues_completed: c.venues_completed.len(),
            venues_in_progress: c.venues_in_progress.len(),
            venues_not_started: c.venues_not_started.len(),
            valid: c.is_valid(),
        })
        .collect();

    if rows.is_empty() {
        println!("No checkpoints for {}", session_id);
        return Ok(());
    }
    for row in &rows {
        println!(
            "{}  {:<18}  papers={:<6}  {}",
            row.checkpoint_id,
            row.checkpoint_type,
            row.papers_collected,
            if row.valid { "valid" } else { "CORRUPTED" }
        );
    }

    if let Some(path) = csv_path {
        save_csv(path, &rows)?;
    }
    Ok(())
}

/// Save data to CSV file
fn save_csv<T: Serialize>(path: &Path, data: &[T]) -> Result<()> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(true)
        .from_path(path)
        .context("Failed to create CSV writer")?;

    for item in data {
        wtr.serialize(item).context("Failed to write CSV record")?;
    }

    wtr.flush().context("Failed to flush CSV")?;
    println!("Saved: {:?}", path);
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", text);
    Ok(())
}

/// Parse year specification: "2024", "2020-2024" or "2021,2023"
fn parse_years(years_str: &str) -> Result<BTreeSet<i32>> {
    let mut years = BTreeSet::new();
    for part in years_str.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((start, end)) = part.split_once('-') {
            let start: i32 = start.trim().parse().context("Invalid start year")?;
            let end: i32 = end.trim().parse().context("Invalid end year")?;
            if start > end {
                bail!("Start year must be <= end year");
            }
            years.extend(start..=end);
        } else {
            years.insert(part.parse().context("Invalid year")?);
        }
    }
    if years.is_empty() {
        bail!("No years given");
    }
    Ok(years)
}
