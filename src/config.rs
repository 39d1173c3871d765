//! Configuration for session state and recovery.
//!
//! All thresholds used by the checkpoint manager, the planner and the recovery
//! engine live here so tests and deployments can tune them without code changes.

use crate::error::{Result, StateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Default state directory: `<data_local_dir>/rustpapercollect/state`
fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("rustpapercollect").join("state"))
        .unwrap_or_else(|| PathBuf::from("./state"))
}

/// Tunables for the state subsystem
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Root of the `sessions/` tree
    pub base_state_dir: PathBuf,
    /// Run automatic retention every N checkpoints per session
    pub checkpoint_cleanup_interval: u64,
    /// Checkpoints retained per session by automatic cleanup
    pub keep_latest_checkpoints: usize,
    /// Allowed relative gap between `papers_by_venue` and `papers_collected`
    pub papers_count_tolerance: f64,
    /// Staleness threshold for the in-progress marker and post-hoc warning
    pub recovery_timeout_seconds: u64,
    /// Attempts allowed before a session must be recovered manually
    pub max_recovery_attempts: u32,
    /// Plans estimating longer than this are rejected
    pub max_recovery_time_minutes: f64,
    /// Plans with lower confidence are rejected
    pub min_recovery_confidence: f64,
    /// A checkpoint older than this is no longer preferred for restore
    pub recent_checkpoint_hours: f64,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            base_state_dir: default_state_dir(),
            checkpoint_cleanup_interval: 10,
            keep_latest_checkpoints: 10,
            papers_count_tolerance: 0.10,
            recovery_timeout_seconds: 300,
            max_recovery_attempts: 3,
            max_recovery_time_minutes: 5.0,
            min_recovery_confidence: 0.5,
            recent_checkpoint_hours: 24.0,
        }
    }
}

impl StateConfig {
    /// Default configuration rooted at `base_state_dir`
    pub fn with_state_dir(base_state_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_state_dir: base_state_dir.into(),
            ..Self::default()
        }
    }

    /// Load configuration from a JSON file; missing keys take defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: StateConfig = serde_json::from_str(&content)?;
        config.validate()?;
        info!(path = %path.display(), "Loaded state configuration");
        Ok(config)
    }

    /// Reject values the components cannot operate with
    pub fn validate(&self) -> Result<()> {
        if self.checkpoint_cleanup_interval == 0 {
            return Err(StateError::Config(
                "checkpoint_cleanup_interval must be positive".to_string(),
            ));
        }
        if self.keep_latest_checkpoints == 0 {
            return Err(StateError::Config(
                "keep_latest_checkpoints must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.papers_count_tolerance) {
            return Err(StateError::Config(format!(
                "papers_count_tolerance out of range: {}",
                self.papers_count_tolerance
            )));
        }
        if self.recovery_timeout_seconds == 0 {
            return Err(StateError::Config(
                "recovery_timeout_seconds must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.min_recovery_confidence) {
            return Err(StateError::Config(format!(
                "min_recovery_confidence out of range: {}",
                self.min_recovery_confidence
            )));
        }
        if self.max_recovery_time_minutes <= 0.0 || self.recent_checkpoint_hours <= 0.0 {
            return Err(StateError::Config(
                "time thresholds must be positive".to_string(),
            ));
        }
        debug!(config = ?self, "State configuration validated");
        Ok(())
    }

    /// `<base>/sessions`
    pub fn sessions_dir(&self) -> PathBuf {
        self.base_state_dir.join("sessions")
    }

    /// `<base>/sessions/<session_id>`
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    /// `<base>/sessions/<session_id>/checkpoints`
    pub fn checkpoints_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("checkpoints")
    }
}
