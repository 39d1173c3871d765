//! Checkpoint lifecycle: creation, loading, listing, validation and retention.
//!
//! Checkpoints live under `sessions/<session_id>/checkpoints/` as one JSON file
//! per checkpoint and are never overwritten. Every public method logs and
//! swallows internal errors so a checkpoint failure can never take down the
//! collection process that asked for it.

use crate::checkpoint::{
    CheckpointData, CheckpointProgress, CheckpointValidationResult, ValidationStatus,
};
use crate::config::StateConfig;
use crate::error::{Result, StateError};
use crate::persistence::{backup_path, StatePersistence};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

const CHECKPOINT_PREFIX: &str = "checkpoint_";
const CHECKPOINT_EXTENSION: &str = ".json";

/// Whether automatic retention should run after the `count`-th checkpoint
pub fn should_cleanup(count: u64, interval: u64) -> bool {
    interval > 0 && count > 0 && count % interval == 0
}

/// Build a globally unique checkpoint id: session, timestamp and 8 random hex digits
pub fn generate_checkpoint_id(session_id: &str, timestamp: DateTime<Utc>) -> String {
    format!(
        "{}{}_{}_{:08x}",
        CHECKPOINT_PREFIX,
        session_id,
        timestamp.format("%Y%m%d_%H%M%S_%6f"),
        rand::random::<u32>()
    )
}

/// Aggregate view over a session's checkpoints
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckpointStatistics {
    pub total_checkpoints: usize,
    pub valid_checkpoints: usize,
    pub corrupted_checkpoints: usize,
    pub by_type: BTreeMap<String, usize>,
    pub earliest_checkpoint_id: Option<String>,
    pub latest_checkpoint_id: Option<String>,
    pub timespan_hours: f64,
}

/// Creates, loads, validates and prunes checkpoints
pub struct CheckpointManager {
    config: StateConfig,
    persistence: StatePersistence,
    counters: Mutex<HashMap<String, u64>>,
}

impl CheckpointManager {
    pub fn new(config: StateConfig) -> Self {
        Self {
            config,
            persistence: StatePersistence::new(),
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    fn checkpoint_path(&self, session_id: &str, checkpoint_id: &str) -> PathBuf {
        self.config
            .checkpoints_dir(session_id)
            .join(format!("{}{}", checkpoint_id, CHECKPOINT_EXTENSION))
    }

    /// Create and persist a checkpoint, returning its id
    pub fn create_checkpoint(&self, session_id: &str, progress: CheckpointProgress) -> Option<String> {
        self.create_checkpoint_data(session_id, progress)
            .map(|checkpoint| checkpoint.checkpoint_id)
    }

    /// Create and persist a checkpoint, returning the stored snapshot
    pub fn create_checkpoint_data(
        &self,
        session_id: &str,
        progress: CheckpointProgress,
    ) -> Option<CheckpointData> {
        match self.try_create(session_id, progress) {
            Ok(checkpoint) => Some(checkpoint),
            Err(e) => {
                error!(session_id, error = %e, "Failed to create checkpoint");
                None
            }
        }
    }

    fn try_create(&self, session_id: &str, progress: CheckpointProgress) -> Result<CheckpointData> {
        let timestamp = Utc::now();
        let checkpoint_id = generate_checkpoint_id(session_id, timestamp);
        let mut checkpoint = CheckpointData::new(&checkpoint_id, session_id, timestamp, progress);

        // Catches serialization problems before anything touches disk
        if !checkpoint.validate_integrity() {
            return Err(StateError::Integrity(format!(
                "checkpoint {} failed integrity check after construction",
                checkpoint_id
            )));
        }

        let path = self.checkpoint_path(session_id, &checkpoint_id);
        if !self.persistence.save_state_atomic(&path, &checkpoint, false) {
            return Err(StateError::Persistence(format!(
                "could not write {}",
                path.display()
            )));
        }
        checkpoint.validation_status = Some(ValidationStatus::Valid);

        let count = self.bump_counter(session_id);
        info!(
            session_id,
            checkpoint_id = %checkpoint_id,
            checkpoint_type = checkpoint.checkpoint_type.as_str(),
            papers = checkpoint.papers_collected,
            count,
            "Checkpoint created"
        );

        if should_cleanup(count, self.config.checkpoint_cleanup_interval) {
            let removed = self.cleanup_session_checkpoints(session_id, self.config.keep_latest_checkpoints);
            debug!(session_id, removed, "Periodic checkpoint cleanup");
        }

        Ok(checkpoint)
    }

    fn bump_counter(&self, session_id: &str) -> u64 {
        let mut counters = match self.counters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let count = counters.entry(session_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// Checkpoints created by this manager for a session since startup
    pub fn checkpoint_count(&self, session_id: &str) -> u64 {
        self.counters
            .lock()
            .map(|counters| counters.get(session_id).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Drop in-memory bookkeeping for a removed session
    pub fn forget_session(&self, session_id: &str) {
        if let Ok(mut counters) = self.counters.lock() {
            counters.remove(session_id);
        }
    }

    /// Load a checkpoint; `None` if missing or failing integrity validation.
    ///
    /// Integrity is the struct checksum, the same test listing and validation
    /// apply, so fields this version does not know are ignored.
    pub fn load_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> Option<CheckpointData> {
        let path = self.checkpoint_path(session_id, checkpoint_id);
        let mut checkpoint: CheckpointData = self.persistence.load_state(&path, false)?;

        if !checkpoint.validate_integrity() {
            warn!(session_id, checkpoint_id, "Checkpoint failed integrity validation");
            return None;
        }
        checkpoint.validation_status = Some(ValidationStatus::Valid);
        Some(checkpoint)
    }

    /// Newest checkpoint whose integrity validates
    pub fn load_latest_checkpoint(&self, session_id: &str) -> Option<CheckpointData> {
        let latest = self
            .list_checkpoints(session_id)
            .into_iter()
            .rev()
            .find(CheckpointData::is_valid);

        match &latest {
            Some(checkpoint) => debug!(
                session_id,
                checkpoint_id = %checkpoint.checkpoint_id,
                "Latest valid checkpoint"
            ),
            None => debug!(session_id, "No valid checkpoint"),
        }
        latest
    }

    /// All readable checkpoints of a session, oldest first, each tagged with
    /// a freshly computed validation status
    pub fn list_checkpoints(&self, session_id: &str) -> Vec<CheckpointData> {
        match self.try_list(session_id) {
            Ok(checkpoints) => checkpoints,
            Err(e) => {
                error!(session_id, error = %e, "Failed to list checkpoints");
                Vec::new()
            }
        }
    }

    fn try_list(&self, session_id: &str) -> Result<Vec<CheckpointData>> {
        let dir = self.config.checkpoints_dir(session_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_checkpoint = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(CHECKPOINT_PREFIX) && n.ends_with(CHECKPOINT_EXTENSION));
            if !is_checkpoint {
                continue;
            }

            let Some(mut checkpoint) = self.persistence.load_state::<CheckpointData>(&path, false) else {
                warn!(path = %path.display(), "Skipping unreadable checkpoint file");
                continue;
            };

            let status = if checkpoint.validate_integrity() {
                ValidationStatus::Valid
            } else {
                warn!(
                    session_id,
                    checkpoint_id = %checkpoint.checkpoint_id,
                    "Checkpoint is corrupted"
                );
                ValidationStatus::Corrupted
            };
            checkpoint.validation_status = Some(status);
            checkpoints.push(checkpoint);
        }

        checkpoints.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.checkpoint_id.cmp(&b.checkpoint_id))
        });
        Ok(checkpoints)
    }

    /// Detailed multi-criterion validation of one checkpoint
    pub fn validate_checkpoint(&self, session_id: &str, checkpoint_id: &str) -> CheckpointValidationResult {
        let path = self.checkpoint_path(session_id, checkpoint_id);
        let Some(checkpoint) = self.persistence.load_state::<CheckpointData>(&path, false) else {
            warn!(session_id, checkpoint_id, "Checkpoint missing or unreadable");
            return CheckpointValidationResult::unusable(checkpoint_id, "Checkpoint not found or unreadable");
        };

        let result = checkpoint.assess(session_id, self.config.papers_count_tolerance);
        if !result.is_valid {
            warn!(
                session_id,
                checkpoint_id,
                score = result.integrity_score,
                errors = ?result.validation_errors,
                "Checkpoint validation failed"
            );
        }
        result
    }

    /// Delete all but the `keep_latest` newest checkpoints; returns how many were removed
    pub fn cleanup_session_checkpoints(&self, session_id: &str, keep_latest: usize) -> usize {
        let checkpoints = self.list_checkpoints(session_id);
        if checkpoints.len() <= keep_latest {
            return 0;
        }

        let excess = checkpoints.len() - keep_latest;
        let mut removed = 0;
        for checkpoint in checkpoints.iter().take(excess) {
            let path = self.checkpoint_path(session_id, &checkpoint.checkpoint_id);
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    removed += 1;
                    let sidecar = backup_path(&path);
                    if sidecar.exists() {
                        if let Err(e) = std::fs::remove_file(&sidecar) {
                            warn!(path = %sidecar.display(), error = %e, "Failed to remove checkpoint backup");
                        }
                    }
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove checkpoint"),
            }
        }

        info!(session_id, removed, kept = keep_latest, "Cleaned up old checkpoints");
        removed
    }

    /// Counts by validity and type, plus the covered time span
    pub fn get_checkpoint_statistics(&self, session_id: &str) -> CheckpointStatistics {
        let checkpoints = self.list_checkpoints(session_id);
        let mut stats = CheckpointStatistics {
            total_checkpoints: checkpoints.len(),
            ..CheckpointStatistics::default()
        };

        for checkpoint in &checkpoints {
            if checkpoint.is_valid() {
                stats.valid_checkpoints += 1;
            } else {
                stats.corrupted_checkpoints += 1;
            }
            *stats
                .by_type
                .entry(checkpoint.checkpoint_type.as_str().to_string())
                .or_insert(0) += 1;
        }

        if let (Some(first), Some(last)) = (checkpoints.first(), checkpoints.last()) {
            stats.earliest_checkpoint_id = Some(first.checkpoint_id.clone());
            stats.latest_checkpoint_id = Some(last.checkpoint_id.clone());
            stats.timespan_hours =
                (last.timestamp - first.timestamp).num_milliseconds() as f64 / 3_600_000.0;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointType, PapersByVenue, VenueYear};
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> CheckpointManager {
        CheckpointManager::new(StateConfig::with_state_dir(dir.path()))
    }

    fn progress(papers: u64) -> CheckpointProgress {
        let mut by_venue = PapersByVenue::new();
        by_venue.entry("CVPR".to_string()).or_default().insert(2023, papers);
        CheckpointProgress::new(CheckpointType::BatchCompleted, format!("batch {}", papers))
            .with_venues(vec![VenueYear::new("CVPR", 2023)], vec![], vec![])
            .with_papers(papers, by_venue)
    }

    /// Rewrite a stored checkpoint with a changed paper count but the old checksum
    fn corrupt(manager: &CheckpointManager, session_id: &str, checkpoint_id: &str) {
        let path = manager.checkpoint_path(session_id, checkpoint_id);
        let content = std::fs::read_to_string(&path).expect("read checkpoint");
        let mut value: serde_json::Value = serde_json::from_str(&content).expect("parse checkpoint");
        value["papers_collected"] = serde_json::Value::from(999_999);
        std::fs::write(&path, value.to_string()).expect("write checkpoint");
    }

    #[test]
    fn test_should_cleanup_policy() {
        assert!(!should_cleanup(0, 10));
        assert!(!should_cleanup(9, 10));
        assert!(should_cleanup(10, 10));
        assert!(should_cleanup(20, 10));
        assert!(!should_cleanup(5, 0));
    }

    #[test]
    fn test_checkpoint_id_format() {
        let id = generate_checkpoint_id("session_abc", Utc::now());
        assert!(id.starts_with("checkpoint_session_abc_"));
        let suffix = id.rsplit('_').next().expect("suffix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_create_and_load() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);

        let id = manager.create_checkpoint("s1", progress(100)).expect("created");
        let loaded = manager.load_checkpoint("s1", &id).expect("loaded");
        assert_eq!(loaded.papers_collected, 100);
        assert!(loaded.validate_integrity());
        assert_eq!(manager.checkpoint_count("s1"), 1);
        assert!(manager.load_checkpoint("s1", "checkpoint_missing").is_none());
    }

    #[test]
    fn test_latest_skips_corrupted() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);

        let first = manager.create_checkpoint("s1", progress(10)).expect("first");
        let second = manager.create_checkpoint("s1", progress(20)).expect("second");
        let third = manager.create_checkpoint("s1", progress(30)).expect("third");
        corrupt(&manager, "s1", &third);

        let latest = manager.load_latest_checkpoint("s1").expect("latest");
        assert_eq!(latest.checkpoint_id, second);
        assert_ne!(latest.checkpoint_id, first);
        assert!(manager.load_checkpoint("s1", &third).is_none());

        let listed = manager.list_checkpoints("s1");
        assert_eq!(listed.len(), 3);
        let corrupted: Vec<_> = listed
            .iter()
            .filter(|c| c.validation_status == Some(ValidationStatus::Corrupted))
            .collect();
        assert_eq!(corrupted.len(), 1);
        assert_eq!(corrupted[0].checkpoint_id, third);
    }

    #[test]
    fn test_retention_keeps_newest() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);

        let ids: Vec<String> = (1..=6)
            .map(|n| manager.create_checkpoint("s1", progress(n)).expect("created"))
            .collect();

        assert_eq!(manager.cleanup_session_checkpoints("s1", 10), 0);
        assert_eq!(manager.cleanup_session_checkpoints("s1", 4), 2);

        let remaining: Vec<String> = manager
            .list_checkpoints("s1")
            .into_iter()
            .map(|c| c.checkpoint_id)
            .collect();
        assert_eq!(remaining, ids[2..].to_vec());
    }

    #[test]
    fn test_periodic_cleanup() {
        let dir = TempDir::new().expect("tempdir");
        let config = StateConfig {
            checkpoint_cleanup_interval: 5,
            keep_latest_checkpoints: 3,
            ..StateConfig::with_state_dir(dir.path())
        };
        let manager = CheckpointManager::new(config);

        for n in 1..=4 {
            manager.create_checkpoint("s1", progress(n)).expect("created");
        }
        assert_eq!(manager.list_checkpoints("s1").len(), 4);

        manager.create_checkpoint("s1", progress(5)).expect("created");
        assert_eq!(manager.list_checkpoints("s1").len(), 3);
    }

    #[test]
    fn test_sessions_do_not_interfere() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);

        manager.create_checkpoint("a", progress(1)).expect("a");
        manager.create_checkpoint("b", progress(2)).expect("b");
        manager.create_checkpoint("b", progress(3)).expect("b");

        assert_eq!(manager.list_checkpoints("a").len(), 1);
        assert_eq!(manager.list_checkpoints("b").len(), 2);
        assert_eq!(manager.cleanup_session_checkpoints("b", 1), 1);
        assert_eq!(manager.list_checkpoints("a").len(), 1);
    }

    #[test]
    fn test_concurrent_sessions_do_not_interfere() {
        let dir = TempDir::new().expect("tempdir");
        let manager = Arc::new(manager(&dir));
        let sessions = 6;
        let per_session = 5;

        let handles: Vec<_> = (0..sessions)
            .map(|i| {
                let manager = Arc::clone(&manager);
                thread::spawn(move || {
                    let session_id = format!("session_{}", i);
                    (1..=per_session)
                        .map(|n| manager.create_checkpoint(&session_id, progress(i * 100 + n)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let created: Vec<Vec<Option<String>>> = handles
            .into_iter()
            .map(|h| h.join().expect("thread finished"))
            .collect();

        for (i, ids) in created.iter().enumerate() {
            let session_id = format!("session_{}", i);
            assert!(ids.iter().all(Option::is_some), "{} lost a checkpoint", session_id);
            assert_eq!(manager.checkpoint_count(&session_id), per_session);

            let listed = manager.list_checkpoints(&session_id);
            assert_eq!(listed.len(), per_session as usize);
            assert!(listed.iter().all(|c| c.session_id == session_id && c.is_valid()));

            let files = std::fs::read_dir(manager.config().checkpoints_dir(&session_id))
                .expect("checkpoint dir")
                .flatten()
                .filter(|e| e.file_name().to_string_lossy().ends_with(CHECKPOINT_EXTENSION))
                .count();
            assert_eq!(files, per_session as usize);

            let latest = manager.load_latest_checkpoint(&session_id).expect("latest");
            assert!(ids.contains(&Some(latest.checkpoint_id)));
        }
    }

    #[test]
    fn test_unknown_fields_ignored_on_load() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = manager.create_checkpoint("s1", progress(40)).expect("created");

        let path = manager.checkpoint_path("s1", &id);
        let content = std::fs::read_to_string(&path).expect("read checkpoint");
        let mut value: serde_json::Value = serde_json::from_str(&content).expect("parse checkpoint");
        value["annotation"] = serde_json::Value::from("reviewed");
        std::fs::write(&path, value.to_string()).expect("write checkpoint");

        let listed = manager.list_checkpoints("s1");
        assert_eq!(listed[0].validation_status, Some(ValidationStatus::Valid));
        assert!(manager.validate_checkpoint("s1", &id).is_valid);
        assert_eq!(
            manager.load_latest_checkpoint("s1").map(|c| c.checkpoint_id),
            Some(id.clone())
        );
        let loaded = manager.load_checkpoint("s1", &id).expect("loaded");
        assert_eq!(loaded.papers_collected, 40);
    }

    #[test]
    fn test_validate_checkpoint_detects_corruption() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);

        let id = manager.create_checkpoint("s1", progress(50)).expect("created");
        let result = manager.validate_checkpoint("s1", &id);
        assert!(result.is_valid);
        assert!(result.can_be_used_for_recovery);

        corrupt(&manager, "s1", &id);
        let result = manager.validate_checkpoint("s1", &id);
        assert!(!result.is_valid);
        assert!((result.integrity_score - 0.5).abs() < 1e-9);
        assert!(result.can_be_used_for_recovery);

        let missing = manager.validate_checkpoint("s1", "checkpoint_nope");
        assert!(!missing.is_valid);
        assert_eq!(missing.integrity_score, 0.0);
    }

    #[test]
    fn test_statistics() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);

        let first = manager.create_checkpoint("s1", progress(1)).expect("created");
        let error = progress(2).with_error(crate::checkpoint::ErrorContext::new("api_timeout", "timed out"));
        let last = manager.create_checkpoint("s1", error).expect("created");

        let stats = manager.get_checkpoint_statistics("s1");
        assert_eq!(stats.total_checkpoints, 2);
        assert_eq!(stats.valid_checkpoints, 2);
        assert_eq!(stats.by_type.get("error_occurred"), Some(&1));
        assert_eq!(stats.by_type.get("batch_completed"), Some(&1));
        assert_eq!(stats.earliest_checkpoint_id, Some(first));
        assert_eq!(stats.latest_checkpoint_id, Some(last));
        assert!(stats.timespan_hours >= 0.0);

        assert_eq!(manager.get_checkpoint_statistics("empty"), CheckpointStatistics::default());
    }
}
