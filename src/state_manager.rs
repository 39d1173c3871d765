//! Session lifecycle and the bridge from checkpoints to recovery plans.

use crate::analysis::{self, CheckpointPlanner, RecoveryPlanner};
use crate::checkpoint::{
    CheckpointData, CheckpointProgress, CheckpointType, PapersByVenue, VenueYear,
};
use crate::checkpoint_manager::CheckpointManager;
use crate::config::StateConfig;
use crate::error::{OptionExt, Result, StateError};
use crate::persistence::StatePersistence;
use crate::recovery::{
    InterruptionAnalysis, RecoveryPlan, ResumptionStrategy, SessionResumeResult, ValidationResult,
};
use crate::session::{
    CollectionSession, SessionConfigRecord, SessionStatus, SessionStatusRecord, VenueConfig,
    SESSION_CONFIG_FILE, SESSION_STATUS_FILE,
};
use chrono::{Duration, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

const SESSION_SUBDIRS: [&str; 3] = ["checkpoints", "venues", "recovery"];

/// Build a session id from the current time and 8 random hex digits
pub fn generate_session_id() -> String {
    format!(
        "session_{}_{:08x}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::random::<u32>()
    )
}

fn check_session_id(session_id: &str) -> Result<()> {
    if session_id.is_empty()
        || session_id.contains(['/', '\\'])
        || session_id.starts_with('.')
    {
        return Err(StateError::Validation(format!(
            "invalid session id: {:?}",
            session_id
        )));
    }
    Ok(())
}

/// Remove `cells` from every progress list, then append them to `target`
fn move_cells(session: &mut CollectionSession, cells: &[VenueYear], target: SessionProgressList) {
    if cells.is_empty() {
        return;
    }
    for list in [
        &mut session.venues_completed,
        &mut session.venues_in_progress,
        &mut session.venues_not_started,
    ] {
        list.retain(|cell| !cells.contains(cell));
    }
    let list = match target {
        SessionProgressList::InProgress => &mut session.venues_in_progress,
        SessionProgressList::NotStarted => &mut session.venues_not_started,
    };
    list.extend(cells.iter().cloned());
}

#[derive(Debug, Clone, Copy)]
enum SessionProgressList {
    InProgress,
    NotStarted,
}

/// Remove one cell from a per-venue paper map, returning its count
fn take_cell_papers(papers: &mut PapersByVenue, cell: &VenueYear) -> u64 {
    let Some(years) = papers.get_mut(&cell.venue) else {
        return 0;
    };
    let count = years.remove(&cell.year).unwrap_or(0);
    if years.is_empty() {
        papers.remove(&cell.venue);
    }
    count
}

fn count_files(dir: &Path) -> u64 {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .flatten()
                .filter(|e| e.path().is_file())
                .count() as u64
        })
        .unwrap_or(0)
}

/// Owns collection sessions: creation, progress updates, status, plans and resume
pub struct StateManager {
    config: StateConfig,
    persistence: StatePersistence,
    checkpoint_manager: Arc<CheckpointManager>,
    planner: Arc<dyn RecoveryPlanner>,
    sessions: Mutex<HashMap<String, CollectionSession>>,
}

impl StateManager {
    pub fn new(config: StateConfig) -> Self {
        Self::with_planner(config, Arc::new(CheckpointPlanner))
    }

    /// State manager using an alternative recovery planner
    pub fn with_planner(config: StateConfig, planner: Arc<dyn RecoveryPlanner>) -> Self {
        let checkpoint_manager = Arc::new(CheckpointManager::new(config.clone()));
        Self {
            config,
            persistence: StatePersistence::new(),
            checkpoint_manager,
            planner,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn checkpoint_manager(&self) -> Arc<CheckpointManager> {
        Arc::clone(&self.checkpoint_manager)
    }

    fn sessions(&self) -> MutexGuard<'_, HashMap<String, CollectionSession>> {
        match self.sessions.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Create a session, its directory layout and its initial checkpoint.
    ///
    /// Fails with [`StateError::SessionExists`] when `session_id` is taken.
    pub fn create_session(
        &self,
        target_venues: Vec<VenueConfig>,
        target_years: BTreeSet<i32>,
        collection_config: BTreeMap<String, Value>,
        session_id: Option<String>,
    ) -> Result<String> {
        let session_id = session_id.unwrap_or_else(generate_session_id);
        check_session_id(&session_id)?;

        // Held across check-and-create so concurrent duplicates cannot both pass
        let mut sessions = self.sessions();
        let dir = self.config.session_dir(&session_id);
        if sessions.contains_key(&session_id) || dir.join(SESSION_CONFIG_FILE).exists() {
            warn!(session_id = %session_id, "Session already exists");
            return Err(StateError::SessionExists(session_id));
        }

        let session = CollectionSession::new(&session_id, target_venues, target_years, collection_config);
        let session = match self.initialize_session(session) {
            Ok(session) => session,
            Err(e) => {
                error!(session_id = %session_id, error = %e, "Session creation failed");
                if let Err(cleanup) = std::fs::remove_dir_all(&dir) {
                    warn!(session_id = %session_id, error = %cleanup, "Failed to remove partial session directory");
                }
                self.checkpoint_manager.forget_session(&session_id);
                return Err(e);
            }
        };

        info!(
            session_id = %session_id,
            venues = session.target_venues.len(),
            cells = session.venues_not_started.len(),
            "Session created"
        );
        sessions.insert(session_id.clone(), session);
        Ok(session_id)
    }

    /// Directory layout, config record, initial checkpoint and status record
    fn initialize_session(&self, mut session: CollectionSession) -> Result<CollectionSession> {
        let session_id = session.session_id.clone();
        let dir = self.config.session_dir(&session_id);
        for sub in SESSION_SUBDIRS {
            std::fs::create_dir_all(dir.join(sub))?;
        }

        if !self
            .persistence
            .save_state_atomic(&dir.join(SESSION_CONFIG_FILE), &session.config_record(), false)
        {
            return Err(StateError::Persistence(format!(
                "could not write config for session {}",
                session_id
            )));
        }

        let progress = CheckpointProgress::new(CheckpointType::SessionStarted, "session created")
            .with_venues(Vec::new(), Vec::new(), session.venues_not_started.clone());
        let checkpoint = self
            .checkpoint_manager
            .create_checkpoint_data(&session_id, progress)
            .ok_or_else(|| {
                StateError::Persistence(format!(
                    "could not write initial checkpoint for session {}",
                    session_id
                ))
            })?;
        session.last_checkpoint_id = Some(checkpoint.checkpoint_id);
        session.checkpoint_count = 1;
        self.persist_status(&session)?;
        Ok(session)
    }

    fn persist_status(&self, session: &CollectionSession) -> Result<()> {
        let path = self
            .config
            .session_dir(&session.session_id)
            .join(SESSION_STATUS_FILE);
        if self
            .persistence
            .save_state_atomic(&path, &session.status_record(), true)
        {
            Ok(())
        } else {
            Err(StateError::Persistence(format!(
                "could not write status for session {}",
                session.session_id
            )))
        }
    }

    fn load_session_from_disk(&self, session_id: &str) -> Result<CollectionSession> {
        let dir = self.config.session_dir(session_id);
        let config: SessionConfigRecord = self
            .persistence
            .load_state(&dir.join(SESSION_CONFIG_FILE), true)
            .ok_or_session(session_id)?;
        let status: SessionStatusRecord = self
            .persistence
            .load_state(&dir.join(SESSION_STATUS_FILE), true)
            .ok_or_session(session_id)?;
        debug!(session_id, "Loaded session from disk");
        Ok(CollectionSession::from_records(config, status))
    }

    /// Apply `update` to the current session and persist the result.
    ///
    /// The update works on a copy; nothing changes in memory or on disk if it fails.
    fn with_session_mut<R>(
        &self,
        session_id: &str,
        update: impl FnOnce(&mut CollectionSession) -> Result<R>,
    ) -> Result<R> {
        let mut sessions = self.sessions();
        let mut session = match sessions.get(session_id) {
            Some(session) => session.clone(),
            None => self.load_session_from_disk(session_id)?,
        };
        let out = update(&mut session)?;
        self.persist_status(&session)?;
        sessions.insert(session_id.to_string(), session);
        Ok(out)
    }

    /// Session from memory, falling back to disk
    pub fn get_session_status(&self, session_id: &str) -> Option<CollectionSession> {
        if let Some(session) = self.sessions().get(session_id) {
            return Some(session.clone());
        }
        match self.load_session_from_disk(session_id) {
            Ok(session) => Some(session),
            Err(e) => {
                debug!(session_id, error = %e, "Session not available");
                None
            }
        }
    }

    /// Set the lifecycle status of a session; false when it cannot be updated
    pub fn update_session_status(&self, session_id: &str, status: SessionStatus) -> bool {
        let result = self.with_session_mut(session_id, |session| {
            session.status = status;
            session.last_activity_time = Utc::now();
            Ok(())
        });
        match result {
            Ok(()) => {
                info!(session_id, status = ?status, "Session status updated");
                true
            }
            Err(e) => {
                error!(session_id, error = %e, "Failed to update session status");
                false
            }
        }
    }

    /// Ids of all sessions in memory or on disk, sorted
    pub fn list_sessions(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.sessions().keys().cloned().collect();
        match std::fs::read_dir(self.config.sessions_dir()) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if !path.join(SESSION_CONFIG_FILE).is_file() {
                        continue;
                    }
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        ids.insert(name.to_string());
                    }
                }
            }
            Err(e) => debug!(error = %e, "No sessions directory"),
        }
        ids.into_iter().collect()
    }

    /// Delete sessions inactive for longer than `max_age_days`; returns how many
    pub fn cleanup_old_sessions(&self, max_age_days: u32) -> usize {
        let cutoff = Utc::now() - Duration::days(i64::from(max_age_days));
        let mut removed = 0;

        for session_id in self.list_sessions() {
            let Some(session) = self.get_session_status(&session_id) else {
                continue;
            };
            if session.last_activity_time >= cutoff {
                continue;
            }

            let dir = self.config.session_dir(&session_id);
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(&dir) {
                    warn!(session_id = %session_id, error = %e, "Failed to remove session directory");
                    continue;
                }
            }
            self.sessions().remove(&session_id);
            self.checkpoint_manager.forget_session(&session_id);
            removed += 1;
            info!(
                session_id = %session_id,
                last_activity = %session.last_activity_time,
                "Removed old session"
            );
        }
        removed
    }

    // ========================================================================
    // Checkpoints
    // ========================================================================

    /// Write a checkpoint and fold its progress into the session record
    pub fn save_checkpoint(&self, session_id: &str, progress: CheckpointProgress) -> Option<String> {
        let result = self.with_session_mut(session_id, |session| {
            let checkpoint = self
                .checkpoint_manager
                .create_checkpoint_data(session_id, progress)
                .ok_or_else(|| {
                    StateError::Persistence(format!("checkpoint for session {} not written", session_id))
                })?;
            session.apply_checkpoint(&checkpoint);
            session.checkpoint_count += 1;
            session.last_activity_time = checkpoint.timestamp;
            Ok(checkpoint.checkpoint_id)
        });

        match result {
            Ok(checkpoint_id) => Some(checkpoint_id),
            Err(e) => {
                error!(session_id, error = %e, "Failed to save checkpoint");
                None
            }
        }
    }

    pub fn load_latest_checkpoint(&self, session_id: &str) -> Option<CheckpointData> {
        self.checkpoint_manager.load_latest_checkpoint(session_id)
    }

    // ========================================================================
    // Analysis and planning
    // ========================================================================

    pub(crate) fn build_analysis(&self, session_id: &str) -> Result<InterruptionAnalysis> {
        let session = self.get_session_status(session_id).ok_or_session(session_id)?;
        let checkpoints = self.checkpoint_manager.list_checkpoints(session_id);
        let analysis = analysis::analyze_interruption(&session, &checkpoints, &self.config, Utc::now());
        debug!(
            session_id,
            interruption_type = ?analysis.interruption_type,
            complexity = ?analysis.recovery_complexity,
            valid = analysis.valid_checkpoints.len(),
            corrupted = analysis.corrupted_checkpoints.len(),
            "Interruption analysed"
        );
        Ok(analysis)
    }

    /// Diagnose why a session stopped and what is salvageable
    pub fn analyze_interruption(&self, session_id: &str) -> Option<InterruptionAnalysis> {
        match self.build_analysis(session_id) {
            Ok(analysis) => Some(analysis),
            Err(e) => {
                warn!(session_id, error = %e, "Interruption analysis failed");
                None
            }
        }
    }

    pub fn plan_recovery(&self, analysis: &InterruptionAnalysis) -> RecoveryPlan {
        let plan = self.planner.plan(analysis, &self.config);
        info!(
            session_id = %plan.session_id,
            strategy = %plan.resumption_strategy,
            confidence = plan.confidence_score,
            minutes = plan.estimated_recovery_time_minutes,
            "Recovery plan generated"
        );
        plan
    }

    pub fn get_recovery_plan(&self, session_id: &str) -> Option<RecoveryPlan> {
        self.analyze_interruption(session_id)
            .map(|analysis| self.plan_recovery(&analysis))
    }

    // ========================================================================
    // Resume
    // ========================================================================

    /// Apply a recovery plan to the session and mark it active
    pub fn resume_session(&self, session_id: &str, plan: &RecoveryPlan) -> SessionResumeResult {
        let mut result = SessionResumeResult::started(session_id);
        match self.try_resume(session_id, plan, &mut result) {
            Ok(snapshot) => {
                result.success = true;
                result.ready_for_continuation = true;
                result.session_snapshot = Some(snapshot);
                info!(
                    session_id,
                    strategy = %plan.resumption_strategy,
                    papers = result.papers_recovered,
                    venues = result.venues_recovered,
                    "Session resumed"
                );
            }
            Err(e) => {
                error!(session_id, error = %e, "Session resume failed");
                result.step_failed("Session restoration", e.to_string());
            }
        }
        result.finish();
        result
    }

    fn try_resume(
        &self,
        session_id: &str,
        plan: &RecoveryPlan,
        result: &mut SessionResumeResult,
    ) -> Result<SessionStatusRecord> {
        let strategy = plan.resumption_strategy;
        let checkpoint = match (&plan.optimal_checkpoint_id, strategy) {
            (
                Some(checkpoint_id),
                ResumptionStrategy::FromLastCheckpoint | ResumptionStrategy::FromVenueStart,
            ) => Some(
                self.checkpoint_manager
                    .load_checkpoint(session_id, checkpoint_id)
                    .ok_or_else(|| StateError::CheckpointNotFound {
                        session_id: session_id.to_string(),
                        checkpoint_id: checkpoint_id.clone(),
                    })?,
            ),
            _ => None,
        };

        let snapshot = self.with_session_mut(session_id, |session| {
            match strategy {
                ResumptionStrategy::FromLastCheckpoint => {
                    let checkpoint = checkpoint.as_ref().ok_or_else(|| {
                        StateError::Recovery("plan names no checkpoint to restore".to_string())
                    })?;
                    session.apply_checkpoint(checkpoint);
                    result.checkpoints_recovered = 1;
                    result.papers_recovered = checkpoint.papers_collected;
                    result.venues_recovered = checkpoint.touched_venue_count() as u64;
                }
                ResumptionStrategy::FromVenueStart => {
                    let mut papers_by_venue = PapersByVenue::new();
                    if let Some(checkpoint) = &checkpoint {
                        session.apply_checkpoint(checkpoint);
                        result.checkpoints_recovered = 1;
                        papers_by_venue = checkpoint.papers_by_venue.clone();
                    }
                    let discarded: u64 = plan
                        .venues_to_restart
                        .iter()
                        .map(|cell| take_cell_papers(&mut papers_by_venue, cell))
                        .sum();
                    move_cells(session, &plan.venues_to_restart, SessionProgressList::NotStarted);
                    session.total_papers_collected =
                        session.total_papers_collected.saturating_sub(discarded);
                    self.checkpoint_restored(
                        session,
                        CheckpointType::BatchCompleted,
                        format!("restarted {} venue(s) from scratch", plan.venues_to_restart.len()),
                        papers_by_venue,
                    )?;
                    result.papers_recovered = session.total_papers_collected;
                    result.venues_recovered = plan.venues_to_restart.len() as u64;
                }
                ResumptionStrategy::PartialRestart => {
                    move_cells(session, &plan.venues_to_resume, SessionProgressList::InProgress);
                    result.venues_recovered = plan.venues_to_resume.len() as u64;
                }
                ResumptionStrategy::FullRestart => {
                    session.venues_completed.clear();
                    session.venues_in_progress.clear();
                    session.venues_not_started = session.venue_grid();
                    session.total_papers_collected = 0;
                    self.checkpoint_restored(
                        session,
                        CheckpointType::SessionStarted,
                        "session restarted",
                        PapersByVenue::new(),
                    )?;
                }
            }
            session.status = SessionStatus::Active;
            session.last_activity_time = Utc::now();
            Ok(session.status_record())
        })?;

        result.data_files_recovered = count_files(&self.config.session_dir(session_id).join("venues"));
        result.step_ok(format!("Applied {} plan", strategy));
        Ok(snapshot)
    }

    /// Write a checkpoint matching a restored session and point the session at it
    fn checkpoint_restored(
        &self,
        session: &mut CollectionSession,
        checkpoint_type: CheckpointType,
        operation: impl Into<String>,
        papers_by_venue: PapersByVenue,
    ) -> Result<()> {
        let progress = CheckpointProgress::new(checkpoint_type, operation)
            .with_venues(
                session.venues_completed.clone(),
                session.venues_in_progress.clone(),
                session.venues_not_started.clone(),
            )
            .with_papers(session.total_papers_collected, papers_by_venue);
        let checkpoint = self
            .checkpoint_manager
            .create_checkpoint_data(&session.session_id, progress)
            .ok_or_else(|| {
                StateError::Persistence(format!(
                    "checkpoint for restored session {} not written",
                    session.session_id
                ))
            })?;
        session.last_checkpoint_id = Some(checkpoint.checkpoint_id);
        session.checkpoint_count += 1;
        Ok(())
    }

    // ========================================================================
    // Consistency
    // ========================================================================

    /// Internal consistency checks over a session's progress lists
    pub fn validate_session_state(&self, session: &CollectionSession) -> Vec<ValidationResult> {
        let mut checks = Vec::new();

        let overlapping = session.overlapping_cells();
        checks.push(if overlapping.is_empty() {
            ValidationResult::pass("venue_partition", 1.0, "Progress lists are disjoint")
        } else {
            ValidationResult::fail(
                "venue_partition",
                0.95,
                format!("Cells in more than one progress list: {}", join_cells(&overlapping)),
            )
        });

        let outside = session.cells_outside_grid();
        checks.push(if outside.is_empty() {
            ValidationResult::pass("venue_grid_membership", 1.0, "All cells belong to the target grid")
        } else {
            ValidationResult::fail(
                "venue_grid_membership",
                0.9,
                format!("Cells outside the target grid: {}", join_cells(&outside)),
            )
        });

        checks.push(self.check_paper_count(session));
        checks
    }

    fn check_paper_count(&self, session: &CollectionSession) -> ValidationResult {
        const CHECK: &str = "paper_count_plausibility";

        if session.total_papers_collected > 0
            && session.venues_completed.is_empty()
            && session.venues_in_progress.is_empty()
        {
            return ValidationResult::fail(
                CHECK,
                0.8,
                format!(
                    "{} papers recorded but no venue has progress",
                    session.total_papers_collected
                ),
            );
        }

        let checkpoint = session
            .last_checkpoint_id
            .as_deref()
            .and_then(|id| self.checkpoint_manager.load_checkpoint(&session.session_id, id));
        match checkpoint {
            Some(checkpoint) if checkpoint.papers_collected > session.total_papers_collected => {
                ValidationResult::fail(
                    CHECK,
                    0.7,
                    format!(
                        "Session reports {} papers, fewer than the {} in checkpoint {}",
                        session.total_papers_collected,
                        checkpoint.papers_collected,
                        checkpoint.checkpoint_id
                    ),
                )
            }
            Some(_) => ValidationResult::pass(CHECK, 0.9, "Paper count matches the last checkpoint"),
            None => ValidationResult::pass(CHECK, 0.6, "No readable checkpoint to compare against"),
        }
    }
}

fn join_cells(cells: &[VenueYear]) -> String {
    cells
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use tempfile::TempDir;

    fn manager(dir: &TempDir) -> StateManager {
        StateManager::new(StateConfig::with_state_dir(dir.path()))
    }

    fn venues() -> Vec<VenueConfig> {
        vec![VenueConfig::new("CVPR", vec![]), VenueConfig::new("ICLR", vec![])]
    }

    fn years() -> BTreeSet<i32> {
        BTreeSet::from([2023, 2024])
    }

    fn create(manager: &StateManager, id: &str) -> String {
        manager
            .create_session(venues(), years(), BTreeMap::new(), Some(id.to_string()))
            .expect("session created")
    }

    fn batch_progress() -> CheckpointProgress {
        let mut by_venue = PapersByVenue::new();
        by_venue.insert("CVPR".to_string(), BTreeMap::from([(2023, 80)]));
        by_venue.insert("ICLR".to_string(), BTreeMap::from([(2024, 20)]));
        CheckpointProgress::new(CheckpointType::BatchCompleted, "ICLR 2024 batch 1")
            .with_venues(
                vec![VenueYear::new("CVPR", 2023)],
                vec![VenueYear::new("ICLR", 2024)],
                vec![VenueYear::new("CVPR", 2024), VenueYear::new("ICLR", 2023)],
            )
            .with_papers(100, by_venue)
    }

    #[test]
    fn test_create_session_layout() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_layout");

        let session_dir = manager.config().session_dir(&id);
        for sub in SESSION_SUBDIRS {
            assert!(session_dir.join(sub).is_dir(), "missing {}", sub);
        }
        assert!(session_dir.join(SESSION_CONFIG_FILE).is_file());
        assert!(session_dir.join(SESSION_STATUS_FILE).is_file());

        let initial = manager.load_latest_checkpoint(&id).expect("initial checkpoint");
        assert_eq!(initial.checkpoint_type, CheckpointType::SessionStarted);
        assert_eq!(initial.venues_not_started.len(), 4);

        let session = manager.get_session_status(&id).expect("session");
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.checkpoint_count, 1);
        assert_eq!(session.last_checkpoint_id, Some(initial.checkpoint_id));
    }

    #[test]
    fn test_generated_session_id() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = manager
            .create_session(venues(), years(), BTreeMap::new(), None)
            .expect("session created");
        assert!(id.starts_with("session_"));
        assert_eq!(manager.list_sessions(), vec![id]);
    }

    #[test]
    fn test_duplicate_session_id_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        create(&manager, "session_dup");

        let err = manager
            .create_session(venues(), years(), BTreeMap::new(), Some("session_dup".to_string()))
            .expect_err("duplicate rejected");
        assert!(matches!(err, StateError::SessionExists(id) if id == "session_dup"));

        // A fresh manager over the same directory sees the on-disk session
        let other = StateManager::new(manager.config().clone());
        assert!(other
            .create_session(venues(), years(), BTreeMap::new(), Some("session_dup".to_string()))
            .is_err());
    }

    #[test]
    fn test_invalid_session_id_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let err = manager
            .create_session(venues(), years(), BTreeMap::new(), Some("../escape".to_string()))
            .expect_err("rejected");
        assert!(matches!(err, StateError::Validation(_)));
    }

    #[test]
    fn test_concurrent_create_sessions() {
        let dir = TempDir::new().expect("tempdir");
        let manager = Arc::new(manager(&dir));

        let mut handles = Vec::new();
        for i in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                manager.create_session(venues(), years(), BTreeMap::new(), Some(format!("session_{}", i)))
            }));
        }
        for _ in 0..2 {
            let manager = Arc::clone(&manager);
            handles.push(thread::spawn(move || {
                manager.create_session(venues(), years(), BTreeMap::new(), Some("session_shared".to_string()))
            }));
        }

        let results: Vec<_> = handles
            .into_iter()
            .map(|h| h.join().expect("thread finished"))
            .collect();
        assert!(results[..8].iter().all(|r| r.is_ok()));

        let shared_errors = results[8..]
            .iter()
            .filter(|r| matches!(r, Err(StateError::SessionExists(_))))
            .count();
        assert_eq!(shared_errors, 1);
        assert_eq!(manager.list_sessions().len(), 9);
    }

    #[test]
    fn test_failed_create_removes_partial_session() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let session_dir = manager.config().session_dir("session_partial");
        // A directory where the status file belongs makes the last write fail
        std::fs::create_dir_all(session_dir.join(SESSION_STATUS_FILE)).expect("blocker");

        let err = manager
            .create_session(venues(), years(), BTreeMap::new(), Some("session_partial".to_string()))
            .expect_err("status write fails");
        assert!(matches!(err, StateError::Persistence(_)));
        assert!(!session_dir.exists());
        assert!(manager.list_sessions().is_empty());

        // The id is free again
        create(&manager, "session_partial");
        assert_eq!(manager.list_sessions(), vec!["session_partial".to_string()]);
    }

    #[test]
    fn test_save_checkpoint_updates_session() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_save");

        let checkpoint_id = manager.save_checkpoint(&id, batch_progress()).expect("saved");
        let session = manager.get_session_status(&id).expect("session");
        assert_eq!(session.total_papers_collected, 100);
        assert_eq!(session.checkpoint_count, 2);
        assert_eq!(session.last_checkpoint_id.as_deref(), Some(checkpoint_id.as_str()));
        assert_eq!(session.venues_completed, vec![VenueYear::new("CVPR", 2023)]);

        // Persisted: a new manager reads the same progress from disk
        let reloaded = StateManager::new(manager.config().clone())
            .get_session_status(&id)
            .expect("reloaded");
        assert_eq!(reloaded.total_papers_collected, 100);
        assert_eq!(reloaded.venues_in_progress, vec![VenueYear::new("ICLR", 2024)]);
    }

    #[test]
    fn test_save_checkpoint_unknown_session() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        assert!(manager.save_checkpoint("missing", batch_progress()).is_none());
        assert!(manager.checkpoint_manager().list_checkpoints("missing").is_empty());
    }

    #[test]
    fn test_recovery_plan_prefers_fresh_checkpoint() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_plan");
        let checkpoint_id = manager.save_checkpoint(&id, batch_progress()).expect("saved");

        let plan = manager.get_recovery_plan(&id).expect("plan");
        assert_eq!(plan.resumption_strategy, ResumptionStrategy::FromLastCheckpoint);
        assert_eq!(plan.optimal_checkpoint_id, Some(checkpoint_id));
        assert!(plan.confidence_score > 0.9);
        assert!(manager.get_recovery_plan("missing").is_none());
    }

    #[test]
    fn test_resume_from_last_checkpoint() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_resume");
        manager.save_checkpoint(&id, batch_progress()).expect("saved");
        assert!(manager.update_session_status(&id, SessionStatus::Interrupted));

        let plan = manager.get_recovery_plan(&id).expect("plan");
        let result = manager.resume_session(&id, &plan);
        assert!(result.success);
        assert!(result.ready_for_continuation);
        assert_eq!(result.papers_recovered, 100);
        assert_eq!(result.venues_recovered, 2);

        let snapshot = result.session_snapshot.expect("snapshot");
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert_eq!(
            manager.get_session_status(&id).expect("session").status,
            SessionStatus::Active
        );
    }

    #[test]
    fn test_resume_from_venue_start_resets_in_progress() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_venue_start");
        manager.save_checkpoint(&id, batch_progress()).expect("saved");

        let mut plan = manager.get_recovery_plan(&id).expect("plan");
        plan.resumption_strategy = ResumptionStrategy::FromVenueStart;
        plan.venues_to_restart = vec![VenueYear::new("ICLR", 2024)];

        let result = manager.resume_session(&id, &plan);
        assert!(result.success);
        let session = manager.get_session_status(&id).expect("session");
        assert!(session.venues_in_progress.is_empty());
        assert!(session.venues_not_started.contains(&VenueYear::new("ICLR", 2024)));
        assert_eq!(session.total_papers_collected, 80);
        assert!(session.overlapping_cells().is_empty());

        // The restored state is checkpointed and the session points at it
        let latest = manager.load_latest_checkpoint(&id).expect("latest");
        assert_eq!(session.last_checkpoint_id.as_deref(), Some(latest.checkpoint_id.as_str()));
        assert_eq!(session.checkpoint_count, 3);
        assert_eq!(latest.papers_collected, 80);
        assert_eq!(latest.papers_for(&VenueYear::new("ICLR", 2024)), 0);
        assert!(latest.is_count_consistent(0.0));
        assert!(manager.validate_session_state(&session).iter().all(|c| c.passed));
    }

    #[test]
    fn test_full_restart_resets_progress() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_full");
        manager.save_checkpoint(&id, batch_progress()).expect("saved");

        let mut plan = manager.get_recovery_plan(&id).expect("plan");
        plan.resumption_strategy = ResumptionStrategy::FullRestart;
        plan.optimal_checkpoint_id = None;

        let result = manager.resume_session(&id, &plan);
        assert!(result.success);
        let session = manager.get_session_status(&id).expect("session");
        assert_eq!(session.total_papers_collected, 0);
        assert!(session.venues_completed.is_empty());
        assert_eq!(session.venues_not_started, session.venue_grid());

        // Discarded progress does not come back through the old batch checkpoint
        let latest = manager.load_latest_checkpoint(&id).expect("latest");
        assert_eq!(latest.papers_collected, 0);
        assert_eq!(session.last_checkpoint_id, Some(latest.checkpoint_id.clone()));
        let next = manager.get_recovery_plan(&id).expect("plan");
        assert_eq!(next.optimal_checkpoint_id, Some(latest.checkpoint_id));
        assert!(next.venues_to_skip.is_empty());
    }

    #[test]
    fn test_resume_with_missing_checkpoint_fails() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_missing_cp");

        let mut plan = manager.get_recovery_plan(&id).expect("plan");
        plan.resumption_strategy = ResumptionStrategy::FromLastCheckpoint;
        plan.optimal_checkpoint_id = Some("checkpoint_nope".to_string());

        let result = manager.resume_session(&id, &plan);
        assert!(!result.success);
        assert_eq!(result.recovery_steps_failed, vec!["Session restoration"]);
        assert!(result.resume_errors[0].contains("checkpoint_nope"));
    }

    #[test]
    fn test_validate_session_state() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let id = create(&manager, "session_validate");
        manager.save_checkpoint(&id, batch_progress()).expect("saved");

        let session = manager.get_session_status(&id).expect("session");
        let checks = manager.validate_session_state(&session);
        assert_eq!(checks.len(), 3);
        assert!(checks.iter().all(|c| c.passed), "{:?}", checks);

        let mut broken = session.clone();
        broken.venues_not_started.push(VenueYear::new("CVPR", 2023));
        broken.venues_in_progress.push(VenueYear::new("NeurIPS", 2023));
        broken.total_papers_collected = 50;
        let failed: Vec<String> = manager
            .validate_session_state(&broken)
            .into_iter()
            .filter(|c| !c.passed)
            .map(|c| c.check_name)
            .collect();
        assert_eq!(
            failed,
            vec!["venue_partition", "venue_grid_membership", "paper_count_plausibility"]
        );
    }

    #[test]
    fn test_cleanup_old_sessions() {
        let dir = TempDir::new().expect("tempdir");
        let manager = manager(&dir);
        let old = create(&manager, "session_old");
        let fresh = create(&manager, "session_fresh");

        manager
            .with_session_mut(&old, |session| {
                session.last_activity_time = Utc::now() - Duration::days(40);
                Ok(())
            })
            .expect("backdated");

        assert_eq!(manager.cleanup_old_sessions(30), 1);
        assert_eq!(manager.list_sessions(), vec![fresh]);
        assert!(!manager.config().session_dir(&old).exists());
        assert!(manager.get_session_status(&old).is_none());
    }
}
