//! End-to-end recovery of interrupted sessions.
//!
//! [`InterruptionRecoveryEngine::resume_interrupted_session`] runs a fixed
//! sequence of steps and stops at the first failure. Every outcome, including
//! internal errors, is reported through the returned [`SessionResumeResult`].

use crate::error::{Result, StateError};
use crate::monitoring::ApiHealthMonitor;
use crate::recovery::{
    IntegrityCheckResult, InterruptionAnalysis, RecoveryPlan, ResumptionStrategy,
    SessionResumeResult,
};
use crate::session::SessionStatus;
use crate::state_manager::StateManager;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

/// One step of the recovery sequence, as recorded in the step logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryStep {
    ConcurrencyCheck,
    AttemptLimitCheck,
    InterruptionAnalysis,
    PlanGeneration,
    FeasibilityValidation,
    StrategyExecution(ResumptionStrategy),
    StateConsistencyValidation,
    SessionRestoration,
}

impl fmt::Display for RecoveryStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecoveryStep::ConcurrencyCheck => f.write_str("Concurrency check"),
            RecoveryStep::AttemptLimitCheck => f.write_str("Attempt limit check"),
            RecoveryStep::InterruptionAnalysis => f.write_str("Interruption analysis"),
            RecoveryStep::PlanGeneration => f.write_str("Recovery plan generation"),
            RecoveryStep::FeasibilityValidation => f.write_str("Recovery feasibility validation"),
            RecoveryStep::StrategyExecution(strategy) => write!(f, "Strategy execution: {}", strategy),
            RecoveryStep::StateConsistencyValidation => f.write_str("State consistency validation"),
            RecoveryStep::SessionRestoration => f.write_str("Session restoration"),
        }
    }
}

/// Point-in-time view of a session's recovery bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryStatus {
    pub session_id: String,
    pub in_progress: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<f64>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub can_attempt: bool,
}

/// Orchestrates recovery with a concurrency guard and bounded retries
pub struct InterruptionRecoveryEngine {
    state_manager: Arc<StateManager>,
    health_monitor: Option<Arc<dyn ApiHealthMonitor>>,
    active_recoveries: Mutex<HashMap<String, DateTime<Utc>>>,
    recovery_attempts: Mutex<HashMap<String, u32>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl InterruptionRecoveryEngine {
    pub fn new(state_manager: Arc<StateManager>) -> Self {
        Self {
            state_manager,
            health_monitor: None,
            active_recoveries: Mutex::new(HashMap::new()),
            recovery_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Consult `monitor` after a successful recovery and warn about unusable APIs
    pub fn with_health_monitor(mut self, monitor: Arc<dyn ApiHealthMonitor>) -> Self {
        self.health_monitor = Some(monitor);
        self
    }

    fn timeout_seconds(&self) -> i64 {
        i64::try_from(self.state_manager.config().recovery_timeout_seconds).unwrap_or(i64::MAX)
    }

    fn max_attempts(&self) -> u32 {
        self.state_manager.config().max_recovery_attempts
    }

    /// Recover an interrupted session. Never panics or returns an error; the
    /// result carries the step log, errors and warnings.
    pub fn resume_interrupted_session(&self, session_id: &str) -> SessionResumeResult {
        let mut result = SessionResumeResult::started(session_id);
        info!(session_id, "Starting session recovery");

        let claimed = match self.claim_recovery(session_id) {
            Ok(claimed) => claimed,
            Err(e) => {
                result.step_failed(RecoveryStep::ConcurrencyCheck, e.to_string());
                result.finish();
                return result;
            }
        };
        result.step_ok(RecoveryStep::ConcurrencyCheck);

        match self.record_attempt(session_id) {
            Ok(attempt) => {
                debug!(session_id, attempt, "Recovery attempt recorded");
                result.step_ok(RecoveryStep::AttemptLimitCheck);
                if let Err(e) = self.run_recovery(session_id, &mut result) {
                    error!(session_id, error = %e, "Recovery engine error");
                    result.success = false;
                    result.resume_errors.push(format!("Recovery engine error: {}", e));
                }
            }
            Err(e) => result.step_failed(RecoveryStep::AttemptLimitCheck, e.to_string()),
        }

        self.finish_recovery(session_id, claimed, &mut result);
        result
    }

    /// Mark a recovery as running, replacing a stale marker; returns the claim time
    fn claim_recovery(&self, session_id: &str) -> Result<DateTime<Utc>> {
        let now = Utc::now();
        let mut active = lock(&self.active_recoveries);
        if let Some(started) = active.get(session_id) {
            let elapsed = (now - *started).num_seconds();
            if elapsed < self.timeout_seconds() {
                warn!(session_id, elapsed, "Recovery already in progress");
                return Err(StateError::Recovery(format!(
                    "Recovery already in progress for session {} (started {}s ago)",
                    session_id, elapsed
                )));
            }
            warn!(session_id, elapsed, "Replacing stale recovery marker");
        }
        active.insert(session_id.to_string(), now);
        Ok(now)
    }

    /// Remove the marker set by the claim at `claimed`. A marker that replaced
    /// it after going stale belongs to another run and stays.
    fn release_recovery(&self, session_id: &str, claimed: DateTime<Utc>) -> bool {
        let mut active = lock(&self.active_recoveries);
        if active.get(session_id) == Some(&claimed) {
            active.remove(session_id);
            true
        } else {
            debug!(session_id, "Recovery marker was replaced by a newer run");
            false
        }
    }

    fn record_attempt(&self, session_id: &str) -> Result<u32> {
        let mut attempts = lock(&self.recovery_attempts);
        let count = attempts.entry(session_id.to_string()).or_insert(0);
        *count += 1;
        let max = self.max_attempts();
        if *count > max {
            warn!(session_id, attempts = *count, max, "Recovery attempts exhausted");
            return Err(StateError::Recovery(format!(
                "Maximum recovery attempts exceeded ({} > {})",
                *count, max
            )));
        }
        Ok(*count)
    }

    /// Steps 3 to 8. A failed step is recorded on `result` and ends the run
    /// with `Ok`; `Err` is reserved for unexpected internal errors.
    fn run_recovery(&self, session_id: &str, result: &mut SessionResumeResult) -> Result<()> {
        let analysis = match self.state_manager.build_analysis(session_id) {
            Ok(analysis) => analysis,
            Err(e) => {
                result.step_failed(
                    RecoveryStep::InterruptionAnalysis,
                    format!("Interruption analysis failed: {}", e),
                );
                return Ok(());
            }
        };
        info!(
            session_id,
            interruption_type = ?analysis.interruption_type,
            cause = ?analysis.interruption_cause.cause_type,
            complexity = ?analysis.recovery_complexity,
            "Interruption analysed"
        );
        if !analysis.corrupted_checkpoints.is_empty() {
            result.resume_warnings.push(format!(
                "{} corrupted checkpoint(s) excluded from recovery",
                analysis.corrupted_checkpoints.len()
            ));
        }
        result.step_ok(RecoveryStep::InterruptionAnalysis);

        let plan = self.state_manager.plan_recovery(&analysis);
        result.step_ok(RecoveryStep::PlanGeneration);

        let config = self.state_manager.config();
        let issues = plan.feasibility_issues(
            &analysis,
            config.min_recovery_confidence,
            config.max_recovery_time_minutes,
        );
        if !issues.is_empty() {
            warn!(session_id, issues = ?issues, "Recovery plan rejected");
            result.step_failed(RecoveryStep::FeasibilityValidation, issues.join("; "));
            return Ok(());
        }
        result.step_ok(RecoveryStep::FeasibilityValidation);

        let execution = RecoveryStep::StrategyExecution(plan.resumption_strategy);
        if let Err(e) = self.execute_strategy(session_id, &plan, result) {
            result.step_failed(execution, e.to_string());
            return Ok(());
        }
        result.step_ok(execution);

        let session = self
            .state_manager
            .get_session_status(session_id)
            .ok_or_else(|| StateError::SessionNotFound(session_id.to_string()))?;
        let checks = self.state_manager.validate_session_state(&session);
        let failed: Vec<String> = checks
            .iter()
            .filter(|c| !c.passed)
            .map(|c| format!("{}: {}", c.check_name, c.message))
            .collect();
        result
            .data_integrity_checks
            .extend(checks.into_iter().map(IntegrityCheckResult::from));
        if !failed.is_empty() {
            result.step_failed(RecoveryStep::StateConsistencyValidation, failed.join("; "));
            return Ok(());
        }
        result.state_consistency_validated = true;
        result.step_ok(RecoveryStep::StateConsistencyValidation);

        let restored = self.state_manager.resume_session(session_id, &plan);
        self.merge_restoration(result, restored);
        if result.success {
            self.warn_unhealthy_apis(&analysis, result);
        }
        Ok(())
    }

    fn execute_strategy(
        &self,
        session_id: &str,
        plan: &RecoveryPlan,
        result: &mut SessionResumeResult,
    ) -> Result<()> {
        match plan.resumption_strategy {
            ResumptionStrategy::FromLastCheckpoint => {
                let checkpoint_id = plan.optimal_checkpoint_id.as_deref().ok_or_else(|| {
                    StateError::Recovery("Plan does not name a checkpoint to restore".to_string())
                })?;
                let checkpoint_manager = self.state_manager.checkpoint_manager();

                let validation = checkpoint_manager.validate_checkpoint(session_id, checkpoint_id);
                result.data_integrity_checks.push(IntegrityCheckResult {
                    check_name: "checkpoint_integrity".to_string(),
                    passed: validation.is_valid,
                    confidence: validation.integrity_score,
                    details: if validation.validation_errors.is_empty() {
                        format!("Checkpoint {} validated", checkpoint_id)
                    } else {
                        validation.validation_errors.join("; ")
                    },
                });
                result
                    .resume_warnings
                    .extend(validation.validation_warnings.iter().cloned());
                if !validation.is_valid {
                    return Err(StateError::Integrity(format!(
                        "Checkpoint {} failed validation: {}",
                        checkpoint_id,
                        validation.validation_errors.join("; ")
                    )));
                }

                let checkpoint = checkpoint_manager
                    .load_checkpoint(session_id, checkpoint_id)
                    .ok_or_else(|| StateError::CheckpointNotFound {
                        session_id: session_id.to_string(),
                        checkpoint_id: checkpoint_id.to_string(),
                    })?;
                result.checkpoints_recovered = 1;
                result.papers_recovered = checkpoint.papers_collected;
                result.venues_recovered = checkpoint.touched_venue_count() as u64;
            }
            ResumptionStrategy::FromVenueStart => {
                result.venues_recovered = plan.venues_to_restart.len() as u64;
            }
            ResumptionStrategy::PartialRestart => {
                result.venues_recovered = plan.venues_to_resume.len() as u64;
            }
            ResumptionStrategy::FullRestart => {
                result
                    .resume_warnings
                    .push("Full restart: all collected progress will be redone".to_string());
            }
        }
        Ok(())
    }

    fn merge_restoration(&self, result: &mut SessionResumeResult, restored: SessionResumeResult) {
        result.success = restored.success;
        result.ready_for_continuation = restored.ready_for_continuation;
        result.papers_recovered = result.papers_recovered.max(restored.papers_recovered);
        result.venues_recovered = result.venues_recovered.max(restored.venues_recovered);
        result.checkpoints_recovered = result.checkpoints_recovered.max(restored.checkpoints_recovered);
        result.data_files_recovered = restored.data_files_recovered;
        result.session_snapshot = restored.session_snapshot;
        result.resume_warnings.extend(restored.resume_warnings);

        if restored.success {
            result.step_ok(RecoveryStep::SessionRestoration);
        } else {
            result.recovery_steps_failed.push(RecoveryStep::SessionRestoration.to_string());
            result.resume_errors.extend(restored.resume_errors);
        }
    }

    fn warn_unhealthy_apis(&self, analysis: &InterruptionAnalysis, result: &mut SessionResumeResult) {
        let Some(monitor) = &self.health_monitor else {
            return;
        };
        let Some(checkpoint_id) = &analysis.latest_valid_checkpoint else {
            return;
        };
        let Some(checkpoint) = self
            .state_manager
            .checkpoint_manager()
            .load_checkpoint(&analysis.session_id, checkpoint_id)
        else {
            return;
        };

        for api_name in checkpoint.api_health_status.keys() {
            let health = monitor.get_health_status(api_name);
            if health.status.is_unusable() {
                result.resume_warnings.push(format!(
                    "API {} is {:?} ({} consecutive errors)",
                    api_name, health.status, health.consecutive_errors
                ));
            }
        }
    }

    fn finish_recovery(&self, session_id: &str, claimed: DateTime<Utc>, result: &mut SessionResumeResult) {
        result.finish();

        let budget = self.state_manager.config().recovery_timeout_seconds as f64;
        if result.recovery_duration_seconds > budget {
            warn!(session_id, duration = result.recovery_duration_seconds, "Recovery exceeded time budget");
            result.resume_warnings.push(format!(
                "Recovery took {:.1}s, over the {:.0}s budget",
                result.recovery_duration_seconds, budget
            ));
        }

        self.release_recovery(session_id, claimed);

        if result.success {
            lock(&self.recovery_attempts).insert(session_id.to_string(), 0);
            info!(
                session_id,
                duration = result.recovery_duration_seconds,
                papers = result.papers_recovered,
                "Session recovery succeeded"
            );
        } else {
            if self.state_manager.get_session_status(session_id).is_some() {
                self.state_manager
                    .update_session_status(session_id, SessionStatus::Interrupted);
            }
            warn!(session_id, errors = ?result.resume_errors, "Session recovery failed");
        }
    }

    pub fn get_recovery_status(&self, session_id: &str) -> RecoveryStatus {
        let started_at = lock(&self.active_recoveries).get(session_id).copied();
        let attempts = lock(&self.recovery_attempts)
            .get(session_id)
            .copied()
            .unwrap_or(0);
        let max_attempts = self.max_attempts();
        RecoveryStatus {
            session_id: session_id.to_string(),
            in_progress: started_at.is_some(),
            started_at,
            elapsed_seconds: started_at
                .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0),
            attempts,
            max_attempts,
            can_attempt: started_at.is_none() && attempts < max_attempts,
        }
    }

    /// Clear the in-progress marker; true if one existed.
    ///
    /// A recovery already running on another thread is not interrupted.
    pub fn cancel_recovery(&self, session_id: &str) -> bool {
        let existed = lock(&self.active_recoveries).remove(session_id).is_some();
        if existed {
            info!(session_id, "Recovery marker cleared");
        }
        existed
    }

    #[cfg(test)]
    fn mark_active(&self, session_id: &str, started: DateTime<Utc>) {
        lock(&self.active_recoveries).insert(session_id.to_string(), started);
    }

    #[cfg(test)]
    fn set_attempts(&self, session_id: &str, attempts: u32) {
        lock(&self.recovery_attempts).insert(session_id.to_string(), attempts);
    }
}
