//! Interruption analysis and recovery planning.
//!
//! [`analyze_interruption`] is the only place an [`InterruptionAnalysis`] is
//! built. The state manager calls it for plans and the recovery engine reaches
//! it through the state manager, so both always see the same diagnosis.

use crate::checkpoint::{CheckpointData, ErrorContext, VenueYear};
use crate::config::StateConfig;
use crate::recovery::{
    CauseType, InterruptionAnalysis, InterruptionCause, InterruptionType, RecoveryComplexity,
    RecoveryPlan, ResumptionStrategy, RiskLevel,
};
use crate::session::{CollectionSession, SessionStatus};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;

/// Integrity a checkpoint needs before it is restored directly
const RESTORE_INTEGRITY: f64 = 0.8;
/// More in-progress venues than this makes a recovery complex
const COMPLEX_IN_PROGRESS: usize = 3;

// ============================================================================
// Classification
// ============================================================================

/// Classify an interruption from the last recorded error type, falling back
/// to the time elapsed since the session was last active.
pub fn detect_interruption_type(last_error_type: Option<&str>, elapsed: Duration) -> InterruptionType {
    if let Some(error_type) = last_error_type {
        let error_type = error_type.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| error_type.contains(n));

        return if has(&["api", "timeout"]) {
            InterruptionType::ApiFailure
        } else if has(&["network", "connection"]) {
            InterruptionType::NetworkInterruption
        } else if has(&["disk", "space"]) {
            InterruptionType::DiskSpaceExhaustion
        } else if has(&["memory"]) {
            InterruptionType::MemoryExhaustion
        } else {
            InterruptionType::ComponentCrash
        };
    }

    if elapsed > Duration::hours(1) {
        InterruptionType::ProcessTermination
    } else if elapsed > Duration::minutes(10) {
        InterruptionType::ComponentCrash
    } else {
        InterruptionType::ApiFailure
    }
}

fn implications(cause: CauseType) -> Vec<String> {
    let lines: &[&str] = match cause {
        CauseType::ApiFailure => &[
            "Check API health before resuming",
            "In-flight requests for in-progress venues must be repeated",
        ],
        CauseType::NetworkFailure => &["Verify connectivity before resuming"],
        CauseType::DiskFull => &[
            "Free disk space before resuming",
            "The newest checkpoint may be incomplete",
        ],
        CauseType::MemoryError => &["Reduce batch size before resuming"],
        CauseType::SystemCrash => &["Partial batches for in-progress venues may be lost"],
        CauseType::ProcessKilled => &["Work after the last checkpoint is lost"],
        CauseType::Unknown => &[],
    };
    lines.iter().map(|s| s.to_string()).collect()
}

fn interruption_cause(
    kind: InterruptionType,
    error: Option<&ErrorContext>,
    elapsed: Duration,
) -> InterruptionCause {
    let cause_type = kind.cause_type();
    let (confidence, evidence) = match error {
        Some(ctx) => {
            let mut evidence = vec![format!("Error checkpoint: {}: {}", ctx.error_type, ctx.error_message)];
            if let Some(api) = &ctx.api_context {
                evidence.push(format!("Failing API: {}", api));
            }
            if let (Some(venue), Some(year)) = (&ctx.venue_context, ctx.year_context) {
                evidence.push(format!("Collecting {}:{}", venue, year));
            }
            (0.9, evidence)
        }
        None => {
            let confidence = match kind {
                InterruptionType::ProcessTermination => 0.6,
                _ => 0.5,
            };
            (
                confidence,
                vec![format!("No error recorded; inactive for {} minutes", elapsed.num_minutes())],
            )
        }
    };

    InterruptionCause {
        cause_type,
        confidence,
        evidence,
        recovery_implications: implications(cause_type),
    }
}

// ============================================================================
// Analysis
// ============================================================================

/// Build the interruption analysis for a session from its listed checkpoints.
///
/// `checkpoints` must be ordered oldest first with `validation_status` set, as
/// returned by `CheckpointManager::list_checkpoints`.
pub fn analyze_interruption(
    session: &CollectionSession,
    checkpoints: &[CheckpointData],
    config: &StateConfig,
    now: DateTime<Utc>,
) -> InterruptionAnalysis {
    let latest_valid = checkpoints.iter().rev().find(|c| c.is_valid());
    let elapsed = now - session.last_activity_time;

    let error = latest_valid.and_then(|c| c.error_context.as_ref());
    let interruption_type = detect_interruption_type(error.map(|e| e.error_type.as_str()), elapsed);
    let interruption_cause = interruption_cause(interruption_type, error, elapsed);

    let (completed, in_progress, not_started, mut unknown) = match latest_valid {
        Some(checkpoint) => (
            checkpoint.venues_completed.clone(),
            checkpoint.venues_in_progress.clone(),
            checkpoint.venues_not_started.clone(),
            Vec::new(),
        ),
        // Without a trustworthy checkpoint, completion claims cannot be confirmed
        None => (
            Vec::new(),
            session.venues_in_progress.clone(),
            session.venues_not_started.clone(),
            session.venues_completed.clone(),
        ),
    };

    let grid = session.venue_grid();
    let known: HashSet<&VenueYear> = completed
        .iter()
        .chain(&in_progress)
        .chain(&not_started)
        .chain(&unknown)
        .collect();
    let untracked: Vec<VenueYear> = grid.iter().filter(|c| !known.contains(c)).cloned().collect();
    unknown.extend(untracked);

    let valid_checkpoints: Vec<String> = checkpoints
        .iter()
        .filter(|c| c.is_valid())
        .map(|c| c.checkpoint_id.clone())
        .collect();
    let corrupted_checkpoints: Vec<String> = checkpoints
        .iter()
        .filter(|c| !c.is_valid())
        .map(|c| c.checkpoint_id.clone())
        .collect();
    let missing_checkpoints: Vec<String> = session
        .last_checkpoint_id
        .iter()
        .filter(|id| !checkpoints.iter().any(|c| &c.checkpoint_id == *id))
        .cloned()
        .collect();

    let latest_integrity_score = latest_valid
        .map(|c| c.assess(&session.session_id, config.papers_count_tolerance).integrity_score)
        .unwrap_or(0.0);

    let mut blocking_issues = Vec::new();
    if session.status == SessionStatus::Completed {
        blocking_issues.push("Session already completed".to_string());
    }
    if grid.is_empty() {
        blocking_issues.push("Session has no target venues".to_string());
    }

    let recovery_complexity = if latest_valid.is_none() {
        RecoveryComplexity::Problematic
    } else if !corrupted_checkpoints.is_empty()
        || !missing_checkpoints.is_empty()
        || in_progress.len() > COMPLEX_IN_PROGRESS
    {
        RecoveryComplexity::Complex
    } else if in_progress.is_empty() && unknown.is_empty() {
        RecoveryComplexity::Trivial
    } else {
        RecoveryComplexity::Simple
    };

    let estimated_papers_collected = latest_valid
        .map(|c| c.papers_collected)
        .unwrap_or(session.total_papers_collected);
    let estimated_papers_lost = session
        .total_papers_collected
        .saturating_sub(estimated_papers_collected);
    let papers_in_progress = latest_valid
        .map(|c| in_progress.iter().map(|cell| c.papers_for(cell)).sum::<u64>())
        .unwrap_or(0);

    InterruptionAnalysis {
        session_id: session.session_id.clone(),
        interruption_time: session.last_activity_time,
        analysis_time: now,
        last_checkpoint_time: latest_valid.map(|c| c.timestamp),
        last_successful_operation: latest_valid.map(|c| c.last_successful_operation.clone()),
        interruption_type,
        venues_definitely_completed: completed,
        venues_possibly_incomplete: in_progress,
        venues_unknown_status: unknown,
        venues_not_started: not_started,
        corrupted_checkpoints,
        missing_checkpoints,
        valid_checkpoints,
        latest_valid_checkpoint: latest_valid.map(|c| c.checkpoint_id.clone()),
        latest_integrity_score,
        recovery_complexity,
        blocking_issues,
        estimated_papers_collected,
        estimated_papers_lost,
        papers_in_progress,
        interruption_cause,
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Turns an interruption analysis into a recovery plan
pub trait RecoveryPlanner: Send + Sync {
    fn plan(&self, analysis: &InterruptionAnalysis, config: &StateConfig) -> RecoveryPlan;
}

/// Default planner: restore the newest trustworthy checkpoint and degrade
/// toward restarting venues as checkpoint quality drops.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointPlanner;

impl CheckpointPlanner {
    /// 1.0 for checkpoints up to an hour old, falling linearly to 0.7 at the
    /// recency threshold, 0.6 beyond it.
    fn recency_factor(age_hours: f64, recent_hours: f64) -> f64 {
        if age_hours <= 1.0 {
            1.0
        } else if age_hours <= recent_hours {
            let span = (recent_hours - 1.0).max(f64::EPSILON);
            1.0 - 0.3 * (age_hours - 1.0) / span
        } else {
            0.6
        }
    }

    fn validation_steps(analysis: &InterruptionAnalysis, strategy: ResumptionStrategy) -> Vec<String> {
        let mut steps = Vec::new();
        if !analysis.corrupted_checkpoints.is_empty() {
            steps.push(format!(
                "Inspect {} corrupted checkpoint(s)",
                analysis.corrupted_checkpoints.len()
            ));
        }
        if !analysis.missing_checkpoints.is_empty() {
            steps.push("Confirm the session's last checkpoint was not deleted".to_string());
        }
        if !analysis.venues_unknown_status.is_empty() {
            steps.push("Verify paper counts for venues with unknown status".to_string());
        }
        match analysis.interruption_cause.cause_type {
            CauseType::ApiFailure | CauseType::NetworkFailure => {
                steps.push("Check API health before resuming".to_string())
            }
            CauseType::DiskFull => steps.push("Check free disk space".to_string()),
            _ => {}
        }
        if strategy == ResumptionStrategy::FullRestart {
            steps.push("Archive existing output before restarting".to_string());
        }
        steps
    }
}

impl RecoveryPlanner for CheckpointPlanner {
    fn plan(&self, analysis: &InterruptionAnalysis, config: &StateConfig) -> RecoveryPlan {
        let age = analysis.checkpoint_age_hours();
        let recency = Self::recency_factor(age, config.recent_checkpoint_hours);
        let integrity = analysis.latest_integrity_score;
        let corruption_factor = if analysis.corrupted_checkpoints.is_empty() { 1.0 } else { 0.9 };

        let completed = analysis.venues_definitely_completed.clone();
        let in_progress = analysis.venues_possibly_incomplete.clone();
        let unknown = analysis.venues_unknown_status.clone();

        let mut plan = RecoveryPlan {
            session_id: analysis.session_id.clone(),
            resumption_strategy: ResumptionStrategy::FullRestart,
            optimal_checkpoint_id: None,
            venues_to_skip: Vec::new(),
            venues_to_resume: Vec::new(),
            venues_to_restart: Vec::new(),
            venues_to_validate: Vec::new(),
            estimated_recovery_time_minutes: 0.5,
            estimated_papers_to_recover: 0,
            data_loss_estimate: 0,
            confidence_score: 0.0,
            recommended_validation_steps: Vec::new(),
            risk_assessment: RiskLevel::High,
        };

        match &analysis.latest_valid_checkpoint {
            Some(id) if age <= config.recent_checkpoint_hours && integrity >= RESTORE_INTEGRITY => {
                plan.resumption_strategy = ResumptionStrategy::FromLastCheckpoint;
                plan.optimal_checkpoint_id = Some(id.clone());
                plan.estimated_recovery_time_minutes =
                    0.5 + 0.25 * in_progress.len() as f64 + 0.1 * unknown.len() as f64;
                plan.venues_to_skip = completed;
                plan.venues_to_resume = in_progress;
                plan.venues_to_validate = unknown;
                plan.estimated_papers_to_recover = analysis.estimated_papers_collected;
                plan.data_loss_estimate = analysis.estimated_papers_lost;
                plan.confidence_score = integrity * recency * 0.95 * corruption_factor;
                plan.risk_assessment = if analysis.recovery_complexity <= RecoveryComplexity::Simple {
                    RiskLevel::Low
                } else {
                    RiskLevel::Medium
                };
            }
            Some(id) => {
                plan.resumption_strategy = ResumptionStrategy::FromVenueStart;
                plan.optimal_checkpoint_id = Some(id.clone());
                plan.estimated_recovery_time_minutes =
                    0.5 + 0.4 * in_progress.len() as f64 + 0.1 * unknown.len() as f64;
                plan.venues_to_skip = completed;
                plan.venues_to_restart = in_progress;
                plan.venues_to_validate = unknown;
                plan.estimated_papers_to_recover = analysis
                    .estimated_papers_collected
                    .saturating_sub(analysis.papers_in_progress);
                plan.data_loss_estimate = analysis.estimated_papers_lost + analysis.papers_in_progress;
                plan.confidence_score = integrity * recency * 0.85 * corruption_factor;
                plan.risk_assessment = RiskLevel::Medium;
            }
            None if !in_progress.is_empty() || !unknown.is_empty() => {
                plan.resumption_strategy = ResumptionStrategy::PartialRestart;
                plan.estimated_recovery_time_minutes =
                    1.0 + 0.3 * in_progress.len() as f64 + 0.1 * unknown.len() as f64;
                plan.venues_to_resume = in_progress;
                plan.venues_to_validate = unknown;
                plan.data_loss_estimate = analysis.estimated_papers_collected;
                plan.confidence_score = 0.55;
                plan.risk_assessment = RiskLevel::High;
            }
            None => {
                let cells = analysis.venues_not_started.len() + unknown.len();
                plan.estimated_recovery_time_minutes = 0.5 + 0.05 * cells as f64;
                plan.venues_to_restart = analysis
                    .venues_not_started
                    .iter()
                    .chain(&unknown)
                    .cloned()
                    .collect();
                plan.data_loss_estimate = analysis.estimated_papers_collected;
                plan.confidence_score = 0.6;
            }
        }

        plan.confidence_score = plan.confidence_score.clamp(0.0, 1.0);
        plan.recommended_validation_steps = Self::validation_steps(analysis, plan.resumption_strategy);
        plan
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointProgress, CheckpointType, PapersByVenue, ValidationStatus};
    use crate::session::VenueConfig;
    use std::collections::{BTreeMap, BTreeSet};

    fn session() -> CollectionSession {
        CollectionSession::new(
            "session_a",
            vec![VenueConfig::new("CVPR", vec![]), VenueConfig::new("ICLR", vec![])],
            BTreeSet::from([2023, 2024]),
            BTreeMap::new(),
        )
    }

    fn checkpoint(id: &str, at: DateTime<Utc>, status: ValidationStatus) -> CheckpointData {
        let mut by_venue = PapersByVenue::new();
        by_venue.insert("CVPR".to_string(), BTreeMap::from([(2023, 80)]));
        by_venue.insert("ICLR".to_string(), BTreeMap::from([(2024, 20)]));
        let progress = CheckpointProgress::new(CheckpointType::BatchCompleted, "batch 4")
            .with_venues(
                vec![VenueYear::new("CVPR", 2023)],
                vec![VenueYear::new("ICLR", 2024)],
                vec![VenueYear::new("CVPR", 2024), VenueYear::new("ICLR", 2023)],
            )
            .with_papers(100, by_venue);
        let mut checkpoint = CheckpointData::new(id, "session_a", at, progress);
        checkpoint.validation_status = Some(status);
        checkpoint
    }

    fn config() -> StateConfig {
        StateConfig::with_state_dir("/tmp/unused")
    }

    #[test]
    fn test_detect_from_error_type() {
        let none = Duration::zero();
        assert_eq!(detect_interruption_type(Some("api_timeout"), none), InterruptionType::ApiFailure);
        assert_eq!(detect_interruption_type(Some("Timeout"), none), InterruptionType::ApiFailure);
        assert_eq!(
            detect_interruption_type(Some("connection_reset"), none),
            InterruptionType::NetworkInterruption
        );
        assert_eq!(
            detect_interruption_type(Some("no_space_left"), none),
            InterruptionType::DiskSpaceExhaustion
        );
        assert_eq!(
            detect_interruption_type(Some("out_of_memory"), none),
            InterruptionType::MemoryExhaustion
        );
        assert_eq!(detect_interruption_type(Some("panic"), none), InterruptionType::ComponentCrash);
    }

    #[test]
    fn test_detect_from_elapsed_time() {
        assert_eq!(
            detect_interruption_type(None, Duration::hours(2)),
            InterruptionType::ProcessTermination
        );
        assert_eq!(
            detect_interruption_type(None, Duration::minutes(30)),
            InterruptionType::ComponentCrash
        );
        assert_eq!(detect_interruption_type(None, Duration::minutes(2)), InterruptionType::ApiFailure);
    }

    #[test]
    fn test_fresh_checkpoint_restores_directly() {
        let now = Utc::now();
        let mut session = session();
        session.total_papers_collected = 100;
        let checkpoints = vec![checkpoint("cp1", now, ValidationStatus::Valid)];

        let analysis = analyze_interruption(&session, &checkpoints, &config(), now);
        assert_eq!(analysis.latest_valid_checkpoint.as_deref(), Some("cp1"));
        assert_eq!(analysis.venues_definitely_completed, vec![VenueYear::new("CVPR", 2023)]);
        assert_eq!(analysis.papers_in_progress, 20);
        assert_eq!(analysis.recovery_complexity, RecoveryComplexity::Simple);
        assert!(analysis.blocking_issues.is_empty());

        let plan = CheckpointPlanner.plan(&analysis, &config());
        assert_eq!(plan.resumption_strategy, ResumptionStrategy::FromLastCheckpoint);
        assert_eq!(plan.optimal_checkpoint_id.as_deref(), Some("cp1"));
        assert_eq!(plan.venues_to_resume, vec![VenueYear::new("ICLR", 2024)]);
        assert_eq!(plan.estimated_papers_to_recover, 100);
        assert!(plan.confidence_score > 0.9);
        assert!(plan.estimated_recovery_time_minutes < 5.0);
    }

    #[test]
    fn test_old_checkpoint_restarts_venues() {
        let then = Utc::now();
        let now = then + Duration::hours(48);
        let checkpoints = vec![checkpoint("cp1", then, ValidationStatus::Valid)];
        let mut session = session();
        session.last_activity_time = then;

        let analysis = analyze_interruption(&session, &checkpoints, &config(), now);
        assert_eq!(analysis.interruption_type, InterruptionType::ProcessTermination);

        let plan = CheckpointPlanner.plan(&analysis, &config());
        assert_eq!(plan.resumption_strategy, ResumptionStrategy::FromVenueStart);
        assert_eq!(plan.venues_to_restart, vec![VenueYear::new("ICLR", 2024)]);
        assert_eq!(plan.estimated_papers_to_recover, 80);
        assert_eq!(plan.data_loss_estimate, 20);
        assert!(plan.confidence_score < 0.6);
    }

    #[test]
    fn test_only_corrupted_checkpoints() {
        let now = Utc::now();
        let mut session = session();
        session.venues_completed = vec![VenueYear::new("CVPR", 2023)];
        session.venues_not_started.retain(|c| c != &VenueYear::new("CVPR", 2023));
        let checkpoints = vec![checkpoint("cp1", now, ValidationStatus::Corrupted)];

        let analysis = analyze_interruption(&session, &checkpoints, &config(), now);
        assert_eq!(analysis.recovery_complexity, RecoveryComplexity::Problematic);
        assert_eq!(analysis.corrupted_checkpoints, vec!["cp1"]);
        assert_eq!(analysis.venues_unknown_status, vec![VenueYear::new("CVPR", 2023)]);
        assert_eq!(analysis.latest_integrity_score, 0.0);

        let plan = CheckpointPlanner.plan(&analysis, &config());
        assert_eq!(plan.resumption_strategy, ResumptionStrategy::PartialRestart);
        assert_eq!(plan.venues_to_validate, vec![VenueYear::new("CVPR", 2023)]);
        assert!(plan.optimal_checkpoint_id.is_none());
    }

    #[test]
    fn test_no_checkpoints_full_restart() {
        let now = Utc::now();
        let analysis = analyze_interruption(&session(), &[], &config(), now);
        let plan = CheckpointPlanner.plan(&analysis, &config());
        assert_eq!(plan.resumption_strategy, ResumptionStrategy::FullRestart);
        assert_eq!(plan.venues_to_restart.len(), 4);
        assert!(plan.confidence_score >= config().min_recovery_confidence);
    }

    #[test]
    fn test_error_checkpoint_drives_classification() {
        let now = Utc::now();
        let progress = CheckpointProgress::new(CheckpointType::ErrorOccurred, "batch 2")
            .with_venues(vec![], vec![VenueYear::new("CVPR", 2023)], vec![])
            .with_error(ErrorContext::new("network_error", "connection refused").on_api("openalex"));
        let mut error_checkpoint = CheckpointData::new("cp_err", "session_a", now, progress);
        error_checkpoint.validation_status = Some(ValidationStatus::Valid);

        let analysis = analyze_interruption(&session(), &[error_checkpoint], &config(), now);
        assert_eq!(analysis.interruption_type, InterruptionType::NetworkInterruption);
        assert_eq!(analysis.interruption_cause.cause_type, CauseType::NetworkFailure);
        assert!(analysis.interruption_cause.confidence > 0.8);
        assert!(analysis.interruption_cause.evidence.iter().any(|e| e.contains("openalex")));
    }

    #[test]
    fn test_completed_session_is_blocked() {
        let now = Utc::now();
        let mut session = session();
        session.status = SessionStatus::Completed;
        let analysis = analyze_interruption(&session, &[], &config(), now);
        assert_eq!(analysis.blocking_issues, vec!["Session already completed"]);
    }

    #[test]
    fn test_time_estimate_scales_with_in_progress_work() {
        let now = Utc::now();
        let checkpoints = vec![checkpoint("cp1", now, ValidationStatus::Valid)];
        let mut analysis = analyze_interruption(&session(), &checkpoints, &config(), now);
        let small = CheckpointPlanner.plan(&analysis, &config()).estimated_recovery_time_minutes;

        analysis
            .venues_possibly_incomplete
            .extend([VenueYear::new("CVPR", 2024), VenueYear::new("ICLR", 2023)]);
        let large = CheckpointPlanner.plan(&analysis, &config()).estimated_recovery_time_minutes;
        assert!(large > small);
    }
}
