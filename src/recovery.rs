//! Interruption analysis, recovery plan and recovery result types.

use crate::checkpoint::VenueYear;
use crate::session::SessionStatusRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why a session stopped, as classified from its last checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptionType {
    ApiFailure,
    NetworkInterruption,
    DiskSpaceExhaustion,
    MemoryExhaustion,
    ComponentCrash,
    ProcessTermination,
}

impl InterruptionType {
    pub fn cause_type(self) -> CauseType {
        match self {
            InterruptionType::ApiFailure => CauseType::ApiFailure,
            InterruptionType::NetworkInterruption => CauseType::NetworkFailure,
            InterruptionType::DiskSpaceExhaustion => CauseType::DiskFull,
            InterruptionType::MemoryExhaustion => CauseType::MemoryError,
            InterruptionType::ComponentCrash => CauseType::SystemCrash,
            InterruptionType::ProcessTermination => CauseType::ProcessKilled,
        }
    }
}

/// Root-cause category reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseType {
    ProcessKilled,
    SystemCrash,
    NetworkFailure,
    ApiFailure,
    DiskFull,
    MemoryError,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionCause {
    pub cause_type: CauseType,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub evidence: Vec<String>,
    pub recovery_implications: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryComplexity {
    Trivial,
    Simple,
    Complex,
    Problematic,
}

/// Diagnostic record of what stopped a session and what is salvageable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptionAnalysis {
    pub session_id: String,
    /// Last recorded activity of the session
    pub interruption_time: DateTime<Utc>,
    pub analysis_time: DateTime<Utc>,
    pub last_checkpoint_time: Option<DateTime<Utc>>,
    pub last_successful_operation: Option<String>,
    pub interruption_type: InterruptionType,

    pub venues_definitely_completed: Vec<VenueYear>,
    pub venues_possibly_incomplete: Vec<VenueYear>,
    pub venues_unknown_status: Vec<VenueYear>,
    pub venues_not_started: Vec<VenueYear>,

    pub corrupted_checkpoints: Vec<String>,
    pub missing_checkpoints: Vec<String>,
    pub valid_checkpoints: Vec<String>,
    /// Newest checkpoint passing integrity validation
    pub latest_valid_checkpoint: Option<String>,
    /// Integrity score of `latest_valid_checkpoint`, 0.0 when there is none
    pub latest_integrity_score: f64,

    pub recovery_complexity: RecoveryComplexity,
    /// Non-empty means recovery must not proceed
    pub blocking_issues: Vec<String>,
    pub estimated_papers_collected: u64,
    pub estimated_papers_lost: u64,
    /// Papers already collected for venues that were still in progress
    pub papers_in_progress: u64,
    pub interruption_cause: InterruptionCause,
}

impl InterruptionAnalysis {
    /// Hours between the last checkpoint (or last activity) and the analysis
    pub fn checkpoint_age_hours(&self) -> f64 {
        let reference = self.last_checkpoint_time.unwrap_or(self.interruption_time);
        (self.analysis_time - reference).num_seconds().max(0) as f64 / 3600.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumptionStrategy {
    FromLastCheckpoint,
    FromVenueStart,
    PartialRestart,
    FullRestart,
}

impl ResumptionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            ResumptionStrategy::FromLastCheckpoint => "from_last_checkpoint",
            ResumptionStrategy::FromVenueStart => "from_venue_start",
            ResumptionStrategy::PartialRestart => "partial_restart",
            ResumptionStrategy::FullRestart => "full_restart",
        }
    }
}

impl fmt::Display for ResumptionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// How to resume an interrupted session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    pub session_id: String,
    pub resumption_strategy: ResumptionStrategy,
    pub optimal_checkpoint_id: Option<String>,
    pub venues_to_skip: Vec<VenueYear>,
    pub venues_to_resume: Vec<VenueYear>,
    pub venues_to_restart: Vec<VenueYear>,
    pub venues_to_validate: Vec<VenueYear>,
    pub estimated_recovery_time_minutes: f64,
    pub estimated_papers_to_recover: u64,
    /// Papers expected to be collected again
    pub data_loss_estimate: u64,
    /// 0.0 to 1.0
    pub confidence_score: f64,
    pub recommended_validation_steps: Vec<String>,
    pub risk_assessment: RiskLevel,
}

impl RecoveryPlan {
    pub fn recovery_confidence(&self) -> f64 {
        self.confidence_score
    }

    /// Reasons this plan must not be executed; empty when feasible
    pub fn feasibility_issues(
        &self,
        analysis: &InterruptionAnalysis,
        min_confidence: f64,
        max_minutes: f64,
    ) -> Vec<String> {
        let mut issues = Vec::new();
        if self.confidence_score < min_confidence {
            issues.push(format!(
                "Recovery confidence too low: {:.2} < {:.2}",
                self.confidence_score, min_confidence
            ));
        }
        if self.estimated_recovery_time_minutes > max_minutes {
            issues.push(format!(
                "Estimated recovery time too long: {:.1} min > {:.1} min",
                self.estimated_recovery_time_minutes, max_minutes
            ));
        }
        issues.extend(
            analysis
                .blocking_issues
                .iter()
                .map(|issue| format!("Blocking issue: {}", issue)),
        );
        issues
    }
}

/// Outcome of a single integrity or consistency check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub check_name: String,
    pub passed: bool,
    /// 0.0 to 1.0
    pub confidence: f64,
    pub message: String,
}

impl ValidationResult {
    pub fn pass(check_name: &str, confidence: f64, message: impl Into<String>) -> Self {
        Self {
            check_name: check_name.to_string(),
            passed: true,
            confidence,
            message: message.into(),
        }
    }

    pub fn fail(check_name: &str, confidence: f64, message: impl Into<String>) -> Self {
        Self {
            check_name: check_name.to_string(),
            passed: false,
            confidence,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrityCheckResult {
    pub check_name: String,
    pub passed: bool,
    pub confidence: f64,
    pub details: String,
}

impl From<ValidationResult> for IntegrityCheckResult {
    fn from(result: ValidationResult) -> Self {
        Self {
            check_name: result.check_name,
            passed: result.passed,
            confidence: result.confidence,
            details: result.message,
        }
    }
}

/// Outcome of a resume attempt; the single contract handed back to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionResumeResult {
    pub session_id: String,
    pub success: bool,
    pub recovery_start_time: DateTime<Utc>,
    pub recovery_end_time: Option<DateTime<Utc>>,
    pub recovery_duration_seconds: f64,

    pub checkpoints_recovered: u64,
    pub papers_recovered: u64,
    pub venues_recovered: u64,
    pub data_files_recovered: u64,

    pub recovery_steps_executed: Vec<String>,
    pub recovery_steps_failed: Vec<String>,
    pub data_integrity_checks: Vec<IntegrityCheckResult>,
    pub state_consistency_validated: bool,
    pub ready_for_continuation: bool,

    pub resume_errors: Vec<String>,
    pub resume_warnings: Vec<String>,
    pub session_snapshot: Option<SessionStatusRecord>,
}

impl SessionResumeResult {
    /// Empty, unsuccessful result stamped with the current time
    pub fn started(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            success: false,
            recovery_start_time: Utc::now(),
            recovery_end_time: None,
            recovery_duration_seconds: 0.0,
            checkpoints_recovered: 0,
            papers_recovered: 0,
            venues_recovered: 0,
            data_files_recovered: 0,
            recovery_steps_executed: Vec::new(),
            recovery_steps_failed: Vec::new(),
            data_integrity_checks: Vec::new(),
            state_consistency_validated: false,
            ready_for_continuation: false,
            resume_errors: Vec::new(),
            resume_warnings: Vec::new(),
            session_snapshot: None,
        }
    }

    /// Stamp the end time and duration
    pub fn finish(&mut self) {
        let end = Utc::now();
        self.recovery_duration_seconds =
            (end - self.recovery_start_time).num_milliseconds().max(0) as f64 / 1000.0;
        self.recovery_end_time = Some(end);
    }

    pub fn step_ok(&mut self, step: impl fmt::Display) {
        self.recovery_steps_executed.push(step.to_string());
    }

    /// Record a failed step together with the error that caused it
    pub fn step_failed(&mut self, step: impl fmt::Display, error: impl Into<String>) {
        self.recovery_steps_failed.push(step.to_string());
        self.resume_errors.push(error.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis() -> InterruptionAnalysis {
        let now = Utc::now();
        InterruptionAnalysis {
            session_id: "s".to_string(),
            interruption_time: now - chrono::Duration::hours(2),
            analysis_time: now,
            last_checkpoint_time: Some(now - chrono::Duration::hours(3)),
            last_successful_operation: None,
            interruption_type: InterruptionType::ProcessTermination,
            venues_definitely_completed: vec![],
            venues_possibly_incomplete: vec![],
            venues_unknown_status: vec![],
            venues_not_started: vec![],
            corrupted_checkpoints: vec![],
            missing_checkpoints: vec![],
            valid_checkpoints: vec![],
            latest_valid_checkpoint: None,
            latest_integrity_score: 0.0,
            recovery_complexity: RecoveryComplexity::Trivial,
            blocking_issues: vec![],
            estimated_papers_collected: 0,
            estimated_papers_lost: 0,
            papers_in_progress: 0,
            interruption_cause: InterruptionCause {
                cause_type: CauseType::ProcessKilled,
                confidence: 0.6,
                evidence: vec![],
                recovery_implications: vec![],
            },
        }
    }

    fn plan(confidence: f64, minutes: f64) -> RecoveryPlan {
        RecoveryPlan {
            session_id: "s".to_string(),
            resumption_strategy: ResumptionStrategy::FullRestart,
            optimal_checkpoint_id: None,
            venues_to_skip: vec![],
            venues_to_resume: vec![],
            venues_to_restart: vec![],
            venues_to_validate: vec![],
            estimated_recovery_time_minutes: minutes,
            estimated_papers_to_recover: 0,
            data_loss_estimate: 0,
            confidence_score: confidence,
            recommended_validation_steps: vec![],
            risk_assessment: RiskLevel::Low,
        }
    }

    #[test]
    fn test_feasibility_thresholds() {
        let analysis = analysis();
        assert!(plan(0.5, 5.0).feasibility_issues(&analysis, 0.5, 5.0).is_empty());
        assert_eq!(plan(0.3, 1.0).feasibility_issues(&analysis, 0.5, 5.0).len(), 1);
        assert_eq!(plan(0.3, 6.0).feasibility_issues(&analysis, 0.5, 5.0).len(), 2);

        let mut blocked = analysis;
        blocked.blocking_issues.push("Session already completed".to_string());
        assert_eq!(plan(0.9, 1.0).feasibility_issues(&blocked, 0.5, 5.0).len(), 1);
    }

    #[test]
    fn test_checkpoint_age() {
        let analysis = analysis();
        assert!((analysis.checkpoint_age_hours() - 3.0).abs() < 0.01);
    }

    #[test]
    fn test_interruption_type_maps_to_cause() {
        assert_eq!(InterruptionType::NetworkInterruption.cause_type(), CauseType::NetworkFailure);
        assert_eq!(InterruptionType::DiskSpaceExhaustion.cause_type(), CauseType::DiskFull);
        assert_eq!(InterruptionType::ProcessTermination.cause_type(), CauseType::ProcessKilled);
    }

    #[test]
    fn test_result_step_log() {
        let mut result = SessionResumeResult::started("s");
        result.step_ok("Interruption analysis");
        result.step_failed("Recovery feasibility validation", "confidence too low");
        result.finish();
        assert_eq!(result.recovery_steps_executed, vec!["Interruption analysis"]);
        assert_eq!(result.recovery_steps_failed, vec!["Recovery feasibility validation"]);
        assert_eq!(result.resume_errors.len(), 1);
        assert!(result.recovery_end_time.is_some());
        assert!(result.recovery_duration_seconds >= 0.0);
    }
}
