//! Checkpoint data model.
//!
//! A [`CheckpointData`] is an immutable snapshot of collection progress. Its
//! `checksum` is the SHA-256 of the canonical JSON form of every other field
//! and is computed once, at construction.

use crate::monitoring::{HealthStatus, UsageInfo};
use crate::persistence::compute_checksum;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Score lost when the stored checksum does not match
pub const CHECKSUM_PENALTY: f64 = 0.5;
/// Score lost when the checkpoint records no venues at all
pub const NO_VENUES_PENALTY: f64 = 0.3;
/// Score lost when the checkpoint belongs to another session
pub const SESSION_MISMATCH_PENALTY: f64 = 0.4;
/// Minimum integrity score for a checkpoint to be restored from
pub const MIN_USABLE_SCORE: f64 = 0.5;

/// Papers per venue, then per year
pub type PapersByVenue = BTreeMap<String, BTreeMap<i32, u64>>;

/// One cell of the venue × year grid
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VenueYear {
    pub venue: String,
    pub year: i32,
}

impl VenueYear {
    pub fn new(venue: impl Into<String>, year: i32) -> Self {
        Self {
            venue: venue.into(),
            year,
        }
    }
}

impl fmt::Display for VenueYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.venue, self.year)
    }
}

/// Event that produced a checkpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointType {
    SessionStarted,
    VenueCompleted,
    BatchCompleted,
    ApiCallCompleted,
    ErrorOccurred,
}

impl CheckpointType {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointType::SessionStarted => "session_started",
            CheckpointType::VenueCompleted => "venue_completed",
            CheckpointType::BatchCompleted => "batch_completed",
            CheckpointType::ApiCallCompleted => "api_call_completed",
            CheckpointType::ErrorOccurred => "error_occurred",
        }
    }
}

/// Integrity state computed on every listing; never persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Corrupted,
}

/// Details of the failure recorded by an `error_occurred` checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub error_type: String,
    pub error_message: String,
    #[serde(default)]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub venue_context: Option<String>,
    #[serde(default)]
    pub year_context: Option<i32>,
    #[serde(default)]
    pub api_context: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: None,
            venue_context: None,
            year_context: None,
            api_context: None,
            retry_count: 0,
            timestamp: Utc::now(),
        }
    }

    /// Attach the venue/year being collected when the error happened
    pub fn at(mut self, venue: impl Into<String>, year: i32) -> Self {
        self.venue_context = Some(venue.into());
        self.year_context = Some(year);
        self
    }

    /// Attach the API that failed
    pub fn on_api(mut self, api: impl Into<String>) -> Self {
        self.api_context = Some(api.into());
        self
    }
}

/// Producer-side description of progress, turned into a [`CheckpointData`]
/// by the checkpoint manager
#[derive(Debug, Clone)]
pub struct CheckpointProgress {
    pub checkpoint_type: CheckpointType,
    pub venues_completed: Vec<VenueYear>,
    pub venues_in_progress: Vec<VenueYear>,
    pub venues_not_started: Vec<VenueYear>,
    pub papers_collected: u64,
    pub papers_by_venue: PapersByVenue,
    pub last_successful_operation: String,
    pub api_health_status: BTreeMap<String, HealthStatus>,
    pub rate_limit_status: BTreeMap<String, UsageInfo>,
    pub error_context: Option<ErrorContext>,
}

impl CheckpointProgress {
    pub fn new(checkpoint_type: CheckpointType, last_successful_operation: impl Into<String>) -> Self {
        Self {
            checkpoint_type,
            venues_completed: Vec::new(),
            venues_in_progress: Vec::new(),
            venues_not_started: Vec::new(),
            papers_collected: 0,
            papers_by_venue: PapersByVenue::new(),
            last_successful_operation: last_successful_operation.into(),
            api_health_status: BTreeMap::new(),
            rate_limit_status: BTreeMap::new(),
            error_context: None,
        }
    }

    pub fn with_venues(
        mut self,
        completed: Vec<VenueYear>,
        in_progress: Vec<VenueYear>,
        not_started: Vec<VenueYear>,
    ) -> Self {
        self.venues_completed = completed;
        self.venues_in_progress = in_progress;
        self.venues_not_started = not_started;
        self
    }

    pub fn with_papers(mut self, papers_collected: u64, papers_by_venue: PapersByVenue) -> Self {
        self.papers_collected = papers_collected;
        self.papers_by_venue = papers_by_venue;
        self
    }

    pub fn with_api_health(mut self, statuses: impl IntoIterator<Item = HealthStatus>) -> Self {
        self.api_health_status = statuses
            .into_iter()
            .map(|s| (s.api_name.clone(), s))
            .collect();
        self
    }

    pub fn with_rate_limits(mut self, usage: BTreeMap<String, UsageInfo>) -> Self {
        self.rate_limit_status = usage;
        self
    }

    /// Record an error; the checkpoint type becomes `error_occurred`
    pub fn with_error(mut self, error_context: ErrorContext) -> Self {
        self.checkpoint_type = CheckpointType::ErrorOccurred;
        self.error_context = Some(error_context);
        self
    }
}

/// Immutable, checksummed snapshot of collection progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointData {
    pub checkpoint_id: String,
    pub session_id: String,
    pub checkpoint_type: CheckpointType,
    pub timestamp: DateTime<Utc>,
    pub venues_completed: Vec<VenueYear>,
    pub venues_in_progress: Vec<VenueYear>,
    pub venues_not_started: Vec<VenueYear>,
    pub papers_collected: u64,
    pub papers_by_venue: PapersByVenue,
    pub last_successful_operation: String,
    #[serde(default)]
    pub api_health_status: BTreeMap<String, HealthStatus>,
    #[serde(default)]
    pub rate_limit_status: BTreeMap<String, UsageInfo>,
    #[serde(default)]
    pub error_context: Option<ErrorContext>,
    #[serde(default)]
    pub checksum: String,
    #[serde(skip)]
    pub validation_status: Option<ValidationStatus>,
}

impl CheckpointData {
    /// Build a checkpoint and compute its checksum
    pub fn new(
        checkpoint_id: impl Into<String>,
        session_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        progress: CheckpointProgress,
    ) -> Self {
        let error_context = match progress.checkpoint_type {
            CheckpointType::ErrorOccurred => progress.error_context,
            _ => None,
        };

        let mut checkpoint = Self {
            checkpoint_id: checkpoint_id.into(),
            session_id: session_id.into(),
            checkpoint_type: progress.checkpoint_type,
            timestamp,
            venues_completed: progress.venues_completed,
            venues_in_progress: progress.venues_in_progress,
            venues_not_started: progress.venues_not_started,
            papers_collected: progress.papers_collected,
            papers_by_venue: progress.papers_by_venue,
            last_successful_operation: progress.last_successful_operation,
            api_health_status: progress.api_health_status,
            rate_limit_status: progress.rate_limit_status,
            error_context,
            checksum: String::new(),
            validation_status: None,
        };
        checkpoint.refresh_checksum();
        checkpoint
    }

    /// SHA-256 over the canonical serialization of every field but `checksum`
    pub fn calculate_checksum(&self) -> String {
        match serde_json::to_value(self) {
            Ok(value) => compute_checksum(&value),
            Err(_) => String::new(),
        }
    }

    /// Recompute and store the checksum
    pub fn refresh_checksum(&mut self) {
        self.checksum = self.calculate_checksum();
    }

    /// True when the stored checksum matches a fresh computation
    pub fn validate_integrity(&self) -> bool {
        !self.checksum.is_empty() && self.checksum == self.calculate_checksum()
    }

    /// Sum of the per-venue paper counts
    pub fn venue_paper_total(&self) -> u64 {
        self.papers_by_venue
            .values()
            .flat_map(|years| years.values())
            .sum()
    }

    /// Whether `papers_by_venue` agrees with `papers_collected` within `tolerance`.
    ///
    /// A checkpoint without per-venue counts is trivially consistent.
    pub fn is_count_consistent(&self, tolerance: f64) -> bool {
        if self.papers_by_venue.is_empty() {
            return true;
        }
        let total = self.venue_paper_total();
        if self.papers_collected == 0 {
            return total == 0;
        }
        let gap = total.abs_diff(self.papers_collected) as f64;
        gap / self.papers_collected as f64 <= tolerance
    }

    pub fn has_venues(&self) -> bool {
        !(self.venues_completed.is_empty()
            && self.venues_in_progress.is_empty()
            && self.venues_not_started.is_empty())
    }

    /// Venues with any restorable progress
    pub fn touched_venue_count(&self) -> usize {
        self.venues_completed.len() + self.venues_in_progress.len()
    }

    /// Papers recorded for one venue/year cell
    pub fn papers_for(&self, cell: &VenueYear) -> u64 {
        self.papers_by_venue
            .get(&cell.venue)
            .and_then(|years| years.get(&cell.year))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_valid(&self) -> bool {
        self.validation_status == Some(ValidationStatus::Valid)
    }

    /// Multi-criterion validation against the session it is expected to belong to
    pub fn assess(&self, expected_session_id: &str, count_tolerance: f64) -> CheckpointValidationResult {
        let mut result = CheckpointValidationResult::new(&self.checkpoint_id);

        if !self.validate_integrity() {
            result.fail("Checksum validation failed", CHECKSUM_PENALTY);
        }
        if !self.has_venues() {
            result.fail("Checkpoint records no venues", NO_VENUES_PENALTY);
        }
        if self.session_id != expected_session_id {
            result.fail(
                format!(
                    "Session id mismatch: expected {}, found {}",
                    expected_session_id, self.session_id
                ),
                SESSION_MISMATCH_PENALTY,
            );
        }

        if !self.is_count_consistent(count_tolerance) {
            result.validation_warnings.push(format!(
                "Paper counts disagree: {} by venue vs {} collected",
                self.venue_paper_total(),
                self.papers_collected
            ));
        }
        if self.checkpoint_type == CheckpointType::ErrorOccurred && self.error_context.is_none() {
            result
                .validation_warnings
                .push("Error checkpoint without error context".to_string());
        }

        result.finish();
        result
    }
}

/// Outcome of a detailed checkpoint validation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointValidationResult {
    pub checkpoint_id: String,
    pub is_valid: bool,
    pub validation_errors: Vec<String>,
    #[serde(default)]
    pub validation_warnings: Vec<String>,
    pub integrity_score: f64,
    pub can_be_used_for_recovery: bool,
}

impl CheckpointValidationResult {
    fn new(checkpoint_id: &str) -> Self {
        Self {
            checkpoint_id: checkpoint_id.to_string(),
            is_valid: true,
            validation_errors: Vec::new(),
            validation_warnings: Vec::new(),
            integrity_score: 1.0,
            can_be_used_for_recovery: true,
        }
    }

    /// Result for a checkpoint that could not be loaded at all
    pub fn unusable(checkpoint_id: &str, error: impl Into<String>) -> Self {
        Self {
            checkpoint_id: checkpoint_id.to_string(),
            is_valid: false,
            validation_errors: vec![error.into()],
            validation_warnings: Vec::new(),
            integrity_score: 0.0,
            can_be_used_for_recovery: false,
        }
    }

    fn fail(&mut self, error: impl Into<String>, penalty: f64) {
        self.validation_errors.push(error.into());
        self.integrity_score -= penalty;
    }

    fn finish(&mut self) {
        self.integrity_score = self.integrity_score.clamp(0.0, 1.0);
        self.is_valid = self.validation_errors.is_empty();
        self.can_be_used_for_recovery = self.integrity_score >= MIN_USABLE_SCORE;
    }
}
