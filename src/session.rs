//! Collection session model.
//!
//! A session is persisted as two files: `session_config.json` holds what the
//! session was asked to collect and never changes; `session_status.json` holds
//! progress and is rewritten on every checkpoint.

use crate::checkpoint::{CheckpointData, VenueYear};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};

pub const SESSION_CONFIG_FILE: &str = "session_config.json";
pub const SESSION_STATUS_FILE: &str = "session_status.json";

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Completed,
    Interrupted,
    Failed,
}

/// One venue to collect
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VenueConfig {
    pub venue_name: String,
    pub target_years: Vec<i32>,
    pub max_papers_per_year: u64,
    /// Lower value is collected first
    pub priority: i32,
}

impl VenueConfig {
    pub fn new(venue_name: impl Into<String>, target_years: Vec<i32>) -> Self {
        Self {
            venue_name: venue_name.into(),
            target_years,
            max_papers_per_year: 10_000,
            priority: 1,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Persisted immutable half of a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfigRecord {
    pub session_id: String,
    pub creation_time: DateTime<Utc>,
    pub target_venues: Vec<VenueConfig>,
    pub target_years: BTreeSet<i32>,
    #[serde(default)]
    pub collection_config: BTreeMap<String, Value>,
}

/// Persisted mutable half of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatusRecord {
    pub session_id: String,
    pub status: SessionStatus,
    pub last_activity_time: DateTime<Utc>,
    pub venues_completed: Vec<VenueYear>,
    pub venues_in_progress: Vec<VenueYear>,
    pub venues_not_started: Vec<VenueYear>,
    pub total_papers_collected: u64,
    #[serde(default)]
    pub last_checkpoint_id: Option<String>,
    #[serde(default)]
    pub checkpoint_count: u64,
}

/// One long-running collection run
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSession {
    pub session_id: String,
    pub creation_time: DateTime<Utc>,
    pub last_activity_time: DateTime<Utc>,
    pub status: SessionStatus,
    pub target_venues: Vec<VenueConfig>,
    pub target_years: BTreeSet<i32>,
    pub collection_config: BTreeMap<String, Value>,
    pub venues_completed: Vec<VenueYear>,
    pub venues_in_progress: Vec<VenueYear>,
    pub venues_not_started: Vec<VenueYear>,
    pub total_papers_collected: u64,
    pub last_checkpoint_id: Option<String>,
    pub checkpoint_count: u64,
}

impl CollectionSession {
    /// New active session with every grid cell not started
    pub fn new(
        session_id: impl Into<String>,
        mut target_venues: Vec<VenueConfig>,
        target_years: BTreeSet<i32>,
        collection_config: BTreeMap<String, Value>,
    ) -> Self {
        let now = Utc::now();
        target_venues.sort_by_key(|v| v.priority);

        let mut session = Self {
            session_id: session_id.into(),
            creation_time: now,
            last_activity_time: now,
            status: SessionStatus::Active,
            target_venues,
            target_years,
            collection_config,
            venues_completed: Vec::new(),
            venues_in_progress: Vec::new(),
            venues_not_started: Vec::new(),
            total_papers_collected: 0,
            last_checkpoint_id: None,
            checkpoint_count: 0,
        };
        session.venues_not_started = session.venue_grid();
        session
    }

    /// The venue × year cells this session targets, in priority order.
    ///
    /// A venue's own `target_years` narrow the session years when non-empty.
    pub fn venue_grid(&self) -> Vec<VenueYear> {
        let mut seen = HashSet::new();
        let mut grid = Vec::new();
        for venue in &self.target_venues {
            let years: Vec<i32> = if venue.target_years.is_empty() {
                self.target_years.iter().copied().collect()
            } else {
                venue
                    .target_years
                    .iter()
                    .copied()
                    .filter(|y| self.target_years.is_empty() || self.target_years.contains(y))
                    .collect()
            };
            for year in years {
                let cell = VenueYear::new(venue.venue_name.clone(), year);
                if seen.insert(cell.clone()) {
                    grid.push(cell);
                }
            }
        }
        grid
    }

    /// Copy progress from a checkpoint into the session
    pub fn apply_checkpoint(&mut self, checkpoint: &CheckpointData) {
        self.venues_completed = checkpoint.venues_completed.clone();
        self.venues_in_progress = checkpoint.venues_in_progress.clone();
        self.venues_not_started = checkpoint.venues_not_started.clone();
        self.total_papers_collected = checkpoint.papers_collected;
        self.last_checkpoint_id = Some(checkpoint.checkpoint_id.clone());
    }

    /// Cells listed in more than one progress list
    pub fn overlapping_cells(&self) -> Vec<VenueYear> {
        let mut seen = HashSet::new();
        let mut duplicates = BTreeSet::new();
        for cell in self
            .venues_completed
            .iter()
            .chain(&self.venues_in_progress)
            .chain(&self.venues_not_started)
        {
            if !seen.insert(cell) {
                duplicates.insert(cell.clone());
            }
        }
        duplicates.into_iter().collect()
    }

    /// Cells listed in progress but outside the target grid
    pub fn cells_outside_grid(&self) -> Vec<VenueYear> {
        let grid: HashSet<VenueYear> = self.venue_grid().into_iter().collect();
        self.venues_completed
            .iter()
            .chain(&self.venues_in_progress)
            .chain(&self.venues_not_started)
            .filter(|cell| !grid.contains(*cell))
            .cloned()
            .collect()
    }

    pub fn config_record(&self) -> SessionConfigRecord {
        SessionConfigRecord {
            session_id: self.session_id.clone(),
            creation_time: self.creation_time,
            target_venues: self.target_venues.clone(),
            target_years: self.target_years.clone(),
            collection_config: self.collection_config.clone(),
        }
    }

    pub fn status_record(&self) -> SessionStatusRecord {
        SessionStatusRecord {
            session_id: self.session_id.clone(),
            status: self.status,
            last_activity_time: self.last_activity_time,
            venues_completed: self.venues_completed.clone(),
            venues_in_progress: self.venues_in_progress.clone(),
            venues_not_started: self.venues_not_started.clone(),
            total_papers_collected: self.total_papers_collected,
            last_checkpoint_id: self.last_checkpoint_id.clone(),
            checkpoint_count: self.checkpoint_count,
        }
    }

    /// Reassemble a session from its two persisted halves
    pub fn from_records(config: SessionConfigRecord, status: SessionStatusRecord) -> Self {
        Self {
            session_id: config.session_id,
            creation_time: config.creation_time,
            last_activity_time: status.last_activity_time,
            status: status.status,
            target_venues: config.target_venues,
            target_years: config.target_years,
            collection_config: config.collection_config,
            venues_completed: status.venues_completed,
            venues_in_progress: status.venues_in_progress,
            venues_not_started: status.venues_not_started,
            total_papers_collected: status.total_papers_collected,
            last_checkpoint_id: status.last_checkpoint_id,
            checkpoint_count: status.checkpoint_count,
        }
    }
}
