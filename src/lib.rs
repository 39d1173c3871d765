//! # rustpapercollect
//!
//! Checkpointed, crash-resilient paper collection sessions with interruption recovery
//!
//! ## Modules
//!
//! - [`state_manager`] - Session lifecycle, checkpoint saving, recovery plans
//! - [`recovery_engine`] - End-to-end recovery with concurrency and retry guards
//! - [`checkpoint_manager`] - Checkpoint creation, listing, validation, retention
//! - [`analysis`] - Interruption analysis and recovery planning
//! - [`persistence`] - Atomic, checksummed JSON state files
//! - [`monitoring`] - API health tracking and rate limiting
//! - [`error`] - Custom error types
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rustpapercollect::{InterruptionRecoveryEngine, StateConfig, StateManager, VenueConfig};
//! use std::collections::{BTreeMap, BTreeSet};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let manager = Arc::new(StateManager::new(StateConfig::default()));
//!     let session_id = manager.create_session(
//!         vec![VenueConfig::new("CVPR", vec![])],
//!         BTreeSet::from([2023, 2024]),
//!         BTreeMap::new(),
//!         None,
//!     )?;
//!
//!     let engine = InterruptionRecoveryEngine::new(manager);
//!     let result = engine.resume_interrupted_session(&session_id);
//!     println!("Recovered: {}", result.success);
//!     Ok(())
//! }
//! ```

pub mod analysis;
pub mod checkpoint;
pub mod checkpoint_manager;
pub mod config;
pub mod error;
pub mod monitoring;
pub mod persistence;
pub mod recovery;
pub mod recovery_engine;
pub mod session;
pub mod state_manager;

pub use checkpoint::{CheckpointData, CheckpointProgress, CheckpointType, ErrorContext, VenueYear};
pub use checkpoint_manager::CheckpointManager;
pub use config::StateConfig;
pub use error::{Result, StateError};
pub use recovery::{InterruptionAnalysis, RecoveryPlan, ResumptionStrategy, SessionResumeResult};
pub use recovery_engine::InterruptionRecoveryEngine;
pub use session::{CollectionSession, SessionStatus, VenueConfig};
pub use state_manager::StateManager;
