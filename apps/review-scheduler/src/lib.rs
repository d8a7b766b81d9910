//! SM-2 review scheduling with per-learner due-card queues.
//!
//! # Features
//!
//! - **Scheduler**: pure SM-2 update from (state, grade, instant) to the next state
//! - **Queue Manager**: oldest-overdue-first selection, new cards throttled by a daily goal
//! - **Lazy day boundary**: quota counters restart on access, no background timer
//! - **Per-card serialization**: sharded lock table plus optimistic revisions in storage
//! - **Pluggable storage**: in-memory and SQLite backends behind one async trait

pub mod algorithm;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod lock;
pub mod models;
pub mod queue;
pub mod store;

pub use algorithm::{Sm2, MAX_INTERVAL_DAYS};
pub use config::Config;
pub use db::SqliteStore;
pub use error::{SchedulerError, SchedulerResult};
pub use lock::KeyedLocks;
pub use models::{
    format_interval, CardId, CardPhase, CardSchedule, DailyStats, LearnerId, LearnerQueueState,
    LearnerStats, Quality, Review, ReviewId, ReviewOutcome,
};
pub use queue::{QueueManager, QueueSettings};
pub use store::{MemoryStore, ReviewCommit, ReviewStore};
