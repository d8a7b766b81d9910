//! Configuration for the review scheduler.

use crate::algorithm::{Sm2, MAX_INTERVAL_DAYS};
use crate::error::{SchedulerError, SchedulerResult};
use crate::lock::DEFAULT_SHARDS;
use crate::queue::QueueSettings;
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest accepted `algorithm.max_interval_days` (1000 years).
const MAX_INTERVAL_LIMIT: u32 = 365_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub study: StudyConfig,
    #[serde(default)]
    pub algorithm: AlgorithmConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

impl Config {
    /// Load from the default location, falling back to defaults.
    pub fn load() -> Self {
        Self::config_path()
            .and_then(|p| std::fs::read_to_string(p).ok())
            .and_then(|s| toml::from_str(&s).ok())
            .unwrap_or_default()
    }

    /// Load an explicit file; errors are reported, not defaulted.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let content = toml::to_string_pretty(self)?;
            std::fs::write(path, content)?;
        }
        Ok(())
    }

    pub fn config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "review-scheduler")
            .map(|d| d.config_dir().join("config.toml"))
    }

    /// Database file: explicit setting, else the platform data dir.
    pub fn db_path(&self) -> Option<PathBuf> {
        self.storage.db_path.clone().or_else(|| {
            directories::ProjectDirs::from("", "", "review-scheduler")
                .map(|d| d.data_dir().join("reviews.db"))
        })
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.study.daily_goal == 0 {
            return Err(SchedulerError::Config("study.daily_goal must be positive".into()));
        }
        if self.queue.lock_shards == 0 {
            return Err(SchedulerError::Config("queue.lock_shards must be positive".into()));
        }
        if self.algorithm.min_ease <= 0.0 || self.algorithm.initial_ease < self.algorithm.min_ease {
            return Err(SchedulerError::Config(
                "algorithm.initial_ease must be at least algorithm.min_ease > 0".into(),
            ));
        }
        let algo = &self.algorithm;
        let longest_fixed = algo
            .first_interval_days
            .max(algo.second_interval_days)
            .max(algo.relearn_interval_days);
        if algo.max_interval_days < longest_fixed || algo.max_interval_days > MAX_INTERVAL_LIMIT {
            return Err(SchedulerError::Config(format!(
                "algorithm.max_interval_days must be between {longest_fixed} and {MAX_INTERVAL_LIMIT}"
            )));
        }
        self.queue.utc_offset()?;
        Ok(())
    }

    pub fn to_sm2(&self) -> Sm2 {
        let algo = &self.algorithm;
        Sm2 {
            initial_ease: algo.initial_ease,
            min_ease: algo.min_ease,
            first_interval_days: algo.first_interval_days,
            second_interval_days: algo.second_interval_days,
            relearn_interval_days: algo.relearn_interval_days,
            max_interval_days: algo.max_interval_days,
        }
    }

    pub fn to_queue_settings(&self) -> SchedulerResult<QueueSettings> {
        Ok(QueueSettings {
            storage_timeout: Duration::from_millis(self.queue.storage_timeout_ms),
            lock_shards: self.queue.lock_shards,
            utc_offset: self.queue.utc_offset()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudyConfig {
    #[serde(default = "default_daily_goal")]
    pub daily_goal: u32,
}

fn default_daily_goal() -> u32 { 5 }

impl Default for StudyConfig {
    fn default() -> Self {
        Self { daily_goal: 5 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmConfig {
    #[serde(default = "default_initial_ease")]
    pub initial_ease: f64,
    #[serde(default = "default_min_ease")]
    pub min_ease: f64,
    #[serde(default = "default_first_interval")]
    pub first_interval_days: u32,
    #[serde(default = "default_second_interval")]
    pub second_interval_days: u32,
    #[serde(default = "default_relearn_interval")]
    pub relearn_interval_days: u32,
    #[serde(default = "default_max_interval")]
    pub max_interval_days: u32,
}

fn default_initial_ease() -> f64 { 2.5 }
fn default_min_ease() -> f64 { 1.3 }
fn default_first_interval() -> u32 { 1 }
fn default_second_interval() -> u32 { 6 }
fn default_relearn_interval() -> u32 { 1 }
fn default_max_interval() -> u32 { MAX_INTERVAL_DAYS }

impl Default for AlgorithmConfig {
    fn default() -> Self {
        Self {
            initial_ease: 2.5,
            min_ease: 1.3,
            first_interval_days: 1,
            second_interval_days: 6,
            relearn_interval_days: 1,
            max_interval_days: MAX_INTERVAL_DAYS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_storage_timeout")]
    pub storage_timeout_ms: u64,
    #[serde(default = "default_lock_shards")]
    pub lock_shards: usize,
    /// Offset from UTC that defines the learner's calendar day.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

fn default_storage_timeout() -> u64 { 5000 }
fn default_lock_shards() -> usize { DEFAULT_SHARDS }

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_timeout_ms: 5000,
            lock_shards: DEFAULT_SHARDS,
            utc_offset_minutes: 0,
        }
    }
}

impl QueueConfig {
    pub fn utc_offset(&self) -> SchedulerResult<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .filter(|_| self.utc_offset_minutes.abs() <= 14 * 60)
            .ok_or_else(|| {
                SchedulerError::Config(format!(
                    "queue.utc_offset_minutes out of range: {}",
                    self.utc_offset_minutes
                ))
            })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}
