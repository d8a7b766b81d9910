//! Command-line interface over the SQLite store.

use crate::config::Config;
use crate::db::SqliteStore;
use crate::models::format_interval;
use crate::queue::QueueManager;
use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

/// Review Scheduler
///
/// Spaced repetition scheduling for many learners.
#[derive(Parser, Debug)]
#[command(name = "review-scheduler")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides the default location)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a learner
    AddLearner {
        learner: String,
        /// Daily goal (defaults to the configured goal)
        #[arg(short, long)]
        goal: Option<u32>,
    },

    /// Change a learner's daily goal
    SetGoal { learner: String, goal: u32 },

    /// Introduce a card to a learner
    AddCard { learner: String, card: String },

    /// Show the next card to review
    Next { learner: String },

    /// Grade a card (0-5, 3 and above pass)
    Review {
        learner: String,
        card: String,
        #[arg(allow_negative_numbers = true)]
        quality: i64,
        /// Review id; resubmitting the same id never grades twice
        #[arg(long)]
        id: Option<Uuid>,
    },

    /// Show how many reviews remain toward today's goal
    Remaining { learner: String },

    /// Show card and daily statistics
    Stats { learner: String },

    /// List the current working set
    Queue { learner: String },
}

/// Install the tracing subscriber. `RUST_LOG` applies unless a level is given.
pub fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print<T: serde::Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}

/// Execute a parsed command.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::load(),
    };
    config.validate()?;

    let db_path = cli
        .db_path
        .clone()
        .or_else(|| config.db_path())
        .unwrap_or_else(|| "reviews.db".into());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    let manager = QueueManager::new(store, config.to_sm2(), config.to_queue_settings()?);
    let now = Utc::now();
    let json = cli.json;

    match cli.command {
        Commands::AddLearner { learner, goal } => {
            let state = manager
                .register_learner(&learner, goal.unwrap_or(config.study.daily_goal))
                .await?;
            print(json, &state, || format!("Learner {} (daily goal {})", state.learner_id, state.daily_goal))?;
        }
        Commands::SetGoal { learner, goal } => {
            let state = manager.set_daily_goal(&learner, goal).await?;
            print(json, &state, || format!("Daily goal for {} is now {}", learner, state.daily_goal))?;
        }
        Commands::AddCard { learner, card } => {
            let state = manager.introduce_card(&learner, &card, now).await?;
            print(json, &state, || format!("Card {} ({})", state.card_id, state.phase().name()))?;
        }
        Commands::Next { learner } => {
            let next = manager.next_card(&learner, now).await?;
            print(json, &next, || match &next {
                Some(card) => card.clone(),
                None => "Nothing to review right now".to_string(),
            })?;
        }
        Commands::Review { learner, card, quality, id } => {
            let id = id.unwrap_or_else(Uuid::new_v4);
            let outcome = manager
                .submit_review_with_id(&learner, &card, quality, id, now)
                .await?;
            print(json, &outcome, || {
                format!(
                    "Next review of {} in {} ({}), {} left today",
                    outcome.card_id,
                    format_interval(outcome.interval_days),
                    outcome.due_at.format("%Y-%m-%d %H:%M UTC"),
                    outcome.remaining_today
                )
            })?;
        }
        Commands::Remaining { learner } => {
            let remaining = manager.remaining_today(&learner, now).await?;
            print(json, &remaining, || remaining.to_string())?;
        }
        Commands::Stats { learner } => {
            let cards = manager.learner_stats(&learner, now).await?;
            let daily = manager.daily_stats(&learner, now).await?;
            let both = serde_json::json!({ "cards": cards, "daily": daily });
            print(json, &both, || {
                format!(
                    "Cards: {} total, {} new, {} learning, {} review, {} lapsed, {} due\n\
                     Today: {}/{} done, {} new available",
                    cards.total,
                    cards.new,
                    cards.learning,
                    cards.review,
                    cards.lapsed,
                    cards.due,
                    daily.learned_today,
                    daily.daily_goal,
                    daily.new_available
                )
            })?;
        }
        Commands::Queue { learner } => {
            let set = manager.working_set(&learner, now).await?;
            print(json, &set, || set.join("\n"))?;
        }
    }

    Ok(())
}
