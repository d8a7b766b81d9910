//! SQLite backend for the review store.

use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{CardId, CardSchedule, LearnerQueueState, Quality, Review};
use crate::store::{ReviewCommit, ReviewStore};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, TransactionBehavior};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// `ReviewStore` over a single SQLite connection.
///
/// Calls run on the blocking thread pool so they can be bounded by a
/// timeout from async code.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> SchedulerResult<Self> {
        Self::init(Connection::open(path)?)
    }

    pub fn in_memory() -> SchedulerResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> SchedulerResult<Self> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS learners (
                id TEXT PRIMARY KEY,
                daily_goal INTEGER NOT NULL,
                completed_today INTEGER NOT NULL DEFAULT 0,
                activity_day TEXT
            );

            CREATE TABLE IF NOT EXISTS card_states (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                learner_id TEXT NOT NULL REFERENCES learners(id),
                card_id TEXT NOT NULL,
                repetition_count INTEGER NOT NULL,
                interval_days INTEGER NOT NULL,
                ease_factor REAL NOT NULL,
                due_at TEXT NOT NULL,
                last_reviewed_at TEXT,
                last_quality INTEGER,
                lapses INTEGER NOT NULL DEFAULT 0,
                last_review_id TEXT,
                revision INTEGER NOT NULL DEFAULT 0,
                UNIQUE (learner_id, card_id)
            );

            CREATE TABLE IF NOT EXISTS reviews (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                learner_id TEXT NOT NULL REFERENCES learners(id),
                card_id TEXT NOT NULL,
                quality INTEGER NOT NULL,
                interval_days INTEGER NOT NULL,
                ease_factor REAL NOT NULL,
                reviewed_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_card_states_due ON card_states(learner_id, due_at);
            CREATE INDEX IF NOT EXISTS idx_reviews_learner ON reviews(learner_id);
            "#,
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> SchedulerResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> SchedulerResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| SchedulerError::Storage("connection mutex poisoned".to_string()))?;
            f(&mut *guard)
        })
        .await
        .map_err(|e| SchedulerError::Storage(format!("storage task failed: {e}")))?
    }
}

const CARD_COLUMNS: &str = "card_id, repetition_count, interval_days, ease_factor, due_at, \
     last_reviewed_at, last_quality, lapses, last_review_id, revision";

fn learner_exists(conn: &Connection, learner_id: &str) -> SqlResult<bool> {
    conn.query_row("SELECT 1 FROM learners WHERE id = ?1", params![learner_id], |_| Ok(()))
        .optional()
        .map(|row| row.is_some())
}

fn require_learner(conn: &Connection, learner_id: &str) -> SchedulerResult<()> {
    if learner_exists(conn, learner_id)? {
        Ok(())
    } else {
        Err(SchedulerError::NotFound(format!("learner {learner_id}")))
    }
}

fn write_learner(conn: &Connection, state: &LearnerQueueState) -> SchedulerResult<()> {
    let changed = conn.execute(
        "UPDATE learners SET daily_goal = ?2, completed_today = ?3, activity_day = ?4 WHERE id = ?1",
        params![
            state.learner_id,
            state.daily_goal,
            state.completed_today,
            state.activity_day.map(|d| d.to_string()),
        ],
    )?;
    if changed == 0 {
        return Err(SchedulerError::NotFound(format!("learner {}", state.learner_id)));
    }
    Ok(())
}

fn read_learner(conn: &Connection, learner_id: &str) -> SchedulerResult<LearnerQueueState> {
    conn.query_row(
        "SELECT id, daily_goal, completed_today, activity_day FROM learners WHERE id = ?1",
        params![learner_id],
        parse_learner_row,
    )
    .optional()?
    .ok_or_else(|| SchedulerError::NotFound(format!("learner {learner_id}")))
}

fn upsert_card(conn: &Connection, learner_id: &str, state: &CardSchedule) -> SchedulerResult<()> {
    conn.execute(
        "INSERT INTO card_states (learner_id, card_id, repetition_count, interval_days, ease_factor,
                                  due_at, last_reviewed_at, last_quality, lapses, last_review_id, revision)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(learner_id, card_id) DO UPDATE SET
            repetition_count = excluded.repetition_count, interval_days = excluded.interval_days,
            ease_factor = excluded.ease_factor, due_at = excluded.due_at,
            last_reviewed_at = excluded.last_reviewed_at, last_quality = excluded.last_quality,
            lapses = excluded.lapses, last_review_id = excluded.last_review_id,
            revision = excluded.revision",
        params![
            learner_id,
            state.card_id,
            state.repetition_count,
            state.interval_days,
            state.ease_factor,
            format_ts(state.due_at),
            state.last_reviewed_at.map(format_ts),
            state.last_quality.map(Quality::value),
            state.lapses,
            state.last_review_id.map(|id| id.to_string()),
            state.revision as i64,
        ],
    )?;
    Ok(())
}

#[async_trait]
impl ReviewStore for SqliteStore {
    async fn insert_learner(&self, state: &LearnerQueueState) -> SchedulerResult<bool> {
        let state = state.clone();
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO learners (id, daily_goal, completed_today, activity_day)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    state.learner_id,
                    state.daily_goal,
                    state.completed_today,
                    state.activity_day.map(|d| d.to_string()),
                ],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    async fn load_learner_state(&self, learner_id: &str) -> SchedulerResult<Option<LearnerQueueState>> {
        let learner_id = learner_id.to_string();
        self.with_conn(move |conn| {
            let state = conn
                .query_row(
                    "SELECT id, daily_goal, completed_today, activity_day FROM learners WHERE id = ?1",
                    params![learner_id],
                    parse_learner_row,
                )
                .optional()?;
            Ok(state)
        })
        .await
    }

    async fn save_learner_state(&self, state: &LearnerQueueState) -> SchedulerResult<()> {
        let state = state.clone();
        self.with_conn(move |conn| write_learner(conn, &state)).await
    }

    async fn save_daily_goal(&self, learner_id: &str, daily_goal: u32) -> SchedulerResult<LearnerQueueState> {
        let learner_id = learner_id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            tx.execute(
                "UPDATE learners SET daily_goal = ?2 WHERE id = ?1",
                params![learner_id, daily_goal],
            )?;
            let state = read_learner(&tx, &learner_id)?;
            tx.commit()?;
            Ok(state)
        })
        .await
    }

    async fn insert_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<bool> {
        let (learner_id, state) = (learner_id.to_string(), state.clone());
        self.with_conn(move |conn| {
            require_learner(conn, &learner_id)?;
            let exists = conn
                .query_row(
                    "SELECT 1 FROM card_states WHERE learner_id = ?1 AND card_id = ?2",
                    params![learner_id, state.card_id],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if exists {
                return Ok(false);
            }
            upsert_card(conn, &learner_id, &state)?;
            Ok(true)
        })
        .await
    }

    async fn load_card_state(&self, learner_id: &str, card_id: &str) -> SchedulerResult<Option<CardSchedule>> {
        let (learner_id, card_id) = (learner_id.to_string(), card_id.to_string());
        self.with_conn(move |conn| {
            let sql = format!("SELECT {CARD_COLUMNS} FROM card_states WHERE learner_id = ?1 AND card_id = ?2");
            let state = conn
                .query_row(&sql, params![learner_id, card_id], parse_card_row)
                .optional()?;
            Ok(state)
        })
        .await
    }

    async fn save_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<()> {
        let (learner_id, state) = (learner_id.to_string(), state.clone());
        self.with_conn(move |conn| {
            require_learner(conn, &learner_id)?;
            upsert_card(conn, &learner_id, &state)
        })
        .await
    }

    async fn list_due_cards(
        &self,
        learner_id: &str,
        as_of: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(CardId, DateTime<Utc>)>> {
        let learner_id = learner_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT card_id, due_at FROM card_states
                 WHERE learner_id = ?1 AND last_reviewed_at IS NOT NULL AND due_at <= ?2
                 ORDER BY due_at, card_id",
            )?;
            let due = stmt
                .query_map(params![learner_id, format_ts(as_of)], |row| {
                    let due_str: String = row.get(1)?;
                    Ok((row.get::<_, String>(0)?, parse_ts(1, &due_str)?))
                })?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(due)
        })
        .await
    }

    async fn list_new_cards(&self, learner_id: &str) -> SchedulerResult<Vec<CardId>> {
        let learner_id = learner_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT card_id FROM card_states
                 WHERE learner_id = ?1 AND last_reviewed_at IS NULL
                 ORDER BY seq",
            )?;
            let ids = stmt
                .query_map(params![learner_id], |row| row.get::<_, String>(0))?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(ids)
        })
        .await
    }

    async fn list_card_states(&self, learner_id: &str) -> SchedulerResult<Vec<CardSchedule>> {
        let learner_id = learner_id.to_string();
        self.with_conn(move |conn| {
            let sql = format!("SELECT {CARD_COLUMNS} FROM card_states WHERE learner_id = ?1 ORDER BY seq");
            let mut stmt = conn.prepare(&sql)?;
            let states = stmt
                .query_map(params![learner_id], parse_card_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(states)
        })
        .await
    }

    async fn commit_review(&self, commit: &ReviewCommit) -> SchedulerResult<LearnerQueueState> {
        let commit = commit.clone();
        self.with_conn(move |conn| {
            let learner_id = commit.learner_id.as_str();
            // take the write lock before reading so other connections
            // cannot interleave between read and write
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

            let learner = read_learner(&tx, learner_id)?.record(commit.day, commit.counted);
            let logged = tx
                .query_row(
                    "SELECT 1 FROM reviews WHERE id = ?1",
                    params![commit.review.id.to_string()],
                    |_| Ok(()),
                )
                .optional()?
                .is_some();
            if logged {
                return Err(SchedulerError::DuplicateReview(commit.review.id));
            }

            let revision: Option<i64> = tx
                .query_row(
                    "SELECT revision FROM card_states WHERE learner_id = ?1 AND card_id = ?2",
                    params![learner_id, commit.card.card_id],
                    |row| row.get(0),
                )
                .optional()?;
            match revision {
                None => {
                    return Err(SchedulerError::NotFound(format!("card {}", commit.card.card_id)));
                }
                Some(rev) if rev as u64 != commit.expected_revision => {
                    return Err(SchedulerError::Conflict(format!(
                        "card {} is at revision {}, expected {}",
                        commit.card.card_id, rev, commit.expected_revision
                    )));
                }
                Some(_) => {}
            }

            upsert_card(&tx, learner_id, &commit.card)?;
            tx.execute(
                "UPDATE learners SET completed_today = ?2, activity_day = ?3 WHERE id = ?1",
                params![
                    learner_id,
                    learner.completed_today,
                    learner.activity_day.map(|d| d.to_string()),
                ],
            )?;
            let review = &commit.review;
            tx.execute(
                "INSERT INTO reviews (id, learner_id, card_id, quality, interval_days, ease_factor, reviewed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    review.id.to_string(),
                    review.learner_id,
                    review.card_id,
                    review.quality.value(),
                    review.interval_days,
                    review.ease_factor,
                    format_ts(review.reviewed_at),
                ],
            )?;

            tx.commit()?;
            Ok(learner)
        })
        .await
    }

    async fn list_reviews(&self, learner_id: &str) -> SchedulerResult<Vec<Review>> {
        let learner_id = learner_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, learner_id, card_id, quality, interval_days, ease_factor, reviewed_at
                 FROM reviews WHERE learner_id = ?1 ORDER BY seq",
            )?;
            let reviews = stmt
                .query_map(params![learner_id], parse_review_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            Ok(reviews)
        })
        .await
    }
}

/// Fixed-width RFC 3339 so that text comparison orders instants.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

fn parse_ts(idx: usize, s: &str) -> SqlResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn parse_uuid(idx: usize, s: &str) -> SqlResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| conversion_error(idx, e))
}

fn parse_quality(idx: usize, value: u8) -> SqlResult<Quality> {
    Quality::new(i64::from(value)).map_err(|e| conversion_error(idx, e))
}

fn parse_learner_row(row: &rusqlite::Row) -> SqlResult<LearnerQueueState> {
    let day: Option<String> = row.get("activity_day")?;
    let activity_day = day
        .map(|d| d.parse::<NaiveDate>().map_err(|e| conversion_error(3, e)))
        .transpose()?;

    Ok(LearnerQueueState {
        learner_id: row.get("id")?,
        daily_goal: row.get("daily_goal")?,
        completed_today: row.get("completed_today")?,
        activity_day,
    })
}

fn parse_card_row(row: &rusqlite::Row) -> SqlResult<CardSchedule> {
    let due_str: String = row.get("due_at")?;
    let reviewed: Option<String> = row.get("last_reviewed_at")?;
    let quality: Option<u8> = row.get("last_quality")?;
    let review_id: Option<String> = row.get("last_review_id")?;
    let revision: i64 = row.get("revision")?;

    Ok(CardSchedule {
        card_id: row.get("card_id")?,
        repetition_count: row.get("repetition_count")?,
        interval_days: row.get("interval_days")?,
        ease_factor: row.get("ease_factor")?,
        due_at: parse_ts(4, &due_str)?,
        last_reviewed_at: reviewed.map(|s| parse_ts(5, &s)).transpose()?,
        last_quality: quality.map(|q| parse_quality(6, q)).transpose()?,
        lapses: row.get("lapses")?,
        last_review_id: review_id.map(|s| parse_uuid(8, &s)).transpose()?,
        revision: revision as u64,
    })
}

fn parse_review_row(row: &rusqlite::Row) -> SqlResult<Review> {
    let id_str: String = row.get("id")?;
    let quality: u8 = row.get("quality")?;
    let reviewed_str: String = row.get("reviewed_at")?;

    Ok(Review {
        id: parse_uuid(0, &id_str)?,
        learner_id: row.get("learner_id")?,
        card_id: row.get("card_id")?,
        quality: parse_quality(3, quality)?,
        interval_days: row.get("interval_days")?,
        ease_factor: row.get("ease_factor")?,
        reviewed_at: parse_ts(6, &reviewed_str)?,
    })
}
