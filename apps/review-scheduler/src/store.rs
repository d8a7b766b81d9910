//! Storage collaborator interface and the in-memory backend.

use crate::error::{SchedulerError, SchedulerResult};
use crate::models::{CardId, CardSchedule, LearnerId, LearnerQueueState, Review};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Everything one accepted review writes. Applied atomically.
///
/// The learner record is not carried whole: the store rolls the stored
/// counter over to `day` and adds the completion itself, so reviews of
/// different cards never overwrite each other's counts or a goal change.
#[derive(Debug, Clone)]
pub struct ReviewCommit {
    /// Learner who graded.
    pub learner_id: LearnerId,
    /// Calendar day the review falls on.
    pub day: NaiveDate,
    /// Whether the review adds a completion for `day`.
    pub counted: bool,
    /// Card state after the review.
    pub card: CardSchedule,
    /// Revision the card had when it was read.
    pub expected_revision: u64,
    /// Review log entry.
    pub review: Review,
}

/// Durable store for learner and card records.
///
/// Implementations must make every single-record write atomic, and
/// `commit_review` atomic across all of its records.
#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Insert a learner. Returns `false` if it already exists.
    async fn insert_learner(&self, state: &LearnerQueueState) -> SchedulerResult<bool>;

    async fn load_learner_state(&self, learner_id: &str) -> SchedulerResult<Option<LearnerQueueState>>;

    async fn save_learner_state(&self, state: &LearnerQueueState) -> SchedulerResult<()>;

    /// Change only the daily goal, leaving the counters as stored.
    async fn save_daily_goal(&self, learner_id: &str, daily_goal: u32) -> SchedulerResult<LearnerQueueState>;

    /// Insert a card state if absent. Returns `false` if it already exists.
    async fn insert_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<bool>;

    async fn load_card_state(&self, learner_id: &str, card_id: &str) -> SchedulerResult<Option<CardSchedule>>;

    async fn save_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<()>;

    /// Reviewed cards with `due_at <= as_of`, oldest first.
    async fn list_due_cards(
        &self,
        learner_id: &str,
        as_of: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(CardId, DateTime<Utc>)>>;

    /// Never-reviewed cards in introduction order.
    async fn list_new_cards(&self, learner_id: &str) -> SchedulerResult<Vec<CardId>>;

    /// All card states of a learner in introduction order.
    async fn list_card_states(&self, learner_id: &str) -> SchedulerResult<Vec<CardSchedule>>;

    /// Write card state, learner counter and log entry together, or nothing.
    /// Returns the learner state as committed.
    ///
    /// Fails with `Conflict` when the stored card revision is not
    /// `expected_revision`, and with `DuplicateReview` when the log already
    /// holds the review id.
    async fn commit_review(&self, commit: &ReviewCommit) -> SchedulerResult<LearnerQueueState>;

    /// Review log of a learner in commit order.
    async fn list_reviews(&self, learner_id: &str) -> SchedulerResult<Vec<Review>>;
}

#[derive(Default)]
struct LearnerCards {
    order: Vec<CardId>,
    states: HashMap<CardId, CardSchedule>,
}

impl LearnerCards {
    fn in_order(&self) -> impl Iterator<Item = &CardSchedule> {
        self.order.iter().filter_map(|id| self.states.get(id))
    }
}

#[derive(Default)]
struct MemoryInner {
    learners: HashMap<String, LearnerQueueState>,
    cards: HashMap<String, LearnerCards>,
    reviews: Vec<Review>,
}

/// In-process store behind a single mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> SchedulerResult<MutexGuard<'_, MemoryInner>> {
        self.inner
            .lock()
            .map_err(|_| SchedulerError::Storage("memory store mutex poisoned".to_string()))
    }
}

fn learner_missing(learner_id: &str) -> SchedulerError {
    SchedulerError::NotFound(format!("learner {learner_id}"))
}

#[async_trait]
impl ReviewStore for MemoryStore {
    async fn insert_learner(&self, state: &LearnerQueueState) -> SchedulerResult<bool> {
        let mut inner = self.inner()?;
        if inner.learners.contains_key(&state.learner_id) {
            return Ok(false);
        }
        inner.learners.insert(state.learner_id.clone(), state.clone());
        inner.cards.entry(state.learner_id.clone()).or_default();
        Ok(true)
    }

    async fn load_learner_state(&self, learner_id: &str) -> SchedulerResult<Option<LearnerQueueState>> {
        Ok(self.inner()?.learners.get(learner_id).cloned())
    }

    async fn save_learner_state(&self, state: &LearnerQueueState) -> SchedulerResult<()> {
        let mut inner = self.inner()?;
        match inner.learners.get_mut(&state.learner_id) {
            Some(stored) => {
                *stored = state.clone();
                Ok(())
            }
            None => Err(learner_missing(&state.learner_id)),
        }
    }

    async fn save_daily_goal(&self, learner_id: &str, daily_goal: u32) -> SchedulerResult<LearnerQueueState> {
        let mut inner = self.inner()?;
        let stored = inner
            .learners
            .get_mut(learner_id)
            .ok_or_else(|| learner_missing(learner_id))?;
        stored.daily_goal = daily_goal;
        Ok(stored.clone())
    }

    async fn insert_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<bool> {
        let mut inner = self.inner()?;
        if !inner.learners.contains_key(learner_id) {
            return Err(learner_missing(learner_id));
        }
        let cards = inner.cards.entry(learner_id.to_string()).or_default();
        if cards.states.contains_key(&state.card_id) {
            return Ok(false);
        }
        cards.order.push(state.card_id.clone());
        cards.states.insert(state.card_id.clone(), state.clone());
        Ok(true)
    }

    async fn load_card_state(&self, learner_id: &str, card_id: &str) -> SchedulerResult<Option<CardSchedule>> {
        Ok(self
            .inner()?
            .cards
            .get(learner_id)
            .and_then(|cards| cards.states.get(card_id))
            .cloned())
    }

    async fn save_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<()> {
        let mut inner = self.inner()?;
        if !inner.learners.contains_key(learner_id) {
            return Err(learner_missing(learner_id));
        }
        let cards = inner.cards.entry(learner_id.to_string()).or_default();
        if !cards.states.contains_key(&state.card_id) {
            cards.order.push(state.card_id.clone());
        }
        cards.states.insert(state.card_id.clone(), state.clone());
        Ok(())
    }

    async fn list_due_cards(
        &self,
        learner_id: &str,
        as_of: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(CardId, DateTime<Utc>)>> {
        let inner = self.inner()?;
        let mut due: Vec<_> = inner
            .cards
            .get(learner_id)
            .map(|cards| {
                cards
                    .in_order()
                    .filter(|s| s.is_due(as_of))
                    .map(|s| (s.card_id.clone(), s.due_at))
                    .collect()
            })
            .unwrap_or_default();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(due)
    }

    async fn list_new_cards(&self, learner_id: &str) -> SchedulerResult<Vec<CardId>> {
        let inner = self.inner()?;
        Ok(inner
            .cards
            .get(learner_id)
            .map(|cards| {
                cards
                    .in_order()
                    .filter(|s| s.is_new())
                    .map(|s| s.card_id.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_card_states(&self, learner_id: &str) -> SchedulerResult<Vec<CardSchedule>> {
        let inner = self.inner()?;
        Ok(inner
            .cards
            .get(learner_id)
            .map(|cards| cards.in_order().cloned().collect())
            .unwrap_or_default())
    }

    async fn commit_review(&self, commit: &ReviewCommit) -> SchedulerResult<LearnerQueueState> {
        let mut inner = self.inner()?;
        let learner_id = commit.learner_id.as_str();
        let learner = inner
            .learners
            .get(learner_id)
            .ok_or_else(|| learner_missing(learner_id))?
            .record(commit.day, commit.counted);
        if inner.reviews.iter().any(|r| r.id == commit.review.id) {
            return Err(SchedulerError::DuplicateReview(commit.review.id));
        }

        let stored = inner
            .cards
            .get_mut(learner_id)
            .and_then(|cards| cards.states.get_mut(&commit.card.card_id))
            .ok_or_else(|| SchedulerError::NotFound(format!("card {}", commit.card.card_id)))?;
        if stored.revision != commit.expected_revision {
            return Err(SchedulerError::Conflict(format!(
                "card {} is at revision {}, expected {}",
                commit.card.card_id, stored.revision, commit.expected_revision
            )));
        }

        // all checks passed; nothing below can fail
        *stored = commit.card.clone();
        inner.learners.insert(learner_id.to_string(), learner.clone());
        inner.reviews.push(commit.review.clone());
        Ok(learner)
    }

    async fn list_reviews(&self, learner_id: &str) -> SchedulerResult<Vec<Review>> {
        Ok(self
            .inner()?
            .reviews
            .iter()
            .filter(|r| r.learner_id == learner_id)
            .cloned()
            .collect())
    }
}
