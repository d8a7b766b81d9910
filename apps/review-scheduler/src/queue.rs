//! Per-learner review queue.
//!
//! The queue holds no authoritative state of its own. Every call derives the
//! working set from stored due timestamps and quota records, so a restart
//! loses nothing.
//!
//! Selection order:
//! 1. reviewed cards with `due_at <= now`, oldest first;
//! 2. never-reviewed cards in introduction order, only while the learner is
//!    under the daily goal.

use crate::algorithm::Sm2;
use crate::error::{SchedulerError, SchedulerResult};
use crate::lock::{KeyedLocks, DEFAULT_SHARDS};
use crate::models::{
    CardId, CardSchedule, DailyStats, LearnerQueueState, LearnerStats, Quality, Review, ReviewId,
    ReviewOutcome,
};
use crate::store::{ReviewCommit, ReviewStore};
use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Runtime knobs for a [`QueueManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueSettings {
    /// Deadline for each storage call.
    pub storage_timeout: Duration,
    /// Shards in the per-card lock table.
    pub lock_shards: usize,
    /// Offset whose local midnight ends a learner's day.
    pub utc_offset: FixedOffset,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            storage_timeout: Duration::from_secs(5),
            lock_shards: DEFAULT_SHARDS,
            utc_offset: Utc.fix(),
        }
    }
}

/// Schedules reviews and serves due cards for many learners.
pub struct QueueManager<S> {
    store: S,
    algorithm: Sm2,
    locks: KeyedLocks,
    settings: QueueSettings,
}

impl<S: ReviewStore> QueueManager<S> {
    /// Manager over `store` with the given algorithm and settings.
    pub fn new(store: S, algorithm: Sm2, settings: QueueSettings) -> Self {
        Self {
            store,
            algorithm,
            locks: KeyedLocks::new(settings.lock_shards),
            settings,
        }
    }

    /// Manager with the default SM-2 tunables and settings.
    pub fn with_defaults(store: S) -> Self {
        Self::new(store, Sm2::default(), QueueSettings::default())
    }

    /// Underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Scheduling algorithm in use.
    pub fn algorithm(&self) -> &Sm2 {
        &self.algorithm
    }

    /// Calendar day of an instant for quota purposes.
    pub fn day_of(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.settings.utc_offset).date_naive()
    }

    /// Bound a storage call by the configured deadline.
    async fn call<T>(&self, fut: impl Future<Output = SchedulerResult<T>>) -> SchedulerResult<T> {
        tokio::time::timeout(self.settings.storage_timeout, fut)
            .await
            .map_err(|_| SchedulerError::Timeout)?
    }

    /// Run `op`, retrying once with fresh reads on a retryable error.
    async fn with_retry<T, F, Fut>(&self, name: &str, mut op: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        match op().await {
            Err(e) if e.is_retryable() => {
                warn!(operation = name, error = %e, "retrying once");
                op().await
            }
            other => other,
        }
    }

    async fn learner(&self, learner_id: &str) -> SchedulerResult<LearnerQueueState> {
        self.call(self.store.load_learner_state(learner_id))
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("learner {learner_id}")))
    }

    async fn card(&self, learner_id: &str, card_id: &str) -> SchedulerResult<CardSchedule> {
        self.call(self.store.load_card_state(learner_id, card_id))
            .await?
            .ok_or_else(|| SchedulerError::NotFound(format!("card {card_id} for learner {learner_id}")))
    }

    /// Create a learner. An existing learner is returned unchanged.
    pub async fn register_learner(&self, learner_id: &str, daily_goal: u32) -> SchedulerResult<LearnerQueueState> {
        if daily_goal == 0 {
            return Err(SchedulerError::InvalidGoal(daily_goal));
        }
        self.with_retry("register_learner", || async {
            let state = LearnerQueueState::new(learner_id, daily_goal);
            if self.call(self.store.insert_learner(&state)).await? {
                info!(learner = learner_id, daily_goal, "registered learner");
                Ok(state)
            } else {
                self.learner(learner_id).await
            }
        })
        .await
    }

    /// Change a learner's daily goal. Today's completions are kept.
    pub async fn set_daily_goal(&self, learner_id: &str, daily_goal: u32) -> SchedulerResult<LearnerQueueState> {
        if daily_goal == 0 {
            return Err(SchedulerError::InvalidGoal(daily_goal));
        }
        self.with_retry("set_daily_goal", || {
            self.call(self.store.save_daily_goal(learner_id, daily_goal))
        })
        .await
    }

    /// First exposure of a card to a learner: creates the default state.
    ///
    /// Introducing a known card returns its current state untouched.
    pub async fn introduce_card(
        &self,
        learner_id: &str,
        card_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<CardSchedule> {
        let _guard = self.locks.lock(learner_id, card_id).await;
        self.with_retry("introduce_card", || async {
            let initial = self.algorithm.initial_schedule(card_id, now);
            if self.call(self.store.insert_card_state(learner_id, &initial)).await? {
                debug!(learner = learner_id, card = card_id, "introduced card");
                Ok(initial)
            } else {
                self.card(learner_id, card_id).await
            }
        })
        .await
    }

    /// Ordered cards eligible for review at `now`.
    pub async fn working_set(&self, learner_id: &str, now: DateTime<Utc>) -> SchedulerResult<Vec<CardId>> {
        self.with_retry("working_set", || self.derive_working_set(learner_id, now))
            .await
    }

    async fn derive_working_set(&self, learner_id: &str, now: DateTime<Utc>) -> SchedulerResult<Vec<CardId>> {
        let remaining = self.learner(learner_id).await?.rolled_over(self.day_of(now)).remaining();

        let mut due = self.call(self.store.list_due_cards(learner_id, now)).await?;
        due.retain(|(_, due_at)| *due_at <= now);
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        let mut set: Vec<CardId> = due.into_iter().map(|(id, _)| id).collect();
        let overdue = set.len();

        if remaining > 0 {
            let fresh = self.call(self.store.list_new_cards(learner_id)).await?;
            set.extend(fresh.into_iter().take(remaining as usize));
        }

        debug!(
            learner = learner_id,
            overdue,
            new = set.len() - overdue,
            remaining,
            "derived working set"
        );
        Ok(set)
    }

    /// Next card to present, if any.
    pub async fn next_card(&self, learner_id: &str, now: DateTime<Utc>) -> SchedulerResult<Option<CardId>> {
        Ok(self.working_set(learner_id, now).await?.into_iter().next())
    }

    /// Grade a card and commit the new schedule.
    ///
    /// Reviews of the same card by the same learner are serialized. A card
    /// counts toward the daily goal once per calendar day.
    ///
    /// A `Timeout` does not prove the write was dropped: the storage call may
    /// still land afterwards. Callers that retry on their own should use
    /// [`submit_review_with_id`](Self::submit_review_with_id).
    pub async fn submit_review(
        &self,
        learner_id: &str,
        card_id: &str,
        quality: i64,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ReviewOutcome> {
        self.submit_review_with_id(learner_id, card_id, quality, Uuid::new_v4(), now)
            .await
    }

    /// [`submit_review`](Self::submit_review) under a caller-chosen review id.
    ///
    /// Resubmitting an id that is already the card's latest review returns
    /// the stored outcome without grading again. An id that was logged and
    /// has since been superseded fails with `DuplicateReview`. Either way a
    /// review id is applied at most once.
    pub async fn submit_review_with_id(
        &self,
        learner_id: &str,
        card_id: &str,
        quality: i64,
        review_id: ReviewId,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ReviewOutcome> {
        let quality = Quality::new(quality)?;

        let _guard = self.locks.lock(learner_id, card_id).await;
        self.with_retry("submit_review", || {
            self.apply_review(learner_id, card_id, quality, review_id, now)
        })
        .await
    }

    async fn apply_review(
        &self,
        learner_id: &str,
        card_id: &str,
        quality: Quality,
        review_id: ReviewId,
        now: DateTime<Utc>,
    ) -> SchedulerResult<ReviewOutcome> {
        let learner = self.learner(learner_id).await?;
        let previous = self.card(learner_id, card_id).await?;
        let today = self.day_of(now);

        // an earlier attempt timed out after its write landed
        if previous.last_review_id == Some(review_id) {
            let remaining = learner.rolled_over(today).remaining();
            return Ok(outcome(&previous, remaining));
        }

        let counts = previous
            .last_reviewed_at
            .map_or(true, |at| self.day_of(at) != today);

        let mut next = self.algorithm.update(&previous, quality, now);
        next.revision = previous.revision + 1;
        next.last_review_id = Some(review_id);

        let commit = ReviewCommit {
            learner_id: learner_id.to_string(),
            day: today,
            counted: counts,
            review: Review::new(review_id, learner_id, quality, &next, now),
            expected_revision: previous.revision,
            card: next,
        };
        let learner = self.call(self.store.commit_review(&commit)).await?;

        info!(
            learner = learner_id,
            card = card_id,
            quality = quality.value(),
            repetitions = commit.card.repetition_count,
            interval_days = commit.card.interval_days,
            ease = commit.card.ease_factor,
            counted = counts,
            "review committed"
        );
        Ok(outcome(&commit.card, learner.remaining()))
    }

    /// Completions still needed today; the counter restarts lazily at the
    /// day boundary.
    pub async fn remaining_today(&self, learner_id: &str, now: DateTime<Utc>) -> SchedulerResult<u32> {
        self.with_retry("remaining_today", || async {
            Ok(self.learner(learner_id).await?.rolled_over(self.day_of(now)).remaining())
        })
        .await
    }

    /// Card counts by phase.
    pub async fn learner_stats(&self, learner_id: &str, now: DateTime<Utc>) -> SchedulerResult<LearnerStats> {
        self.with_retry("learner_stats", || async {
            self.learner(learner_id).await?;
            let states = self.call(self.store.list_card_states(learner_id)).await?;
            Ok(LearnerStats::from_schedules(&states, now))
        })
        .await
    }

    /// Progress against today's goal.
    pub async fn daily_stats(&self, learner_id: &str, now: DateTime<Utc>) -> SchedulerResult<DailyStats> {
        self.with_retry("daily_stats", || async {
            let learner = self.learner(learner_id).await?.rolled_over(self.day_of(now));
            let new_available = self.call(self.store.list_new_cards(learner_id)).await?.len();
            Ok(DailyStats {
                learned_today: learner.completed_today,
                daily_goal: learner.daily_goal,
                remaining_today: learner.remaining(),
                new_available,
                goal_reached: learner.goal_reached(),
                can_learn_more: new_available > 0 && !learner.goal_reached(),
            })
        })
        .await
    }

    /// Review log of a learner.
    pub async fn reviews(&self, learner_id: &str) -> SchedulerResult<Vec<Review>> {
        self.with_retry("reviews", || async {
            self.learner(learner_id).await?;
            self.call(self.store.list_reviews(learner_id)).await
        })
        .await
    }
}

fn outcome(schedule: &CardSchedule, remaining_today: u32) -> ReviewOutcome {
    ReviewOutcome {
        card_id: schedule.card_id.clone(),
        due_at: schedule.due_at,
        repetition_count: schedule.repetition_count,
        interval_days: schedule.interval_days,
        ease_factor: schedule.ease_factor,
        phase: schedule.phase(),
        remaining_today,
    }
}
