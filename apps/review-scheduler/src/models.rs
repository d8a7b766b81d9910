//! Data models for review scheduling.

use crate::error::{SchedulerError, SchedulerResult};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifiers.
pub type LearnerId = String;
pub type CardId = String;
pub type ReviewId = Uuid;

/// Default ease factor for a freshly introduced card.
pub const INITIAL_EASE: f64 = 2.5;
/// Floor for the ease factor.
pub const MIN_EASE: f64 = 1.3;

/// A quality grade in 0..=5. Grades of 3 and above pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub struct Quality(u8);

impl Quality {
    /// Lowest passing grade.
    pub const PASS: u8 = 3;
    /// Highest grade.
    pub const MAX: u8 = 5;

    /// Validate a raw grade.
    pub fn new(value: i64) -> SchedulerResult<Self> {
        if (0..=i64::from(Self::MAX)).contains(&value) {
            Ok(Self(value as u8))
        } else {
            Err(SchedulerError::InvalidGrade(value))
        }
    }

    /// Raw grade value.
    pub fn value(self) -> u8 {
        self.0
    }

    /// Whether this grade counts as a successful recall.
    pub fn is_pass(self) -> bool {
        self.0 >= Self::PASS
    }
}

impl TryFrom<i64> for Quality {
    type Error = SchedulerError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Quality> for i64 {
    fn from(q: Quality) -> Self {
        i64::from(q.0)
    }
}

/// Lifecycle classification of a card.
///
/// Derived from the scheduling state on demand, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardPhase {
    /// Never reviewed.
    New,
    /// Short fixed intervals (first two passes).
    Learning,
    /// Ease-factor driven intervals.
    Review,
    /// Failed out of review, relearning.
    Lapsed,
}

impl CardPhase {
    /// Get display name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Learning => "Learning",
            Self::Review => "Review",
            Self::Lapsed => "Lapsed",
        }
    }
}

/// Scheduling state for one learner/card pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CardSchedule {
    /// Card ID.
    pub card_id: CardId,
    /// Consecutive passing reviews since the last failure.
    pub repetition_count: u32,
    /// Days until the next review.
    pub interval_days: u32,
    /// Interval multiplier, never below [`MIN_EASE`].
    pub ease_factor: f64,
    /// When the card becomes eligible again.
    pub due_at: DateTime<Utc>,
    /// Last grading instant, `None` for a new card.
    pub last_reviewed_at: Option<DateTime<Utc>>,
    /// Last grade received.
    pub last_quality: Option<Quality>,
    /// Failures from the review phase.
    pub lapses: u32,
    /// Review that produced this state.
    pub last_review_id: Option<ReviewId>,
    /// Bumped on every committed review; used for optimistic concurrency.
    pub revision: u64,
}

impl CardSchedule {
    /// Default state on first exposure: due immediately.
    pub fn new(card_id: impl Into<CardId>, now: DateTime<Utc>) -> Self {
        Self::with_ease(card_id, INITIAL_EASE, now)
    }

    /// Default state with a custom starting ease.
    pub fn with_ease(card_id: impl Into<CardId>, ease_factor: f64, now: DateTime<Utc>) -> Self {
        Self {
            card_id: card_id.into(),
            repetition_count: 0,
            interval_days: 0,
            ease_factor,
            due_at: now,
            last_reviewed_at: None,
            last_quality: None,
            lapses: 0,
            last_review_id: None,
            revision: 0,
        }
    }

    /// Whether the card has never been graded.
    pub fn is_new(&self) -> bool {
        self.last_reviewed_at.is_none()
    }

    /// Whether a reviewed card is due at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.is_new() && self.due_at <= now
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> CardPhase {
        match self.last_reviewed_at {
            None => CardPhase::New,
            Some(_) if self.repetition_count == 0 && self.lapses > 0 => CardPhase::Lapsed,
            Some(_) if self.repetition_count < 2 => CardPhase::Learning,
            Some(_) => CardPhase::Review,
        }
    }
}

/// Per-learner quota state.
///
/// The working set is not part of this record; it is derived from stored
/// due timestamps on every access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerQueueState {
    /// Learner ID.
    pub learner_id: LearnerId,
    /// Target completions per day.
    pub daily_goal: u32,
    /// Completions on `activity_day`.
    pub completed_today: u32,
    /// Calendar day of the last recorded activity.
    pub activity_day: Option<NaiveDate>,
}

impl LearnerQueueState {
    /// Fresh state with nothing completed.
    pub fn new(learner_id: impl Into<LearnerId>, daily_goal: u32) -> Self {
        Self {
            learner_id: learner_id.into(),
            daily_goal,
            completed_today: 0,
            activity_day: None,
        }
    }

    /// State as seen on `today`: the counter restarts once the day changes.
    pub fn rolled_over(&self, today: NaiveDate) -> Self {
        if self.activity_day == Some(today) {
            return self.clone();
        }
        Self {
            learner_id: self.learner_id.clone(),
            daily_goal: self.daily_goal,
            completed_today: 0,
            activity_day: Some(today),
        }
    }

    /// State after one review on `today`; `counted` adds a completion.
    pub fn record(&self, today: NaiveDate, counted: bool) -> Self {
        let mut next = self.rolled_over(today);
        if counted {
            next.completed_today += 1;
        }
        next
    }

    /// Completions still needed to reach the goal.
    pub fn remaining(&self) -> u32 {
        self.daily_goal.saturating_sub(self.completed_today)
    }

    /// Whether the goal is met.
    pub fn goal_reached(&self) -> bool {
        self.completed_today >= self.daily_goal
    }
}

/// A logged review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    /// Unique identifier.
    pub id: ReviewId,
    /// Learner who graded.
    pub learner_id: LearnerId,
    /// Card that was reviewed.
    pub card_id: CardId,
    /// Grade given.
    pub quality: Quality,
    /// Interval scheduled by this review.
    pub interval_days: u32,
    /// Ease factor after this review.
    pub ease_factor: f64,
    /// When the review occurred.
    pub reviewed_at: DateTime<Utc>,
}

impl Review {
    /// Log entry for a review that produced `schedule`.
    pub fn new(
        id: ReviewId,
        learner_id: impl Into<LearnerId>,
        quality: Quality,
        schedule: &CardSchedule,
        reviewed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            learner_id: learner_id.into(),
            card_id: schedule.card_id.clone(),
            quality,
            interval_days: schedule.interval_days,
            ease_factor: schedule.ease_factor,
            reviewed_at,
        }
    }
}

/// Result of a submitted review, returned to the front-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    /// Graded card.
    pub card_id: CardId,
    /// Next review time.
    pub due_at: DateTime<Utc>,
    /// Consecutive passes.
    pub repetition_count: u32,
    /// Days until the next review.
    pub interval_days: u32,
    /// Ease factor after the grade.
    pub ease_factor: f64,
    /// Phase after the grade.
    pub phase: CardPhase,
    /// Completions still needed today.
    pub remaining_today: u32,
}

/// Per-learner card statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearnerStats {
    /// Total cards.
    pub total: usize,
    /// Never reviewed.
    pub new: usize,
    /// In learning.
    pub learning: usize,
    /// In review.
    pub review: usize,
    /// Lapsed and relearning.
    pub lapsed: usize,
    /// Reviewed cards due now.
    pub due: usize,
}

impl LearnerStats {
    /// Tally a set of card states.
    pub fn from_schedules<'a>(
        schedules: impl IntoIterator<Item = &'a CardSchedule>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut stats = Self::default();
        for schedule in schedules {
            stats.total += 1;
            match schedule.phase() {
                CardPhase::New => stats.new += 1,
                CardPhase::Learning => stats.learning += 1,
                CardPhase::Review => stats.review += 1,
                CardPhase::Lapsed => stats.lapsed += 1,
            }
            if schedule.is_due(now) {
                stats.due += 1;
            }
        }
        stats
    }
}

/// Progress against the daily goal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyStats {
    /// Distinct cards reviewed today.
    pub learned_today: u32,
    /// Target completions per day.
    pub daily_goal: u32,
    /// Completions still needed today.
    pub remaining_today: u32,
    /// Never-reviewed cards waiting.
    pub new_available: usize,
    /// Whether today's goal is met.
    pub goal_reached: bool,
    /// New cards remain and the goal is not met yet.
    pub can_learn_more: bool,
}

/// Human-readable interval ("1 day", "2 wk 3 d", ...).
pub fn format_interval(days: u32) -> String {
    fn split(days: u32, unit: u32, label: &str) -> String {
        let (whole, rest) = (days / unit, days % unit);
        if rest == 0 {
            format!("{whole} {label}")
        } else {
            format!("{whole} {label} {rest} d")
        }
    }

    match days {
        1 => "1 day".to_string(),
        0..=6 => format!("{days} days"),
        7..=29 => split(days, 7, "wk"),
        30..=364 => split(days, 30, "mo"),
        _ => split(days, 365, "yr"),
    }
}
