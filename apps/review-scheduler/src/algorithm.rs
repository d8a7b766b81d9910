//! SM-2 spaced repetition engine.

use crate::models::{CardSchedule, Quality, INITIAL_EASE, MIN_EASE};
use chrono::{DateTime, Duration, Utc};

/// Default ceiling for a review interval (about a century).
pub const MAX_INTERVAL_DAYS: u32 = 36_500;

/// SM-2 algorithm (SuperMemo 2).
///
/// `update` is a pure function of its inputs and is safe to call from any
/// number of threads.
#[derive(Debug, Clone, PartialEq)]
pub struct Sm2 {
    /// Ease factor of a new card.
    pub initial_ease: f64,
    /// Minimum ease factor.
    pub min_ease: f64,
    /// Interval after the first pass.
    pub first_interval_days: u32,
    /// Interval after the second consecutive pass.
    pub second_interval_days: u32,
    /// Interval after a failing grade.
    pub relearn_interval_days: u32,
    /// Ceiling for any interval.
    pub max_interval_days: u32,
}

impl Default for Sm2 {
    fn default() -> Self {
        Self {
            initial_ease: INITIAL_EASE,
            min_ease: MIN_EASE,
            first_interval_days: 1,
            second_interval_days: 6,
            relearn_interval_days: 1,
            max_interval_days: MAX_INTERVAL_DAYS,
        }
    }
}

impl Sm2 {
    /// Algorithm name.
    pub fn name(&self) -> &str {
        "SM-2"
    }

    /// Schedule for a card on first exposure.
    pub fn initial_schedule(&self, card_id: &str, now: DateTime<Utc>) -> CardSchedule {
        CardSchedule::with_ease(card_id, self.initial_ease, now)
    }

    /// Ease factor after a grade, clamped to the floor and kept at two decimals.
    pub fn next_ease(&self, ease_factor: f64, quality: Quality) -> f64 {
        let miss = f64::from(Quality::MAX - quality.value());
        let ease = ease_factor + (0.1 - miss * (0.08 + miss * 0.02));
        ((ease * 100.0).round() / 100.0).max(self.min_ease)
    }

    /// Apply one graded review.
    ///
    /// The ease factor is adjusted first and the adjusted value drives the
    /// interval growth. Intervals round to whole days, ties upward, and
    /// never exceed `max_interval_days`.
    pub fn update(&self, schedule: &CardSchedule, quality: Quality, now: DateTime<Utc>) -> CardSchedule {
        let ease_factor = self.next_ease(schedule.ease_factor, quality);

        let (repetition_count, interval_days, lapses) = if quality.is_pass() {
            let interval = match schedule.repetition_count {
                0 => self.first_interval_days,
                1 => self.second_interval_days,
                _ => {
                    let previous = schedule.interval_days.max(1);
                    let grown = (f64::from(previous) * ease_factor).round();
                    grown.min(f64::from(self.max_interval_days)) as u32
                }
            };
            (
                schedule.repetition_count.saturating_add(1),
                interval.min(self.max_interval_days),
                schedule.lapses,
            )
        } else {
            let lapses = if schedule.repetition_count >= 2 {
                schedule.lapses + 1
            } else {
                schedule.lapses
            };
            (0, self.relearn_interval_days.min(self.max_interval_days), lapses)
        };

        CardSchedule {
            card_id: schedule.card_id.clone(),
            repetition_count,
            interval_days,
            ease_factor,
            due_at: now
                .checked_add_signed(Duration::days(i64::from(interval_days)))
                .unwrap_or(DateTime::<Utc>::MAX_UTC),
            last_reviewed_at: Some(now),
            last_quality: Some(quality),
            lapses,
            last_review_id: schedule.last_review_id,
            revision: schedule.revision,
        }
    }
}
