//! End-to-end queue behavior through the public API.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use review_scheduler::{
    CardId, CardPhase, CardSchedule, LearnerQueueState, MemoryStore, QueueManager, QueueSettings,
    Review, ReviewCommit, ReviewStore, SchedulerError, SchedulerResult, Sm2, SqliteStore,
};
use uuid::Uuid;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

fn day(n: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 10, 0, 0).unwrap() + Duration::days(n)
}

async fn memory_manager(goal: u32, cards: &[&str]) -> QueueManager<MemoryStore> {
    let manager = QueueManager::with_defaults(MemoryStore::new());
    manager.register_learner("42", goal).await.unwrap();
    for card in cards {
        manager.introduce_card("42", card, day(0)).await.unwrap();
    }
    manager
}

#[tokio::test]
async fn test_interval_sequence_at_daily_reviews() {
    let manager = memory_manager(10, &["steady", "eager"]).await;

    let mut steady = Vec::new();
    let mut eager = Vec::new();
    for (i, (a, b)) in [(4, 5), (4, 5), (4, 4)].into_iter().enumerate() {
        let now = day(i as i64);
        steady.push(manager.submit_review("42", "steady", a, now).await.unwrap());
        eager.push(manager.submit_review("42", "eager", b, now).await.unwrap());
    }

    let intervals = |v: &[review_scheduler::ReviewOutcome]| v.iter().map(|o| o.interval_days).collect::<Vec<_>>();
    assert_eq!(intervals(&steady), vec![1, 6, 15]);
    assert_eq!(steady[2].ease_factor, 2.5);
    assert_eq!(intervals(&eager), vec![1, 6, 16]);
    assert_eq!(eager[2].due_at, day(2) + Duration::days(16));
    assert_eq!(eager[2].phase, CardPhase::Review);
}

#[tokio::test]
async fn test_overdue_cards_always_come_first() {
    let manager = memory_manager(10, &["a", "b", "c", "d"]).await;
    manager.submit_review("42", "a", 4, day(0)).await.unwrap();
    manager.submit_review("42", "b", 1, day(0)).await.unwrap();
    // b is due tomorrow, a too; c gets a 1-day interval from day 1
    manager.submit_review("42", "c", 3, day(1)).await.unwrap();

    let now = day(5);
    let set = manager.working_set("42", now).await.unwrap();
    assert_eq!(set, vec!["a", "b", "c", "d"]);

    for card in &set[..3] {
        let state = manager.store().load_card_state("42", card).await.unwrap().unwrap();
        assert!(state.due_at <= now);
    }
    assert_eq!(manager.next_card("42", now).await.unwrap().as_deref(), Some("a"));
}

#[tokio::test]
async fn test_empty_when_goal_met_and_nothing_due() {
    let manager = memory_manager(1, &["a", "b"]).await;
    assert_eq!(manager.next_card("42", day(0)).await.unwrap().as_deref(), Some("a"));
    manager.submit_review("42", "a", 5, day(0)).await.unwrap();

    assert_eq!(manager.next_card("42", day(0)).await.unwrap(), None);
    // next day the quota is back and the reviewed card is due
    assert_eq!(manager.working_set("42", day(1)).await.unwrap(), vec!["a", "b"]);
}

#[tokio::test]
async fn test_remaining_is_non_increasing_within_a_day() {
    let manager = memory_manager(3, &["a", "b", "c", "d"]).await;
    let mut last = manager.remaining_today("42", day(0)).await.unwrap();
    assert_eq!(last, 3);
    for (i, card) in ["a", "b", "a", "c", "d"].into_iter().enumerate() {
        let now = day(0) + Duration::minutes(i as i64 * 10);
        manager.submit_review("42", card, 4, now).await.unwrap();
        let remaining = manager.remaining_today("42", now).await.unwrap();
        assert!(remaining <= last);
        last = remaining;
    }
    assert_eq!(last, 0);
    assert_eq!(manager.remaining_today("42", day(1)).await.unwrap(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reviews_of_one_card_are_not_lost() {
    let manager = Arc::new(memory_manager(5, &["a"]).await);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit_review("42", "a", 5, day(0)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let state = manager.store().load_card_state("42", "a").await.unwrap().unwrap();
    assert_eq!(state.repetition_count, 8);
    assert_eq!(state.revision, 8);
    assert_eq!(manager.reviews("42").await.unwrap().len(), 8);
    // counted once for the day
    assert_eq!(manager.remaining_today("42", day(0)).await.unwrap(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reviews_on_sqlite() {
    let manager = Arc::new(QueueManager::with_defaults(SqliteStore::in_memory().unwrap()));
    manager.register_learner("42", 5).await.unwrap();
    manager.introduce_card("42", "a", day(0)).await.unwrap();
    manager.introduce_card("42", "b", day(0)).await.unwrap();

    let handles: Vec<_> = [("a", 5), ("a", 1), ("b", 4), ("a", 4), ("b", 4)]
        .into_iter()
        .map(|(card, grade)| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit_review("42", card, grade, day(0)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let a = manager.store().load_card_state("42", "a").await.unwrap().unwrap();
    let b = manager.store().load_card_state("42", "b").await.unwrap().unwrap();
    assert_eq!(a.revision, 3);
    assert_eq!(b.revision, 2);
    assert_eq!(b.repetition_count, 2);
    assert_eq!(manager.reviews("42").await.unwrap().len(), 5);
}

/// Review `cards` concurrently and check that every distinct card counted.
async fn review_distinct_cards_concurrently<S: ReviewStore + 'static>(manager: QueueManager<S>) {
    let cards = ["a", "b", "c", "d"];
    manager.register_learner("42", 6).await.unwrap();
    for card in cards {
        manager.introduce_card("42", card, day(0)).await.unwrap();
    }
    let manager = Arc::new(manager);

    let handles: Vec<_> = cards
        .into_iter()
        .map(|card| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.submit_review("42", card, 4, day(0)).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(manager.remaining_today("42", day(0)).await.unwrap(), 2);
    assert_eq!(manager.daily_stats("42", day(0)).await.unwrap().learned_today, 4);
    assert_eq!(manager.reviews("42").await.unwrap().len(), 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reviews_of_distinct_cards_all_count() {
    review_distinct_cards_concurrently(QueueManager::with_defaults(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reviews_of_distinct_cards_on_sqlite() {
    review_distinct_cards_concurrently(QueueManager::with_defaults(SqliteStore::in_memory().unwrap())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_interleaved_learner_reads_do_not_lose_counts() {
    // every review reads the learner record before any of them commits
    let store = FaultyStore::default();
    store.pause_learner_reads.store(true, Ordering::SeqCst);
    review_distinct_cards_concurrently(QueueManager::with_defaults(store)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_goal_change_during_reviews_is_kept() {
    let store = FaultyStore::default();
    store.pause_learner_reads.store(true, Ordering::SeqCst);
    let manager = Arc::new(QueueManager::with_defaults(store));
    manager.register_learner("42", 5).await.unwrap();
    manager.introduce_card("42", "a", day(0)).await.unwrap();

    let reviewer = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.submit_review("42", "a", 4, day(0)).await })
    };
    manager.set_daily_goal("42", 8).await.unwrap();
    reviewer.await.unwrap().unwrap();

    let stats = manager.daily_stats("42", day(0)).await.unwrap();
    assert_eq!(stats.daily_goal, 8);
    assert_eq!(stats.learned_today, 1);
}

#[tokio::test]
async fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("reviews.db");

    let before = {
        let manager = QueueManager::with_defaults(SqliteStore::open(&path).unwrap());
        manager.register_learner("42", 2).await.unwrap();
        for card in ["a", "b", "c"] {
            manager.introduce_card("42", card, day(0)).await.unwrap();
        }
        manager.submit_review("42", "a", 4, day(0)).await.unwrap();
        manager.store().load_card_state("42", "a").await.unwrap().unwrap()
    };

    let manager = QueueManager::with_defaults(SqliteStore::open(&path).unwrap());
    let after = manager.store().load_card_state("42", "a").await.unwrap().unwrap();
    assert_eq!(after, before);
    assert_eq!(manager.remaining_today("42", day(0)).await.unwrap(), 1);
    assert_eq!(manager.working_set("42", day(0)).await.unwrap(), vec!["b"]);
    assert_eq!(manager.working_set("42", day(1)).await.unwrap(), vec!["a", "b", "c"]);
}

/// Delegating store that injects storage faults.
#[derive(Default)]
struct FaultyStore {
    inner: MemoryStore,
    slow_reads: AtomicBool,
    pause_learner_reads: AtomicBool,
    conflicts: AtomicU32,
    slow_after_commit: AtomicU32,
    slow_reads_after_commit: AtomicU32,
}

impl FaultyStore {
    async fn maybe_stall(&self) {
        if self.slow_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }
    }

    fn take(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ReviewStore for FaultyStore {
    async fn insert_learner(&self, state: &LearnerQueueState) -> SchedulerResult<bool> {
        self.inner.insert_learner(state).await
    }

    async fn load_learner_state(&self, learner_id: &str) -> SchedulerResult<Option<LearnerQueueState>> {
        self.maybe_stall().await;
        let state = self.inner.load_learner_state(learner_id).await;
        if self.pause_learner_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        }
        state
    }

    async fn save_learner_state(&self, state: &LearnerQueueState) -> SchedulerResult<()> {
        self.inner.save_learner_state(state).await
    }

    async fn save_daily_goal(&self, learner_id: &str, daily_goal: u32) -> SchedulerResult<LearnerQueueState> {
        self.inner.save_daily_goal(learner_id, daily_goal).await
    }

    async fn insert_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<bool> {
        self.inner.insert_card_state(learner_id, state).await
    }

    async fn load_card_state(&self, learner_id: &str, card_id: &str) -> SchedulerResult<Option<CardSchedule>> {
        self.inner.load_card_state(learner_id, card_id).await
    }

    async fn save_card_state(&self, learner_id: &str, state: &CardSchedule) -> SchedulerResult<()> {
        self.inner.save_card_state(learner_id, state).await
    }

    async fn list_due_cards(
        &self,
        learner_id: &str,
        as_of: DateTime<Utc>,
    ) -> SchedulerResult<Vec<(CardId, DateTime<Utc>)>> {
        self.inner.list_due_cards(learner_id, as_of).await
    }

    async fn list_new_cards(&self, learner_id: &str) -> SchedulerResult<Vec<CardId>> {
        self.inner.list_new_cards(learner_id).await
    }

    async fn list_card_states(&self, learner_id: &str) -> SchedulerResult<Vec<CardSchedule>> {
        self.inner.list_card_states(learner_id).await
    }

    async fn commit_review(&self, commit: &ReviewCommit) -> SchedulerResult<LearnerQueueState> {
        if Self::take(&self.conflicts) {
            return Err(SchedulerError::Conflict("injected".to_string()));
        }
        let learner = self.inner.commit_review(commit).await?;
        if Self::take(&self.slow_reads_after_commit) {
            self.slow_reads.store(true, Ordering::SeqCst);
        }
        if Self::take(&self.slow_after_commit) || self.slow_reads.load(Ordering::SeqCst) {
            tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        }
        Ok(learner)
    }

    async fn list_reviews(&self, learner_id: &str) -> SchedulerResult<Vec<Review>> {
        self.inner.list_reviews(learner_id).await
    }
}

async fn faulty_manager() -> QueueManager<FaultyStore> {
    let settings = QueueSettings {
        storage_timeout: std::time::Duration::from_millis(50),
        ..QueueSettings::default()
    };
    let manager = QueueManager::new(FaultyStore::default(), Sm2::default(), settings);
    manager.register_learner("42", 5).await.unwrap();
    manager.introduce_card("42", "a", day(0)).await.unwrap();
    manager
}

#[tokio::test]
async fn test_single_conflict_is_retried() {
    let manager = faulty_manager().await;
    manager.store().conflicts.store(1, Ordering::SeqCst);

    let outcome = manager.submit_review("42", "a", 4, day(0)).await.unwrap();
    assert_eq!(outcome.repetition_count, 1);
    assert_eq!(manager.reviews("42").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_conflict_is_surfaced() {
    let manager = faulty_manager().await;
    manager.store().conflicts.store(2, Ordering::SeqCst);

    let err = manager.submit_review("42", "a", 4, day(0)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Conflict(_)));
    let state = manager.store().load_card_state("42", "a").await.unwrap().unwrap();
    assert_eq!(state.revision, 0);
    assert!(manager.reviews("42").await.unwrap().is_empty());
    assert_eq!(manager.remaining_today("42", day(0)).await.unwrap(), 5);
}

#[tokio::test]
async fn test_timeout_leaves_state_unchanged() {
    let manager = faulty_manager().await;
    manager.store().slow_reads.store(true, Ordering::SeqCst);

    let err = manager.submit_review("42", "a", 4, day(0)).await.unwrap_err();
    assert!(matches!(err, SchedulerError::Timeout));
    assert!(matches!(
        manager.remaining_today("42", day(0)).await,
        Err(SchedulerError::Timeout)
    ));

    manager.store().slow_reads.store(false, Ordering::SeqCst);
    let state = manager.store().load_card_state("42", "a").await.unwrap().unwrap();
    assert!(state.is_new());
}

#[tokio::test]
async fn test_retry_after_landed_write_does_not_double_apply() {
    let manager = faulty_manager().await;
    manager.store().slow_after_commit.store(1, Ordering::SeqCst);

    let outcome = manager.submit_review("42", "a", 5, day(0)).await.unwrap();
    assert_eq!(outcome.repetition_count, 1);
    assert_eq!(outcome.interval_days, 1);
    assert_eq!(outcome.remaining_today, 4);
    assert_eq!(manager.reviews("42").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_caller_retry_with_same_id_after_timeout() {
    let manager = faulty_manager().await;
    manager.store().slow_reads_after_commit.store(1, Ordering::SeqCst);
    let id = Uuid::new_v4();

    // the write lands, then both attempts run out of time
    let err = manager
        .submit_review_with_id("42", "a", 5, id, day(0))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::Timeout));

    manager.store().slow_reads.store(false, Ordering::SeqCst);
    let outcome = manager
        .submit_review_with_id("42", "a", 5, id, day(0))
        .await
        .unwrap();
    assert_eq!(outcome.repetition_count, 1);
    assert_eq!(outcome.remaining_today, 4);
    assert_eq!(manager.reviews("42").await.unwrap().len(), 1);
}
