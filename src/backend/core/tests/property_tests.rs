//! Property tests for cooldown and eligibility invariants.

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use reindex_core::error::ErrorCode;
use reindex_core::jobs::{
    CooldownPolicy, QueueStatus, ReindexScope, ReindexTask, RetryMode, RetryQueue, TaskOutcome,
};
use std::time::Duration;

fn failed_task(scope: ReindexScope, at: chrono::DateTime<Utc>) -> ReindexTask {
    let mut task = ReindexTask::new(scope, "prop", at);
    task.start(at).unwrap();
    task.finish(TaskOutcome::failure("E"), at).unwrap();
    task
}

proptest! {
    #[test]
    fn cooldown_is_monotonic_and_bounded(
        base_secs in 1u64..600,
        max_secs in 1u64..86_400,
        attempts in 0u32..64,
    ) {
        let policy = CooldownPolicy::new(Duration::from_secs(base_secs), Duration::from_secs(max_secs));
        let current = policy.next_cooldown(attempts);
        let next = policy.next_cooldown(attempts + 1);

        prop_assert!(current <= next);
        prop_assert!(next <= policy.max());
        prop_assert!(current >= policy.base().min(policy.max()));
    }

    #[test]
    fn jitter_never_exceeds_max(
        base_secs in 1u64..600,
        attempts in 0u32..16,
        factor in 0.0f64..1.0,
    ) {
        let policy = CooldownPolicy::new(Duration::from_secs(base_secs), Duration::from_secs(1800))
            .with_jitter(factor);
        let delay = policy.jittered_cooldown(attempts);
        prop_assert!(delay >= policy.next_cooldown(attempts));
        prop_assert!(delay <= policy.max());
    }

    #[test]
    fn auto_entries_never_exceed_budget(
        max_attempts in 1u32..6,
        steps in proptest::collection::vec(0i64..600, 1..40),
    ) {
        let queue = RetryQueue::new(
            CooldownPolicy::new(Duration::from_secs(30), Duration::from_secs(300)),
            max_attempts,
        );
        let scope = ReindexScope::sources(["filings"]).unwrap();
        let mut now = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let queue_id = queue
            .enqueue(&failed_task(scope.clone(), now), RetryMode::Auto, now)
            .unwrap()
            .entry
            .queue_id;

        for step in steps {
            now += ChronoDuration::seconds(step);
            let before = queue.get(queue_id).unwrap();
            let was_eligible = before.is_eligible(now);

            match queue.claim(queue_id, "prop", None, false, now) {
                Ok(claim) => {
                    prop_assert!(was_eligible);
                    prop_assert_eq!(claim.entry.status, QueueStatus::Running);
                    let retry = failed_task(scope.clone(), now);
                    queue.record_retry_failure(queue_id, &retry, now).unwrap();
                }
                Err(e) => {
                    prop_assert_eq!(e.code(), ErrorCode::NotEligible);
                }
            }

            let entry = queue.get(queue_id).unwrap();
            prop_assert!(entry.attempts <= entry.max_attempts);
            if entry.attempts == entry.max_attempts {
                prop_assert!(!entry.is_eligible(now + ChronoDuration::days(365)));
            }
        }
    }

    #[test]
    fn scope_label_is_order_insensitive(keys in proptest::collection::vec("[a-z]{1,8}", 1..6)) {
        let forward = ReindexScope::sources(keys.iter()).unwrap();
        let reversed = ReindexScope::sources(keys.iter().rev()).unwrap();
        prop_assert_eq!(forward.label(), reversed.label());
        prop_assert!(forward.overlaps(&reversed));
    }
}
