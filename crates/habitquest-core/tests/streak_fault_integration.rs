//! Streak behaviour when the cache fails mid check-in.

mod common;

use common::{habit, harness, packet};
use habitquest_core::clock::Clock;
use habitquest_core::{Difficulty, RuleViolation, StreakState};

/// Test: a crash after the counter moved but before the day was recorded
/// over-counts by exactly one on retry.
#[test]
fn test_crash_before_last_checkin_overcounts_by_one() {
    let h = harness();
    let ctx = h.ctx();
    h.engine.register_user(&ctx, 1, "Ayu", "").unwrap();
    let streaks = h.engine.streaks();

    assert_eq!(streaks.check_in(&ctx, 1, h.clock.now()).unwrap().streak, 1);
    h.next_day();

    h.cache.fail_next_write_to(":last_checkin");
    let err = streaks.check_in(&ctx, 1, h.clock.now()).unwrap_err();
    assert!(err.is_infrastructure());
    assert_eq!(streaks.current_streak(&ctx, 1).unwrap(), 2);

    let retry = streaks.check_in(&ctx, 1, h.clock.now()).unwrap();
    assert_eq!(retry.streak, 3, "true streak is 2; one extra day at most");
    assert!(!retry.already_checked_in);

    let again = streaks.check_in(&ctx, 1, h.clock.now()).unwrap();
    assert!(again.already_checked_in);
    assert_eq!(again.streak, 3);
}

/// Test: losing only the flag write is repaired without over-counting.
#[test]
fn test_crash_before_flag_does_not_overcount() {
    let h = harness();
    let ctx = h.ctx();
    h.engine.register_user(&ctx, 1, "Ayu", "").unwrap();
    let streaks = h.engine.streaks();

    streaks.check_in(&ctx, 1, h.clock.now()).unwrap();
    h.next_day();

    h.cache.fail_next_write_to(":checkin_flag");
    assert!(streaks.check_in(&ctx, 1, h.clock.now()).is_err());
    assert_eq!(
        streaks.state(&ctx, 1, h.clock.now()).unwrap(),
        StreakState::CheckedInToday
    );

    let retry = streaks.check_in(&ctx, 1, h.clock.now()).unwrap();
    assert_eq!(retry.streak, 2);
    assert!(streaks.check_in(&ctx, 1, h.clock.now()).unwrap().already_checked_in);
}

/// Test: an unreachable cache surfaces as an infrastructure error.
#[test]
fn test_cache_outage_is_infrastructure() {
    let h = harness();
    let ctx = h.ctx();
    h.engine.register_user(&ctx, 1, "Ayu", "").unwrap();

    h.cache.set_down(true);
    let err = h
        .engine
        .streaks()
        .check_in(&ctx, 1, h.clock.now())
        .unwrap_err();
    assert!(err.is_infrastructure());
    assert!(err.rule().is_none());
    assert_eq!(h.db.profile(1).unwrap().unwrap().longest_streak, 0);

    h.cache.set_down(false);
    assert_eq!(
        h.engine
            .streaks()
            .check_in(&ctx, 1, h.clock.now())
            .unwrap()
            .streak,
        1
    );
}

/// Test: a cache outage after the durable commit leaves the task unsettled;
/// retrying finishes the check-in and journal without a second exp gain.
#[test]
fn test_task_completion_resumes_after_cache_outage() {
    let h = harness();
    let ctx = h.ctx();
    h.engine.register_user(&ctx, 1, "Ayu", "").unwrap();
    h.engine
        .create_packet(&ctx, 1, &packet(2, 1, vec![habit("Stretch", Difficulty::Easy)]))
        .unwrap();
    let first = h.engine.assign_daily_tasks(&ctx, 1).unwrap().remove(0);
    h.engine.complete_task(&ctx, 1, first.id).unwrap();

    h.next_day();
    let task = h.engine.assign_daily_tasks(&ctx, 1).unwrap().remove(0);
    h.cache.set_down(true);
    let err = h.engine.complete_task(&ctx, 1, task.id).unwrap_err();
    assert!(err.is_infrastructure());
    h.cache.set_down(false);

    assert!(h.db.task(task.id).unwrap().unwrap().completed);
    assert_eq!(h.db.profile(1).unwrap().unwrap().current_exp, 20);
    assert_eq!(
        h.engine.streaks().state(&ctx, 1, h.clock.now()).unwrap(),
        StreakState::AwaitingToday
    );

    let retry = h.engine.complete_task(&ctx, 1, task.id).unwrap();
    assert_eq!(retry.streak.streak, 2);
    assert!(retry.packet_completed);
    assert!(retry.all_done_today);
    assert_eq!(retry.progress.profile.current_exp, 20);
    assert_eq!(
        h.engine.streaks().state(&ctx, 1, h.clock.now()).unwrap(),
        StreakState::CheckedInToday
    );
    assert!(h
        .journal(1)
        .contains(&"Completed packet Greener mornings with a completion rate of 100%".to_string()));

    let err = h.engine.complete_task(&ctx, 1, task.id).unwrap_err();
    assert_eq!(
        err.rule(),
        Some(&RuleViolation::TaskAlreadyCompleted { task_id: task.id })
    );
    assert_eq!(h.db.profile(1).unwrap().unwrap().current_exp, 20);
}

/// Test: a reward claim that fails at the check-in credits nothing, so the
/// retry credits exactly once.
#[test]
fn test_reward_claim_retry_after_checkin_failure() {
    let h = harness();
    let ctx = h.ctx();
    h.engine.register_user(&ctx, 1, "Ayu", "").unwrap();
    let source = habitquest_core::RewardSource {
        name: "Beach clean-up".into(),
        category: "quest".into(),
        base_points: 100,
    };

    h.cache.fail_next_write_to(":streak");
    assert!(h.engine.claim_reward(&ctx, 1, &source).unwrap_err().is_infrastructure());
    assert_eq!(h.db.profile(1).unwrap().unwrap().points, 0);
    assert!(h.db.history(1).unwrap().is_empty());

    let claim = h.engine.claim_reward(&ctx, 1, &source).unwrap();
    assert_eq!(claim.awarded, 100);
    assert_eq!(claim.streak.streak, 1);
    assert_eq!(h.db.history(1).unwrap().len(), 1);
    assert_eq!(h.engine.leaderboard().score(&ctx, 1).unwrap(), Some(100));
}
