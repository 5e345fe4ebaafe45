//! Retry policy: a pure function deciding what happens to a task after a
//! failed download/update attempt.
//!
//! Grounded in `root/app/models/config_models.py`'s `RetryConfig`
//! (`hail_mary_enabled`, `hail_mary_wait_hours`, `max_normal_retries`).

use crate::config::{RetryConfig, UpdateMethod};
use crate::model::{RetryAction, RetryDecision, StoryTask};

/// Decides the next action for `task` after a failed attempt.
///
/// Exponential backoff is `60 * 2^(repeats - 1)` seconds, capped at the
/// configured Hail-Mary wait. The Hail-Mary escalation fires exactly once, at
/// the first attempt that crosses `max_normal_retries` — every attempt after
/// that (once `task.retry_decision` already records a Hail-Mary) is abandoned
/// rather than retried again.
#[must_use]
pub fn decide(task: &StoryTask, retry_cfg: &RetryConfig, update_method: UpdateMethod) -> RetryDecision {
    if task.is_force_with_no_force(update_method) {
        return RetryDecision::abandon(format!(
            "{task} requires forcing an update but the library is configured for update_no_force; permanently skipped"
        ));
    }

    let already_hail_maried = matches!(
        task.retry_decision,
        Some(RetryDecision {
            action: RetryAction::HailMary,
            ..
        })
    );
    if already_hail_maried {
        return RetryDecision::abandon(format!("{task} exhausted its Hail-Mary attempt"));
    }

    let next_repeats = task.repeats + 1;
    let hail_mary_wait_minutes = retry_cfg.hail_mary_wait_minutes();

    if next_repeats > retry_cfg.max_normal_retries {
        return if retry_cfg.hail_mary_enabled {
            RetryDecision::hail_mary(
                hail_mary_wait_minutes,
                format!(
                    "{task} failed {} times, making one last attempt in {:.1} hours",
                    task.repeats, retry_cfg.hail_mary_wait_hours
                ),
            )
        } else {
            RetryDecision::abandon(format!(
                "{task} failed {} times and Hail-Mary retries are disabled",
                task.repeats
            ))
        };
    }

    let delay_seconds = 60.0 * 2f64.powi(i32::try_from(next_repeats).unwrap_or(i32::MAX) - 1);
    let delay_seconds = delay_seconds.min(hail_mary_wait_minutes * 60.0);
    RetryDecision::retry(delay_seconds / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn retry_cfg() -> RetryConfig {
        RetryConfig {
            hail_mary_enabled: true,
            hail_mary_wait_hours: 12.0,
            max_normal_retries: 3,
        }
    }

    #[test]
    fn first_failure_retries_with_one_minute_delay() {
        let task = StoryTask::new("https://example.com/s/1", "fanfiction");
        let decision = decide(&task, &retry_cfg(), UpdateMethod::Update);
        assert_eq!(decision.action, RetryAction::Retry);
        assert!((decision.delay_minutes - 1.0).abs() < 1e-9);
    }

    #[test]
    fn second_failure_doubles_delay() {
        let mut task = StoryTask::new("https://example.com/s/1", "fanfiction");
        task.repeats = 1;
        let decision = decide(&task, &retry_cfg(), UpdateMethod::Update);
        assert!((decision.delay_minutes - 2.0).abs() < 1e-9);
    }

    #[test]
    fn crossing_max_normal_retries_triggers_hail_mary() {
        let mut task = StoryTask::new("https://example.com/s/1", "fanfiction");
        task.repeats = 3; // next_repeats = 4 > max_normal_retries = 3
        let decision = decide(&task, &retry_cfg(), UpdateMethod::Update);
        assert_eq!(decision.action, RetryAction::HailMary);
        assert!(decision.should_notify);
    }

    #[test]
    fn attempt_after_hail_mary_is_abandoned() {
        let mut task = StoryTask::new("https://example.com/s/1", "fanfiction");
        task.repeats = 4;
        task.retry_decision = Some(RetryDecision::hail_mary(720.0, "prior hail mary"));
        let decision = decide(&task, &retry_cfg(), UpdateMethod::Update);
        assert_eq!(decision.action, RetryAction::Abandon);
    }

    #[test]
    fn hail_mary_disabled_abandons_at_boundary() {
        let mut cfg = retry_cfg();
        cfg.hail_mary_enabled = false;
        let mut task = StoryTask::new("https://example.com/s/1", "fanfiction");
        task.repeats = 3;
        let decision = decide(&task, &cfg, UpdateMethod::Update);
        assert_eq!(decision.action, RetryAction::Abandon);
    }

    #[test]
    fn force_with_no_force_library_abandons_immediately() {
        let mut task = StoryTask::new("https://example.com/s/1", "fanfiction");
        task.behavior = Some(crate::model::Behavior::Force);
        let decision = decide(&task, &retry_cfg(), UpdateMethod::UpdateNoForce);
        assert_eq!(decision.action, RetryAction::Abandon);
    }

    #[test]
    fn delay_is_capped_at_hail_mary_wait() {
        let mut cfg = retry_cfg();
        cfg.max_normal_retries = 50;
        let mut task = StoryTask::new("https://example.com/s/1", "fanfiction");
        task.repeats = 20; // would be an enormous delay uncapped
        let decision = decide(&task, &cfg, UpdateMethod::Update);
        assert_eq!(decision.action, RetryAction::Retry);
        assert!(decision.delay_minutes <= cfg.hail_mary_wait_minutes());
    }
}
