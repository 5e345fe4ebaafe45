//! Core data model shared across the pipeline: [`StoryTask`] and [`RetryDecision`].
//!
//! Grounded in `root/app/models/fanfic_info.py` (`FanficInfo`) and
//! `models/retry_types.py` from the original Python implementation.

use std::fmt;

/// Single-shot escalation flag threaded through a [`StoryTask`].
///
/// Currently the only behavior is `Force`, set when the downloader invoker
/// reports a "forceable" condition and consumed by the next attempt's
/// argument vector and retry-policy call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Force,
}

/// A unit of work flowing through the pipeline.
///
/// Equality and hashing are defined over `(url, site, library_id)` only,
/// matching `FanficInfo.__eq__`/`__hash__` in the original — `repeats`,
/// `behavior`, `title`, and `retry_decision` are mutable processing state,
/// not identity.
#[derive(Debug, Clone)]
pub struct StoryTask {
    pub url: String,
    pub site: String,
    pub library_id: Option<String>,
    pub title: Option<String>,
    pub behavior: Option<Behavior>,
    pub repeats: u32,
    pub retry_decision: Option<RetryDecision>,
}

impl StoryTask {
    /// Creates a freshly-discovered task with no retry history.
    #[must_use]
    pub fn new(url: impl Into<String>, site: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            site: site.into(),
            library_id: None,
            title: None,
            behavior: None,
            repeats: 0,
            retry_decision: None,
        }
    }

    /// True if this task's last downloader attempt was short-circuited for
    /// `force` requested against an `update_no_force` library.
    #[must_use]
    pub fn is_force_with_no_force(&self, update_method: crate::config::UpdateMethod) -> bool {
        self.behavior == Some(Behavior::Force)
            && update_method == crate::config::UpdateMethod::UpdateNoForce
    }
}

impl PartialEq for StoryTask {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url && self.site == other.site && self.library_id == other.library_id
    }
}
impl Eq for StoryTask {}

impl std::hash::Hash for StoryTask {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.url.hash(state);
        self.site.hash(state);
        self.library_id.hash(state);
    }
}

impl fmt::Display for StoryTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.url, self.site)
    }
}

/// The three outcomes the retry policy can reach for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    HailMary,
    Abandon,
}

/// Value object produced exactly once per failed attempt by the retry policy,
/// stored on the task, and consumed exactly once by the retry scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryDecision {
    pub action: RetryAction,
    pub delay_minutes: f64,
    pub should_notify: bool,
    pub notification_message: String,
}

impl RetryDecision {
    #[must_use]
    pub fn retry(delay_minutes: f64) -> Self {
        Self {
            action: RetryAction::Retry,
            delay_minutes,
            should_notify: false,
            notification_message: String::new(),
        }
    }

    #[must_use]
    pub fn hail_mary(delay_minutes: f64, message: impl Into<String>) -> Self {
        Self {
            action: RetryAction::HailMary,
            delay_minutes,
            should_notify: true,
            notification_message: message.into(),
        }
    }

    #[must_use]
    pub fn abandon(message: impl Into<String>) -> Self {
        Self {
            action: RetryAction::Abandon,
            delay_minutes: 0.0,
            should_notify: true,
            notification_message: message.into(),
        }
    }
}
