//! Downloader invoker: shells out to the external story-downloader
//! (`fanficfare`-equivalent) and classifies its combined output.
//!
//! Grounded in `root/app/workers/command.py::construct_fanficfare_command`
//! and `execute_command`. The two output regex families (permanent-failure,
//! forceable) are compiled once at construction.

use std::path::Path;
use std::process::Stdio;

use regex::{Regex, RegexSet};
use thiserror::Error;
use tokio::process::Command;
use tracing::instrument;

use crate::config::UpdateMethod;
use crate::model::{Behavior, StoryTask};

#[derive(Debug, Error)]
pub enum DownloaderError {
    #[error("failed to launch downloader for {url}: {source}")]
    Spawn {
        url: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of a single downloader invocation: a typed sum rather than a raw
/// exit code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Success,
    Permanent { reason: String },
    Forceable { reason: String },
    Transient { reason: String },
}

const PERMANENT_PATTERNS: &[&str] = &[
    r"(?i)this story has been removed",
    r"(?i)story not found",
    r"(?i)access denied",
    r"(?i)no such story",
    r"(?i)adult content.*not accessible",
];

const FORCEABLE_PATTERNS: &[&str] = &[
    r"(?i)chapter count.*mismatch",
    r"(?i)story has been updated but not all chapters",
    r"(?i)would overwrite",
];

struct OutputClassifier {
    permanent: RegexSet,
    forceable: Vec<Regex>,
}

impl OutputClassifier {
    fn new() -> Self {
        Self {
            permanent: RegexSet::new(PERMANENT_PATTERNS)
                .expect("static permanent-failure patterns must compile"),
            forceable: FORCEABLE_PATTERNS
                .iter()
                .map(|p| Regex::new(p).expect("static forceable patterns must compile"))
                .collect(),
        }
    }

    fn classify(&self, combined_output: &str, exit_success: bool) -> DownloadOutcome {
        if self.permanent.is_match(combined_output) {
            return DownloadOutcome::Permanent {
                reason: combined_output.to_string(),
            };
        }
        for re in &self.forceable {
            if let Some(m) = re.find(combined_output) {
                return DownloadOutcome::Forceable {
                    reason: m.as_str().to_string(),
                };
            }
        }
        if exit_success {
            DownloadOutcome::Success
        } else {
            DownloadOutcome::Transient {
                reason: combined_output.to_string(),
            }
        }
    }
}

/// Builds and runs the downloader subprocess for a single task.
pub struct DownloaderInvoker {
    classifier: OutputClassifier,
}

impl Default for DownloaderInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl DownloaderInvoker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            classifier: OutputClassifier::new(),
        }
    }

    /// Builds the `fanficfare` argument vector for `task`, keyed by
    /// `(update_method, behavior)`. `path_or_url` is the final positional
    /// argument: the exported `.epub` path when the story already exists in
    /// the library, otherwise the story's URL.
    #[must_use]
    pub fn build_args(&self, task: &StoryTask, update_method: UpdateMethod, path_or_url: &str, verbose: bool) -> Vec<String> {
        let mut args = Vec::new();

        let is_force_behavior =
            task.behavior == Some(Behavior::Force) && update_method != UpdateMethod::UpdateNoForce;

        if update_method == UpdateMethod::UpdateAlways && !is_force_behavior {
            args.push("-U".to_string());
        } else if update_method == UpdateMethod::Force || is_force_behavior {
            args.push("-u".to_string());
            args.push("--force".to_string());
        } else {
            args.push("-u".to_string());
        }

        args.push("--update-cover".to_string());
        args.push("--non-interactive".to_string());
        if verbose {
            args.push("--debug".to_string());
        }

        args.push(path_or_url.to_string());
        args
    }

    /// Runs the downloader for `task` inside `work_dir`, returning the
    /// classified outcome.
    #[instrument(skip(self), fields(url = %task.url, site = %task.site))]
    pub async fn run(
        &self,
        task: &StoryTask,
        update_method: UpdateMethod,
        path_or_url: &str,
        verbose: bool,
        work_dir: &Path,
    ) -> Result<DownloadOutcome, DownloaderError> {
        let args = self.build_args(task, update_method, path_or_url, verbose);

        let output = Command::new("fanficfare")
            .args(&args)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|source| DownloaderError::Spawn {
                url: task.url.clone(),
                source,
            })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push('\n');
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        Ok(self.classifier.classify(&combined, output.status.success()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> StoryTask {
        StoryTask::new("https://www.fanfiction.net/s/1/1/", "fanfiction")
    }

    #[test]
    fn build_args_adds_update_flag_and_appends_standard_flags() {
        let invoker = DownloaderInvoker::new();
        let args = invoker.build_args(&task(), UpdateMethod::Update, &task().url, false);
        assert!(args.contains(&"-u".to_string()));
        assert!(args.contains(&"--update-cover".to_string()));
        assert!(args.contains(&"--non-interactive".to_string()));
        assert!(!args.contains(&"--debug".to_string()));
        assert_eq!(args.last().unwrap(), &task().url);
    }

    #[test]
    fn build_args_adds_debug_flag_when_verbose() {
        let invoker = DownloaderInvoker::new();
        let args = invoker.build_args(&task(), UpdateMethod::Update, &task().url, true);
        assert!(args.contains(&"--debug".to_string()));
    }

    #[test]
    fn build_args_adds_force_flag_when_behavior_force() {
        let invoker = DownloaderInvoker::new();
        let mut t = task();
        t.behavior = Some(Behavior::Force);
        let args = invoker.build_args(&t, UpdateMethod::Update, &t.url.clone(), false);
        assert!(args.contains(&"-u".to_string()));
        assert!(args.contains(&"--force".to_string()));
    }

    #[test]
    fn build_args_force_behavior_overrides_update_always_with_dash_u() {
        let invoker = DownloaderInvoker::new();
        let mut t = task();
        t.behavior = Some(Behavior::Force);
        let args = invoker.build_args(&t, UpdateMethod::UpdateAlways, &t.url.clone(), false);
        assert!(args.contains(&"-u".to_string()));
        assert!(args.contains(&"--force".to_string()));
        assert!(!args.contains(&"-U".to_string()));
    }

    #[test]
    fn build_args_update_always_without_force_uses_dash_cap_u() {
        let invoker = DownloaderInvoker::new();
        let args = invoker.build_args(&task(), UpdateMethod::UpdateAlways, &task().url, false);
        assert!(args.contains(&"-U".to_string()));
        assert!(!args.contains(&"--force".to_string()));
    }

    #[test]
    fn build_args_suppresses_force_under_update_no_force() {
        let invoker = DownloaderInvoker::new();
        let mut t = task();
        t.behavior = Some(Behavior::Force);
        let args = invoker.build_args(&t, UpdateMethod::UpdateNoForce, &t.url.clone(), false);
        assert!(!args.contains(&"--force".to_string()));
        assert!(args.contains(&"-u".to_string()));
    }

    #[test]
    fn build_args_uses_epub_path_as_final_argument_when_provided() {
        let invoker = DownloaderInvoker::new();
        let args = invoker.build_args(&task(), UpdateMethod::Update, "/tmp/story/My Story.epub", false);
        assert_eq!(args.last().unwrap(), "/tmp/story/My Story.epub");
    }

    #[test]
    fn classifies_permanent_failure() {
        let c = OutputClassifier::new();
        let outcome = c.classify("Error: Story Not Found (code 404)", false);
        assert!(matches!(outcome, DownloadOutcome::Permanent { .. }));
    }

    #[test]
    fn classifies_forceable_condition() {
        let c = OutputClassifier::new();
        let outcome = c.classify("Chapter count mismatch, not updating", false);
        assert!(matches!(outcome, DownloadOutcome::Forceable { .. }));
    }

    #[test]
    fn classifies_transient_on_unmatched_failure() {
        let c = OutputClassifier::new();
        let outcome = c.classify("connection reset by peer", false);
        assert!(matches!(outcome, DownloadOutcome::Transient { .. }));
    }

    #[test]
    fn classifies_success() {
        let c = OutputClassifier::new();
        let outcome = c.classify("Update complete", true);
        assert_eq!(outcome, DownloadOutcome::Success);
    }
}
