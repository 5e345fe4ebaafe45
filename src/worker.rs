//! Worker: the per-site processing loop that turns a [`StoryTask`] into
//! a downloaded, library-reconciled story (or a retry/abandon decision).
//!
//! Grounded in `root/app/workers/pipeline.py` and `root/app/workers/handlers.py`.
//! Each worker announces idleness back to the coordinator before
//! blocking on its next task, and again after finishing one — the idle
//! announce protocol.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, instrument, warn};

use crate::activeset::ActiveSet;
use crate::config::{LibraryConfig, RetryConfig};
use crate::coordinator::CoordinatorEvent;
use crate::downloader::{DownloadOutcome, DownloaderInvoker};
use crate::library::LibraryClient;
use crate::model::{Behavior, StoryTask};
use crate::notify::Notifier;
use crate::retry;
use crate::scheduler::SchedulerCommand;
use crate::strategy;

/// Per-worker dependencies, grouped so `Worker::new` doesn't take an
/// unreadable parameter list.
pub struct WorkerDeps {
    pub library: Arc<dyn LibraryClient>,
    pub downloader: Arc<DownloaderInvoker>,
    pub notifier: Arc<Notifier>,
    pub active_set: Arc<ActiveSet>,
    pub library_config: LibraryConfig,
    pub retry_config: RetryConfig,
    pub verbose: bool,
}

pub struct Worker {
    pub id: String,
    deps: WorkerDeps,
    coordinator_tx: mpsc::Sender<CoordinatorEvent>,
    scheduler_tx: mpsc::Sender<SchedulerCommand>,
}

impl Worker {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        deps: WorkerDeps,
        coordinator_tx: mpsc::Sender<CoordinatorEvent>,
        scheduler_tx: mpsc::Sender<SchedulerCommand>,
    ) -> Self {
        Self {
            id: id.into(),
            deps,
            coordinator_tx,
            scheduler_tx,
        }
    }

    /// Runs until `rx` closes (all senders dropped during shutdown),
    /// announcing idleness to the coordinator before and after each task.
    /// Takes `rx` by `&mut` so a supervisor respawn can hand the same
    /// channel to a fresh `Worker` after a crash.
    #[instrument(skip_all, fields(worker_id = %self.id))]
    pub async fn run(self, rx: &mut mpsc::Receiver<StoryTask>) {
        let _ = self
            .coordinator_tx
            .send(CoordinatorEvent::WorkerIdle(self.id.clone()))
            .await;

        while let Some(task) = rx.recv().await {
            self.process(task).await;
            let _ = self
                .coordinator_tx
                .send(CoordinatorEvent::WorkerIdle(self.id.clone()))
                .await;
        }
        info!(worker_id = %self.id, "worker shutting down");
    }

    #[instrument(skip(self, task), fields(worker_id = %self.id, url = %task.url, site = %task.site))]
    async fn process(&self, mut task: StoryTask) {
        let work_dir = match tempfile::tempdir() {
            Ok(dir) => dir,
            Err(e) => {
                error!(error = %e, "failed to create scratch directory");
                self.requeue_as_transient(task, "could not create a scratch directory").await;
                return;
            }
        };

        let library_id = match &task.library_id {
            Some(id) => Some(id.clone()),
            None => self.deps.library.get_story_id(&task.url).await.ok().flatten(),
        };
        task.library_id = library_id.clone();

        // path_or_url: the exported .epub when the story already exists in the
        // library (fanficfare updates it in place), otherwise the raw URL.
        let (path_or_url, exported_epub) = if let Some(id) = &library_id {
            match self.deps.library.export(id, work_dir.path()).await {
                Ok(path) => {
                    let path_str = path.display().to_string();
                    (path_str, Some(path))
                }
                Err(e) => {
                    warn!(%task, error = %e, "failed to export existing library entry, falling back to url");
                    (task.url.clone(), None)
                }
            }
        } else {
            (task.url.clone(), None)
        };

        let outcome = self
            .deps
            .downloader
            .run(
                &task,
                self.deps.library_config.update_method,
                &path_or_url,
                self.deps.verbose,
                work_dir.path(),
            )
            .await;

        match outcome {
            Ok(DownloadOutcome::Success) => {
                self.on_success(task, library_id, exported_epub, work_dir.path()).await;
            }
            Ok(DownloadOutcome::Permanent { reason }) => self.on_permanent_failure(task, &reason).await,
            Ok(DownloadOutcome::Forceable { reason }) => self.on_forceable(task, &reason).await,
            Ok(DownloadOutcome::Transient { reason }) => self.on_transient(task, &reason).await,
            Err(e) => self.on_transient(task, &e.to_string()).await,
        }
    }

    async fn on_success(
        &self,
        mut task: StoryTask,
        library_id: Option<String>,
        exported_epub: Option<std::path::PathBuf>,
        work_dir: &std::path::Path,
    ) {
        self.deps.active_set.remove(&task.url);

        let epub_path = match exported_epub.or_else(|| crate::library::find_epub(work_dir)) {
            Some(path) => path,
            None => {
                error!(%task, "downloader reported success but produced no .epub file");
                self.requeue_as_transient(task, "downloader reported success but produced no .epub file")
                    .await;
                return;
            }
        };

        let result = if let Some(id) = library_id {
            strategy::strategy_for(self.deps.library_config.metadata_mode)
                .execute(self.deps.library.as_ref(), &id, &epub_path)
                .await
                .map(|()| id)
        } else {
            strategy::AddNewStrategy.execute(self.deps.library.as_ref(), &epub_path).await
        };

        match result {
            Ok(new_id) => {
                task.library_id = Some(new_id);
                task.repeats = 0;
                info!(%task, "story updated successfully");
                self.deps
                    .notifier
                    .notify(&format!("Updated: {task}"))
                    .await;
            }
            Err(e) => {
                error!(%task, error = %e, "library reconciliation failed after successful download");
                self.requeue_as_transient(task, &e.to_string()).await;
            }
        }
    }

    /// Same recovery path as any other execution failure: increments
    /// `repeats` and consults the retry policy.
    async fn on_permanent_failure(&self, task: StoryTask, reason: &str) {
        warn!(%task, reason, "permanent failure");
        self.requeue_as_transient(task, reason).await;
    }

    /// A forceable condition is not a failure: requeue immediately onto the
    /// coordinator's ingress channel with `repeats` untouched and no retry
    /// policy consultation, so the next attempt runs with force dropped.
    async fn on_forceable(&self, mut task: StoryTask, reason: &str) {
        warn!(%task, reason, "forceable condition, retrying immediately with force");
        task.behavior = Some(Behavior::Force);
        let _ = self
            .coordinator_tx
            .send(CoordinatorEvent::NewTask(task))
            .await;
    }

    async fn on_transient(&self, task: StoryTask, reason: &str) {
        warn!(%task, reason, "transient failure");
        self.requeue_as_transient(task, reason).await;
    }

    async fn requeue_as_transient(&self, mut task: StoryTask, reason: &str) {
        let decision = retry::decide(&task, &self.deps.retry_config, self.deps.library_config.update_method);
        task.repeats += 1;

        if decision.should_notify {
            self.deps.notifier.notify(&decision.notification_message).await;
        }

        let should_requeue = !matches!(decision.action, crate::model::RetryAction::Abandon);
        task.retry_decision = Some(decision.clone());

        if should_requeue {
            let delay = std::time::Duration::from_secs_f64(decision.delay_minutes * 60.0);
            let _ = self
                .scheduler_tx
                .send(SchedulerCommand::Schedule { task, delay })
                .await;
        } else {
            self.deps.active_set.remove(&task.url);
            info!(%task, reason, "task abandoned");
        }
    }
}
