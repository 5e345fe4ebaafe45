//! Retry scheduler: holds a per-task timer and requeues the task to the
//! coordinator's ingress channel once its backoff delay elapses.
//!
//! Grounded in `root/app/task_manager.py`'s deferred-retry bookkeeping.
//! Pending timers are tracked in a `JoinSet` so shutdown can cancel all
//! outstanding retries instead of leaking tasks.

use tokio::task::JoinSet;
use tracing::{info, instrument, warn};

use crate::coordinator::CoordinatorEvent;
use crate::model::StoryTask;

/// Commands accepted by the scheduler's command channel.
pub enum SchedulerCommand {
    Schedule { task: StoryTask, delay: std::time::Duration },
}

/// Runs until `commands` closes, then cancels every still-pending timer.
///
/// Each accepted [`SchedulerCommand::Schedule`] spawns a sleep-then-requeue
/// task tracked in a `JoinSet`; on shutdown the whole set is aborted rather
/// than awaited, since a pending retry has no partial work to flush.
#[instrument(skip_all)]
pub async fn run(
    commands: &mut tokio::sync::mpsc::Receiver<SchedulerCommand>,
    ingress: tokio::sync::mpsc::Sender<CoordinatorEvent>,
) {
    let mut pending: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            maybe_cmd = commands.recv() => {
                match maybe_cmd {
                    Some(SchedulerCommand::Schedule { task, delay }) => {
                        let ingress = ingress.clone();
                        pending.spawn(async move {
                            tokio::time::sleep(delay).await;
                            if ingress.send(CoordinatorEvent::NewTask(task)).await.is_err() {
                                warn!("ingress closed while requeuing a scheduled retry");
                            }
                        });
                    }
                    None => break,
                }
            }
            Some(_) = pending.join_next(), if !pending.is_empty() => {}
        }
    }

    info!(cancelled = pending.len(), "retry scheduler shutting down, cancelling pending timers");
    pending.abort_all();
    while pending.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scheduled_task_is_requeued_after_delay() {
        let (cmd_tx, mut cmd_rx) = tokio::sync::mpsc::channel(4);
        let (ingress_tx, mut ingress_rx) = tokio::sync::mpsc::channel(4);

        let handle = tokio::spawn(async move { run(&mut cmd_rx, ingress_tx).await });

        cmd_tx
            .send(SchedulerCommand::Schedule {
                task: StoryTask::new("https://example.com/1", "other"),
                delay: std::time::Duration::from_millis(10),
            })
            .await
            .unwrap();

        let event = tokio::time::timeout(std::time::Duration::from_secs(1), ingress_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CoordinatorEvent::NewTask(t) if t.url == "https://example.com/1"));

        drop(cmd_tx);
        handle.await.unwrap();
    }
}
