//! Supervisor: owns the named process units (email ingester,
//! coordinator, retry scheduler, worker pool), watches them for unexpected
//! exit, and drives graceful shutdown on SIGTERM/SIGINT.
//!
//! Grounded in `root/app/process_management/manager.py` and
//! `root/app/task_manager.py`'s state machine, with the signal-handling
//! pattern taken from this crate's `ctrl_c` + `AtomicBool` idiom (here
//! latched so a repeat signal during shutdown just logs).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};

use crate::config::ProcessConfig;

/// Shares a value (typically the receiving half of a channel) between a
/// unit's running future and the supervisor's respawn closure for it.
///
/// The future takes the value out via [`Restartable::take`] for the
/// duration of its run and the returned guard puts it back on drop — including
/// during an unwinding panic — so a later restart can resume consuming the
/// same channel rather than needing a brand new one wired up to every sender.
pub struct Restartable<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Restartable<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            slot: Arc::new(Mutex::new(Some(value))),
        }
    }

    pub async fn take(&self) -> Option<RestartGuard<T>> {
        let mut slot = self.slot.lock().await;
        slot.take().map(|value| RestartGuard {
            slot: self.slot.clone(),
            value: Some(value),
        })
    }
}

impl<T> Clone for Restartable<T> {
    fn clone(&self) -> Self {
        Self { slot: self.slot.clone() }
    }
}

pub struct RestartGuard<T> {
    slot: Arc<Mutex<Option<T>>>,
    value: Option<T>,
}

impl<T> std::ops::Deref for RestartGuard<T> {
    type Target = T;
    fn deref(&self) -> &T {
        self.value.as_ref().expect("guard holds its value until dropped")
    }
}

impl<T> std::ops::DerefMut for RestartGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.value.as_mut().expect("guard holds its value until dropped")
    }
}

impl<T> Drop for RestartGuard<T> {
    fn drop(&mut self) {
        if let Some(value) = self.value.take() {
            if let Ok(mut slot) = self.slot.try_lock() {
                *slot = Some(value);
            }
        }
    }
}

/// Lifecycle state of a single supervised unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
    Restarting,
}

type RespawnFn = Arc<dyn Fn() -> JoinHandle<()> + Send + Sync>;

struct ManagedUnit {
    state: TaskState,
    handle: JoinHandle<()>,
    restart_attempts: u32,
    respawn: Option<RespawnFn>,
}

/// Registry of named background units plus the shutdown signal they all
/// share. `shutdown_tx` is a `watch` channel rather than a one-shot so every
/// unit can observe the same "stop now" transition without needing its own
/// clone negotiated at spawn time.
pub struct Supervisor {
    units: HashMap<String, ManagedUnit>,
    process_config: ProcessConfig,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
    signal_count: Arc<AtomicBool>,
}

impl Supervisor {
    #[must_use]
    pub fn new(process_config: ProcessConfig) -> (Self, tokio::sync::watch::Receiver<bool>) {
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        (
            Self {
                units: HashMap::new(),
                process_config,
                shutdown_tx,
                signal_count: Arc::new(AtomicBool::new(false)),
            },
            shutdown_rx,
        )
    }

    /// Registers a running unit under `name`. The supervisor does not spawn
    /// the future itself — callers spawn with whatever shutdown receiver
    /// they need, then hand the `JoinHandle` here so it's watched. Such a
    /// unit is never auto-restarted on unexpected exit, regardless of
    /// `auto_restart` — use [`Supervisor::register_restartable`] for that.
    pub fn register(&mut self, name: impl Into<String>, handle: JoinHandle<()>) {
        self.units.insert(
            name.into(),
            ManagedUnit {
                state: TaskState::Running,
                handle,
                restart_attempts: 0,
                respawn: None,
            },
        );
    }

    /// Registers a unit along with the closure that spawns it, so
    /// [`Supervisor::run_health_check`] can respawn it (up to
    /// `max_restart_attempts`, `restart_delay_sec` apart) if it exits
    /// unexpectedly and `auto_restart` is enabled.
    pub fn register_restartable(
        &mut self,
        name: impl Into<String>,
        spawn: impl Fn() -> JoinHandle<()> + Send + Sync + 'static,
    ) {
        let handle = spawn();
        self.units.insert(
            name.into(),
            ManagedUnit {
                state: TaskState::Running,
                handle,
                restart_attempts: 0,
                respawn: Some(Arc::new(spawn)),
            },
        );
    }

    /// Returns a receiver every unit's main loop should select on alongside
    /// its own work, to learn when a graceful shutdown has been requested.
    #[must_use]
    pub fn shutdown_receiver(&self) -> tokio::sync::watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Blocks until SIGTERM/SIGINT (or the process's own decision to stop),
    /// running periodic health checks in the meantime, then drives shutdown.
    ///
    /// Signal listening continues, latched, through the shutdown phase: a
    /// repeat signal while units are draining produces one log line and no
    /// additional action, rather than a forced exit — the
    /// `shutdown_timeout`-bounded join in [`drain_units`] is the only
    /// mechanism that can cut a stuck unit loose.
    #[instrument(skip_all)]
    pub async fn run(mut self) {
        let mut health_check = tokio::time::interval(std::time::Duration::from_secs_f64(
            self.process_config.health_check_interval_sec,
        ));

        #[cfg(unix)]
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        let (done_tx, mut done_rx) = tokio::sync::oneshot::channel();
        let mut draining = false;

        loop {
            #[cfg(unix)]
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    self.handle_shutdown_signal("SIGINT").await;
                }
                _ = sigterm.recv() => {
                    self.handle_shutdown_signal("SIGTERM").await;
                }
                _ = health_check.tick(), if !draining => {
                    self.run_health_check().await;
                }
                _ = &mut done_rx, if draining => {
                    break;
                }
            }

            #[cfg(not(unix))]
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    self.handle_shutdown_signal("ctrl-c").await;
                }
                _ = health_check.tick(), if !draining => {
                    self.run_health_check().await;
                }
                _ = &mut done_rx, if draining => {
                    break;
                }
            }

            if self.signal_count.load(Ordering::SeqCst) && !draining {
                draining = true;
                let units = std::mem::take(&mut self.units);
                let shutdown_timeout = self.process_config.shutdown_timeout_sec;
                tokio::spawn(async move {
                    drain_units(units, shutdown_timeout).await;
                    let _ = done_tx.send(());
                });
            }
        }
    }

    async fn handle_shutdown_signal(&self, signal_name: &str) {
        let already_shutting_down = self.signal_count.swap(true, Ordering::SeqCst);
        if already_shutting_down {
            warn!("received an additional {signal_name} while already stopping, ignoring");
            return;
        }
        info!("received {signal_name}, beginning graceful shutdown");
        let _ = self.shutdown_tx.send(true);
    }

    #[instrument(skip(self))]
    async fn run_health_check(&mut self) {
        let finished: Vec<String> = self
            .units
            .iter()
            .filter(|(_, unit)| unit.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();

        for name in finished {
            let Some(unit) = self.units.get_mut(&name) else {
                continue;
            };
            warn!(unit = %name, "unit exited unexpectedly");
            unit.state = TaskState::Failed;

            if !self.process_config.auto_restart {
                continue;
            }
            let Some(respawn) = unit.respawn.clone() else {
                warn!(unit = %name, "unit is not restartable, leaving stopped");
                unit.state = TaskState::Stopped;
                continue;
            };
            if unit.restart_attempts >= self.process_config.max_restart_attempts {
                error!(unit = %name, "exceeded max restart attempts, leaving stopped");
                unit.state = TaskState::Stopped;
                continue;
            }
            unit.restart_attempts += 1;
            unit.state = TaskState::Restarting;
            let attempt = unit.restart_attempts;
            let delay = std::time::Duration::from_secs_f64(self.process_config.restart_delay_sec);
            warn!(unit = %name, attempt, delay_sec = self.process_config.restart_delay_sec, "restarting unit after delay");

            tokio::time::sleep(delay).await;
            let handle = respawn();
            if let Some(unit) = self.units.get_mut(&name) {
                unit.handle = handle;
                unit.state = TaskState::Running;
                info!(unit = %name, attempt, "unit restarted");
            }
        }
    }
}

#[instrument(skip_all)]
async fn drain_units(units: HashMap<String, ManagedUnit>, shutdown_timeout_sec: f64) {
    let timeout = std::time::Duration::from_secs_f64(shutdown_timeout_sec);
    let deadline = tokio::time::Instant::now() + timeout;

    for (name, unit) in units {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, unit.handle).await {
            Ok(Ok(())) => info!(unit = %name, "stopped cleanly"),
            Ok(Err(e)) => error!(unit = %name, error = %e, "unit task panicked"),
            Err(_) => warn!(unit = %name, "did not stop within the shutdown timeout"),
        }
    }
    info!("shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_config() -> ProcessConfig {
        ProcessConfig {
            shutdown_timeout_sec: 5.0,
            health_check_interval_sec: 60.0,
            auto_restart: true,
            max_restart_attempts: 3,
            restart_delay_sec: 1.0,
            enable_monitoring: true,
            worker_timeout_sec: None,
            signal_timeout_sec: 10.0,
        }
    }

    #[tokio::test]
    async fn health_check_marks_a_non_restartable_unit_stopped() {
        let mut config = process_config();
        config.auto_restart = false;
        let (mut supervisor, _rx) = Supervisor::new(config);
        let handle = tokio::spawn(async {});
        // let the spawned task actually finish before we check it
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        supervisor.register("test-unit", handle);

        supervisor.run_health_check().await;

        let unit = supervisor.units.get("test-unit").unwrap();
        assert_eq!(unit.state, TaskState::Failed);
    }

    #[tokio::test]
    async fn health_check_respawns_a_restartable_unit_that_exited() {
        let mut config = process_config();
        config.restart_delay_sec = 0.0;
        let (mut supervisor, _rx) = Supervisor::new(config);

        let spawn_count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = spawn_count.clone();
        supervisor.register_restartable("test-unit", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async {})
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        supervisor.run_health_check().await;

        assert_eq!(spawn_count.load(Ordering::SeqCst), 2); // initial register + one respawn
        let unit = supervisor.units.get("test-unit").unwrap();
        assert_eq!(unit.state, TaskState::Running);
        assert_eq!(unit.restart_attempts, 1);
    }

    #[tokio::test]
    async fn health_check_gives_up_after_max_restart_attempts() {
        let mut config = process_config();
        config.restart_delay_sec = 0.0;
        config.max_restart_attempts = 1;
        let (mut supervisor, _rx) = Supervisor::new(config);

        supervisor.register_restartable("test-unit", || tokio::spawn(async {}));
        // First health check pass: consumes the one allowed restart attempt.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        supervisor.run_health_check().await;
        assert_eq!(supervisor.units.get("test-unit").unwrap().state, TaskState::Running);

        // Second pass: the respawned unit has already finished too, and the
        // attempt budget is exhausted.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        supervisor.run_health_check().await;
        assert_eq!(supervisor.units.get("test-unit").unwrap().state, TaskState::Stopped);
    }

    #[tokio::test]
    async fn shutdown_receiver_observes_signal_send() {
        let (supervisor, mut rx) = Supervisor::new(process_config());
        let _ = supervisor.shutdown_tx.send(true);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
