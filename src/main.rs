//! CLI entry point for the fanfic pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info};

use fanfic_pipeline_core::activeset::ActiveSet;
use fanfic_pipeline_core::config::Config;
use fanfic_pipeline_core::coordinator::{Coordinator, CoordinatorEvent};
use fanfic_pipeline_core::downloader::DownloaderInvoker;
use fanfic_pipeline_core::ingester::{self, ImapMailboxClient};
use fanfic_pipeline_core::library::CalibreLibraryClient;
use fanfic_pipeline_core::notify::Notifier;
use fanfic_pipeline_core::scheduler;
use fanfic_pipeline_core::supervisor::{Restartable, Supervisor};
use fanfic_pipeline_core::worker::{Worker, WorkerDeps};

mod cli;

use cli::Args;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");
    info!("fanfic-pipeline starting");

    if let Err(e) = run(args).await {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
    Ok(())
}

async fn run(args: Args) -> Result<()> {
    let config = Config::load(&args.config)
        .with_context(|| format!("loading configuration from {}", args.config.display()))?;

    let library = Arc::new(CalibreLibraryClient::new(config.library.clone()));
    let downloader = Arc::new(DownloaderInvoker::new());
    let notifier = Arc::new(Notifier::new(&config.notifications));
    let active_set = Arc::new(ActiveSet::new());
    let mailbox = Arc::new(ImapMailboxClient::new(config.email.clone()));

    let (supervisor, _top_shutdown_rx) =
        Supervisor::new(config.process.clone());
    let mut supervisor = supervisor;

    let (coordinator_tx, coordinator_rx) = mpsc::channel::<CoordinatorEvent>(256);
    let (scheduler_tx, scheduler_rx) = mpsc::channel(256);

    let verbose = args.verbose > 0;

    let mut worker_senders = HashMap::new();
    let mut worker_rx_slots = Vec::new();
    for index in 0..config.max_workers {
        let worker_id = format!("worker-{index}");
        let (tx, rx) = mpsc::channel(256);
        worker_senders.insert(worker_id.clone(), tx);
        worker_rx_slots.push((worker_id, Restartable::new(rx)));
    }

    for (worker_id, rx_slot) in &worker_rx_slots {
        let register_name = worker_id.clone();
        let worker_id = worker_id.clone();
        let rx_slot = rx_slot.clone();
        let deps_template = (
            library.clone(),
            downloader.clone(),
            notifier.clone(),
            active_set.clone(),
            config.library.clone(),
            config.retry.clone(),
            coordinator_tx.clone(),
            scheduler_tx.clone(),
        );
        let spawn = move || {
            let worker_id = worker_id.clone();
            let rx_slot = rx_slot.clone();
            let (library, downloader, notifier, active_set, library_config, retry_config, coordinator_tx, scheduler_tx) =
                deps_template.clone();
            tokio::spawn(async move {
                let Some(mut rx) = rx_slot.take().await else {
                    return;
                };
                let deps = WorkerDeps {
                    library,
                    downloader,
                    notifier,
                    active_set,
                    library_config,
                    retry_config,
                    verbose,
                };
                let worker = Worker::new(worker_id, deps, coordinator_tx, scheduler_tx);
                worker.run(&mut rx).await;
            })
        };
        supervisor.register_restartable(register_name, spawn);
    }

    let coordinator_rx_slot = Restartable::new(coordinator_rx);
    let coordinator_spawn = {
        let coordinator_rx_slot = coordinator_rx_slot.clone();
        let worker_senders = worker_senders.clone();
        move || {
            let coordinator_rx_slot = coordinator_rx_slot.clone();
            let worker_senders = worker_senders.clone();
            tokio::spawn(async move {
                let Some(mut ingress) = coordinator_rx_slot.take().await else {
                    return;
                };
                Coordinator::new(worker_senders).run(&mut ingress).await;
            })
        }
    };
    supervisor.register_restartable("coordinator", coordinator_spawn);

    let scheduler_rx_slot = Restartable::new(scheduler_rx);
    let scheduler_spawn = {
        let scheduler_rx_slot = scheduler_rx_slot.clone();
        let coordinator_tx = coordinator_tx.clone();
        move || {
            let scheduler_rx_slot = scheduler_rx_slot.clone();
            let coordinator_tx = coordinator_tx.clone();
            tokio::spawn(async move {
                let Some(mut commands) = scheduler_rx_slot.take().await else {
                    return;
                };
                scheduler::run(&mut commands, coordinator_tx).await;
            })
        }
    };
    supervisor.register_restartable("retry-scheduler", scheduler_spawn);

    let ingest_spawn = {
        let mailbox = mailbox.clone();
        let email_config = config.email.clone();
        let active_set = active_set.clone();
        let notifier = notifier.clone();
        let coordinator_tx = coordinator_tx.clone();
        let supervisor_shutdown = supervisor.shutdown_receiver();
        move || {
            tokio::spawn(ingester::run(
                mailbox.clone(),
                email_config.clone(),
                active_set.clone(),
                notifier.clone(),
                mpsc_into_story_task_sender(coordinator_tx.clone()),
                supervisor_shutdown.clone(),
            ))
        }
    };
    supervisor.register_restartable("email-ingester", ingest_spawn);

    supervisor.run().await;
    Ok(())
}

/// Adapts the coordinator's event channel to the plain `StoryTask` sender the
/// ingester expects, so the ingester module doesn't need to know about
/// [`CoordinatorEvent`].
fn mpsc_into_story_task_sender(
    coordinator_tx: mpsc::Sender<CoordinatorEvent>,
) -> mpsc::Sender<fanfic_pipeline_core::StoryTask> {
    let (tx, mut rx) = mpsc::channel(256);
    tokio::spawn(async move {
        while let Some(task) = rx.recv().await {
            if coordinator_tx.send(CoordinatorEvent::NewTask(task)).await.is_err() {
                break;
            }
        }
    });
    tx
}
