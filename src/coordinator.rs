//! Coordinator: greedy single-writer scheduler enforcing the
//! site-assignment exclusivity invariant — at most one worker processes a
//! given site at a time.
//!
//! Grounded in `root/app/services/coordinator.py`: `backlog` (per-site FIFO),
//! `assignments` (worker -> site), `idle_workers`, and the
//! `_handle_new_task`/`_handle_worker_idle` event handlers.

use std::collections::{HashMap, HashSet, VecDeque};

use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::model::StoryTask;

/// Events the coordinator reacts to, fed through its single ingress channel.
#[derive(Debug)]
pub enum CoordinatorEvent {
    NewTask(StoryTask),
    WorkerIdle(String),
}

/// Single-writer scheduling state. Not `Sync` by design — all mutation goes
/// through [`Coordinator::run`]'s event loop, which is the actual guard
/// against two workers ever being assigned the same site (the [`ActiveSet`]
/// dedup map is a cheap filter, not this invariant's source of truth).
///
/// [`ActiveSet`]: crate::activeset::ActiveSet
pub struct Coordinator {
    backlog: HashMap<String, VecDeque<StoryTask>>,
    busy_sites: HashSet<String>,
    assigned_site_by_worker: HashMap<String, String>,
    worker_by_site: HashMap<String, String>,
    idle_workers: HashSet<String>,
    worker_senders: HashMap<String, mpsc::Sender<StoryTask>>,
}

impl Coordinator {
    #[must_use]
    pub fn new(worker_senders: HashMap<String, mpsc::Sender<StoryTask>>) -> Self {
        let idle_workers = worker_senders.keys().cloned().collect();
        Self {
            backlog: HashMap::new(),
            busy_sites: HashSet::new(),
            assigned_site_by_worker: HashMap::new(),
            worker_by_site: HashMap::new(),
            idle_workers,
            worker_senders,
        }
    }

    /// Drains `ingress` until the channel closes (shutdown), dispatching
    /// events synchronously so the invariant never races. Takes the receiver
    /// by `&mut` rather than by value so a supervisor respawn can hand the
    /// same channel to a fresh `Coordinator` after a crash.
    #[instrument(skip_all)]
    pub async fn run(mut self, ingress: &mut mpsc::Receiver<CoordinatorEvent>) {
        while let Some(event) = ingress.recv().await {
            match event {
                CoordinatorEvent::NewTask(task) => self.handle_new_task(task).await,
                CoordinatorEvent::WorkerIdle(worker_id) => self.handle_worker_idle(worker_id).await,
            }
        }
    }

    #[instrument(skip(self, task), fields(site = %task.site))]
    async fn handle_new_task(&mut self, task: StoryTask) {
        let site = task.site.clone();

        // The site already has a worker assigned: its backlog was fully
        // drained onto that worker's personal queue at assignment time, so a
        // fresh task for the same site goes straight onto that queue too,
        // keeping invariant 2 (non-empty personal queue while backlogged).
        if let Some(worker_id) = self.worker_by_site.get(&site).cloned() {
            self.send_to_worker(&worker_id, task).await;
            return;
        }

        if let Some(worker_id) = self.pop_idle_worker() {
            self.assign_site(worker_id.clone(), site);
            self.send_to_worker(&worker_id, task).await;
        } else {
            self.backlog.entry(site).or_default().push_back(task);
        }
    }

    #[instrument(skip(self))]
    async fn handle_worker_idle(&mut self, worker_id: String) {
        if let Some(prev_site) = self.assigned_site_by_worker.remove(&worker_id) {
            self.busy_sites.remove(&prev_site);
            self.worker_by_site.remove(&prev_site);
        }
        self.idle_workers.insert(worker_id.clone());
        self.assign_next_backlog_site(worker_id).await;
    }

    /// Picks the next eligible (non-busy-site) backlog entry for `worker_id`
    /// and drains that site's *entire* backlog queue onto the worker's
    /// personal channel in one go, rather than one task per idle-announce —
    /// this is what keeps the worker's queue non-empty for the whole time
    /// the site is marked busy, and avoids re-consulting the coordinator for
    /// every single queued task of a popular site.
    async fn assign_next_backlog_site(&mut self, worker_id: String) {
        let Some(site) = self.next_eligible_backlog_site() else {
            return;
        };
        if !self.idle_workers.remove(&worker_id) {
            return;
        }
        self.assign_site(worker_id.clone(), site.clone());

        let Some(mut queue) = self.backlog.remove(&site) else {
            return;
        };
        while let Some(task) = queue.pop_front() {
            self.send_to_worker(&worker_id, task).await;
        }
    }

    fn next_eligible_backlog_site(&self) -> Option<String> {
        self.backlog
            .iter()
            .find(|(site, queue)| !self.busy_sites.contains(*site) && !queue.is_empty())
            .map(|(site, _)| site.clone())
    }

    fn pop_idle_worker(&mut self) -> Option<String> {
        let worker_id = self.idle_workers.iter().next().cloned()?;
        self.idle_workers.remove(&worker_id);
        Some(worker_id)
    }

    fn assign_site(&mut self, worker_id: String, site: String) {
        debug!(worker_id, site, "assigning site to worker");
        self.busy_sites.insert(site.clone());
        self.assigned_site_by_worker.insert(worker_id.clone(), site.clone());
        self.worker_by_site.insert(site, worker_id);
    }

    async fn send_to_worker(&self, worker_id: &str, task: StoryTask) {
        if let Some(sender) = self.worker_senders.get(worker_id) {
            let _ = sender.send(task).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(url: &str, site: &str) -> StoryTask {
        StoryTask::new(url, site)
    }

    #[tokio::test]
    async fn single_worker_gets_first_task_immediately() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut senders = HashMap::new();
        senders.insert("w1".to_string(), tx);
        let mut coord = Coordinator::new(senders);

        coord.handle_new_task(task("u1", "ao3")).await;

        let received = rx.try_recv().unwrap();
        assert_eq!(received.url, "u1");
    }

    #[tokio::test]
    async fn second_task_for_an_already_assigned_site_joins_its_workers_queue() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut senders = HashMap::new();
        senders.insert("w1".to_string(), tx);
        let mut coord = Coordinator::new(senders);

        coord.handle_new_task(task("u1", "ao3")).await;
        coord.handle_new_task(task("u2", "ao3")).await;

        // The site's exclusive worker is known, so both tasks land on its
        // personal queue directly; nothing sits in the coordinator's backlog.
        assert_eq!(rx.try_recv().unwrap().url, "u1");
        assert_eq!(rx.try_recv().unwrap().url, "u2");
        assert!(coord.backlog.get("ao3").is_none());
    }

    #[tokio::test]
    async fn task_for_a_different_site_backlogs_when_no_worker_is_idle() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut senders = HashMap::new();
        senders.insert("w1".to_string(), tx);
        let mut coord = Coordinator::new(senders);

        coord.handle_new_task(task("u1", "ao3")).await; // claims the only worker
        coord.handle_new_task(task("u2", "royalroad")).await; // no idle worker left

        assert_eq!(rx.try_recv().unwrap().url, "u1");
        assert!(rx.try_recv().is_err());
        assert_eq!(coord.backlog.get("royalroad").map(VecDeque::len), Some(1));
    }

    #[tokio::test]
    async fn worker_going_idle_drains_the_entire_backlog_for_its_next_site_at_once() {
        let (tx1, mut rx1) = mpsc::channel(8);
        let (tx2, mut rx2) = mpsc::channel(8);
        let mut senders = HashMap::new();
        senders.insert("w1".to_string(), tx1);
        senders.insert("w2".to_string(), tx2);
        let mut coord = Coordinator::new(senders);

        coord.handle_new_task(task("a1", "ao3")).await; // takes w1
        coord.handle_new_task(task("b1", "royalroad")).await; // takes w2
        // Both workers are now busy; three more tasks for a third site queue up.
        coord.handle_new_task(task("c1", "ffn")).await;
        coord.handle_new_task(task("c2", "ffn")).await;
        coord.handle_new_task(task("c3", "ffn")).await;
        assert_eq!(coord.backlog.get("ffn").map(VecDeque::len), Some(3));

        let _ = rx1.try_recv().unwrap(); // a1
        coord.handle_worker_idle("w1".to_string()).await;

        assert_eq!(rx1.try_recv().unwrap().url, "c1");
        assert_eq!(rx1.try_recv().unwrap().url, "c2");
        assert_eq!(rx1.try_recv().unwrap().url, "c3");
        assert!(coord.backlog.get("ffn").is_none());
    }

    #[tokio::test]
    async fn two_sites_go_to_two_workers_concurrently() {
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        let mut senders = HashMap::new();
        senders.insert("w1".to_string(), tx1);
        senders.insert("w2".to_string(), tx2);
        let mut coord = Coordinator::new(senders);

        coord.handle_new_task(task("u1", "ao3")).await;
        coord.handle_new_task(task("u2", "royalroad")).await;

        let got1 = rx1.try_recv().is_ok();
        let got2 = rx2.try_recv().is_ok();
        assert!(got1 && got2, "both distinct-site tasks should reach distinct idle workers");
        assert_eq!(coord.busy_sites.len(), 2);
    }
}
