//! The staged job queue.
//!
//! Jobs wait here between the scheduler and the workers. Workers block on
//! [`JobQueue::pop`] (plain threads, so a parking_lot condvar); the
//! scheduler sleeps on [`JobQueue::wait_for_demand`] until a pop leaves room.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::job::Job;

#[derive(Default)]
struct Staged {
    jobs: HashMap<u64, Job>,
    /// Oldest first.
    order: BTreeSet<(Instant, u64)>,
    rollable: usize,
    frozen: bool,
}

impl Staged {
    fn insert(&mut self, job: Job) {
        if job.is_rollable() {
            self.rollable += 1;
        }
        job.pool.staged_add(1);
        self.order.insert((job.staged_at, job.id));
        self.jobs.insert(job.id, job);
    }

    fn remove(&mut self, key: (Instant, u64)) -> Option<Job> {
        self.order.remove(&key);
        let job = self.jobs.remove(&key.1)?;
        if job.is_rollable() {
            self.rollable = self.rollable.saturating_sub(1);
        }
        job.pool.staged_sub(1);
        Some(job)
    }

    /// Prefer non-rollable work while any exists, so rollable masters stay
    /// around to be cloned.
    fn next_key(&self) -> Option<(Instant, u64)> {
        if self.jobs.len() > self.rollable {
            self.order
                .iter()
                .find(|(_, id)| self.jobs.get(id).is_some_and(|j| !j.is_rollable()))
                .copied()
        } else {
            self.order.iter().next().copied()
        }
    }
}

pub struct JobQueue {
    staged: Mutex<Staged>,
    more_work: Condvar,
    need_work: Notify,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    pub fn new() -> Self {
        Self {
            staged: Mutex::new(Staged::default()),
            more_work: Condvar::new(),
            need_work: Notify::new(),
        }
    }

    /// Returns false once the queue is frozen for shutdown.
    pub fn stage(&self, job: Job) -> bool {
        {
            let mut staged = self.staged.lock();
            if staged.frozen {
                return false;
            }
            staged.insert(job);
        }
        self.more_work.notify_one();
        true
    }

    /// Take the next job, waiting up to `timeout`. None on timeout or once
    /// the queue is frozen.
    pub fn pop(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        let mut staged = self.staged.lock();
        loop {
            if staged.frozen {
                return None;
            }
            if let Some(key) = staged.next_key() {
                let job = staged.remove(key);
                drop(staged);
                self.need_work.notify_one();
                return job;
            }
            if self.more_work.wait_until(&mut staged, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Refuse new work and wake every waiter.
    pub fn freeze(&self) {
        self.staged.lock().frozen = true;
        self.more_work.notify_all();
        self.need_work.notify_waiters();
    }

    pub fn is_frozen(&self) -> bool {
        self.staged.lock().frozen
    }

    /// Remove every job matching `predicate` and return them.
    pub fn discard_where<F>(&self, mut predicate: F) -> Vec<Job>
    where
        F: FnMut(&Job) -> bool,
    {
        let removed = {
            let mut staged = self.staged.lock();
            let keys: Vec<(Instant, u64)> = staged
                .order
                .iter()
                .filter(|(_, id)| staged.jobs.get(id).is_some_and(&mut predicate))
                .copied()
                .collect();
            keys.into_iter()
                .filter_map(|key| staged.remove(key))
                .collect::<Vec<_>>()
        };
        if !removed.is_empty() {
            self.need_work.notify_one();
        }
        removed
    }

    /// Satisfy demand by cloning a rolled copy of some staged master that
    /// passes `eligible`. The master is rolled again before going back so
    /// it never hands out the same header twice.
    pub fn clone_available<F>(&self, mut eligible: F) -> bool
    where
        F: FnMut(&Job) -> bool,
    {
        {
            let mut staged = self.staged.lock();
            if staged.frozen {
                return false;
            }
            let key = staged
                .order
                .iter()
                .find(|(_, id)| {
                    staged
                        .jobs
                        .get(id)
                        .is_some_and(|j| j.is_rollable() && eligible(j))
                })
                .copied();
            let Some(key) = key else {
                return false;
            };
            let Some(mut master) = staged.remove(key) else {
                return false;
            };
            master.roll();
            let clone = master.make_clone();
            master.roll();
            staged.insert(master);
            staged.insert(clone);
        }
        self.more_work.notify_one();
        true
    }

    /// Wait until a worker took a job, or `timeout` passes.
    pub async fn wait_for_demand(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.need_work.notified()).await;
    }

    /// Wake the scheduler without popping anything.
    pub fn signal_demand(&self) {
        self.need_work.notify_one();
    }

    pub fn len(&self) -> usize {
        self.staged.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rollable(&self) -> usize {
        self.staged.lock().rollable
    }

    pub fn contains(&self, id: u64) -> bool {
        self.staged.lock().jobs.contains_key(&id)
    }
}
