//! Share, work and hash-rate counters.
//!
//! Global, per-pool and per-worker counters all sit behind one lock so a
//! snapshot never observes a half-applied update.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Default, Serialize)]
pub struct ShareCounters {
    pub accepted: u64,
    pub rejected: u64,
    pub stale: u64,
    /// Shares lost without an answer (dropped sessions, give-ups).
    pub dropped: u64,
    pub diff_accepted: f64,
    pub diff_rejected: f64,
    pub diff_stale: f64,
    pub last_share: Option<DateTime<Local>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolCounters {
    pub shares: ShareCounters,
    pub getworks: u64,
    pub get_failures: u64,
    pub remote_failures: u64,
    pub lagging: u64,
    pub discarded_work: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerCounters {
    pub shares: ShareCounters,
    pub hw_errors: u64,
    pub hashes: u64,
    pub hashrate: f64,
    #[serde(skip)]
    pending: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GlobalCounters {
    pub shares: ShareCounters,
    pub hw_errors: u64,
    pub getworks: u64,
    pub get_failures: u64,
    pub remote_failures: u64,
    pub lagging: u64,
    pub discarded_work: u64,
    pub found_blocks: u64,
    pub best_share: f64,
    pub hashes: u64,
    /// Decayed average over the logging interval.
    pub hashrate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    /// Accepted shares per minute since start.
    pub utility: f64,
    pub global: GlobalCounters,
    pub pools: BTreeMap<usize, PoolCounters>,
    pub workers: BTreeMap<usize, WorkerCounters>,
}

struct Inner {
    global: GlobalCounters,
    pools: BTreeMap<usize, PoolCounters>,
    workers: BTreeMap<usize, WorkerCounters>,
    pending_hashes: u64,
    last_decay: Instant,
}

pub struct Stats {
    inner: Mutex<Inner>,
    started: Instant,
}

/// Exponentially decayed rate: sparse samples move the average smoothly.
pub fn decay_rate(rate: f64, sample: f64, elapsed: f64, interval: f64) -> f64 {
    if interval <= 0.0 {
        return sample;
    }
    let prop = 1.0 - (-elapsed / interval).exp();
    (rate + sample * prop) / (1.0 + prop)
}

fn credit(shares: &mut ShareCounters, accepted: bool, difficulty: f64) {
    if accepted {
        shares.accepted += 1;
        shares.diff_accepted += difficulty;
    } else {
        shares.rejected += 1;
        shares.diff_rejected += difficulty;
    }
    shares.last_share = Some(Local::now());
}

fn stale(shares: &mut ShareCounters, difficulty: f64) {
    shares.stale += 1;
    shares.diff_stale += difficulty;
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

impl Stats {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                global: GlobalCounters::default(),
                pools: BTreeMap::new(),
                workers: BTreeMap::new(),
                pending_hashes: 0,
                last_decay: Instant::now(),
            }),
            started: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn record_share(&self, pool: usize, worker: Option<usize>, accepted: bool, difficulty: f64) {
        let mut inner = self.inner.lock();
        credit(&mut inner.global.shares, accepted, difficulty);
        credit(&mut inner.pools.entry(pool).or_default().shares, accepted, difficulty);
        if let Some(worker) = worker {
            credit(&mut inner.workers.entry(worker).or_default().shares, accepted, difficulty);
        }
    }

    pub fn record_stale(&self, pool: usize, worker: Option<usize>, difficulty: f64) {
        let mut inner = self.inner.lock();
        stale(&mut inner.global.shares, difficulty);
        stale(&mut inner.pools.entry(pool).or_default().shares, difficulty);
        if let Some(worker) = worker {
            stale(&mut inner.workers.entry(worker).or_default().shares, difficulty);
        }
    }

    pub fn record_dropped(&self, pool: usize) {
        let mut inner = self.inner.lock();
        inner.global.shares.dropped += 1;
        inner.pools.entry(pool).or_default().shares.dropped += 1;
    }

    pub fn record_discarded_work(&self, pool: usize, count: u64) {
        let mut inner = self.inner.lock();
        inner.global.discarded_work += count;
        inner.pools.entry(pool).or_default().discarded_work += count;
    }

    pub fn record_hw_error(&self, worker: Option<usize>) {
        let mut inner = self.inner.lock();
        inner.global.hw_errors += 1;
        if let Some(worker) = worker {
            inner.workers.entry(worker).or_default().hw_errors += 1;
        }
    }

    pub fn record_getwork(&self, pool: usize) {
        let mut inner = self.inner.lock();
        inner.global.getworks += 1;
        inner.pools.entry(pool).or_default().getworks += 1;
    }

    pub fn record_get_failure(&self, pool: usize) {
        let mut inner = self.inner.lock();
        inner.global.get_failures += 1;
        inner.pools.entry(pool).or_default().get_failures += 1;
    }

    pub fn record_remote_failure(&self, pool: usize) {
        let mut inner = self.inner.lock();
        inner.global.remote_failures += 1;
        inner.pools.entry(pool).or_default().remote_failures += 1;
    }

    pub fn record_lagging(&self, pool: usize) {
        let mut inner = self.inner.lock();
        inner.global.lagging += 1;
        inner.pools.entry(pool).or_default().lagging += 1;
    }

    pub fn record_found_block(&self) {
        self.inner.lock().global.found_blocks += 1;
    }

    /// Returns true when `difficulty` is a new best.
    pub fn record_best_share(&self, difficulty: f64) -> bool {
        let mut inner = self.inner.lock();
        if difficulty > inner.global.best_share {
            inner.global.best_share = difficulty;
            true
        } else {
            false
        }
    }

    pub fn record_hashes(&self, worker: usize, hashes: u64) {
        let mut inner = self.inner.lock();
        inner.global.hashes += hashes;
        inner.pending_hashes += hashes;
        let entry = inner.workers.entry(worker).or_default();
        entry.hashes += hashes;
        entry.pending += hashes;
    }

    /// Fold hashes reported since the last call into the decayed meters.
    /// Returns the global rate in hashes per second.
    pub fn decay_meter(&self, interval: Duration) -> f64 {
        let mut inner = self.inner.lock();
        let elapsed = inner.last_decay.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return inner.global.hashrate;
        }
        let interval = interval.as_secs_f64();
        let sample = inner.pending_hashes as f64 / elapsed;
        inner.global.hashrate = decay_rate(inner.global.hashrate, sample, elapsed, interval);
        inner.pending_hashes = 0;
        for worker in inner.workers.values_mut() {
            let sample = worker.pending as f64 / elapsed;
            worker.hashrate = decay_rate(worker.hashrate, sample, elapsed, interval);
            worker.pending = 0;
        }
        inner.last_decay = Instant::now();
        inner.global.hashrate
    }

    pub fn accepted_total(&self) -> u64 {
        self.inner.lock().global.shares.accepted
    }

    /// Accepted shares per minute since start.
    pub fn utility(&self) -> f64 {
        let minutes = self.uptime().as_secs_f64() / 60.0;
        if minutes <= 0.0 {
            return 0.0;
        }
        self.accepted_total() as f64 / minutes
    }

    pub fn global(&self) -> GlobalCounters {
        self.inner.lock().global.clone()
    }

    pub fn pool(&self, pool: usize) -> PoolCounters {
        self.inner.lock().pools.get(&pool).cloned().unwrap_or_default()
    }

    pub fn worker(&self, worker: usize) -> WorkerCounters {
        self.inner.lock().workers.get(&worker).cloned().unwrap_or_default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let utility = self.utility();
        let inner = self.inner.lock();
        StatsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            utility,
            global: inner.global.clone(),
            pools: inner.pools.clone(),
            workers: inner.workers.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decay_converges_on_steady_input() {
        let mut rate = 0.0;
        for _ in 0..200 {
            rate = decay_rate(rate, 1000.0, 5.0, 5.0);
        }
        assert!((rate - 1000.0).abs() < 1.0, "rate {rate}");
    }

    #[test]
    fn test_decay_dampens_spikes() {
        let rate = decay_rate(100.0, 10_000.0, 0.5, 5.0);
        assert!(rate < 1_000.0, "one short sample should not dominate: {rate}");
        assert!(rate > 100.0);
    }

    #[test]
    fn test_share_counters_at_every_level() {
        let stats = Stats::new();
        stats.record_share(1, Some(7), true, 16.0);
        stats.record_share(1, None, false, 16.0);
        stats.record_stale(2, Some(7), 8.0);

        let global = stats.global();
        assert_eq!(global.shares.accepted, 1);
        assert_eq!(global.shares.rejected, 1);
        assert_eq!(global.shares.stale, 1);
        assert_eq!(global.shares.diff_accepted, 16.0);

        assert_eq!(stats.pool(1).shares.accepted, 1);
        assert_eq!(stats.pool(1).shares.rejected, 1);
        assert_eq!(stats.pool(2).shares.diff_stale, 8.0);
        assert_eq!(stats.worker(7).shares.accepted, 1);
        assert_eq!(stats.worker(7).shares.stale, 1);
        assert_eq!(stats.worker(7).shares.rejected, 0);
    }

    #[test]
    fn test_best_share_only_rises() {
        let stats = Stats::new();
        assert!(stats.record_best_share(10.0));
        assert!(!stats.record_best_share(5.0));
        assert!(stats.record_best_share(11.0));
        assert_eq!(stats.global().best_share, 11.0);
    }

    #[test]
    fn test_hash_meter() {
        let stats = Stats::new();
        stats.record_hashes(0, 5_000);
        std::thread::sleep(Duration::from_millis(20));
        let rate = stats.decay_meter(Duration::from_secs(5));
        assert!(rate > 0.0);
        assert_eq!(stats.worker(0).hashes, 5_000);
        assert!(stats.worker(0).hashrate > 0.0);
    }
}
