//! The engine: shared context plus the public control surface.
//!
//! [`EngineContext`] is the state every task works on (pools, queue, block
//! tracker, stats, workers). [`Engine`] owns it, starts the scheduler and
//! watchdog tasks, and exposes the control and status operations an outer
//! surface (CLI, API) needs.
//!
//! Lock order when more than one is held: queue, then pool set, then a
//! single pool's state. No lock is held across an await.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::block::{BlockTracker, CurrentBlock};
use crate::config::{EngineConfig, PoolConfig, PoolProtocol, Tuning};
use crate::error::{EngineError, Result};
use crate::job::Job;
use crate::pool::{Pool, PoolSet, PoolSnapshot, PoolStatus, Strategy};
use crate::protocol::{self, benchmark::BenchmarkClient, ProtocolClient, PushEvents, ShareReport};
use crate::queue::JobQueue;
use crate::stats::{Stats, StatsSnapshot};
use crate::worker::{DeviceParams, WorkerBackend, WorkerHandle, WorkerRegistry, WorkerSnapshot};
use crate::{scheduler, watchdog};

/// How long workers get to wind down before tasks are cancelled.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct EngineContext {
    pub tuning: Tuning,
    pub pools: PoolSet,
    pub queue: JobQueue,
    pub blocks: BlockTracker,
    pub stats: Stats,
    pub workers: WorkerRegistry,
    restart_epoch: AtomicU64,
    /// Job requests in flight.
    queued: AtomicUsize,
    cancel: CancellationToken,
    runtime: Handle,
}

impl EngineContext {
    pub(crate) fn new(tuning: Tuning, pools: PoolSet) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| EngineError::Config(format!("engine needs a tokio runtime: {}", e)))?;
        Ok(Self {
            tuning,
            pools,
            queue: JobQueue::new(),
            blocks: BlockTracker::new(),
            stats: Stats::new(),
            workers: WorkerRegistry::new(),
            restart_epoch: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            cancel: CancellationToken::new(),
            runtime,
        })
    }

    pub fn restart_epoch(&self) -> u64 {
        self.restart_epoch.load(Ordering::Acquire)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.runtime
    }

    pub(crate) fn queued(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub(crate) fn begin_request(&self) {
        self.queued.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn end_request(&self) {
        let _ = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
    }

    /// Tag a fresh job with its block generation and queue it, unless it is
    /// already stale. A new block or a long-poll restart flushes the queue
    /// and tells workers to drop what they hold.
    pub fn stage_job(&self, mut job: Job) -> bool {
        let current = self.pools.is_current(job.pool.id);
        let shared = self.pools.strategy().is_shared();
        if self.blocks.observe(&mut job, current, shared).invalidates() {
            self.restart_workers();
            self.discard_stale();
        }
        if self.is_stale(&job, false) {
            debug!("Discarding stale job {} from pool {}", job.id, job.pool.id);
            self.stats.record_discarded_work(job.pool.id, 1);
            return false;
        }
        self.queue.stage(job)
    }

    pub fn restart_workers(&self) {
        let epoch = self.restart_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!("Work restart {}", epoch);
    }

    /// Drop every staged job that went stale. Returns how many.
    pub fn discard_stale(&self) -> usize {
        let removed = self.queue.discard_where(|job| self.is_stale(job, false));
        let mut per_pool: HashMap<usize, u64> = HashMap::new();
        for job in &removed {
            *per_pool.entry(job.pool.id).or_default() += 1;
        }
        for (pool, count) in per_pool {
            self.stats.record_discarded_work(pool, count);
        }
        if !removed.is_empty() {
            debug!("Discarded {} stale jobs", removed.len());
        }
        removed.len()
    }

    /// Stop everything: no more staging, workers told to quit.
    pub fn request_shutdown(&self) {
        if !self.cancel.is_cancelled() {
            info!("Shutdown requested");
        }
        self.queue.freeze();
        self.workers.stop_all();
        self.cancel.cancel();
    }
}

impl PushEvents for EngineContext {
    fn job_pushed(&self, job: Job) {
        let pool = Arc::clone(&job.pool);
        self.stats.record_getwork(pool.id);
        if pool.is_idle() {
            self.pools.mark_recovered(pool.id);
        }
        self.stage_job(job);
    }

    fn share_resolved(&self, report: ShareReport) {
        self.share_result(
            &report.pool,
            report.job.as_ref(),
            report.accepted,
            report.reason.as_deref(),
            report.difficulty,
        );
    }

    fn share_dropped(&self, job: Job) {
        warn!("Share from pool {} dropped without a verdict", job.pool.id);
        self.stats.record_dropped(job.pool.id);
    }

    fn session_lost(&self, pool: &Arc<Pool>) {
        self.pools.mark_dead(pool.id);
        self.discard_stale();
    }

    fn session_restored(&self, pool: &Arc<Pool>) {
        pool.reset_getfails();
        self.pools.mark_recovered(pool.id);
    }

    fn should_listen(&self, pool: &Arc<Pool>) -> bool {
        self.pools.is_current(pool.id) || self.pools.strategy().is_shared()
    }
}

pub struct Engine {
    ctx: Arc<EngineContext>,
    base: EngineConfig,
    pool_configs: RwLock<HashMap<usize, PoolConfig>>,
    next_pool_id: AtomicUsize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

fn benchmark_pool_config() -> PoolConfig {
    PoolConfig {
        protocol: Some(PoolProtocol::Benchmark),
        ..PoolConfig::new("benchmark://local")
    }
}

impl Engine {
    /// Build an engine for `config`. Must be called inside a tokio runtime.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let tuning = Tuning::from_config(&config)?;
        let clients = if config.benchmark {
            vec![Arc::new(BenchmarkClient::new()) as Arc<dyn ProtocolClient>]
        } else {
            config
                .pools
                .iter()
                .map(|pool| protocol::client_for(pool, &tuning))
                .collect::<Result<Vec<_>>>()?
        };
        Self::with_clients(config, clients)
    }

    /// Like [`Engine::new`] but with caller-supplied protocol clients, one
    /// per configured pool in order.
    pub fn with_clients(config: EngineConfig, clients: Vec<Arc<dyn ProtocolClient>>) -> Result<Self> {
        config.validate()?;
        let tuning = Tuning::from_config(&config)?;
        let pool_list = if config.benchmark {
            vec![benchmark_pool_config()]
        } else {
            config.pools.clone()
        };
        if pool_list.len() != clients.len() {
            return Err(EngineError::Config(format!(
                "{} pools configured but {} clients supplied",
                pool_list.len(),
                clients.len()
            )));
        }

        let mut pool_configs = HashMap::new();
        let mut entries = Vec::with_capacity(pool_list.len());
        for (id, (pool_config, client)) in pool_list.into_iter().zip(clients).enumerate() {
            let pool = Arc::new(Pool::new(id, &pool_config, client));
            entries.push((pool, pool_config.quota, pool_config.enabled));
            pool_configs.insert(id, pool_config);
        }
        let mut next_id = entries.len();
        let pools = PoolSet::new(entries, config.strategy, tuning.fail_only)?;

        if let (Some(donation), false) = (&config.donation, config.benchmark) {
            if donation.percent > 0.0 {
                let client = protocol::client_for(&donation.pool, &tuning)?;
                let pool = Arc::new(Pool::new(next_id, &donation.pool, client));
                next_id += 1;
                info!("Donating {:.1}% of work requests to {}", donation.percent, pool.url);
                pools.set_donation(pool, donation.percent);
            }
        }

        let ctx = Arc::new(EngineContext::new(tuning, pools)?);
        Ok(Self {
            ctx,
            base: config,
            pool_configs: RwLock::new(pool_configs),
            next_pool_id: AtomicUsize::new(next_id),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn add_worker(&self, backend: Arc<dyn WorkerBackend>) -> Result<usize> {
        self.add_worker_with(backend, DeviceParams::default())
    }

    /// Register a backend. Started immediately if the engine is running.
    pub fn add_worker_with(&self, backend: Arc<dyn WorkerBackend>, params: DeviceParams) -> Result<usize> {
        let id = self.ctx.workers.add(backend, params);
        if self.started.load(Ordering::Acquire) {
            self.start_worker(id)?;
        }
        Ok(id)
    }

    fn start_worker(&self, id: usize) -> Result<()> {
        let slot = self
            .ctx
            .workers
            .get(id)
            .ok_or_else(|| EngineError::Config(format!("no worker with id {}", id)))?;
        let backend = Arc::clone(slot.backend());
        backend.configure(slot.params())?;
        backend.start(WorkerHandle::new(Arc::clone(&self.ctx), slot))?;
        info!("Started worker {} ({})", id, backend.name());
        Ok(())
    }

    async fn probe_pools(&self) {
        let timeout = self.ctx.tuning.request_timeout;
        let probes = self.ctx.pools.pools().into_iter().map(|pool| async move {
            let result = match tokio::time::timeout(timeout, pool.client().probe(&pool)).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::Transport("probe timed out".into())),
            };
            (pool, result)
        });
        for (pool, result) in join_all(probes).await {
            match result {
                Ok(()) => {
                    info!("Pool {} {} alive", pool.id, pool.url);
                    self.ctx.pools.mark_recovered(pool.id);
                }
                Err(e) => {
                    warn!("Pool {} {} probe failed: {}", pool.id, pool.url, e);
                    self.ctx.pools.mark_dead(pool.id);
                }
            }
        }
    }

    async fn start_push(&self, pool: Arc<Pool>) {
        if !pool.client().supports_push() {
            return;
        }
        let events: Arc<dyn PushEvents> = Arc::clone(&self.ctx) as Arc<dyn PushEvents>;
        let cancel = self.ctx.cancel.child_token();
        pool.client().start(Arc::clone(&pool), events, cancel).await;
    }

    /// Probe pools, start push listeners, the scheduler, the watchdog and
    /// every registered worker.
    pub async fn start(&self) -> Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Config("engine already started".into()));
        }
        self.probe_pools().await;
        if !self.ctx.pools.any_usable() {
            self.started.store(false, Ordering::Release);
            error!("No servers were found that could be used to get work from");
            return Err(EngineError::NoUsablePools);
        }

        let mut pools = self.ctx.pools.pools();
        pools.extend(self.ctx.pools.donation_pool());
        for pool in pools {
            self.start_push(pool).await;
        }

        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(scheduler::run(Arc::clone(&self.ctx))));
            tasks.push(tokio::spawn(watchdog::run(Arc::clone(&self.ctx))));
        }

        for slot in self.ctx.workers.slots() {
            self.start_worker(slot.id)?;
        }
        info!(
            "Engine started with {} pools ({}) and {} workers",
            self.ctx.pools.len(),
            self.ctx.pools.strategy(),
            self.ctx.workers.len()
        );
        Ok(())
    }

    /// Resolves once something asked the engine to stop.
    pub async fn wait(&self) {
        self.ctx.cancel.cancelled().await;
    }

    pub async fn shutdown(&self) {
        self.ctx.queue.freeze();
        self.ctx.workers.stop_all();
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while self.ctx.workers.any_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        if self.ctx.workers.any_running() {
            warn!("Workers still running after {:?}", SHUTDOWN_GRACE);
        }
        self.ctx.request_shutdown();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!("Engine stopped");
    }

    pub fn pool_snapshots(&self) -> Vec<PoolSnapshot> {
        self.ctx.pools.snapshot()
    }

    pub fn stats_snapshot(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    pub fn worker_snapshots(&self) -> Vec<WorkerSnapshot> {
        self.ctx.workers.snapshot()
    }

    pub fn current_block(&self) -> CurrentBlock {
        self.ctx.blocks.current_block()
    }

    pub fn queue_len(&self) -> usize {
        self.ctx.queue.len()
    }

    pub fn restart_epoch(&self) -> u64 {
        self.ctx.restart_epoch()
    }

    fn require_pool(&self, id: usize) -> Result<Arc<Pool>> {
        self.ctx
            .pools
            .get(id)
            .ok_or_else(|| EngineError::Config(format!("no pool with id {}", id)))
    }

    /// Make `id` the top priority pool and switch to it.
    pub fn switch_pool(&self, id: usize) -> Result<()> {
        self.require_pool(id)?;
        self.ctx.pools.switch_pools(Some(id));
        self.ctx.discard_stale();
        self.ctx.queue.signal_demand();
        Ok(())
    }

    pub fn enable_pool(&self, id: usize) -> Result<()> {
        self.ctx.pools.enable_pool(id)?;
        self.ctx.queue.signal_demand();
        Ok(())
    }

    pub fn disable_pool(&self, id: usize) -> Result<()> {
        self.ctx.pools.disable_pool(id)?;
        self.ctx.discard_stale();
        Ok(())
    }

    pub fn set_quota(&self, id: usize, quota: u32) -> Result<()> {
        self.ctx.pools.set_quota(id, quota)
    }

    pub fn set_strategy(&self, strategy: Strategy) {
        self.ctx.pools.set_strategy(strategy);
        self.ctx.queue.signal_demand();
    }

    /// Add a pool at the lowest priority. Push listeners start right away
    /// on a running engine.
    pub async fn add_pool(&self, config: PoolConfig) -> Result<usize> {
        if config.url.trim().is_empty() {
            return Err(EngineError::Config("pool url is empty".into()));
        }
        let client = protocol::client_for(&config, &self.ctx.tuning)?;
        let id = self.next_pool_id.fetch_add(1, Ordering::AcqRel);
        let pool = Arc::new(Pool::new(id, &config, client));
        self.ctx.pools.add_pool(Arc::clone(&pool), config.quota)?;
        if !config.enabled {
            self.ctx.pools.disable_pool(id)?;
        }
        self.pool_configs.write().insert(id, config);
        if self.started.load(Ordering::Acquire) {
            self.start_push(pool).await;
            self.ctx.queue.signal_demand();
        }
        Ok(id)
    }

    /// The configuration as it stands now, pool order and quotas included.
    pub fn effective_config(&self) -> EngineConfig {
        let mut config = self.base.clone();
        config.strategy = self.ctx.pools.strategy();
        if config.benchmark {
            return config;
        }
        let pool_configs = self.pool_configs.read();
        config.pools = self
            .ctx
            .pools
            .by_priority()
            .iter()
            .filter_map(|pool| {
                let mut entry = pool_configs.get(&pool.id)?.clone();
                entry.quota = self.ctx.pools.quota(pool.id).unwrap_or(entry.quota);
                entry.enabled = self.ctx.pools.status(pool.id) == Some(PoolStatus::Enabled);
                Some(entry)
            })
            .collect();
        config
    }

    pub fn save_config<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let config = self.effective_config();
        config.save(path.as_ref())?;
        info!("Configuration written to {}", path.as_ref().display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pool_config, MockClient};
    use crate::job::ProtocolKind;

    fn engine(n: usize) -> Engine {
        let config = EngineConfig::with_pools((0..n).map(pool_config).collect());
        let clients = (0..n)
            .map(|_| Arc::new(MockClient::new(ProtocolKind::Poll)) as Arc<dyn ProtocolClient>)
            .collect();
        Engine::with_clients(config, clients).unwrap()
    }

    #[test]
    fn test_needs_runtime() {
        let config = EngineConfig::with_pools(vec![pool_config(0)]);
        let clients = vec![Arc::new(MockClient::new(ProtocolKind::Poll)) as Arc<dyn ProtocolClient>];
        assert!(matches!(
            Engine::with_clients(config, clients),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_client_count_must_match() {
        let config = EngineConfig::with_pools(vec![pool_config(0), pool_config(1)]);
        let clients = vec![Arc::new(MockClient::new(ProtocolKind::Poll)) as Arc<dyn ProtocolClient>];
        assert!(Engine::with_clients(config, clients).is_err());
    }

    #[tokio::test]
    async fn test_new_block_flushes_queue() {
        let engine = engine(1);
        let ctx = engine.context();
        let pool = ctx.pools.get(0).unwrap();
        assert!(ctx.stage_job(crate::testing::job_on(&pool, 0x11)));
        assert!(ctx.stage_job(crate::testing::job_on(&pool, 0x11)));
        assert_eq!(ctx.queue.len(), 2);
        assert_eq!(ctx.restart_epoch(), 0);

        assert!(ctx.stage_job(crate::testing::job_on(&pool, 0x22)));
        assert_eq!(ctx.queue.len(), 1);
        assert_eq!(ctx.restart_epoch(), 1);
        assert_eq!(ctx.stats.global().discarded_work, 2);

        // work for the superseded block is refused
        assert!(!ctx.stage_job(crate::testing::job_on(&pool, 0x11)));
        assert_eq!(ctx.queue.len(), 1);
    }

    #[tokio::test]
    async fn test_effective_config_follows_changes() {
        let engine = engine(3);
        engine.switch_pool(2).unwrap();
        engine.disable_pool(1).unwrap();
        engine.set_quota(0, 5).unwrap();
        engine.set_strategy(Strategy::Quota);

        let config = engine.effective_config();
        assert_eq!(config.strategy, Strategy::Quota);
        let urls: Vec<&str> = config.pools.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["http://127.0.0.1:18002", "http://127.0.0.1:18000", "http://127.0.0.1:18001"]);
        assert_eq!(config.pools[1].quota, 5);
        assert!(!config.pools[2].enabled);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarry.toml");
        engine.save_config(&path).unwrap();
        let reloaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(reloaded.pools, config.pools);
    }

    #[tokio::test]
    async fn test_unknown_pool_rejected() {
        let engine = engine(1);
        assert!(engine.switch_pool(7).is_err());
        assert!(engine.enable_pool(7).is_err());
    }

    #[tokio::test]
    async fn test_benchmark_engine() {
        let config = EngineConfig {
            benchmark: true,
            ..EngineConfig::default()
        };
        let engine = Engine::new(config).unwrap();
        let snapshot = engine.pool_snapshots();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].protocol, PoolProtocol::Benchmark);
        assert!(engine.effective_config().pools.is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_without_usable_pools() {
        let config = EngineConfig::with_pools(vec![pool_config(0)]);
        let client = Arc::new(MockClient::new(ProtocolKind::Poll));
        client.fail.store(true, Ordering::SeqCst);
        let engine = Engine::with_clients(config, vec![client as Arc<dyn ProtocolClient>]).unwrap();
        assert!(matches!(engine.start().await, Err(EngineError::NoUsablePools)));
    }
}
