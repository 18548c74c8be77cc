//! Upstream pools.
//!
//! A [`Pool`] owns its credentials, its protocol client and the health and
//! session state that only concern that pool (guarded by the pool's own
//! lock). Priority, enabled status and the current-pool pointer live in the
//! [`PoolSet`].

mod set;
mod strategy;

pub use set::{PoolSet, PoolSnapshot};
pub use strategy::{PoolStatus, Strategy};

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::config::{PoolConfig, PoolProtocol};
use crate::job::{BlockId, ProtocolKind};
use crate::protocol::ProtocolClient;

/// Identity of a pub/sub connection. A new epoch begins on every reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionState {
    pub epoch: u64,
    pub active: bool,
}

#[derive(Debug, Clone, Default)]
pub struct PoolState {
    pub seq_getfails: u32,
    pub seq_rejects: u32,
    pub idle_since: Option<Instant>,
    pub last_work: Option<Instant>,
    /// Rolling average of fetch round trips.
    pub fetch_latency: Duration,
    /// Block this pool last handed us work for.
    pub block_view: Option<BlockId>,
    pub session: SessionState,
    /// Last share difficulty the pool asked for.
    pub share_difficulty: f64,
}

pub struct Pool {
    pub id: usize,
    pub url: String,
    pub user: String,
    pub pass: String,
    pub protocol: PoolProtocol,
    pub proxy: Option<String>,
    /// Pool accepts shares for superseded work.
    pub submit_old: bool,
    client: Arc<dyn ProtocolClient>,
    idle: AtomicBool,
    lagging: AtomicBool,
    probing: AtomicBool,
    staged: AtomicUsize,
    state: Mutex<PoolState>,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("protocol", &self.protocol)
            .field("idle", &self.is_idle())
            .finish_non_exhaustive()
    }
}

impl Pool {
    pub fn new(id: usize, config: &PoolConfig, client: Arc<dyn ProtocolClient>) -> Self {
        Self {
            id,
            url: config.url.clone(),
            user: config.user.clone(),
            pass: config.pass.clone(),
            protocol: config.resolved_protocol(),
            proxy: config.proxy.clone(),
            submit_old: config.submit_old,
            client,
            idle: AtomicBool::new(false),
            lagging: AtomicBool::new(false),
            probing: AtomicBool::new(false),
            staged: AtomicUsize::new(0),
            state: Mutex::new(PoolState {
                share_difficulty: 1.0,
                ..PoolState::default()
            }),
        }
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub fn kind(&self) -> ProtocolKind {
        self.client.kind()
    }

    /// Whether jobs can be minted without a round trip to the server.
    pub fn can_generate_locally(&self) -> bool {
        matches!(
            self.kind(),
            ProtocolKind::BlockTemplate | ProtocolKind::PubSub | ProtocolKind::Benchmark
        )
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub(crate) fn set_idle(&self, idle: bool) -> bool {
        let prev = self.idle.swap(idle, Ordering::AcqRel);
        if idle && !prev {
            self.state.lock().idle_since = Some(Instant::now());
        }
        prev
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::Acquire)
    }

    /// Returns the previous value.
    pub(crate) fn set_lagging(&self, lagging: bool) -> bool {
        self.lagging.swap(lagging, Ordering::AcqRel)
    }

    /// False if a probe is already running.
    pub(crate) fn begin_probe(&self) -> bool {
        !self.probing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn end_probe(&self) {
        self.probing.store(false, Ordering::Release);
    }

    /// Jobs from this pool currently sitting in the queue.
    pub fn staged(&self) -> usize {
        self.staged.load(Ordering::Relaxed)
    }

    pub(crate) fn staged_add(&self, n: usize) {
        self.staged.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn staged_sub(&self, n: usize) {
        let _ = self
            .staged
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }

    pub fn state(&self) -> PoolState {
        self.state.lock().clone()
    }

    pub(crate) fn bump_getfails(&self) -> u32 {
        let mut state = self.state.lock();
        state.seq_getfails += 1;
        state.seq_getfails
    }

    pub(crate) fn record_work(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.seq_getfails = 0;
        state.last_work = Some(Instant::now());
        state.fetch_latency = if state.fetch_latency.is_zero() {
            latency
        } else {
            (state.fetch_latency * 3 + latency) / 4
        };
    }

    pub(crate) fn reset_getfails(&self) {
        self.state.lock().seq_getfails = 0;
    }

    pub(crate) fn bump_seq_rejects(&self) -> u32 {
        let mut state = self.state.lock();
        state.seq_rejects += 1;
        state.seq_rejects
    }

    pub(crate) fn reset_seq_rejects(&self) {
        self.state.lock().seq_rejects = 0;
    }

    pub fn fetch_latency(&self) -> Duration {
        self.state.lock().fetch_latency
    }

    pub fn session(&self) -> SessionState {
        self.state.lock().session
    }

    /// Start a new pub/sub session, returning its epoch.
    pub(crate) fn begin_session(&self) -> u64 {
        let mut state = self.state.lock();
        state.session.epoch += 1;
        state.session.active = true;
        state.session.epoch
    }

    pub(crate) fn end_session(&self) {
        self.state.lock().session.active = false;
    }

    pub fn share_difficulty(&self) -> f64 {
        self.state.lock().share_difficulty
    }

    pub(crate) fn set_share_difficulty(&self, difficulty: f64) {
        self.state.lock().share_difficulty = difficulty;
    }

    pub fn block_view(&self) -> Option<BlockId> {
        self.state.lock().block_view
    }

    pub(crate) fn set_block_view(&self, block: BlockId) {
        self.state.lock().block_view = Some(block);
    }
}
