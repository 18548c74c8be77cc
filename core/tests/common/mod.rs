//! Shared fixtures for the engine integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use quarry_core::difficulty::MAX_TARGET;
use quarry_core::job::HEADER_LEN;
use quarry_core::pool::Pool;
use quarry_core::{EngineError, Job, ProtocolClient, ProtocolKind, Result, SubmitOutcome, WorkerBackend, WorkerHandle};

pub const NTIME: u32 = 0x6500_0000;

/// Header with a fixed previous-block hash and the given nbits.
pub fn header(prev_byte: u8, nbits: u32) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&0x2000_0000u32.to_le_bytes());
    header[4..36].fill(prev_byte);
    header[68..72].copy_from_slice(&NTIME.to_le_bytes());
    header[72..76].copy_from_slice(&nbits.to_le_bytes());
    header
}

/// Pool stand-in that hands out easy jobs and answers submissions with a
/// fixed verdict.
pub struct ScriptedPool {
    pub kind: ProtocolKind,
    pub verdict: Mutex<SubmitOutcome>,
    pub down: AtomicBool,
    pub fetches: AtomicUsize,
    pub submitted: Mutex<Vec<Job>>,
}

impl ScriptedPool {
    pub fn new(verdict: SubmitOutcome) -> Arc<Self> {
        Arc::new(Self {
            // locally generated work keeps the scheduler off the lagging path
            kind: ProtocolKind::BlockTemplate,
            verdict: Mutex::new(verdict),
            down: AtomicBool::new(false),
            fetches: AtomicUsize::new(0),
            submitted: Mutex::new(Vec::new()),
        })
    }

    pub fn submitted(&self) -> Vec<Job> {
        self.submitted.lock().clone()
    }
}

#[async_trait]
impl ProtocolClient for ScriptedPool {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    async fn fetch_job(&self, pool: &Arc<Pool>) -> Result<Job> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection refused".into()));
        }
        Ok(Job::new(Arc::clone(pool), self.kind, header(0x11, 0x1d00ffff), MAX_TARGET))
    }

    async fn submit(&self, job: &Job) -> Result<SubmitOutcome> {
        self.submitted.lock().push(job.clone());
        Ok(self.verdict.lock().clone())
    }
}

/// Backend that does no hashing; the test drives its handle directly.
#[derive(Default)]
pub struct ManualBackend {
    handle: Mutex<Option<WorkerHandle>>,
}

impl ManualBackend {
    pub fn handle(&self) -> Option<WorkerHandle> {
        self.handle.lock().clone()
    }
}

impl WorkerBackend for ManualBackend {
    fn name(&self) -> &str {
        "manual"
    }

    fn start(&self, handle: WorkerHandle) -> Result<()> {
        *self.handle.lock() = Some(handle);
        Ok(())
    }

    fn request_stop(&self) {}

    fn is_running(&self) -> bool {
        false
    }
}

/// Poll `cond` until it holds or `limit` passes.
pub async fn eventually<F: FnMut() -> bool>(limit: Duration, mut cond: F) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
