//! Fixtures shared by the unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::PoolConfig;
use crate::difficulty;
use crate::error::{EngineError, Result};
use crate::job::{Job, ProtocolKind, HEADER_LEN};
use crate::pool::Pool;
use crate::protocol::{ProtocolClient, SubmitOutcome};

pub(crate) const TEST_NTIME: u32 = 0x6000_0000;
pub(crate) const TEST_NBITS: u32 = 0x1d00ffff;

/// Scriptable in-memory pool.
pub(crate) struct MockClient {
    pub kind: ProtocolKind,
    pub fetches: AtomicUsize,
    pub fail: AtomicBool,
    pub outcome: Mutex<SubmitOutcome>,
    pub submitted: Mutex<Vec<Job>>,
    pub roll_time: Option<Duration>,
    pub prev_byte: Mutex<u8>,
}

impl MockClient {
    pub fn new(kind: ProtocolKind) -> Self {
        Self {
            kind,
            fetches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            outcome: Mutex::new(SubmitOutcome::Accepted),
            submitted: Mutex::new(Vec::new()),
            roll_time: None,
            prev_byte: Mutex::new(0x11),
        }
    }

    pub fn rolling(mut self, roll_time: Duration) -> Self {
        self.roll_time = Some(roll_time);
        self
    }

    pub fn submitted(&self) -> usize {
        self.submitted.lock().len()
    }
}

#[async_trait]
impl ProtocolClient for MockClient {
    fn kind(&self) -> ProtocolKind {
        self.kind
    }

    async fn fetch_job(&self, pool: &Arc<Pool>) -> Result<Job> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection refused".into()));
        }
        let mut job = job_on(pool, *self.prev_byte.lock());
        job.protocol = self.kind;
        Ok(job.with_roll_time(self.roll_time))
    }

    async fn submit(&self, job: &Job) -> Result<SubmitOutcome> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(EngineError::Transport("connection refused".into()));
        }
        self.submitted.lock().push(job.clone());
        Ok(self.outcome.lock().clone())
    }
}

pub(crate) fn pool_config(id: usize) -> PoolConfig {
    PoolConfig::new(&format!("http://127.0.0.1:{}", 18000 + id)).with_credentials("worker", "x")
}

pub(crate) fn test_pool(id: usize) -> Arc<Pool> {
    test_pool_with(id, Arc::new(MockClient::new(ProtocolKind::Poll)))
}

pub(crate) fn test_pool_with(id: usize, client: Arc<dyn ProtocolClient>) -> Arc<Pool> {
    Arc::new(Pool::new(id, &pool_config(id), client))
}

/// A job whose prevhash is `prev_byte` repeated.
pub(crate) fn job_on(pool: &Arc<Pool>, prev_byte: u8) -> Job {
    let mut header = [0u8; HEADER_LEN];
    header[0..4].copy_from_slice(&2u32.to_le_bytes());
    header[4..36].fill(prev_byte);
    header[68..72].copy_from_slice(&TEST_NTIME.to_le_bytes());
    header[72..76].copy_from_slice(&TEST_NBITS.to_le_bytes());
    Job::new(Arc::clone(pool), ProtocolKind::Poll, header, difficulty::MAX_TARGET)
}

pub(crate) fn test_job(pool: &Arc<Pool>) -> Job {
    job_on(pool, 0x11)
}
