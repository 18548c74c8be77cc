//! Offline benchmark work: a fixed block, a trivial target, every share
//! accepted locally.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::{ProtocolClient, SubmitOutcome};
use crate::difficulty;
use crate::error::Result;
use crate::job::{Header, Job, ProtocolKind, HEADER_LEN};
use crate::pool::Pool;

const BENCHMARK_DIFFICULTY: f64 = 0.001;
const BENCHMARK_ROLL: Duration = Duration::from_secs(60);
const BENCHMARK_NTIME: u32 = 1_700_000_000;
const BENCHMARK_NBITS: u32 = 0x1d00ffff;

pub struct BenchmarkClient {
    /// Varies the merkle field so successive jobs differ.
    sequence: AtomicU32,
}

impl Default for BenchmarkClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BenchmarkClient {
    pub fn new() -> Self {
        Self {
            sequence: AtomicU32::new(0),
        }
    }

    fn header(&self) -> Header {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&2u32.to_le_bytes());
        header[4..36].fill(0xbe);
        header[36..40].copy_from_slice(&seq.to_le_bytes());
        header[68..72].copy_from_slice(&BENCHMARK_NTIME.to_le_bytes());
        header[72..76].copy_from_slice(&BENCHMARK_NBITS.to_le_bytes());
        header
    }
}

#[async_trait]
impl ProtocolClient for BenchmarkClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Benchmark
    }

    async fn fetch_job(&self, pool: &Arc<Pool>) -> Result<Job> {
        let target = difficulty::target_from_difficulty(BENCHMARK_DIFFICULTY);
        Ok(Job::new(Arc::clone(pool), ProtocolKind::Benchmark, self.header(), target)
            .with_roll_time(Some(BENCHMARK_ROLL)))
    }

    async fn submit(&self, _job: &Job) -> Result<SubmitOutcome> {
        Ok(SubmitOutcome::Accepted)
    }

    async fn probe(&self, _pool: &Arc<Pool>) -> Result<()> {
        Ok(())
    }
}
