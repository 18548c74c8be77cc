//! The unit of work handed to workers.
//!
//! A job carries a canonical 80-byte header (little-endian fields, internal
//! byte order hashes), its share target and the bookkeeping the queue, the
//! staleness checks and the submission path need. Clones are explicit deep
//! copies via [`Job::make_clone`].

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::difficulty::{self, Target};
use crate::merkle::sha256d;
use crate::pool::Pool;

pub const HEADER_LEN: usize = 80;
pub type Header = [u8; HEADER_LEN];

const PREV_HASH: Range<usize> = 4..36;
const NTIME_OFFSET: usize = 68;
const NBITS_OFFSET: usize = 72;
const NONCE_OFFSET: usize = 76;

/// Rolling past this many seconds would put ntime implausibly far ahead.
pub const MAX_ROLLS: u32 = 7000;

static NEXT_JOB_ID: AtomicU64 = AtomicU64::new(1);

/// Monotonic job sequence id.
pub fn next_job_id() -> u64 {
    NEXT_JOB_ID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    Poll,
    BlockTemplate,
    PubSub,
    Benchmark,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolKind::Poll => "getwork",
            ProtocolKind::BlockTemplate => "gbt",
            ProtocolKind::PubSub => "stratum",
            ProtocolKind::Benchmark => "benchmark",
        };
        f.write_str(name)
    }
}

/// Identity of the block a job builds on: its previous-block hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub [u8; 32]);

impl fmt::Display for BlockId {
    /// Explorer byte order.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut be = self.0;
        be.reverse();
        f.write_str(&hex::encode(be))
    }
}

/// Session-scoped data for pub/sub jobs.
#[derive(Debug, Clone)]
pub struct StratumWork {
    pub job_id: String,
    pub extranonce2: Vec<u8>,
    pub ntime: u32,
    /// Connection epoch the job was generated under.
    pub session: u64,
}

/// What a block-template submission needs besides the header.
#[derive(Debug, Clone)]
pub struct TemplateWork {
    pub coinbase: Vec<u8>,
    pub transactions: Arc<Vec<Vec<u8>>>,
    pub workid: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub enum JobPayload {
    #[default]
    None,
    /// Trailing 48 bytes of the getwork data blob, echoed back on submit.
    Poll { tail: Vec<u8> },
    Template(TemplateWork),
    Stratum(StratumWork),
}

#[derive(Debug, Clone)]
pub struct Job {
    pub id: u64,
    pub header: Header,
    pub target: Target,
    pub difficulty: f64,
    pub protocol: ProtocolKind,
    pub pool: Arc<Pool>,
    pub payload: JobPayload,
    pub staged_at: Instant,
    /// How long the server allows ntime rolling, if at all.
    pub roll_time: Option<Duration>,
    pub generation: u64,
    pub is_clone: bool,
    pub roll_count: u32,
    pub mandatory: bool,
    pub stale: bool,
    pub from_long_poll: bool,
    pub likely_block: bool,
    pub worker: Option<usize>,
}

fn read_u32(header: &Header, offset: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&header[offset..offset + 4]);
    u32::from_le_bytes(b)
}

impl Job {
    pub fn new(pool: Arc<Pool>, protocol: ProtocolKind, header: Header, target: Target) -> Self {
        let target = difficulty::sanitize(target);
        Self {
            id: next_job_id(),
            header,
            difficulty: difficulty::difficulty_from_target(&target),
            target,
            protocol,
            pool,
            payload: JobPayload::None,
            staged_at: Instant::now(),
            roll_time: None,
            generation: 0,
            is_clone: false,
            roll_count: 0,
            mandatory: false,
            stale: false,
            from_long_poll: false,
            likely_block: false,
            worker: None,
        }
    }

    pub fn with_payload(mut self, payload: JobPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_roll_time(mut self, roll_time: Option<Duration>) -> Self {
        self.roll_time = roll_time.filter(|d| !d.is_zero());
        self
    }

    pub fn block_id(&self) -> BlockId {
        let mut id = [0u8; 32];
        id.copy_from_slice(&self.header[PREV_HASH]);
        BlockId(id)
    }

    pub fn ntime(&self) -> u32 {
        read_u32(&self.header, NTIME_OFFSET)
    }

    pub fn set_ntime(&mut self, ntime: u32) {
        self.header[NTIME_OFFSET..NTIME_OFFSET + 4].copy_from_slice(&ntime.to_le_bytes());
    }

    pub fn nbits(&self) -> u32 {
        read_u32(&self.header, NBITS_OFFSET)
    }

    pub fn nonce(&self) -> u32 {
        read_u32(&self.header, NONCE_OFFSET)
    }

    pub fn set_nonce(&mut self, nonce: u32) {
        self.header[NONCE_OFFSET..NONCE_OFFSET + 4].copy_from_slice(&nonce.to_le_bytes());
    }

    /// Double-SHA256 of the header, little-endian for target comparison.
    pub fn hash(&self) -> [u8; 32] {
        sha256d(&self.header)
    }

    /// Counts towards the queue's rollable total.
    pub fn is_rollable(&self) -> bool {
        self.roll_time.is_some() && !self.is_clone
    }

    /// Bump ntime by one second and take a fresh id.
    pub fn roll(&mut self) {
        let ntime = self.ntime().wrapping_add(1);
        self.set_ntime(ntime);
        self.roll_count += 1;
        self.id = next_job_id();
    }

    /// Independent copy for a worker; the master stays in the queue.
    pub fn make_clone(&self) -> Job {
        let mut clone = self.clone();
        clone.id = next_job_id();
        clone.is_clone = true;
        clone.mandatory = false;
        clone.from_long_poll = false;
        clone.staged_at = self
            .staged_at
            .checked_sub(Duration::from_secs(1))
            .unwrap_or(self.staged_at);
        clone
    }
}
