//! Block change detection.
//!
//! Every job is checked against the set of recently seen previous-block
//! hashes. A never-seen hash means the network moved on: the block
//! generation is bumped and everything older becomes stale.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Local};
use log::{debug, info};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::difficulty;
use crate::job::{BlockId, Job};

/// Previous-block hashes remembered for recognising late work.
pub const BLOCK_HISTORY: usize = 6;

/// What observing a job told us about the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First block ever seen; nothing to invalidate.
    Baseline,
    /// The network moved to a new block.
    NewBlock,
    /// Long-poll or clean notify on the current block: restart anyway.
    Restart,
    Current,
    /// Work for a block we already left behind.
    Behind,
}

impl Observation {
    /// Whether workers must drop what they are doing.
    pub fn invalidates(self) -> bool {
        matches!(self, Observation::NewBlock | Observation::Restart)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CurrentBlock {
    /// Explorer byte order.
    pub hash: Option<String>,
    pub since: Option<DateTime<Local>>,
    pub generation: u64,
    pub network_difficulty: f64,
    pub blocks_seen: u64,
}

#[derive(Default)]
struct History {
    known: HashMap<BlockId, u64>,
    order: VecDeque<BlockId>,
    current: Option<BlockId>,
}

pub struct BlockTracker {
    history: Mutex<History>,
    generation: AtomicU64,
    current: RwLock<CurrentBlock>,
}

impl Default for BlockTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockTracker {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(History::default()),
            generation: AtomicU64::new(0),
            current: RwLock::new(CurrentBlock::default()),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn current_block(&self) -> CurrentBlock {
        self.current.read().clone()
    }

    /// Network difficulty of the current block, 0 before the first job.
    pub fn network_difficulty(&self) -> f64 {
        self.current.read().network_difficulty
    }

    /// Classify `job` and tag it with its block generation.
    ///
    /// `pool_current` and `shared` decide whether a long-poll restart on the
    /// current block is worth acting on.
    pub fn observe(&self, job: &mut Job, pool_current: bool, shared: bool) -> Observation {
        let block = job.block_id();
        let mut history = self.history.lock();

        if let Some(&generation) = history.known.get(&block) {
            job.generation = generation;
            job.pool.set_block_view(block);
            if history.current != Some(block) {
                job.stale = true;
                debug!("Pool {} is behind on block {}", job.pool.id, block);
                return Observation::Behind;
            }
            if job.from_long_poll && (pool_current || shared) {
                let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
                history.known.insert(block, generation);
                job.generation = generation;
                self.current.write().generation = generation;
                info!("Long poll from pool {} requested work restart", job.pool.id);
                return Observation::Restart;
            }
            return Observation::Current;
        }

        let first = history.current.is_none();
        let generation = if first {
            self.generation()
        } else {
            self.generation.fetch_add(1, Ordering::AcqRel) + 1
        };
        history.known.insert(block, generation);
        history.order.push_back(block);
        while history.order.len() > BLOCK_HISTORY {
            if let Some(old) = history.order.pop_front() {
                history.known.remove(&old);
            }
        }
        history.current = Some(block);
        job.generation = generation;
        job.pool.set_block_view(block);

        {
            let mut current = self.current.write();
            current.hash = Some(block.to_string());
            current.since = Some(Local::now());
            current.generation = generation;
            current.network_difficulty = difficulty::network_difficulty(job.nbits());
            current.blocks_seen += 1;
        }

        if first {
            info!("Current block {}", block);
            Observation::Baseline
        } else {
            info!("New block {} detected on pool {}", block, job.pool.id);
            Observation::NewBlock
        }
    }
}
