//! Quarry mining coordinator engine.
//!
//! Pulls work from upstream pools over getwork, getblocktemplate or
//! stratum, stages it for compute backends, detects new blocks and stale
//! work, and routes solved shares back to the pool they came from.

pub mod block;
pub mod config;
pub mod connection;
pub mod difficulty;
pub mod engine;
pub mod error;
pub mod job;
pub mod merkle;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod stats;
pub mod worker;

mod scheduler;
mod stale;
mod submit;
mod watchdog;

#[cfg(test)]
pub(crate) mod testing;

pub use block::CurrentBlock;
pub use config::{EngineConfig, PoolConfig, PoolProtocol, Tuning};
pub use engine::{Engine, EngineContext};
pub use error::{EngineError, Result};
pub use job::{Job, ProtocolKind};
pub use pool::{PoolSnapshot, PoolStatus, Strategy};
pub use protocol::{ProtocolClient, PushEvents, SubmitOutcome};
pub use stats::StatsSnapshot;
pub use watchdog::format_hashrate;
pub use worker::{DeviceParams, Health, WorkerBackend, WorkerHandle, WorkerSnapshot};
