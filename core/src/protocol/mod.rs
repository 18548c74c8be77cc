//! Pool wire protocols.
//!
//! Every protocol sits behind [`ProtocolClient`]. Push-capable clients
//! (long poll, pub/sub) deliver jobs and share verdicts back into the
//! engine through [`PushEvents`] rather than through a return value.

pub mod benchmark;
pub mod poll;
pub mod rpc;
pub mod stratum;
pub mod template;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::{PoolConfig, PoolProtocol, Tuning};
use crate::error::Result;
use crate::job::{Job, ProtocolKind};
use crate::pool::Pool;

/// Immediate answer to a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(Option<String>),
    /// Sent; the verdict arrives later through [`PushEvents::share_resolved`].
    Pending,
}

/// A share verdict that arrived asynchronously.
#[derive(Debug, Clone)]
pub struct ShareReport {
    pub pool: Arc<Pool>,
    /// None when the pool answered a share we no longer track.
    pub job: Option<Job>,
    pub accepted: bool,
    pub reason: Option<String>,
    pub difficulty: f64,
}

/// Callbacks from protocol tasks into the engine.
pub trait PushEvents: Send + Sync {
    /// A job arrived without being asked for (long poll, clean notify).
    fn job_pushed(&self, job: Job);

    fn share_resolved(&self, report: ShareReport);

    /// A share was abandoned without a verdict.
    fn share_dropped(&self, job: Job);

    fn session_lost(&self, pool: &Arc<Pool>);

    fn session_restored(&self, pool: &Arc<Pool>);

    /// Long-poll style listeners idle while this is false.
    fn should_listen(&self, pool: &Arc<Pool>) -> bool;
}

#[async_trait]
pub trait ProtocolClient: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Whether [`ProtocolClient::start`] runs anything.
    fn supports_push(&self) -> bool {
        false
    }

    /// Obtain one fresh job. Retries are the client's business.
    async fn fetch_job(&self, pool: &Arc<Pool>) -> Result<Job>;

    async fn submit(&self, job: &Job) -> Result<SubmitOutcome>;

    /// Cheap liveness check used at startup and for idle pools.
    async fn probe(&self, pool: &Arc<Pool>) -> Result<()> {
        self.fetch_job(pool).await.map(|_| ())
    }

    /// Spawn background tasks; they must exit once `cancel` fires.
    async fn start(&self, _pool: Arc<Pool>, _events: Arc<dyn PushEvents>, _cancel: CancellationToken) {}

    /// Close connections idle longer than `max_idle`, returning how many.
    fn reap_idle(&self, _max_idle: Duration) -> usize {
        0
    }
}

/// Build the client matching a pool's configured protocol.
pub fn client_for(config: &PoolConfig, tuning: &Tuning) -> Result<Arc<dyn ProtocolClient>> {
    let client: Arc<dyn ProtocolClient> = match config.resolved_protocol() {
        PoolProtocol::Poll => Arc::new(poll::PollClient::new(config, tuning)?),
        PoolProtocol::Template => Arc::new(template::TemplateClient::new(config, tuning)?),
        PoolProtocol::Stratum => Arc::new(stratum::StratumClient::new(config, tuning)?),
        PoolProtocol::Benchmark => Arc::new(benchmark::BenchmarkClient::new()),
    };
    Ok(client)
}
