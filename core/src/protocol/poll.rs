//! Getwork polling with optional long poll and ntime rolling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::rpc::{RpcReply, RpcTransport};
use super::{ProtocolClient, PushEvents, SubmitOutcome};
use crate::config::{PoolConfig, Tuning};
use crate::difficulty::{self, Target};
use crate::error::{EngineError, Result};
use crate::job::{Header, Job, JobPayload, ProtocolKind, HEADER_LEN};
use crate::pool::Pool;

pub(crate) const LONG_POLL_HEADER: &str = "x-long-polling";
const ROLL_NTIME_HEADER: &str = "x-roll-ntime";
const REJECT_REASON_HEADER: &str = "x-reject-reason";

const GETWORK_DATA_LEN: usize = 128;
/// Long-poll requests park on the server until the block changes.
pub(crate) const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(60 * 60);
/// How often an idle listener re-checks whether it should be listening.
const LISTEN_IDLE: Duration = Duration::from_secs(5);

/// Getwork data carries the header as big-endian 32-bit words.
pub(crate) fn swap_words(data: &[u8]) -> Vec<u8> {
    data.chunks(4)
        .flat_map(|word| word.iter().rev().copied())
        .collect()
}

/// `Y` allows rolling for the scan time, `expire=N` for N seconds.
pub(crate) fn parse_roll_ntime(value: Option<&str>, scan_time: Duration) -> Option<Duration> {
    let value = value?.trim();
    if let Some(secs) = value.strip_prefix("expire=") {
        return secs.trim().parse::<u64>().ok().map(Duration::from_secs);
    }
    match value {
        "" | "N" | "n" => None,
        _ => Some(scan_time),
    }
}

fn decode_target(value: Option<&Value>) -> Result<Target> {
    match value.and_then(Value::as_str) {
        Some(hex_target) => {
            let bytes = hex::decode(hex_target)?;
            let target: Target = bytes
                .try_into()
                .map_err(|_| EngineError::Decode("target must be 32 bytes".into()))?;
            Ok(target)
        }
        None => Ok(difficulty::target_from_difficulty(1.0)),
    }
}

pub(crate) fn decode_work(pool: &Arc<Pool>, reply: &RpcReply, scan_time: Duration) -> Result<Job> {
    if let Some(message) = reply.error_message() {
        return Err(EngineError::Decode(format!("getwork refused: {}", message)));
    }
    let data = reply
        .result
        .get("data")
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Decode("getwork reply without data".into()))?;
    let raw = hex::decode(data)?;
    if raw.len() < GETWORK_DATA_LEN {
        return Err(EngineError::Decode(format!("getwork data is {} bytes", raw.len())));
    }

    let mut header: Header = [0u8; HEADER_LEN];
    header.copy_from_slice(&swap_words(&raw[..HEADER_LEN]));
    let tail = raw[HEADER_LEN..GETWORK_DATA_LEN].to_vec();
    let target = decode_target(reply.result.get("target"))?;
    let roll_time = parse_roll_ntime(reply.header(ROLL_NTIME_HEADER), scan_time);

    Ok(Job::new(Arc::clone(pool), ProtocolKind::Poll, header, target)
        .with_payload(JobPayload::Poll { tail })
        .with_roll_time(roll_time))
}

/// Drive a long-poll style listener until `cancel` fires.
///
/// `wait` parks on the server and yields the next pushed job, or None when
/// there is nothing to listen to yet.
pub(crate) async fn listen<F, Fut>(
    pool: Arc<Pool>,
    events: Arc<dyn PushEvents>,
    cancel: CancellationToken,
    retry_pause: Duration,
    mut wait: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<Job>>>,
{
    loop {
        let pause = if !events.should_listen(&pool) {
            LISTEN_IDLE
        } else {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => break,
                outcome = wait() => outcome,
            };
            match outcome {
                Ok(Some(mut job)) => {
                    job.from_long_poll = true;
                    events.job_pushed(job);
                    continue;
                }
                Ok(None) => LISTEN_IDLE,
                Err(e) => {
                    debug!("Long poll on pool {} failed: {}", pool.id, e);
                    retry_pause.max(Duration::from_secs(1))
                }
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    debug!("Long poll listener for pool {} stopped", pool.id);
}

struct PollInner {
    rpc: RpcTransport,
    retries: i32,
    retry_pause: Duration,
    scan_time: Duration,
    long_poll_url: watch::Sender<Option<String>>,
}

impl PollInner {
    fn note_long_poll(&self, reply: &RpcReply) {
        let Some(path) = reply.header(LONG_POLL_HEADER) else {
            return;
        };
        match self.rpc.resolve(path) {
            Ok(url) => {
                let changed = self.long_poll_url.send_if_modified(|current| {
                    if current.as_deref() == Some(url.as_str()) {
                        false
                    } else {
                        *current = Some(url.clone());
                        true
                    }
                });
                if changed {
                    info!("Long-polling activated for {}", url);
                }
            }
            Err(e) => warn!("Ignoring long poll url: {}", e),
        }
    }

    async fn get_once(&self, pool: &Arc<Pool>) -> Result<Job> {
        let reply = self.rpc.call("getwork", json!([])).await?;
        self.note_long_poll(&reply);
        decode_work(pool, &reply, self.scan_time)
    }

    async fn long_poll_once(&self, pool: &Arc<Pool>) -> Result<Option<Job>> {
        let url = self.long_poll_url.borrow().clone();
        let Some(url) = url else {
            return Ok(None);
        };
        let reply = self.rpc.call_at(&url, "getwork", json!([]), LONG_POLL_TIMEOUT).await?;
        decode_work(pool, &reply, self.scan_time).map(Some)
    }
}

pub struct PollClient {
    inner: Arc<PollInner>,
}

impl PollClient {
    pub fn new(config: &PoolConfig, tuning: &Tuning) -> Result<Self> {
        let (long_poll_url, _) = watch::channel(None);
        Ok(Self {
            inner: Arc::new(PollInner {
                rpc: RpcTransport::new(config, tuning)?,
                retries: tuning.retries,
                retry_pause: tuning.retry_pause,
                scan_time: tuning.scan_time,
                long_poll_url,
            }),
        })
    }

    pub fn long_poll_url(&self) -> Option<String> {
        self.inner.long_poll_url.borrow().clone()
    }
}

#[async_trait]
impl ProtocolClient for PollClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Poll
    }

    fn supports_push(&self) -> bool {
        true
    }

    async fn fetch_job(&self, pool: &Arc<Pool>) -> Result<Job> {
        let mut attempt: i32 = 0;
        loop {
            match self.inner.get_once(pool).await {
                Ok(job) => return Ok(job),
                Err(e) => {
                    attempt += 1;
                    if self.inner.retries >= 0 && attempt > self.inner.retries {
                        return Err(e);
                    }
                    debug!("getwork from pool {} failed ({}), retrying", pool.id, e);
                    tokio::time::sleep(self.inner.retry_pause).await;
                }
            }
        }
    }

    async fn submit(&self, job: &Job) -> Result<SubmitOutcome> {
        let JobPayload::Poll { tail } = &job.payload else {
            return Err(EngineError::Decode("getwork submit without getwork payload".into()));
        };
        let mut data = swap_words(&job.header);
        data.extend_from_slice(tail);
        let reply = self.inner.rpc.call("getwork", json!([hex::encode(data)])).await?;

        if reply.result.as_bool() == Some(true) {
            return Ok(SubmitOutcome::Accepted);
        }
        let reason = reply
            .header(REJECT_REASON_HEADER)
            .map(str::to_string)
            .or_else(|| reply.error_message())
            .or_else(|| {
                reply
                    .result
                    .get("reject-reason")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            });
        Ok(SubmitOutcome::Rejected(reason))
    }

    async fn probe(&self, pool: &Arc<Pool>) -> Result<()> {
        self.inner.get_once(pool).await.map(|_| ())
    }

    async fn start(&self, pool: Arc<Pool>, events: Arc<dyn PushEvents>, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let retry_pause = inner.retry_pause;
        tokio::spawn(listen(pool.clone(), events, cancel, retry_pause, move || {
            let inner = Arc::clone(&inner);
            let pool = Arc::clone(&pool);
            async move { inner.long_poll_once(&pool).await }
        }));
    }

    fn reap_idle(&self, max_idle: Duration) -> usize {
        self.inner.rpc.reap(max_idle)
    }
}
