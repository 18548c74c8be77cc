//! Stratum pub/sub client.
//!
//! One persistent TCP session per pool. The session task reads
//! newline-delimited JSON, keeps the latest notify and extranonce state,
//! and resolves share verdicts. Jobs are minted locally from that state on
//! demand; shares leave through a separate submit task that waits out
//! short reconnects.

mod messages;

pub use messages::{Inbound, Notify, StratumRequest, Subscription};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tokio_util::sync::CancellationToken;

use super::{ProtocolClient, PushEvents, ShareReport, SubmitOutcome};
use crate::config::{PoolConfig, Tuning};
use crate::difficulty;
use crate::error::{EngineError, Result};
use crate::job::{Header, Job, JobPayload, ProtocolKind, StratumWork, HEADER_LEN};
use crate::merkle::{fold_branch, sha256d};
use crate::pool::Pool;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// A session with no traffic for this long is presumed dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);
/// Shares wait this long for a session to come back before being dropped.
const SUBMIT_WINDOW: Duration = Duration::from_secs(120);
const MAX_LINE: usize = 64 * 1024;

/// Strip the scheme from a stratum url.
pub fn host_port(url: &str) -> Result<String> {
    let addr = url
        .trim()
        .strip_prefix("stratum+tcp://")
        .or_else(|| url.trim().strip_prefix("stratum://"))
        .unwrap_or(url.trim())
        .trim_end_matches('/');
    if addr.is_empty() || !addr.contains(':') {
        return Err(EngineError::Config(format!(
            "stratum url '{}' must look like stratum+tcp://host:port",
            url
        )));
    }
    Ok(addr.to_string())
}

#[derive(Default)]
struct WorkState {
    notify: Option<Notify>,
    received: Option<Instant>,
    subscription: Option<Subscription>,
    difficulty: f64,
    epoch: u64,
    extranonce2: u64,
}

enum SessionEnd {
    Closed,
    Redirect,
    Cancelled,
}

struct Shared {
    addr: String,
    user: String,
    pass: String,
    reconnect_interval: Duration,
    request_timeout: Duration,
    work: Mutex<WorkState>,
    /// Sent shares awaiting a verdict, by request id.
    in_flight: Mutex<HashMap<u64, Job>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<String>>>,
    redirect: Mutex<Option<String>>,
    submit_tx: mpsc::UnboundedSender<Job>,
    submit_rx: Mutex<Option<mpsc::UnboundedReceiver<Job>>>,
    ready: tokio::sync::Notify,
    next_id: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, line: String) -> bool {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx.send(line).is_ok(),
            None => false,
        }
    }

    /// Mint a job from the latest notify with the next extranonce2.
    fn make_job(&self, pool: &Arc<Pool>) -> Result<Job> {
        let session = pool.session();
        let (notify, received, subscription, share_difficulty, extranonce2) = {
            let mut work = self.work.lock();
            if !session.active || work.epoch != session.epoch {
                return Err(EngineError::Transport("no active stratum session".into()));
            }
            let (Some(notify), Some(subscription)) = (work.notify.clone(), work.subscription.clone()) else {
                return Err(EngineError::Transport("stratum session has no work yet".into()));
            };
            work.extranonce2 = work.extranonce2.wrapping_add(1);
            (
                notify,
                work.received.unwrap_or_else(Instant::now),
                subscription,
                work.difficulty,
                work.extranonce2,
            )
        };

        let extranonce2 = extranonce2.to_le_bytes()[..subscription.extranonce2_size.min(8)].to_vec();
        let mut coinbase = Vec::with_capacity(
            notify.coinbase1.len() + subscription.extranonce1.len() + extranonce2.len() + notify.coinbase2.len(),
        );
        coinbase.extend_from_slice(&notify.coinbase1);
        coinbase.extend_from_slice(&subscription.extranonce1);
        coinbase.extend_from_slice(&extranonce2);
        coinbase.extend_from_slice(&notify.coinbase2);
        let merkle = fold_branch(sha256d(&coinbase), &notify.merkle_branch);

        let ntime = notify.ntime.wrapping_add(received.elapsed().as_secs() as u32);
        let mut header: Header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&notify.version.to_le_bytes());
        header[4..36].copy_from_slice(&notify.prev_hash);
        header[36..68].copy_from_slice(&merkle);
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&notify.nbits.to_le_bytes());

        let target = difficulty::target_from_difficulty(share_difficulty);
        Ok(Job::new(Arc::clone(pool), ProtocolKind::PubSub, header, target).with_payload(
            JobPayload::Stratum(StratumWork {
                job_id: notify.job_id,
                extranonce2,
                ntime,
                session: session.epoch,
            }),
        ))
    }

    /// Abandon every share still waiting for an answer.
    fn purge_in_flight(&self, events: &Arc<dyn PushEvents>) {
        let lost: Vec<Job> = self.in_flight.lock().drain().map(|(_, job)| job).collect();
        if !lost.is_empty() {
            warn!("Dropping {} shares sent on a lost stratum session", lost.len());
        }
        for job in lost {
            events.share_dropped(job);
        }
    }

    fn resolve_share(&self, pool: &Arc<Pool>, events: &Arc<dyn PushEvents>, id: u64, result: &Value, error: Option<String>) {
        let job = self.in_flight.lock().remove(&id);
        let accepted = result.as_bool() == Some(true) && error.is_none();
        let difficulty = job
            .as_ref()
            .map(|j| j.difficulty)
            .unwrap_or_else(|| pool.share_difficulty());
        if job.is_none() {
            debug!("Pool {} answered unknown share id {}", pool.id, id);
        }
        events.share_resolved(ShareReport {
            pool: Arc::clone(pool),
            job,
            accepted,
            reason: error,
            difficulty,
        });
    }
}

struct Session<'a> {
    shared: &'a Arc<Shared>,
    pool: &'a Arc<Pool>,
    events: &'a Arc<dyn PushEvents>,
    subscribe_id: u64,
    authorize_id: u64,
    subscribed: bool,
    authorized: bool,
}

impl Session<'_> {
    fn established(&self) -> bool {
        self.subscribed && self.authorized
    }

    fn establish(&self) {
        let epoch = self.pool.begin_session();
        self.shared.work.lock().epoch = epoch;
        info!("Stratum session {} established with pool {}", epoch, self.pool.id);
        self.events.session_restored(self.pool);
        self.shared.ready.notify_waiters();
    }

    /// Returns Some when the session should end.
    fn handle(&mut self, message: Inbound) -> Result<Option<SessionEnd>> {
        match message {
            Inbound::Response { id, result, error } if id == self.subscribe_id => {
                let subscription = Subscription::from_result(&result)
                    .map_err(|e| EngineError::Decode(format!("subscribe failed: {} {:?}", e, error)))?;
                debug!("Pool {} extranonce1 {}", self.pool.id, hex::encode(&subscription.extranonce1));
                self.shared.work.lock().subscription = Some(subscription);
                self.subscribed = true;
                if self.established() {
                    self.establish();
                }
            }
            Inbound::Response { id, result, error } if id == self.authorize_id => {
                if result.as_bool() != Some(true) {
                    return Err(EngineError::Config(format!(
                        "pool {} refused worker {}: {}",
                        self.pool.id,
                        self.shared.user,
                        error.unwrap_or_else(|| "no reason".into())
                    )));
                }
                self.authorized = true;
                if self.established() {
                    self.establish();
                }
            }
            Inbound::Response { id, result, error } => {
                self.shared.resolve_share(self.pool, self.events, id, &result, error);
            }
            Inbound::Notify(notify) => {
                let clean = notify.clean;
                debug!("Pool {} notify {} clean={}", self.pool.id, notify.job_id, clean);
                {
                    let mut work = self.shared.work.lock();
                    work.notify = Some(notify);
                    work.received = Some(Instant::now());
                }
                self.shared.ready.notify_waiters();
                if clean && self.established() {
                    match self.shared.make_job(self.pool) {
                        Ok(mut job) => {
                            job.from_long_poll = true;
                            self.events.job_pushed(job);
                        }
                        Err(e) => debug!("No job from clean notify: {}", e),
                    }
                }
            }
            Inbound::SetDifficulty(difficulty) => {
                info!("Pool {} share difficulty set to {}", self.pool.id, difficulty);
                self.pool.set_share_difficulty(difficulty);
                self.shared.work.lock().difficulty = difficulty;
            }
            Inbound::SetExtranonce(subscription) => {
                self.shared.work.lock().subscription = Some(subscription);
            }
            Inbound::Reconnect(addr) => {
                info!("Pool {} asked us to reconnect{}", self.pool.id, match &addr {
                    Some(a) => format!(" to {}", a),
                    None => String::new(),
                });
                *self.shared.redirect.lock() = addr;
                return Ok(Some(SessionEnd::Redirect));
            }
            Inbound::GetVersion { id } => {
                self.shared.send(messages::reply(&id, Value::String(messages::AGENT.into()))?);
            }
            Inbound::Other(method) => debug!("Ignoring stratum method {}", method),
        }
        Ok(None)
    }
}

async fn run_session(
    shared: &Arc<Shared>,
    pool: &Arc<Pool>,
    events: &Arc<dyn PushEvents>,
    cancel: &CancellationToken,
    addr: &str,
) -> Result<SessionEnd> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| EngineError::Transport(format!("connect to {} timed out", addr)))??;
    let (read_half, write_half) = stream.into_split();
    let mut lines = FramedRead::new(read_half, LinesCodec::new_with_max_length(MAX_LINE));
    let mut sink = FramedWrite::new(write_half, LinesCodec::new());

    {
        // notifies may arrive before authorization completes
        let mut work = shared.work.lock();
        work.notify = None;
        work.extranonce2 = 0;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if let Err(e) = sink.send(line).await {
                debug!("Stratum write failed: {}", e);
                break;
            }
        }
    });

    let mut session = Session {
        shared,
        pool,
        events,
        subscribe_id: shared.next_id(),
        authorize_id: shared.next_id(),
        subscribed: false,
        authorized: false,
    };
    tx.send(StratumRequest::subscribe(session.subscribe_id).encode()?)
        .map_err(|_| EngineError::Transport("writer closed".into()))?;
    tx.send(StratumRequest::authorize(session.authorize_id, &shared.user, &shared.pass).encode()?)
        .map_err(|_| EngineError::Transport("writer closed".into()))?;
    *shared.outbound.lock() = Some(tx);

    let outcome = loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break Ok(SessionEnd::Cancelled),
            next = tokio::time::timeout(IDLE_TIMEOUT, lines.next()) => next,
        };
        let line = match next {
            Err(_) => {
                warn!("Pool {} stratum session idle for {:?}", pool.id, IDLE_TIMEOUT);
                break Ok(SessionEnd::Closed);
            }
            Ok(None) => break Ok(SessionEnd::Closed),
            Ok(Some(Err(e))) => break Err(EngineError::Transport(e.to_string())),
            Ok(Some(Ok(line))) => line,
        };
        if line.trim().is_empty() {
            continue;
        }
        let message = match messages::parse_line(&line) {
            Ok(message) => message,
            Err(e) => {
                debug!("Unparseable stratum line from pool {}: {}", pool.id, e);
                continue;
            }
        };
        match session.handle(message) {
            Ok(None) => {}
            Ok(Some(end)) => break Ok(end),
            Err(e) => break Err(e),
        }
    };

    *shared.outbound.lock() = None;
    writer.abort();
    outcome
}

async fn session_loop(shared: Arc<Shared>, pool: Arc<Pool>, events: Arc<dyn PushEvents>, cancel: CancellationToken) {
    loop {
        let addr = shared.redirect.lock().take().unwrap_or_else(|| shared.addr.clone());
        debug!("Connecting to stratum pool {} at {}", pool.id, addr);
        let outcome = run_session(&shared, &pool, &events, &cancel, &addr).await;

        let was_active = pool.session().active;
        pool.end_session();
        shared.purge_in_flight(&events);
        if was_active {
            events.session_lost(&pool);
        }

        let pause = match outcome {
            Ok(SessionEnd::Cancelled) => break,
            Ok(SessionEnd::Redirect) => Duration::ZERO,
            Ok(SessionEnd::Closed) => {
                warn!("Stratum connection to pool {} closed", pool.id);
                shared.reconnect_interval
            }
            Err(e) => {
                warn!("Stratum session with pool {} failed: {}", pool.id, e);
                shared.reconnect_interval
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    debug!("Stratum session loop for pool {} stopped", pool.id);
}

/// Send queued shares, waiting for a live session while the share's own
/// session epoch is still current.
async fn submit_loop(
    shared: Arc<Shared>,
    pool: Arc<Pool>,
    events: Arc<dyn PushEvents>,
    mut rx: mpsc::UnboundedReceiver<Job>,
    cancel: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = cancel.cancelled() => break,
            job = rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };
        let JobPayload::Stratum(work) = &job.payload else {
            events.share_dropped(job);
            continue;
        };
        let started = Instant::now();
        loop {
            let session = pool.session();
            if session.epoch != work.session {
                debug!("Share for job {} outlived its stratum session", work.job_id);
                events.share_dropped(job);
                break;
            }
            if session.active {
                let id = shared.next_id();
                let request = StratumRequest::submit(id, &shared.user, &work.job_id, &work.extranonce2, job.ntime(), job.nonce());
                match request.encode() {
                    Ok(line) => {
                        shared.in_flight.lock().insert(id, job.clone());
                        if shared.send(line) {
                            break;
                        }
                        shared.in_flight.lock().remove(&id);
                    }
                    Err(e) => {
                        warn!("Could not encode share: {}", e);
                        events.share_dropped(job);
                        break;
                    }
                }
            }
            if started.elapsed() >= SUBMIT_WINDOW {
                warn!("Giving up on share for pool {} after {:?}", pool.id, SUBMIT_WINDOW);
                events.share_dropped(job);
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }
}

pub struct StratumClient {
    shared: Arc<Shared>,
}

impl StratumClient {
    pub fn new(config: &PoolConfig, tuning: &Tuning) -> Result<Self> {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        Ok(Self {
            shared: Arc::new(Shared {
                addr: host_port(&config.url)?,
                user: config.user.clone(),
                pass: config.pass.clone(),
                reconnect_interval: tuning.reconnect_interval,
                request_timeout: tuning.request_timeout,
                work: Mutex::new(WorkState {
                    difficulty: 1.0,
                    ..WorkState::default()
                }),
                in_flight: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                redirect: Mutex::new(None),
                submit_tx,
                submit_rx: Mutex::new(Some(submit_rx)),
                ready: tokio::sync::Notify::new(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Shares sent and not yet answered.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.lock().len()
    }
}

#[async_trait]
impl ProtocolClient for StratumClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::PubSub
    }

    fn supports_push(&self) -> bool {
        true
    }

    /// Wait (bounded) for a session with work, then mint locally.
    async fn fetch_job(&self, pool: &Arc<Pool>) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + self.shared.request_timeout;
        loop {
            let ready = self.shared.ready.notified();
            match self.shared.make_job(pool) {
                Ok(job) => return Ok(job),
                Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
                Err(_) => {}
            }
            let _ = tokio::time::timeout_at(deadline, ready).await;
        }
    }

    async fn submit(&self, job: &Job) -> Result<SubmitOutcome> {
        self.shared
            .submit_tx
            .send(job.clone())
            .map_err(|_| EngineError::Shutdown)?;
        Ok(SubmitOutcome::Pending)
    }

    async fn probe(&self, pool: &Arc<Pool>) -> Result<()> {
        if pool.session().active {
            return Ok(());
        }
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.shared.addr))
            .await
            .map_err(|_| EngineError::Transport(format!("connect to {} timed out", self.shared.addr)))??;
        drop(stream);
        Ok(())
    }

    async fn start(&self, pool: Arc<Pool>, events: Arc<dyn PushEvents>, cancel: CancellationToken) {
        let Some(rx) = self.shared.submit_rx.lock().take() else {
            warn!("Stratum client for pool {} already started", pool.id);
            return;
        };
        tokio::spawn(submit_loop(
            Arc::clone(&self.shared),
            Arc::clone(&pool),
            Arc::clone(&events),
            rx,
            cancel.clone(),
        ));
        tokio::spawn(session_loop(Arc::clone(&self.shared), pool, events, cancel));
    }
}
