//! Block-template (getblocktemplate) client.
//!
//! A template is fetched at most once per cache window; every job in
//! between is assembled locally by bumping an extranonce in the coinbase
//! scriptSig and recomputing the merkle root.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::poll::{listen, LONG_POLL_TIMEOUT};
use super::rpc::RpcTransport;
use super::{ProtocolClient, PushEvents, SubmitOutcome};
use crate::config::{PoolConfig, Tuning};
use crate::difficulty::{self, Target};
use crate::error::{EngineError, Result};
use crate::job::{Header, Job, JobPayload, ProtocolKind, TemplateWork, HEADER_LEN};
use crate::merkle::{merkle_root, sha256d};
use crate::pool::Pool;

/// Templates are reused for this long before a fresh fetch.
pub const TEMPLATE_CACHE: Duration = Duration::from_secs(60);

const CAPABILITIES: [&str; 4] = ["coinbasetxn", "workid", "coinbase/append", "longpoll"];
const MAX_SCRIPT_SIG: usize = 100;

pub(crate) fn write_varint(n: u64, out: &mut Vec<u8>) {
    match n {
        0..=0xfc => out.push(n as u8),
        0xfd..=0xffff => {
            out.push(0xfd);
            out.extend_from_slice(&(n as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            out.push(0xfe);
            out.extend_from_slice(&(n as u32).to_le_bytes());
        }
        _ => {
            out.push(0xff);
            out.extend_from_slice(&n.to_le_bytes());
        }
    }
}

fn truncated() -> EngineError {
    EngineError::Decode("coinbase truncated".into())
}

pub(crate) fn read_varint(data: &[u8], pos: &mut usize) -> Result<u64> {
    let first = *data.get(*pos).ok_or_else(truncated)?;
    *pos += 1;
    let width = match first {
        0xfd => 2,
        0xfe => 4,
        0xff => 8,
        n => return Ok(n as u64),
    };
    let bytes = data.get(*pos..*pos + width).ok_or_else(truncated)?;
    *pos += width;
    let mut buf = [0u8; 8];
    buf[..width].copy_from_slice(bytes);
    Ok(u64::from_le_bytes(buf))
}

/// Append `extranonce` to the scriptSig of a legacy-serialized coinbase.
pub(crate) fn insert_extranonce(coinbase: &[u8], extranonce: &[u8]) -> Result<Vec<u8>> {
    if coinbase.len() < 6 {
        return Err(truncated());
    }
    if coinbase[4] == 0 && coinbase[5] == 1 {
        return Err(EngineError::Decode("witness-serialized coinbase is not supported".into()));
    }
    let mut pos = 4;
    let inputs = read_varint(coinbase, &mut pos)?;
    if inputs != 1 {
        return Err(EngineError::Decode(format!("coinbase has {} inputs", inputs)));
    }
    pos += 36;
    let len_pos = pos;
    let script_len = read_varint(coinbase, &mut pos)? as usize;
    let script_end = pos + script_len;
    if script_end > coinbase.len() {
        return Err(truncated());
    }
    let new_len = script_len + extranonce.len();
    if new_len > MAX_SCRIPT_SIG {
        return Err(EngineError::Decode("coinbase scriptSig too long".into()));
    }

    let mut out = Vec::with_capacity(coinbase.len() + extranonce.len() + 2);
    out.extend_from_slice(&coinbase[..len_pos]);
    write_varint(new_len as u64, &mut out);
    out.extend_from_slice(&coinbase[pos..script_end]);
    out.extend_from_slice(extranonce);
    out.extend_from_slice(&coinbase[script_end..]);
    Ok(out)
}

/// Display-order hex hash to internal byte order.
fn decode_hash(value: &str) -> Result<[u8; 32]> {
    let mut bytes: [u8; 32] = hex::decode(value)?
        .try_into()
        .map_err(|_| EngineError::Decode(format!("'{}' is not a 32-byte hash", value)))?;
    bytes.reverse();
    Ok(bytes)
}

fn str_field<'a>(value: &'a Value, name: &str) -> Result<&'a str> {
    value
        .get(name)
        .and_then(Value::as_str)
        .ok_or_else(|| EngineError::Decode(format!("template without {}", name)))
}

#[derive(Debug, Clone)]
pub struct Template {
    pub version: u32,
    pub prev_hash: [u8; 32],
    pub bits: u32,
    pub curtime: u32,
    pub target: Target,
    pub coinbase: Vec<u8>,
    pub txids: Vec<[u8; 32]>,
    pub transactions: Arc<Vec<Vec<u8>>>,
    pub workid: Option<String>,
    pub longpollid: Option<String>,
    pub longpoll_uri: Option<String>,
    pub roll_time: Option<Duration>,
    pub fetched: Instant,
}

impl Template {
    pub fn parse(result: &Value, scan_time: Duration) -> Result<Self> {
        let version = result
            .get("version")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::Decode("template without version".into()))? as u32;
        let prev_hash = decode_hash(str_field(result, "previousblockhash")?)?;
        let bits = u32::from_str_radix(str_field(result, "bits")?, 16)
            .map_err(|e| EngineError::Decode(format!("bad bits: {}", e)))?;
        let curtime = result
            .get("curtime")
            .and_then(Value::as_u64)
            .ok_or_else(|| EngineError::Decode("template without curtime".into()))? as u32;
        let target = match result.get("target").and_then(Value::as_str) {
            Some(target) => decode_hash(target)?,
            None => difficulty::compact_to_target(bits),
        };
        let coinbase = result
            .get("coinbasetxn")
            .map(|cb| str_field(cb, "data"))
            .transpose()?
            .ok_or_else(|| EngineError::Decode("template without coinbasetxn".into()))?;
        let coinbase = hex::decode(coinbase)?;

        let mut txids = Vec::new();
        let mut transactions = Vec::new();
        for tx in result.get("transactions").and_then(Value::as_array).into_iter().flatten() {
            let data = hex::decode(str_field(tx, "data")?)?;
            let txid = match tx.get("txid").or_else(|| tx.get("hash")).and_then(Value::as_str) {
                Some(id) => decode_hash(id)?,
                None => sha256d(&data),
            };
            txids.push(txid);
            transactions.push(data);
        }

        let rolls_time = result
            .get("mutable")
            .and_then(Value::as_array)
            .is_some_and(|m| m.iter().filter_map(Value::as_str).any(|s| s.starts_with("time")));
        let roll_time = rolls_time.then(|| {
            result
                .get("expires")
                .and_then(Value::as_u64)
                .map(Duration::from_secs)
                .unwrap_or(scan_time)
        });

        let text = |name: &str| result.get(name).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            version,
            prev_hash,
            bits,
            curtime,
            target,
            coinbase,
            txids,
            transactions: Arc::new(transactions),
            workid: text("workid"),
            longpollid: text("longpollid"),
            longpoll_uri: text("longpolluri"),
            roll_time,
            fetched: Instant::now(),
        })
    }

    /// Assemble a job for `extranonce`.
    pub fn make_job(&self, pool: &Arc<Pool>, extranonce: u32) -> Result<Job> {
        let coinbase = insert_extranonce(&self.coinbase, &extranonce.to_le_bytes())?;
        let mut leaves = Vec::with_capacity(self.txids.len() + 1);
        leaves.push(sha256d(&coinbase));
        leaves.extend_from_slice(&self.txids);
        let merkle = merkle_root(&leaves);

        let ntime = self.curtime.wrapping_add(self.fetched.elapsed().as_secs() as u32);
        let mut header: Header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(&self.version.to_le_bytes());
        header[4..36].copy_from_slice(&self.prev_hash);
        header[36..68].copy_from_slice(&merkle);
        header[68..72].copy_from_slice(&ntime.to_le_bytes());
        header[72..76].copy_from_slice(&self.bits.to_le_bytes());

        let work = TemplateWork {
            coinbase,
            transactions: Arc::clone(&self.transactions),
            workid: self.workid.clone(),
        };
        Ok(Job::new(Arc::clone(pool), ProtocolKind::BlockTemplate, header, self.target)
            .with_payload(JobPayload::Template(work))
            .with_roll_time(self.roll_time))
    }
}

/// Header, transaction count, coinbase, then the template's transactions.
pub fn serialize_block(job: &Job) -> Result<Vec<u8>> {
    let JobPayload::Template(work) = &job.payload else {
        return Err(EngineError::Decode("block submit without template payload".into()));
    };
    let body: usize = work.transactions.iter().map(Vec::len).sum();
    let mut block = Vec::with_capacity(HEADER_LEN + 9 + work.coinbase.len() + body);
    block.extend_from_slice(&job.header);
    write_varint(work.transactions.len() as u64 + 1, &mut block);
    block.extend_from_slice(&work.coinbase);
    for tx in work.transactions.iter() {
        block.extend_from_slice(tx);
    }
    Ok(block)
}

struct Cached {
    template: Arc<Template>,
    extranonce: u32,
}

struct TemplateInner {
    rpc: RpcTransport,
    retries: i32,
    retry_pause: Duration,
    scan_time: Duration,
    cache: Mutex<Option<Cached>>,
}

impl TemplateInner {
    fn request(longpollid: Option<&str>) -> Value {
        let mut request = json!({ "capabilities": CAPABILITIES, "rules": ["segwit"] });
        if let Some(id) = longpollid {
            request["longpollid"] = Value::String(id.to_string());
        }
        json!([request])
    }

    async fn fetch_template(&self) -> Result<Arc<Template>> {
        let reply = self.rpc.call("getblocktemplate", Self::request(None)).await?;
        if let Some(message) = reply.error_message() {
            return Err(EngineError::Decode(format!("getblocktemplate refused: {}", message)));
        }
        Ok(Arc::new(Template::parse(&reply.result, self.scan_time)?))
    }

    fn store(&self, template: Arc<Template>) {
        *self.cache.lock() = Some(Cached {
            template,
            extranonce: 0,
        });
    }

    /// Next extranonce from a template still inside the cache window.
    fn next_cached(&self) -> Option<(Arc<Template>, u32)> {
        let mut cache = self.cache.lock();
        let cached = cache.as_mut()?;
        if cached.template.fetched.elapsed() >= TEMPLATE_CACHE {
            return None;
        }
        cached.extranonce = cached.extranonce.wrapping_add(1);
        Some((Arc::clone(&cached.template), cached.extranonce))
    }

    async fn long_poll_once(&self, pool: &Arc<Pool>) -> Result<Option<Job>> {
        let current = self.cache.lock().as_ref().map(|c| Arc::clone(&c.template));
        let Some(current) = current else {
            return Ok(None);
        };
        let Some(longpollid) = current.longpollid.as_deref() else {
            return Ok(None);
        };
        let url = match current.longpoll_uri.as_deref() {
            Some(uri) => self.rpc.resolve(uri)?,
            None => self.rpc.url().to_string(),
        };
        let reply = self
            .rpc
            .call_at(&url, "getblocktemplate", Self::request(Some(longpollid)), LONG_POLL_TIMEOUT)
            .await?;
        if let Some(message) = reply.error_message() {
            return Err(EngineError::Decode(message));
        }
        let template = Arc::new(Template::parse(&reply.result, self.scan_time)?);
        self.store(Arc::clone(&template));
        template.make_job(pool, 0).map(Some)
    }
}

pub struct TemplateClient {
    inner: Arc<TemplateInner>,
}

impl TemplateClient {
    pub fn new(config: &PoolConfig, tuning: &Tuning) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(TemplateInner {
                rpc: RpcTransport::new(config, tuning)?,
                retries: tuning.retries,
                retry_pause: tuning.retry_pause,
                scan_time: tuning.scan_time,
                cache: Mutex::new(None),
            }),
        })
    }
}

#[async_trait]
impl ProtocolClient for TemplateClient {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::BlockTemplate
    }

    fn supports_push(&self) -> bool {
        true
    }

    async fn fetch_job(&self, pool: &Arc<Pool>) -> Result<Job> {
        if let Some((template, extranonce)) = self.inner.next_cached() {
            return template.make_job(pool, extranonce);
        }
        let mut attempt: i32 = 0;
        let template = loop {
            match self.inner.fetch_template().await {
                Ok(template) => break template,
                Err(e) => {
                    attempt += 1;
                    if self.inner.retries >= 0 && attempt > self.inner.retries {
                        return Err(e);
                    }
                    debug!("getblocktemplate from pool {} failed ({}), retrying", pool.id, e);
                    tokio::time::sleep(self.inner.retry_pause).await;
                }
            }
        };
        self.inner.store(Arc::clone(&template));
        template.make_job(pool, 0)
    }

    async fn submit(&self, job: &Job) -> Result<SubmitOutcome> {
        let block = hex::encode(serialize_block(job)?);
        let params = match &job.payload {
            JobPayload::Template(TemplateWork { workid: Some(id), .. }) => json!([block, { "workid": id }]),
            _ => json!([block]),
        };
        let reply = self.inner.rpc.call("submitblock", params).await?;
        if let Some(message) = reply.error_message() {
            return Ok(SubmitOutcome::Rejected(Some(message)));
        }
        Ok(match &reply.result {
            Value::Null => SubmitOutcome::Accepted,
            Value::String(reason) => SubmitOutcome::Rejected(Some(reason.clone())),
            other => SubmitOutcome::Rejected(Some(other.to_string())),
        })
    }

    async fn probe(&self, pool: &Arc<Pool>) -> Result<()> {
        let template = self.inner.fetch_template().await?;
        self.inner.store(Arc::clone(&template));
        template.make_job(pool, 0).map(|_| ())
    }

    async fn start(&self, pool: Arc<Pool>, events: Arc<dyn PushEvents>, cancel: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        let retry_pause = inner.retry_pause;
        info!("Block template long poll armed for pool {}", pool.id);
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
