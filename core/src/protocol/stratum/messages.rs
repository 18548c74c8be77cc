//! Stratum line protocol: outbound requests and decoded inbound messages.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{EngineError, Result};
use crate::protocol::poll::swap_words;

pub const AGENT: &str = concat!("quarry/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Serialize)]
pub struct StratumRequest {
    pub id: u64,
    pub method: String,
    pub params: Value,
}

impl StratumRequest {
    pub fn subscribe(id: u64) -> Self {
        Self {
            id,
            method: "mining.subscribe".to_string(),
            params: json!([AGENT]),
        }
    }

    pub fn authorize(id: u64, user: &str, pass: &str) -> Self {
        Self {
            id,
            method: "mining.authorize".to_string(),
            params: json!([user, pass]),
        }
    }

    /// All numeric fields go out as lowercase big-endian hex.
    pub fn submit(id: u64, user: &str, job_id: &str, extranonce2: &[u8], ntime: u32, nonce: u32) -> Self {
        Self {
            id,
            method: "mining.submit".to_string(),
            params: json!([
                user,
                job_id,
                hex::encode(extranonce2),
                format!("{:08x}", ntime),
                format!("{:08x}", nonce),
            ]),
        }
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Answer to a server-initiated request such as `client.get_version`.
pub fn reply(id: &Value, result: Value) -> Result<String> {
    Ok(serde_json::to_string(&json!({ "id": id, "result": result, "error": null }))?)
}

#[derive(Debug, Clone, Deserialize)]
struct RawMessage {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Value,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

/// One `mining.notify`, decoded into internal byte order.
#[derive(Debug, Clone)]
pub struct Notify {
    pub job_id: String,
    pub prev_hash: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
    pub merkle_branch: Vec<[u8; 32]>,
    pub version: u32,
    pub nbits: u32,
    pub ntime: u32,
    /// Everything issued before this notify is worthless.
    pub clean: bool,
}

fn hex_u32(value: &Value, what: &str) -> Result<u32> {
    let text = value
        .as_str()
        .ok_or_else(|| EngineError::Decode(format!("notify {} is not a string", what)))?;
    u32::from_str_radix(text, 16).map_err(|e| EngineError::Decode(format!("notify {}: {}", what, e)))
}

fn hex_bytes(value: &Value, what: &str) -> Result<Vec<u8>> {
    let text = value
        .as_str()
        .ok_or_else(|| EngineError::Decode(format!("notify {} is not a string", what)))?;
    Ok(hex::decode(text)?)
}

fn hash32(bytes: Vec<u8>, what: &str) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| EngineError::Decode(format!("notify {} is not 32 bytes", what)))
}

impl Notify {
    pub fn from_params(params: &Value) -> Result<Self> {
        let p = params
            .as_array()
            .filter(|p| p.len() >= 9)
            .ok_or_else(|| EngineError::Decode("mining.notify needs 9 params".into()))?;

        let job_id = match &p[0] {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        // prevhash arrives with every 32-bit word byte-swapped
        let prev_hash = hash32(swap_words(&hex_bytes(&p[1], "prevhash")?), "prevhash")?;
        let merkle_branch = p[4]
            .as_array()
            .ok_or_else(|| EngineError::Decode("merkle branch is not a list".into()))?
            .iter()
            .map(|h| hash32(hex_bytes(h, "merkle branch")?, "merkle branch"))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            job_id,
            prev_hash,
            coinbase1: hex_bytes(&p[2], "coinbase1")?,
            coinbase2: hex_bytes(&p[3], "coinbase2")?,
            merkle_branch,
            version: hex_u32(&p[5], "version")?,
            nbits: hex_u32(&p[6], "nbits")?,
            ntime: hex_u32(&p[7], "ntime")?,
            clean: p[8].as_bool().unwrap_or(false),
        })
    }
}

/// Extranonce parameters from the subscribe answer or `mining.set_extranonce`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub extranonce1: Vec<u8>,
    pub extranonce2_size: usize,
}

impl Subscription {
    pub fn from_values(extranonce1: &Value, size: &Value) -> Result<Self> {
        let extranonce1 = hex::decode(
            extranonce1
                .as_str()
                .ok_or_else(|| EngineError::Decode("extranonce1 is not a string".into()))?,
        )?;
        let extranonce2_size = size
            .as_u64()
            .filter(|n| (1..=8).contains(n))
            .ok_or_else(|| EngineError::Decode(format!("bad extranonce2 size {}", size)))?
            as usize;
        Ok(Self {
            extranonce1,
            extranonce2_size,
        })
    }

    /// `[[subscriptions], extranonce1, extranonce2_size]`
    pub fn from_result(result: &Value) -> Result<Self> {
        let r = result
            .as_array()
            .filter(|r| r.len() >= 3)
            .ok_or_else(|| EngineError::Decode("unexpected subscribe answer".into()))?;
        Self::from_values(&r[1], &r[2])
    }
}

#[derive(Debug, Clone)]
pub enum Inbound {
    Response {
        id: u64,
        result: Value,
        error: Option<String>,
    },
    Notify(Notify),
    SetDifficulty(f64),
    SetExtranonce(Subscription),
    /// `client.reconnect`; None means the same address.
    Reconnect(Option<String>),
    GetVersion { id: Value },
    Other(String),
}

fn error_text(error: &Value) -> Option<String> {
    match error {
        Value::Null => None,
        Value::Array(parts) if parts.len() >= 2 => Some(match parts[1].as_str() {
            Some(message) => message.to_string(),
            None => parts[1].to_string(),
        }),
        Value::Object(map) => Some(match map.get("message").and_then(Value::as_str) {
            Some(message) => message.to_string(),
            None => error.to_string(),
        }),
        other => Some(other.to_string()),
    }
}

fn numeric_id(id: &Value) -> Option<u64> {
    id.as_u64().or_else(|| id.as_str().and_then(|s| s.parse().ok()))
}

pub fn parse_line(line: &str) -> Result<Inbound> {
    let raw: RawMessage = serde_json::from_str(line)?;
    let Some(method) = raw.method.as_deref() else {
        let id = numeric_id(&raw.id).ok_or_else(|| EngineError::Decode("response without id".into()))?;
        return Ok(Inbound::Response {
            id,
            error: error_text(&raw.error),
            result: raw.result,
        });
    };

    let first = raw.params.get(0);
    match method {
        "mining.notify" => Ok(Inbound::Notify(Notify::from_params(&raw.params)?)),
        "mining.set_difficulty" => first
            .and_then(Value::as_f64)
            .filter(|d| *d > 0.0)
            .map(Inbound::SetDifficulty)
            .ok_or_else(|| EngineError::Decode("bad set_difficulty".into())),
        "mining.set_extranonce" => {
            let size = raw.params.get(1).unwrap_or(&Value::Null);
            Ok(Inbound::SetExtranonce(Subscription::from_values(
                first.unwrap_or(&Value::Null),
                size,
            )?))
        }
        "client.reconnect" => {
            let host = first.and_then(Value::as_str).filter(|h| !h.is_empty());
            let port = raw.params.get(1).and_then(|p| match p {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            });
            Ok(Inbound::Reconnect(match (host, port) {
                (Some(host), Some(port)) => Some(format!("{}:{}", host, port)),
                _ => None,
            }))
        }
        "client.get_version" => Ok(Inbound::GetVersion { id: raw.id }),
        other => Ok(Inbound::Other(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notify_line(clean: bool) -> String {
        json!({
            "id": null,
            "method": "mining.notify",
            "params": [
                "job7",
                "00000001000000020000000300000004000000050000000600000007000000ff",
                "01000000010000",
                "ffffffff",
                ["1111111111111111111111111111111111111111111111111111111111111111"],
                "20000000",
                "1d00ffff",
                "65a0b1c2",
                clean
            ]
        })
        .to_string()
    }

    #[test]
    fn test_parse_notify() {
        let Inbound::Notify(notify) = parse_line(&notify_line(true)).unwrap() else {
            panic!("notify expected");
        };
        assert_eq!(notify.job_id, "job7");
        assert!(notify.clean);
        assert_eq!(notify.version, 0x2000_0000);
        assert_eq!(notify.nbits, 0x1d00ffff);
        assert_eq!(notify.ntime, 0x65a0_b1c2);
        assert_eq!(&notify.prev_hash[..4], &[1, 0, 0, 0]);
        assert_eq!(&notify.prev_hash[28..], &[0xff, 0, 0, 0]);
        assert_eq!(notify.merkle_branch.len(), 1);
    }

    #[test]
    fn test_parse_subscribe_answer() {
        let line = r#"{"id":1,"result":[[["mining.notify","ae6812eb4cd7735a302a8a9dd95cf71f"]],"08000002",4],"error":null}"#;
        let Inbound::Response { id, result, error } = parse_line(line).unwrap() else {
            panic!("response expected");
        };
        assert_eq!(id, 1);
        assert!(error.is_none());
        let sub = Subscription::from_result(&result).unwrap();
        assert_eq!(sub.extranonce1, vec![8, 0, 0, 2]);
        assert_eq!(sub.extranonce2_size, 4);
    }

    #[test]
    fn test_parse_rejection_reason() {
        let line = r#"{"id":"9","result":null,"error":[23,"Low difficulty share",null]}"#;
        let Inbound::Response { id, error, .. } = parse_line(line).unwrap() else {
            panic!("response expected");
        };
        assert_eq!(id, 9);
        assert_eq!(error.as_deref(), Some("Low difficulty share"));
    }

    #[test]
    fn test_parse_server_requests() {
        let diff = r#"{"id":null,"method":"mining.set_difficulty","params":[512]}"#;
        assert!(matches!(parse_line(diff).unwrap(), Inbound::SetDifficulty(d) if d == 512.0));

        let reconnect = r#"{"id":null,"method":"client.reconnect","params":["backup.example",3334,0]}"#;
        assert!(matches!(
            parse_line(reconnect).unwrap(),
            Inbound::Reconnect(Some(ref addr)) if addr == "backup.example:3334"
        ));

        let bare = r#"{"id":null,"method":"client.reconnect","params":[]}"#;
        assert!(matches!(parse_line(bare).unwrap(), Inbound::Reconnect(None)));
    }

    #[test]
    fn test_submit_encoding() {
        let request = StratumRequest::submit(4, "worker", "job7", &[0, 0, 0, 1], 0x65a0_b1c2, 0xdead);
        let encoded: Value = serde_json::from_str(&request.encode().unwrap()).unwrap();
        assert_eq!(encoded["method"], "mining.submit");
        assert_eq!(encoded["params"], json!(["worker", "job7", "00000001", "65a0b1c2", "0000dead"]));
    }
}
