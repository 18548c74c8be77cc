//! Error taxonomy for the engine.
//!
//! Transient failures (`Transport`, `Decode`) are absorbed by the layer that
//! can retry them and only show up upstream as counters and log lines.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Network failure or timeout talking to a pool.
    #[error("transport error: {0}")]
    Transport(String),

    /// The pool answered with something we could not make sense of.
    #[error("malformed response: {0}")]
    Decode(String),

    #[error("stale work")]
    Stale,

    #[error("share rejected: {0}")]
    Rejected(String),

    #[error("hardware fault on worker {worker}: {reason}")]
    Hardware { worker: usize, reason: String },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no usable pools")]
    NoUsablePools,

    #[error("engine is shutting down")]
    Shutdown,
}

impl EngineError {
    /// Errors worth another attempt against the same pool.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transport(_) | EngineError::Decode(_))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            EngineError::Decode(e.to_string())
        } else {
            EngineError::Transport(e.to_string())
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Decode(e.to_string())
    }
}

impl From<hex::FromHexError> for EngineError {
    fn from(e: hex::FromHexError) -> Self {
        EngineError::Decode(e.to_string())
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(e: toml::de::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for EngineError {
    fn from(e: toml::ser::Error) -> Self {
        EngineError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::Transport("reset".into()).is_transient());
        assert!(EngineError::Decode("bad json".into()).is_transient());
        assert!(!EngineError::Stale.is_transient());
        assert!(!EngineError::NoUsablePools.is_transient());
    }

    #[test]
    fn test_hex_error_is_decode() {
        let err: EngineError = hex::decode("zz").unwrap_err().into();
        assert!(matches!(err, EngineError::Decode(_)));
    }
}
