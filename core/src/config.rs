//! Engine configuration.
//!
//! A TOML document listing pools and tuning knobs. Every tuning field has a
//! default so a file with only `[[pools]]` entries is valid. The engine can
//! write its live configuration back out in the same format.

use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::pool::Strategy;

const TIME_FORMAT: &str = "%H:%M";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolProtocol {
    /// getwork style request/response.
    Poll,
    /// getblocktemplate with local header assembly.
    Template,
    /// Persistent publish/subscribe connection.
    Stratum,
    /// Offline pseudo pool.
    Benchmark,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub url: String,

    #[serde(default)]
    pub user: String,

    #[serde(default)]
    pub pass: String,

    #[serde(default = "default_quota")]
    pub quota: u32,

    /// Inferred from the url scheme when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<PoolProtocol>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,

    /// Pool wants shares even for superseded work.
    #[serde(default)]
    pub submit_old: bool,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl PoolConfig {
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            user: String::new(),
            pass: String::new(),
            quota: default_quota(),
            protocol: None,
            proxy: None,
            submit_old: false,
            enabled: true,
        }
    }

    pub fn with_credentials(mut self, user: &str, pass: &str) -> Self {
        self.user = user.to_string();
        self.pass = pass.to_string();
        self
    }

    pub fn resolved_protocol(&self) -> PoolProtocol {
        if let Some(protocol) = self.protocol {
            return protocol;
        }
        let url = self.url.to_ascii_lowercase();
        if url.starts_with("stratum+tcp://") || url.starts_with("stratum://") {
            PoolProtocol::Stratum
        } else if url.starts_with("benchmark") {
            PoolProtocol::Benchmark
        } else {
            PoolProtocol::Poll
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// `HH:MM` local time mining may begin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,

    /// `HH:MM` local time mining must stop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationConfig {
    #[serde(flatten)]
    pub pool: PoolConfig,

    /// Share of job requests routed to the donation pool.
    pub percent: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub strategy: Strategy,

    /// Minutes between switches under the rotate strategy.
    #[serde(default = "default_rotate_period")]
    pub rotate_period_mins: u64,

    /// Only ever take work from the current pool.
    #[serde(default)]
    pub fail_only: bool,

    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,

    #[serde(default = "default_scan_time")]
    pub scan_time_secs: u64,

    #[serde(default = "default_expiry")]
    pub expiry_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Fetch retries per request, -1 for unlimited.
    #[serde(default = "default_retries")]
    pub retries: i32,

    #[serde(default = "default_retry_pause")]
    pub retry_pause_secs: u64,

    #[serde(default)]
    pub submit_stale: bool,

    #[serde(default = "default_true")]
    pub disable_rejecting_pools: bool,

    /// Give up on a share after the first transport failure.
    #[serde(default)]
    pub low_resource: bool,

    /// Cap outbound connections per pool at a small fixed number.
    #[serde(default)]
    pub delay_sensitive: bool,

    /// Shut down after this many accepted shares.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub share_limit: Option<u64>,

    #[serde(default = "default_log_interval")]
    pub log_interval_secs: u64,

    #[serde(default = "default_watchdog_interval")]
    pub watchdog_interval_secs: u64,

    #[serde(default = "default_reconnect_interval")]
    pub reconnect_interval_secs: u64,

    /// Mining threads across all backends.
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,

    #[serde(default)]
    pub benchmark: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<ScheduleConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donation: Option<DonationConfig>,

    #[serde(default)]
    pub pools: Vec<PoolConfig>,
}

fn default_quota() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_rotate_period() -> u64 {
    60
}

fn default_queue_depth() -> usize {
    1
}

fn default_scan_time() -> u64 {
    60
}

fn default_expiry() -> u64 {
    120
}

fn default_request_timeout() -> u64 {
    60
}

fn default_retries() -> i32 {
    2
}

fn default_retry_pause() -> u64 {
    5
}

fn default_log_interval() -> u64 {
    5
}

fn default_watchdog_interval() -> u64 {
    2
}

fn default_reconnect_interval() -> u64 {
    30
}

fn default_worker_threads() -> usize {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: Strategy::default(),
            rotate_period_mins: default_rotate_period(),
            fail_only: false,
            queue_depth: default_queue_depth(),
            scan_time_secs: default_scan_time(),
            expiry_secs: default_expiry(),
            request_timeout_secs: default_request_timeout(),
            retries: default_retries(),
            retry_pause_secs: default_retry_pause(),
            submit_stale: false,
            disable_rejecting_pools: true,
            low_resource: false,
            delay_sensitive: false,
            share_limit: None,
            log_interval_secs: default_log_interval(),
            watchdog_interval_secs: default_watchdog_interval(),
            reconnect_interval_secs: default_reconnect_interval(),
            worker_threads: default_worker_threads(),
            benchmark: false,
            schedule: None,
            donation: None,
            pools: Vec::new(),
        }
    }
}

impl EngineConfig {
    pub fn with_pools(pools: Vec<PoolConfig>) -> Self {
        Self {
            pools,
            ..Self::default()
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.to_toml()?;
        fs::write(path.as_ref(), content).map_err(|e| {
            EngineError::Config(format!("failed to write {}: {}", path.as_ref().display(), e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() && !self.benchmark {
            return Err(EngineError::Config("at least one pool is required".into()));
        }
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.url.trim().is_empty() {
                return Err(EngineError::Config(format!("pool {} has an empty url", i)));
            }
        }
        if self.scan_time_secs == 0 || self.expiry_secs == 0 {
            return Err(EngineError::Config("scan and expiry times must be positive".into()));
        }
        if self.watchdog_interval_secs == 0 || self.log_interval_secs == 0 {
            return Err(EngineError::Config("watchdog and log intervals must be positive".into()));
        }
        if let Some(donation) = &self.donation {
            if !(0.0..=100.0).contains(&donation.percent) {
                return Err(EngineError::Config("donation percent must be within 0-100".into()));
            }
        }
        Tuning::from_config(self).map(|_| ())
    }
}

/// Parsed pause/resume window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Schedule {
    pub start: Option<NaiveTime>,
    pub stop: Option<NaiveTime>,
}

fn parse_time(value: &Option<String>) -> Result<Option<NaiveTime>> {
    value
        .as_deref()
        .map(|s| {
            NaiveTime::parse_from_str(s.trim(), TIME_FORMAT)
                .map_err(|e| EngineError::Config(format!("bad schedule time '{}': {}", s, e)))
        })
        .transpose()
}

/// Runtime view of the tuning knobs, with durations resolved.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub fail_only: bool,
    pub queue_depth: usize,
    pub scan_time: Duration,
    pub expiry: Duration,
    pub request_timeout: Duration,
    pub retries: i32,
    pub retry_pause: Duration,
    pub submit_stale: bool,
    pub disable_rejecting_pools: bool,
    pub low_resource: bool,
    pub delay_sensitive: bool,
    pub share_limit: Option<u64>,
    pub log_interval: Duration,
    pub watchdog_interval: Duration,
    pub reconnect_interval: Duration,
    pub rotate_period: Duration,
    pub worker_threads: usize,
    pub schedule: Option<Schedule>,
}

impl Tuning {
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let schedule = match &config.schedule {
            Some(s) => Some(Schedule {
                start: parse_time(&s.start)?,
                stop: parse_time(&s.stop)?,
            }),
            None => None,
        };
        Ok(Self {
            fail_only: config.fail_only,
            queue_depth: config.queue_depth.max(1),
            scan_time: Duration::from_secs(config.scan_time_secs),
            expiry: Duration::from_secs(config.expiry_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            retries: config.retries,
            retry_pause: Duration::from_secs(config.retry_pause_secs),
            submit_stale: config.submit_stale,
            disable_rejecting_pools: config.disable_rejecting_pools,
            low_resource: config.low_resource,
            delay_sensitive: config.delay_sensitive,
            share_limit: config.share_limit.filter(|n| *n > 0),
            log_interval: Duration::from_secs(config.log_interval_secs.max(1)),
            watchdog_interval: Duration::from_secs(config.watchdog_interval_secs.max(1)),
            reconnect_interval: Duration::from_secs(config.reconnect_interval_secs.max(1)),
            rotate_period: Duration::from_secs(config.rotate_period_mins.max(1) * 60),
            worker_threads: config.worker_threads.max(1),
            schedule,
        })
    }

    /// Outbound connection cap for one pool.
    pub fn connection_limit(&self) -> usize {
        crate::connection::connection_limit(self.worker_threads, self.queue_depth, self.delay_sensitive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
strategy = "quota"
queue_depth = 2
fail_only = true

[schedule]
start = "08:00"
stop = "22:30"

[[pools]]
url = "http://127.0.0.1:8332"
user = "alice"
pass = "x"
quota = 3

[[pools]]
url = "stratum+tcp://pool.example.com:3333"
user = "alice.rig1"
pass = "x"
proxy = "http://127.0.0.1:3128"
submit_old = true
"#;

    #[test]
    fn test_minimal_config_gets_defaults() {
        let config = EngineConfig::from_toml("[[pools]]\nurl = \"http://localhost:8332\"\n").unwrap();
        assert_eq!(config.strategy, Strategy::Failover);
        assert_eq!(config.expiry_secs, 120);
        assert_eq!(config.scan_time_secs, 60);
        assert_eq!(config.pools[0].quota, 1);
        assert!(config.pools[0].enabled);
        assert!(config.disable_rejecting_pools);
        config.validate().unwrap();
    }

    #[test]
    fn test_protocol_inferred_from_url() {
        let config = EngineConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.pools[0].resolved_protocol(), PoolProtocol::Poll);
        assert_eq!(config.pools[1].resolved_protocol(), PoolProtocol::Stratum);
        let mut gbt = PoolConfig::new("http://127.0.0.1:8332");
        gbt.protocol = Some(PoolProtocol::Template);
        assert_eq!(gbt.resolved_protocol(), PoolProtocol::Template);
        assert_eq!(PoolConfig::new("benchmark").resolved_protocol(), PoolProtocol::Benchmark);
    }

    #[test]
    fn test_save_and_reload() {
        let mut config = EngineConfig::from_toml(SAMPLE).unwrap();
        config.pools[0].quota = 5;
        config.strategy = Strategy::Balance;
        config.share_limit = Some(10);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quarry.toml");
        config.save(&path).unwrap();
        let reloaded = EngineConfig::from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_schedule_parsed() {
        let config = EngineConfig::from_toml(SAMPLE).unwrap();
        let tuning = Tuning::from_config(&config).unwrap();
        let schedule = tuning.schedule.unwrap();
        assert_eq!(schedule.start, NaiveTime::from_hms_opt(8, 0, 0));
        assert_eq!(schedule.stop, NaiveTime::from_hms_opt(22, 30, 0));
        assert_eq!(tuning.queue_depth, 2);
        assert!(tuning.fail_only);
    }

    #[test]
    fn test_validation_errors() {
        assert!(EngineConfig::default().validate().is_err());

        let mut config = EngineConfig::from_toml(SAMPLE).unwrap();
        config.schedule = Some(ScheduleConfig {
            start: Some("25:99".into()),
            stop: None,
        });
        assert!(config.validate().is_err());

        let mut config = EngineConfig::from_toml(SAMPLE).unwrap();
        config.pools[0].url = " ".into();
        assert!(config.validate().is_err());

        let benchmark = EngineConfig {
            benchmark: true,
            ..EngineConfig::default()
        };
        benchmark.validate().unwrap();
    }
}
