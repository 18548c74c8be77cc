use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Policy deciding which pool supplies the next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    #[default]
    Failover,
    RoundRobin,
    Rotate,
    /// Proportional share: the pool with the fewest credited shares wins.
    Balance,
    /// Quota balance: round robin weighted by each pool's quota.
    Quota,
}

impl Strategy {
    /// Strategies that spread work over every usable pool at once.
    pub fn is_shared(self) -> bool {
        matches!(self, Strategy::Balance | Strategy::Quota)
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Strategy::Failover => "failover",
            Strategy::RoundRobin => "round-robin",
            Strategy::Rotate => "rotate",
            Strategy::Balance => "balance",
            Strategy::Quota => "quota",
        };
        f.write_str(name)
    }
}

impl FromStr for Strategy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "failover" => Ok(Strategy::Failover),
            "round-robin" | "roundrobin" | "rr" => Ok(Strategy::RoundRobin),
            "rotate" => Ok(Strategy::Rotate),
            "balance" | "load-balance" => Ok(Strategy::Balance),
            "quota" | "quota-balance" => Ok(Strategy::Quota),
            other => Err(EngineError::Config(format!("unknown strategy '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Enabled,
    Disabled,
    /// Auto-disabled after a run of rejected shares.
    Rejecting,
}

impl fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PoolStatus::Enabled => "enabled",
            PoolStatus::Disabled => "disabled",
            PoolStatus::Rejecting => "rejecting",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strategy() {
        assert_eq!("failover".parse::<Strategy>().unwrap(), Strategy::Failover);
        assert_eq!("Round-Robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!("quota-balance".parse::<Strategy>().unwrap(), Strategy::Quota);
        assert!("fastest".parse::<Strategy>().is_err());
    }

    #[test]
    fn test_shared_strategies() {
        assert!(Strategy::Balance.is_shared());
        assert!(Strategy::Quota.is_shared());
        assert!(!Strategy::Failover.is_shared());
        assert!(!Strategy::Rotate.is_shared());
    }

    #[test]
    fn test_display_round_trips() {
        for s in [
            Strategy::Failover,
            Strategy::RoundRobin,
            Strategy::Rotate,
            Strategy::Balance,
            Strategy::Quota,
        ] {
            assert_eq!(s.to_string().parse::<Strategy>().unwrap(), s);
        }
    }
}
