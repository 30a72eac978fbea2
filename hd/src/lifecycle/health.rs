//! Heartbeat health classification
//!
//! Running agents must heartbeat at least every `H` seconds. Health is a
//! pure function of the heartbeat age, so the watcher and the monitor agree
//! by construction.

use serde::{Deserialize, Serialize};

/// Health of a live run, derived from heartbeat age
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentHealth {
    /// Last heartbeat within H
    Healthy,
    /// Within 2H - tolerated, usually a long tool call
    Stale,
    /// Within the stuck multiplier - alert fires
    Stuck,
    /// Beyond the crashed multiplier - orphan cleanup takes over
    Crashed,
}

impl std::fmt::Display for AgentHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Healthy => "healthy",
            Self::Stale => "stale",
            Self::Stuck => "stuck",
            Self::Crashed => "crashed",
        };
        write!(f, "{s}")
    }
}

/// Thresholds in terms of the heartbeat interval
#[derive(Debug, Clone, Copy)]
pub struct HealthThresholds {
    pub interval_ms: i64,
    /// Heartbeat age beyond `stuck_multiplier * interval` is stuck
    pub stuck_multiplier: i64,
    /// Heartbeat age beyond `crashed_multiplier * interval` is crashed
    pub crashed_multiplier: i64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            stuck_multiplier: 5,
            crashed_multiplier: 5,
        }
    }
}

impl HealthThresholds {
    /// Classify a heartbeat age
    pub fn classify(&self, age_ms: i64) -> AgentHealth {
        if age_ms <= self.interval_ms {
            AgentHealth::Healthy
        } else if age_ms <= 2 * self.interval_ms {
            AgentHealth::Stale
        } else if age_ms <= self.stuck_multiplier * self.interval_ms {
            AgentHealth::Stuck
        } else {
            let crashed_at = self.crashed_multiplier.max(self.stuck_multiplier) * self.interval_ms;
            if age_ms > crashed_at {
                AgentHealth::Crashed
            } else {
                AgentHealth::Stuck
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thresholds() -> HealthThresholds {
        HealthThresholds {
            interval_ms: 1_000,
            stuck_multiplier: 5,
            crashed_multiplier: 5,
        }
    }

    #[test]
    fn test_classification_bands() {
        let t = thresholds();
        assert_eq!(t.classify(0), AgentHealth::Healthy);
        assert_eq!(t.classify(1_000), AgentHealth::Healthy);
        assert_eq!(t.classify(1_001), AgentHealth::Stale);
        assert_eq!(t.classify(2_000), AgentHealth::Stale);
        assert_eq!(t.classify(2_001), AgentHealth::Stuck);
        assert_eq!(t.classify(5_000), AgentHealth::Stuck);
        assert_eq!(t.classify(5_001), AgentHealth::Crashed);
    }

    #[test]
    fn test_larger_crashed_multiplier_widens_stuck_band() {
        let t = HealthThresholds {
            interval_ms: 1_000,
            stuck_multiplier: 3,
            crashed_multiplier: 8,
        };
        assert_eq!(t.classify(3_000), AgentHealth::Stuck);
        assert_eq!(t.classify(8_000), AgentHealth::Stuck);
        assert_eq!(t.classify(8_001), AgentHealth::Crashed);
    }
}
