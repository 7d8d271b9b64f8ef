use crate::{proxy::Proxy, sources::SourceSpec};
use serde::Serialize;
use std::time::Duration;

pub const DEFAULT_LOOKUP_BASE: &str = "https://www.tiktok.com";

pub const DEFAULT_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64)",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7)",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 14_0 like Mac OS X)",
];

/// Result of one lookup. `Inconclusive` says nothing about the handle,
/// only that the proxy used could not complete the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ProbeOutcome {
    Available,
    Taken,
    Inconclusive { reason: String },
}

impl ProbeOutcome {
    pub fn is_available(&self) -> bool {
        matches!(self, ProbeOutcome::Available)
    }

    pub fn is_taken(&self) -> bool {
        matches!(self, ProbeOutcome::Taken)
    }

    pub fn is_inconclusive(&self) -> bool {
        matches!(self, ProbeOutcome::Inconclusive { .. })
    }

    pub(crate) fn inconclusive(reason: impl Into<String>) -> Self {
        ProbeOutcome::Inconclusive { reason: reason.into() }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub handle: String,
    pub outcome: ProbeOutcome,
    pub proxy: Proxy,
    pub duration: Duration,
}

/// A handle reported as unregistered, as delivered to a result sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub handle: String,
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub lookup_base: String,
    pub timeout: Duration,
    pub max_concurrent_probes: usize,
    pub max_rate_per_proxy: u32,
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive inconclusive lookups tolerated before a proxy is evicted.
    pub max_failures: u32,
    pub exhaustion_wait: Duration,
    pub user_agents: Vec<String>,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            lookup_base: DEFAULT_LOOKUP_BASE.to_string(),
            timeout: Duration::from_secs(10),
            max_concurrent_probes: 30,
            max_rate_per_proxy: 2,
            min_delay: Duration::from_millis(400),
            max_delay: Duration::from_millis(1000),
            max_failures: 1,
            exhaustion_wait: Duration::from_secs(60),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upper bound on pool membership; 0 means unbounded.
    pub max_size: usize,
    /// Usage count below which a proxy still counts as fresh in health snapshots.
    pub reuse_ceiling: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            reuse_ceiling: 5,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ValidationConfig {
    pub test_url: String,
    pub timeout: Duration,
    pub max_concurrent: usize,
    pub refresh_interval: Duration,
    pub source_timeout: Duration,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            test_url: DEFAULT_LOOKUP_BASE.to_string(),
            timeout: Duration::from_secs(7),
            max_concurrent: 20,
            refresh_interval: Duration::from_secs(600),
            source_timeout: Duration::from_secs(15),
        }
    }
}

/// Everything needed to assemble a [`crate::Supervisor`] backed by real HTTP.
#[derive(Debug, Clone)]
pub struct StormConfig {
    pub probe: ProbeConfig,
    pub pool: PoolConfig,
    pub validation: ValidationConfig,
    pub sources: Vec<SourceSpec>,
}

impl Default for StormConfig {
    fn default() -> Self {
        Self {
            probe: ProbeConfig::default(),
            pool: PoolConfig::default(),
            validation: ValidationConfig::default(),
            sources: crate::sources::default_sources(),
        }
    }
}
