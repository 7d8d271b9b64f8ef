use libhandle_storm::{
    sources::default_sources, PoolConfig, ProbeConfig, SourceSpec, StormConfig, ValidationConfig,
};
use serde::Deserialize;
use std::{
    error::Error,
    path::{Path, PathBuf},
    time::Duration,
};

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub probe: ProbeSection,
    #[serde(default)]
    pub pool: PoolSection,
    #[serde(default)]
    pub validation: ValidationSection,
    /// Empty means the built-in public lists.
    #[serde(default)]
    pub sources: Vec<SourceSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProbeSection {
    pub lookup_base: String,
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub rate_per_proxy: u32,
    pub delay_min_ms: u64,
    pub delay_max_ms: u64,
    pub max_failures: u32,
    pub exhaustion_wait_secs: u64,
    pub user_agents: Vec<String>,
}

impl Default for ProbeSection {
    fn default() -> Self {
        let d = ProbeConfig::default();
        Self {
            lookup_base: d.lookup_base,
            timeout_secs: d.timeout.as_secs(),
            concurrency: d.max_concurrent_probes,
            rate_per_proxy: d.max_rate_per_proxy,
            delay_min_ms: d.min_delay.as_millis() as u64,
            delay_max_ms: d.max_delay.as_millis() as u64,
            max_failures: d.max_failures,
            exhaustion_wait_secs: d.exhaustion_wait.as_secs(),
            user_agents: d.user_agents,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_size: usize,
    pub reuse_ceiling: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        let d = PoolConfig::default();
        Self {
            max_size: d.max_size,
            reuse_ceiling: d.reuse_ceiling,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ValidationSection {
    pub test_url: String,
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub refresh_interval_secs: u64,
    pub source_timeout_secs: u64,
}

impl Default for ValidationSection {
    fn default() -> Self {
        let d = ValidationConfig::default();
        Self {
            test_url: d.test_url,
            timeout_secs: d.timeout.as_secs(),
            concurrency: d.max_concurrent,
            refresh_interval_secs: d.refresh_interval.as_secs(),
            source_timeout_secs: d.source_timeout.as_secs(),
        }
    }
}

impl Config {
    pub fn into_storm_config(self) -> StormConfig {
        let Config {
            probe,
            pool,
            validation,
            sources,
        } = self;

        StormConfig {
            probe: ProbeConfig {
                lookup_base: probe.lookup_base,
                timeout: Duration::from_secs(probe.timeout_secs),
                max_concurrent_probes: probe.concurrency,
                max_rate_per_proxy: probe.rate_per_proxy,
                min_delay: Duration::from_millis(probe.delay_min_ms),
                max_delay: Duration::from_millis(probe.delay_max_ms),
                max_failures: probe.max_failures,
                exhaustion_wait: Duration::from_secs(probe.exhaustion_wait_secs),
                user_agents: probe.user_agents,
            },
            pool: PoolConfig {
                max_size: pool.max_size,
                reuse_ceiling: pool.reuse_ceiling,
            },
            validation: ValidationConfig {
                test_url: validation.test_url,
                timeout: Duration::from_secs(validation.timeout_secs),
                max_concurrent: validation.concurrency,
                refresh_interval: Duration::from_secs(validation.refresh_interval_secs),
                source_timeout: Duration::from_secs(validation.source_timeout_secs),
            },
            sources: if sources.is_empty() {
                default_sources()
            } else {
                sources
            },
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hq").join("config.toml"))
}

/// An explicit path must exist; the default path is optional.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, Box<dyn Error>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(Config::default()),
        },
    };

    let content = std::fs::read_to_string(&path)
        .map_err(|e| format!("Cannot read config {}: {}", path.display(), e))?;
    let config = toml::from_str(&content)
        .map_err(|e| format!("Invalid config {}: {}", path.display(), e))?;
    Ok(config)
}

pub fn get_default_config_toml() -> String {
    r#"# Handle Query (hq) Configuration

[probe]
lookup_base = "https://www.tiktok.com"
timeout_secs = 10
concurrency = 30
# Requests per second through any single proxy
rate_per_proxy = 2
# Random pause between handles, per worker
delay_min_ms = 400
delay_max_ms = 1000
# Consecutive inconclusive lookups before a proxy is dropped
max_failures = 1
# How long workers wait for a refresh when the pool runs dry
exhaustion_wait_secs = 60

[pool]
max_size = 100
# Proxies used fewer times than this count as fresh in the health gauge
reuse_ceiling = 5

[validation]
test_url = "https://www.tiktok.com"
timeout_secs = 7
concurrency = 20
refresh_interval_secs = 600
source_timeout_secs = 15

# Leave out [[sources]] entirely to use the built-in public lists.
# [[sources]]
# kind = "text"
# url = "https://raw.githubusercontent.com/TheSpeedX/PROXY-List/master/http.txt"
# scheme = "http"
#
# [[sources]]
# kind = "webshare"
# api_key_env = "WEBSHARE_API_KEY"
"#
    .to_string()
}
