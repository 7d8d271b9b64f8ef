mod http;
mod lookup;
mod pool;
mod prober;
pub mod proxy;
mod ratelimit;
mod sink;
pub mod sources;
mod supervisor;
mod types;
mod validator;

use std::sync::Arc;

pub use lookup::{classify, profile_url, HandleChecker, HttpChecker};
pub use pool::{PoolHealth, PoolMember, ProxyPool};
pub use prober::{HandleQueue, Prober, ProberError, StatsSnapshot, WorkSource};
pub use proxy::{Proxy, ProxyParseError, Scheme};
pub use sink::{ChannelSink, LogSink, ResultSink, SinkError, SinkEvent};
pub use sources::{ProxySource, SourceError, SourceSpec, StaticSource};
pub use supervisor::{ProberStatus, Supervisor};
pub use types::{
    Finding, PoolConfig, ProbeConfig, ProbeOutcome, ProbeResult, StormConfig, ValidationConfig,
    DEFAULT_LOOKUP_BASE,
};
pub use validator::{HttpTester, ProxyTester, ProxyValidator, ValidationReport};

/// Checks a single handle through `proxy` with default settings.
pub async fn probe(proxy: &Proxy, handle: &str) -> ProbeOutcome {
    HttpChecker::new(&ProbeConfig::default())
        .check(proxy, handle)
        .await
}

/// Tests each proxy against the default validation target and keeps the
/// ones that answer.
pub async fn validate_many<I>(proxies: I) -> Vec<Proxy>
where
    I: IntoIterator<Item = Proxy>,
{
    let pool = Arc::new(ProxyPool::new(PoolConfig {
        max_size: 0,
        ..PoolConfig::default()
    }));
    let seeds = StaticSource::new("seeds", proxies.into_iter().collect());
    let config = ValidationConfig::default();
    let tester = HttpTester::new(config.test_url.clone(), config.timeout);
    let validator = ProxyValidator::new(
        vec![Arc::new(seeds)],
        Arc::new(tester),
        Arc::clone(&pool),
        config,
    );

    validator.run().await;
    pool.members().into_iter().map(|m| m.proxy).collect()
}
