use async_trait::async_trait;
use libhandle_storm::{
    ChannelSink, Finding, HandleChecker, HandleQueue, PoolConfig, ProbeConfig, ProbeOutcome,
    Prober, Proxy, ProxyPool, ProxyTester, ProxyValidator, SinkEvent, StaticSource,
    ValidationConfig, WorkSource,
};
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn proxy(n: u8) -> Proxy {
    Proxy::new(format!("192.0.2.{}", n), 8080)
}

/// 404 for handles starting with "free", hangs on proxies whose port is
/// 9999, 200 otherwise.
struct FakeLookup;

#[async_trait]
impl HandleChecker for FakeLookup {
    async fn check(&self, proxy: &Proxy, handle: &str) -> ProbeOutcome {
        if proxy.port == 9999 {
            futures::future::pending::<()>().await;
        }
        if handle.starts_with("free") {
            ProbeOutcome::Available
        } else {
            ProbeOutcome::Taken
        }
    }
}

struct AcceptAll;

#[async_trait]
impl ProxyTester for AcceptAll {
    async fn test(&self, _proxy: &Proxy) -> bool {
        true
    }
}

fn probe_config() -> ProbeConfig {
    ProbeConfig {
        lookup_base: "https://handles.example".to_string(),
        timeout: Duration::from_millis(50),
        max_concurrent_probes: 1,
        max_rate_per_proxy: 1000,
        min_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        exhaustion_wait: Duration::from_millis(100),
        ..ProbeConfig::default()
    }
}

async fn queue_of(handles: &[&str]) -> Arc<dyn WorkSource> {
    let (tx, queue) = HandleQueue::channel(handles.len() + 1);
    for h in handles {
        tx.send(h.to_string()).await.unwrap();
    }
    Arc::new(queue)
}

#[test]
fn scenario_a_least_used_selection() {
    let pool = ProxyPool::new(PoolConfig::default());
    pool.replace_all(vec![proxy(1), proxy(2), proxy(3)]);

    assert_eq!(pool.acquire(), Some(proxy(1)));
    assert_eq!(pool.acquire(), Some(proxy(2)));
    pool.evict(&proxy(2));
    // proxy(3) is the only member still at zero.
    assert_eq!(pool.acquire(), Some(proxy(3)));

    let usage: Vec<u64> = pool.members().iter().map(|m| m.usage).collect();
    assert_eq!(usage, vec![1, 1]);

    // The minimum is always what comes back.
    for _ in 0..30 {
        let min = pool.members().iter().map(|m| m.usage).min().unwrap();
        let picked = pool.acquire().unwrap();
        let after = pool.members().into_iter().find(|m| m.proxy == picked).unwrap().usage;
        assert_eq!(after, min + 1);
    }
}

#[tokio::test]
async fn scenario_b_available_is_forwarded_once() {
    let pool = Arc::new(ProxyPool::new(PoolConfig::default()));
    pool.replace_all(vec![proxy(1)]);
    let (sink, mut events) = ChannelSink::channel();
    let prober = Prober::new(Arc::clone(&pool), Arc::new(FakeLookup), Arc::new(sink), probe_config());
    let (tx, mut results) = mpsc::unbounded_channel();

    prober
        .run(queue_of(&["freebird", "taken1"]).await, tx, CancellationToken::new())
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    while let Ok(r) = results.try_recv() {
        outcomes.push((r.handle, r.outcome));
    }
    assert_eq!(
        outcomes,
        vec![
            ("freebird".to_string(), ProbeOutcome::Available),
            ("taken1".to_string(), ProbeOutcome::Taken),
        ]
    );

    let mut delivered = Vec::new();
    while let Ok(event) = events.try_recv() {
        delivered.push(event);
    }
    assert_eq!(
        delivered,
        vec![SinkEvent::Found(Finding {
            handle: "freebird".to_string(),
            url: "https://handles.example/@freebird".to_string(),
        })]
    );
}

#[tokio::test]
async fn scenario_c_timeout_evicts_resource() {
    let pool = Arc::new(ProxyPool::new(PoolConfig::default()));
    let dead = Proxy::new("192.0.2.200", 9999);
    pool.replace_all(vec![dead.clone(), proxy(2)]);
    let (sink, _events) = ChannelSink::channel();
    let prober = Prober::new(Arc::clone(&pool), Arc::new(FakeLookup), Arc::new(sink), probe_config());
    let (tx, mut results) = mpsc::unbounded_channel();

    prober
        .run(queue_of(&["someone", "other"]).await, tx, CancellationToken::new())
        .await
        .unwrap();

    let first = results.try_recv().unwrap();
    assert_eq!(first.proxy, dead);
    assert!(first.outcome.is_inconclusive());
    let second = results.try_recv().unwrap();
    assert_eq!(second.proxy, proxy(2));
    assert_eq!(second.outcome, ProbeOutcome::Taken);

    assert!(!pool.contains(&dead));
    for _ in 0..5 {
        assert_ne!(pool.acquire(), Some(dead.clone()));
    }
}

#[tokio::test]
async fn scenario_d_refresh_recovers_empty_pool() {
    let pool = Arc::new(ProxyPool::new(PoolConfig::default()));
    assert!(pool.acquire().is_none());

    let seeds = StaticSource::new("seeds", (1..=5).map(proxy).collect());
    let validator = ProxyValidator::new(
        vec![Arc::new(seeds)],
        Arc::new(AcceptAll),
        Arc::clone(&pool),
        ValidationConfig {
            timeout: Duration::from_millis(50),
            ..ValidationConfig::default()
        },
    );

    let report = validator.run().await;
    assert_eq!(report.validated, 5);
    assert_eq!(pool.len(), 5);
    assert!(pool.acquire().is_some());
}
