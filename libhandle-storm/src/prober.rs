use crate::{
    lookup::{profile_url, HandleChecker},
    pool::ProxyPool,
    proxy::Proxy,
    ratelimit::ProxyRateLimiters,
    sink::ResultSink,
    types::{Finding, ProbeConfig, ProbeOutcome, ProbeResult},
};
use async_trait::async_trait;
use rand::Rng;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, Mutex, Notify},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProberError {
    #[error("No usable proxies after waiting {0:?} for a refresh")]
    NoUsableProxies(Duration),
}

/// Supplies handles to probe. `None` means the supply is finished.
#[async_trait]
pub trait WorkSource: Send + Sync {
    async fn next_handle(&self) -> Option<String>;
}

/// A [`WorkSource`] fed through a bounded channel.
pub struct HandleQueue {
    rx: Mutex<mpsc::Receiver<String>>,
}

impl HandleQueue {
    pub fn channel(capacity: usize) -> (mpsc::Sender<String>, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (tx, Self { rx: Mutex::new(rx) })
    }
}

#[async_trait]
impl WorkSource for HandleQueue {
    async fn next_handle(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }
}

#[derive(Default)]
struct ProbeStats {
    checked: AtomicU64,
    available: AtomicU64,
    taken: AtomicU64,
    inconclusive: AtomicU64,
    evicted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub checked: u64,
    pub available: u64,
    pub taken: u64,
    pub inconclusive: u64,
    pub evicted: u64,
}

pub struct Prober {
    pool: Arc<ProxyPool>,
    checker: Arc<dyn HandleChecker>,
    sink: Arc<dyn ResultSink>,
    rate_limiters: Arc<ProxyRateLimiters>,
    refresh: Arc<Notify>,
    stats: Arc<ProbeStats>,
    config: ProbeConfig,
}

impl Prober {
    pub fn new(
        pool: Arc<ProxyPool>,
        checker: Arc<dyn HandleChecker>,
        sink: Arc<dyn ResultSink>,
        config: ProbeConfig,
    ) -> Self {
        Self {
            pool,
            checker,
            sink,
            rate_limiters: Arc::new(ProxyRateLimiters::new(config.max_rate_per_proxy)),
            refresh: Arc::new(Notify::new()),
            stats: Arc::new(ProbeStats::default()),
            config,
        }
    }

    /// Signalled whenever a worker finds the pool empty. The supervisor
    /// listens on it to start an out-of-band validation pass.
    pub fn refresh_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.refresh)
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.pool
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            checked: self.stats.checked.load(Ordering::Relaxed),
            available: self.stats.available.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            inconclusive: self.stats.inconclusive.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }

    /// Runs `max_concurrent_probes` workers until the work source runs dry,
    /// `cancel` fires, or the pool stays empty past the exhaustion wait.
    /// Every handle taken from `work` produces exactly one result on
    /// `outcomes`.
    pub async fn run(
        &self,
        work: Arc<dyn WorkSource>,
        outcomes: mpsc::UnboundedSender<ProbeResult>,
        cancel: CancellationToken,
    ) -> Result<(), ProberError> {
        let halt = cancel.child_token();
        let mut workers = JoinSet::new();

        for id in 0..self.config.max_concurrent_probes.max(1) {
            let prober = self.clone();
            let work = Arc::clone(&work);
            let outcomes = outcomes.clone();
            let halt = halt.clone();
            workers.spawn(async move { prober.worker(id, work, outcomes, halt).await });
        }

        tracing::info!(workers = workers.len(), "Prober started");

        let mut result = Ok(());
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    if result.is_ok() {
                        tracing::error!(error = %e, "Halting prober");
                        halt.cancel();
                        result = Err(e);
                    }
                }
                Err(e) => tracing::error!(error = %e, "Probe worker aborted"),
            }
        }

        if let Err(e) = &result {
            self.send_alert(e.to_string());
        }

        tracing::info!(stats = ?self.stats(), "Prober stopped");
        result
    }

    async fn worker(
        &self,
        id: usize,
        work: Arc<dyn WorkSource>,
        outcomes: mpsc::UnboundedSender<ProbeResult>,
        cancel: CancellationToken,
    ) -> Result<(), ProberError> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            let Some(proxy) = self.acquire_proxy(&cancel).await? else {
                return Ok(());
            };

            let handle = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                handle = work.next_handle() => match handle {
                    Some(h) => h,
                    None => {
                        tracing::debug!(worker = id, "Work source exhausted");
                        return Ok(());
                    }
                },
            };

            let start = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                outcome = self.probe(&proxy, &handle) => Some(outcome),
            };

            let outcome = match outcome {
                Some(outcome) => {
                    self.settle(&proxy, &outcome);
                    outcome
                }
                None => ProbeOutcome::inconclusive("Cancelled"),
            };

            self.report(
                ProbeResult {
                    handle,
                    outcome,
                    proxy,
                    duration: start.elapsed(),
                },
                &outcomes,
            )
            .await;

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.jitter()) => {}
            }
        }
    }

    /// `Ok(None)` means the worker was cancelled while waiting.
    async fn acquire_proxy(&self, cancel: &CancellationToken) -> Result<Option<Proxy>, ProberError> {
        if let Some(proxy) = self.pool.acquire() {
            return Ok(Some(proxy));
        }

        tracing::warn!("Proxy pool exhausted, requesting refresh");
        self.refresh.notify_one();

        tokio::select! {
            _ = cancel.cancelled() => Ok(None),
            proxy = self.pool.wait_for_proxy(self.config.exhaustion_wait) => match proxy {
                Some(proxy) => Ok(Some(proxy)),
                None => Err(ProberError::NoUsableProxies(self.config.exhaustion_wait)),
            },
        }
    }

    /// One lookup through `proxy`, bounded by the probe timeout whatever the
    /// checker does internally.
    pub async fn probe(&self, proxy: &Proxy, handle: &str) -> ProbeOutcome {
        self.rate_limiters.acquire(proxy).await;

        match tokio::time::timeout(self.config.timeout, self.checker.check(proxy, handle)).await {
            Ok(outcome) => outcome,
            Err(_) => ProbeOutcome::inconclusive("Timeout"),
        }
    }

    fn settle(&self, proxy: &Proxy, outcome: &ProbeOutcome) {
        match outcome {
            ProbeOutcome::Available | ProbeOutcome::Taken => self.pool.record_success(proxy),
            ProbeOutcome::Inconclusive { reason } => {
                if self.pool.record_failure(proxy, self.config.max_failures) {
                    self.rate_limiters.forget(proxy);
                    self.checker.forget(proxy);
                    self.stats.evicted.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(proxy = %proxy, reason = %reason, "Evicted proxy");
                }
            }
        }
    }

    async fn report(&self, result: ProbeResult, outcomes: &mpsc::UnboundedSender<ProbeResult>) {
        self.stats.checked.fetch_add(1, Ordering::Relaxed);

        match &result.outcome {
            ProbeOutcome::Available => {
                self.stats.available.fetch_add(1, Ordering::Relaxed);
                let finding = Finding {
                    handle: result.handle.clone(),
                    url: profile_url(&self.config.lookup_base, &result.handle),
                };
                match tokio::time::timeout(self.config.timeout, self.sink.found(&finding)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => tracing::warn!(handle = %finding.handle, error = %e, "Failed to deliver finding"),
                    Err(_) => tracing::warn!(handle = %finding.handle, "Finding delivery timed out"),
                }
            }
            ProbeOutcome::Taken => {
                self.stats.taken.fetch_add(1, Ordering::Relaxed);
            }
            ProbeOutcome::Inconclusive { .. } => {
                self.stats.inconclusive.fetch_add(1, Ordering::Relaxed);
            }
        }

        if outcomes.send(result).is_err() {
            tracing::trace!("Outcome receiver dropped");
        }
    }

    /// Delivered in the background so a slow notifier never delays the
    /// halt from being observed.
    fn send_alert(&self, message: String) {
        let sink = Arc::clone(&self.sink);
        let timeout = self.config.timeout;
        tokio::spawn(async move {
            match tokio::time::timeout(timeout, sink.alert(&message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "Failed to deliver exhaustion alert"),
                Err(_) => tracing::warn!("Exhaustion alert delivery timed out"),
            }
        });
    }

    /// Drops per-proxy limiter and client state for proxies that are no
    /// longer pool members.
    pub fn prune(&self) {
        let live: HashSet<Proxy> = self.pool.members().into_iter().map(|m| m.proxy).collect();
        self.rate_limiters.retain(|proxy| live.contains(proxy));
        self.checker.retain(&|proxy| live.contains(proxy));
    }

    fn jitter(&self) -> Duration {
        let min = self.config.min_delay.as_millis() as u64;
        let max = self.config.max_delay.as_millis() as u64;
        if max <= min {
            return self.config.min_delay;
        }
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }
}

impl Clone for Prober {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            checker: Arc::clone(&self.checker),
            sink: Arc::clone(&self.sink),
            rate_limiters: Arc::clone(&self.rate_limiters),
            refresh: Arc::clone(&self.refresh),
            stats: Arc::clone(&self.stats),
            config: self.config.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{ChannelSink, SinkError, SinkEvent};
    use std::{collections::HashMap, sync::atomic::AtomicUsize};

    /// Answers from a per-handle script; unknown handles hang until the
    /// probe timeout fires.
    struct ScriptedChecker {
        answers: HashMap<String, ProbeOutcome>,
    }

    #[async_trait]
    impl HandleChecker for ScriptedChecker {
        async fn check(&self, _proxy: &Proxy, handle: &str) -> ProbeOutcome {
            match self.answers.get(handle) {
                Some(outcome) => outcome.clone(),
                None => futures::future::pending().await,
            }
        }
    }

    fn config() -> ProbeConfig {
        ProbeConfig {
            timeout: Duration::from_millis(50),
            max_concurrent_probes: 2,
            max_rate_per_proxy: 1000,
            min_delay: Duration::ZERO,
            max_delay: Duration::from_millis(2),
            exhaustion_wait: Duration::from_millis(100),
            ..ProbeConfig::default()
        }
    }

    fn proxy(n: u8) -> Proxy {
        Proxy::new(format!("10.2.0.{}", n), 3128)
    }

    fn prober(pool: Arc<ProxyPool>, answers: &[(&str, ProbeOutcome)]) -> (Prober, mpsc::UnboundedReceiver<SinkEvent>) {
        let checker = ScriptedChecker {
            answers: answers
                .iter()
                .map(|(h, o)| (h.to_string(), o.clone()))
                .collect(),
        };
        let (sink, events) = ChannelSink::channel();
        (Prober::new(pool, Arc::new(checker), Arc::new(sink), config()), events)
    }

    async fn queue(handles: &[&str]) -> Arc<dyn WorkSource> {
        let (tx, queue) = HandleQueue::channel(handles.len() + 1);
        for h in handles {
            tx.send(h.to_string()).await.unwrap();
        }
        Arc::new(queue)
    }

    fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn every_dequeued_handle_yields_one_outcome() {
        let pool = Arc::new(ProxyPool::default());
        pool.replace_all((1..=3).map(proxy));
        let (prober, mut events) = prober(
            Arc::clone(&pool),
            &[("nova", ProbeOutcome::Available), ("luna", ProbeOutcome::Taken), ("kilo", ProbeOutcome::Taken)],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        prober
            .run(queue(&["nova", "luna", "kilo"]).await, tx, CancellationToken::new())
            .await
            .unwrap();

        let mut handles: Vec<String> = drain(&mut rx).into_iter().map(|r| r.handle).collect();
        handles.sort();
        assert_eq!(handles, vec!["kilo", "luna", "nova"]);

        assert_eq!(
            drain(&mut events),
            vec![SinkEvent::Found(Finding {
                handle: "nova".to_string(),
                url: "https://www.tiktok.com/@nova".to_string(),
            })]
        );

        let stats = prober.stats();
        assert_eq!((stats.checked, stats.available, stats.taken), (3, 1, 2));
        assert_eq!(pool.len(), 3);
    }

    #[tokio::test]
    async fn timeout_evicts_the_proxy_used() {
        let pool = Arc::new(ProxyPool::default());
        pool.replace_all(vec![proxy(1), proxy(2)]);
        let (prober, mut events) = prober(Arc::clone(&pool), &[]);

        let outcome = prober.probe(&proxy(1), "ghost").await;
        assert_eq!(outcome, ProbeOutcome::inconclusive("Timeout"));
        prober.settle(&proxy(1), &outcome);

        assert!(!pool.contains(&proxy(1)));
        for _ in 0..4 {
            assert_eq!(pool.acquire(), Some(proxy(2)));
        }
        assert!(drain(&mut events).is_empty());
        assert_eq!(prober.stats().evicted, 1);
    }

    #[tokio::test]
    async fn inconclusive_results_are_reported_but_not_forwarded() {
        let pool = Arc::new(ProxyPool::default());
        pool.replace_all(vec![proxy(1), proxy(2)]);
        let (prober, mut events) = prober(
            Arc::clone(&pool),
            &[("blocked", ProbeOutcome::inconclusive("HTTP 403"))],
        );
        let (tx, mut rx) = mpsc::unbounded_channel();

        prober
            .run(queue(&["blocked"]).await, tx, CancellationToken::new())
            .await
            .unwrap();

        let results = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert!(results[0].outcome.is_inconclusive());
        assert!(!pool.contains(&results[0].proxy));
        assert_eq!(pool.len(), 1);
        assert!(drain(&mut events).is_empty());
    }

    #[tokio::test]
    async fn empty_pool_requests_refresh_then_halts() {
        let pool = Arc::new(ProxyPool::default());
        let (prober, mut events) = prober(Arc::clone(&pool), &[]);
        let refresh = prober.refresh_signal();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let result = prober
            .run(queue(&["nova"]).await, tx, CancellationToken::new())
            .await;

        assert_eq!(result, Err(ProberError::NoUsableProxies(Duration::from_millis(100))));
        // The permit left by notify_one is still pending.
        tokio::time::timeout(Duration::from_millis(10), refresh.notified())
            .await
            .expect("refresh should have been requested");
        assert!(drain(&mut rx).is_empty());
        let alert = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .expect("alert should be delivered");
        assert!(matches!(alert, Some(SinkEvent::Alert(_))));
    }

    /// `found` fails or hangs, `alert` hangs.
    struct BrokenSink {
        hang_on_found: bool,
    }

    #[async_trait]
    impl ResultSink for BrokenSink {
        async fn found(&self, _finding: &Finding) -> Result<(), SinkError> {
            if self.hang_on_found {
                futures::future::pending::<()>().await;
            }
            Err(SinkError("webhook returned 500".to_string()))
        }

        async fn alert(&self, _message: &str) -> Result<(), SinkError> {
            futures::future::pending().await
        }
    }

    fn prober_with_sink(pool: Arc<ProxyPool>, checker: Arc<dyn HandleChecker>, sink: BrokenSink) -> Prober {
        Prober::new(pool, checker, Arc::new(sink), config())
    }

    fn always_available() -> Arc<dyn HandleChecker> {
        Arc::new(ScriptedChecker {
            answers: ["nova", "luna", "kilo"]
                .iter()
                .map(|h| (h.to_string(), ProbeOutcome::Available))
                .collect(),
        })
    }

    #[tokio::test]
    async fn hung_alert_does_not_delay_halt() {
        let pool = Arc::new(ProxyPool::default());
        let prober = prober_with_sink(pool, always_available(), BrokenSink { hang_on_found: false });
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = tokio::time::timeout(
            Duration::from_secs(1),
            prober.run(queue(&["nova"]).await, tx, CancellationToken::new()),
        )
        .await
        .expect("run should return once the workers give up");
        assert_eq!(result, Err(ProberError::NoUsableProxies(Duration::from_millis(100))));
    }

    #[tokio::test]
    async fn failing_sink_never_stops_the_prober() {
        for hang_on_found in [false, true] {
            let pool = Arc::new(ProxyPool::default());
            pool.replace_all((1..=2).map(proxy));
            let prober = prober_with_sink(Arc::clone(&pool), always_available(), BrokenSink { hang_on_found });
            let (tx, mut rx) = mpsc::unbounded_channel();

            let result = prober
                .run(queue(&["nova", "luna", "kilo"]).await, tx, CancellationToken::new())
                .await;

            assert_eq!(result, Ok(()));
            let mut handles: Vec<String> = drain(&mut rx).into_iter().map(|r| r.handle).collect();
            handles.sort();
            assert_eq!(handles, vec!["kilo", "luna", "nova"]);
            assert_eq!(prober.stats().available, 3);
            assert_eq!(pool.len(), 2);
        }
    }

    /// Answers `Taken` after a short delay and records the highest number
    /// of lookups in flight at once.
    #[derive(Default)]
    struct PeakChecker {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl HandleChecker for PeakChecker {
        async fn check(&self, _proxy: &Proxy, _handle: &str) -> ProbeOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            ProbeOutcome::Taken
        }
    }

    #[tokio::test]
    async fn in_flight_lookups_respect_concurrency_limit() {
        let pool = Arc::new(ProxyPool::default());
        pool.replace_all((1..=6).map(proxy));
        let checker = Arc::new(PeakChecker::default());
        let (sink, _events) = ChannelSink::channel();
        let prober = Prober::new(
            Arc::clone(&pool),
            Arc::clone(&checker) as Arc<dyn HandleChecker>,
            Arc::new(sink),
            ProbeConfig {
                max_concurrent_probes: 3,
                max_delay: Duration::ZERO,
                ..config()
            },
        );
        let handles: Vec<String> = (0..15).map(|n| format!("user{}", n)).collect();
        let handles: Vec<&str> = handles.iter().map(String::as_str).collect();
        let (tx, mut rx) = mpsc::unbounded_channel();

        prober
            .run(queue(&handles).await, tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(drain(&mut rx).len(), 15);
        assert_eq!(checker.peak.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn prune_drops_state_of_replaced_proxies() {
        let pool = Arc::new(ProxyPool::default());
        let (prober, _events) = prober(Arc::clone(&pool), &[("nova", ProbeOutcome::Taken)]);

        for n in 1..=10 {
            pool.replace_all(vec![proxy(n)]);
            prober.probe(&proxy(n), "nova").await;
        }
        assert_eq!(prober.rate_limiters.len(), 10);

        prober.prune();
        assert_eq!(prober.rate_limiters.len(), 1);
    }

    #[tokio::test]
    async fn refresh_during_wait_lets_workers_continue() {
        let pool = Arc::new(ProxyPool::default());
        let (prober, _events) = prober(Arc::clone(&pool), &[("nova", ProbeOutcome::Taken)]);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let refill = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                pool.replace_all(vec![proxy(9)]);
            })
        };

        prober
            .run(queue(&["nova"]).await, tx, CancellationToken::new())
            .await
            .unwrap();
        refill.await.unwrap();

        let results = drain(&mut rx);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].proxy, proxy(9));
    }

    #[tokio::test]
    async fn cancellation_stops_workers_promptly() {
        let pool = Arc::new(ProxyPool::default());
        pool.replace_all((1..=2).map(proxy));
        let (prober, _events) = prober(Arc::clone(&pool), &[("nova", ProbeOutcome::Taken)]);
        let (_keep_open, queue) = HandleQueue::channel(4);
        let (tx, _rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let run = {
            let prober = prober.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { prober.run(Arc::new(queue), tx, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_millis(200), run)
            .await
            .expect("workers should exit after cancel")
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let pool = Arc::new(ProxyPool::default());
        let (mut prober, _events) = prober(pool, &[]);
        prober.config.min_delay = Duration::from_millis(400);
        prober.config.max_delay = Duration::from_millis(1000);
        for _ in 0..50 {
            let d = prober.jitter();
            assert!(d >= Duration::from_millis(400) && d <= Duration::from_millis(1000));
        }
    }
}
