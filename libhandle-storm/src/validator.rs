use crate::{
    http::{create_http_pool, create_proxied_client},
    pool::ProxyPool,
    proxy::Proxy,
    sources::{ProxySource, SourceError, SourceSpec},
    types::ValidationConfig,
};
use async_trait::async_trait;
use futures::{
    future,
    stream::{self, StreamExt},
};
use std::{
    collections::HashSet,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

/// Decides whether a candidate proxy is usable.
#[async_trait]
pub trait ProxyTester: Send + Sync {
    async fn test(&self, proxy: &Proxy) -> bool;
}

/// Fetches a fixed URL through the proxy; any 2xx within the timeout passes.
pub struct HttpTester {
    test_url: String,
    timeout: Duration,
}

impl HttpTester {
    pub fn new(test_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            test_url: test_url.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ProxyTester for HttpTester {
    async fn test(&self, proxy: &Proxy) -> bool {
        let client = match create_proxied_client(self.timeout, proxy) {
            Ok(c) => c,
            Err(e) => {
                tracing::debug!(proxy = %proxy, error = %e, "Cannot build client for proxy");
                return false;
            }
        };

        match tokio::time::timeout(self.timeout, client.get(&self.test_url).send()).await {
            Ok(Ok(response)) => response.status().is_success(),
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

/// Summary of one validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub candidates: usize,
    pub validated: usize,
    pub failed_sources: usize,
    /// False when every source failed and the pool was left untouched.
    pub replaced: bool,
    pub duration: Duration,
}

pub struct ProxyValidator {
    sources: Vec<Arc<dyn ProxySource>>,
    tester: Arc<dyn ProxyTester>,
    pool: Arc<ProxyPool>,
    config: ValidationConfig,
    pass: tokio::sync::Mutex<()>,
    last_report: Mutex<Option<ValidationReport>>,
}

impl ProxyValidator {
    pub fn new(
        sources: Vec<Arc<dyn ProxySource>>,
        tester: Arc<dyn ProxyTester>,
        pool: Arc<ProxyPool>,
        config: ValidationConfig,
    ) -> Self {
        Self {
            sources,
            tester,
            pool,
            config,
            pass: tokio::sync::Mutex::new(()),
            last_report: Mutex::new(None),
        }
    }

    /// Builds HTTP-backed sources and tester from configuration. Extra
    /// sources (for instance command-line seeds) are queried alongside.
    pub fn from_specs(
        specs: &[SourceSpec],
        extra: Vec<Arc<dyn ProxySource>>,
        pool: Arc<ProxyPool>,
        config: ValidationConfig,
    ) -> Result<Self, reqwest::Error> {
        let client = create_http_pool(config.source_timeout)?;
        let mut sources: Vec<Arc<dyn ProxySource>> =
            specs.iter().filter_map(|spec| spec.build(&client)).collect();
        sources.extend(extra);

        let tester = Arc::new(HttpTester::new(config.test_url.clone(), config.timeout));
        Ok(Self::new(sources, tester, pool, config))
    }

    pub fn last_report(&self) -> Option<ValidationReport> {
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Queries every source concurrently. Failing sources are logged and
    /// skipped; the result is de-duplicated in source order.
    pub async fn discover(&self) -> Vec<Proxy> {
        self.discover_counting().await.0
    }

    async fn discover_counting(&self) -> (Vec<Proxy>, usize) {
        let fetches = self.sources.iter().map(|source| async move {
            let result = match tokio::time::timeout(self.config.source_timeout, source.fetch()).await {
                Ok(result) => result,
                Err(_) => Err(SourceError::Timeout(source.name().to_string())),
            };
            (source.name(), result)
        });

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        let mut failed = 0;

        for (name, result) in future::join_all(fetches).await {
            match result {
                Ok(proxies) => {
                    tracing::debug!(source = name, count = proxies.len(), "Fetched proxy candidates");
                    candidates.extend(proxies.into_iter().filter(|p| seen.insert(p.clone())));
                }
                Err(e) => {
                    tracing::info!(source = name, error = %e, "Skipping proxy source");
                    failed += 1;
                }
            }
        }

        (candidates, failed)
    }

    /// Never errors and never outlives the configured timeout.
    pub async fn validate(&self, proxy: &Proxy) -> bool {
        matches!(
            tokio::time::timeout(self.config.timeout, self.tester.test(proxy)).await,
            Ok(true)
        )
    }

    /// Full pass: discover, validate under the concurrency gate, then swap
    /// the survivors into the pool. A call arriving while a pass is in
    /// flight waits for it and returns its report.
    pub async fn run(&self) -> ValidationReport {
        let _guard = match self.pass.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                let _joined = self.pass.lock().await;
                return self.last_report().unwrap_or_default();
            }
        };

        let started = Instant::now();
        let (candidates, failed_sources) = self.discover_counting().await;
        let candidate_count = candidates.len();

        // With no answering source the pool is left alone, including when
        // no source is configured at all.
        let report = if failed_sources == self.sources.len() {
            if self.sources.is_empty() {
                tracing::warn!("No proxy sources configured, keeping current pool");
            } else {
                tracing::warn!(failed_sources, "Every proxy source failed, keeping current pool");
            }
            ValidationReport {
                candidates: 0,
                validated: 0,
                failed_sources,
                replaced: false,
                duration: started.elapsed(),
            }
        } else {
            tracing::info!(candidates = candidate_count, "Validating proxy candidates");

            let limit = match self.pool.config().max_size {
                0 => usize::MAX,
                n => n,
            };
            let validated: Vec<Proxy> = stream::iter(candidates)
                .map(|proxy| async move { self.validate(&proxy).await.then_some(proxy) })
                .buffer_unordered(self.config.max_concurrent.max(1))
                .filter_map(future::ready)
                .take(limit)
                .collect()
                .await;

            let admitted = self.pool.replace_all(validated);
            ValidationReport {
                candidates: candidate_count,
                validated: admitted,
                failed_sources,
                replaced: true,
                duration: started.elapsed(),
            }
        };

        tracing::info!(
            candidates = report.candidates,
            validated = report.validated,
            failed_sources = report.failed_sources,
            elapsed_ms = report.duration.as_millis() as u64,
            "Proxy validation pass finished"
        );

        *self.last_report.lock().unwrap_or_else(PoisonError::into_inner) = Some(report.clone());
        report
    }
}
