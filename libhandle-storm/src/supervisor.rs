//! Supervising control loop.
//!
//! Owns the refresh timer, listens for exhaustion signals from the prober,
//! and exposes the operator commands `start`, `stop` and `force_refresh`.
//! All tasks hang off one root cancellation token, so `shutdown` is
//! deterministic.

use crate::{
    lookup::HttpChecker,
    pool::{PoolHealth, ProxyPool},
    prober::{Prober, ProberError, StatsSnapshot, WorkSource},
    sink::ResultSink,
    sources::ProxySource,
    types::{ProbeResult, StormConfig},
    validator::{ProxyValidator, ValidationReport},
};
use serde::Serialize;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProberStatus {
    Stopped,
    Running,
    /// Halted because no proxy survived a refresh; resumes after the next
    /// successful validation pass.
    Exhausted,
}

struct RunHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct Inner {
    validator: Arc<ProxyValidator>,
    prober: Prober,
    work: Arc<dyn WorkSource>,
    outcomes: mpsc::UnboundedSender<ProbeResult>,
    refresh: Arc<Notify>,
    refresh_interval: Duration,
    shutdown: CancellationToken,
    status: watch::Sender<ProberStatus>,
    passes: watch::Sender<u64>,
    run: Mutex<Option<RunHandle>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(
        validator: Arc<ProxyValidator>,
        prober: Prober,
        work: Arc<dyn WorkSource>,
        outcomes: mpsc::UnboundedSender<ProbeResult>,
        refresh_interval: Duration,
    ) -> Self {
        let (status, _) = watch::channel(ProberStatus::Stopped);
        let (passes, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                refresh: prober.refresh_signal(),
                validator,
                prober,
                work,
                outcomes,
                refresh_interval,
                shutdown: CancellationToken::new(),
                status,
                passes,
                run: Mutex::new(None),
                refresher: Mutex::new(None),
            }),
        }
    }

    /// Wires pool, HTTP validator and HTTP checker together from `config`.
    pub fn from_config(
        config: StormConfig,
        extra_sources: Vec<Arc<dyn ProxySource>>,
        sink: Arc<dyn ResultSink>,
        work: Arc<dyn WorkSource>,
        outcomes: mpsc::UnboundedSender<ProbeResult>,
    ) -> Result<Self, reqwest::Error> {
        let pool = Arc::new(ProxyPool::new(config.pool));
        let validator = Arc::new(ProxyValidator::from_specs(
            &config.sources,
            extra_sources,
            Arc::clone(&pool),
            config.validation.clone(),
        )?);
        let checker = Arc::new(HttpChecker::new(&config.probe));
        let prober = Prober::new(pool, checker, sink, config.probe);

        Ok(Self::new(
            validator,
            prober,
            work,
            outcomes,
            config.validation.refresh_interval,
        ))
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        self.inner.prober.pool()
    }

    pub fn health(&self) -> PoolHealth {
        self.pool().health_snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.prober.stats()
    }

    pub fn status(&self) -> ProberStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ProberStatus> {
        self.inner.status.subscribe()
    }

    pub fn last_refresh(&self) -> Option<ValidationReport> {
        self.inner.validator.last_report()
    }

    /// Number of validation passes completed so far.
    pub fn refresh_count(&self) -> u64 {
        *self.inner.passes.borrow()
    }

    /// Resolves once at least one validation pass has completed.
    pub async fn ready(&self) {
        let mut passes = self.inner.passes.subscribe();
        let _ = passes.wait_for(|n| *n > 0).await;
    }

    /// Spawns the refresh loop: one validation pass right away, then one per
    /// interval and one whenever the prober reports an empty pool. Calling
    /// it again while the loop is alive does nothing.
    pub fn launch(&self) {
        let mut refresher = lock(&self.inner.refresher);
        if refresher.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let this = self.clone();
        *refresher = Some(tokio::spawn(async move { this.refresh_loop().await }));
    }

    async fn refresh_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.refresh_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
                _ = self.inner.refresh.notified() => {
                    tracing::info!("Refresh requested by prober");
                }
            }
            self.refresh_and_resume().await;
        }

        tracing::debug!("Refresh loop exiting");
    }

    async fn refresh_and_resume(&self) -> ValidationReport {
        let report = tokio::select! {
            _ = self.inner.shutdown.cancelled() => return ValidationReport::default(),
            report = self.inner.validator.run() => report,
        };
        self.inner.passes.send_modify(|n| *n += 1);
        if report.replaced {
            self.inner.prober.prune();
        }

        if report.validated > 0 && self.status() == ProberStatus::Exhausted {
            tracing::info!(validated = report.validated, "Proxies available again, resuming prober");
            self.start();
        }
        report
    }

    /// Starts the prober. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        if self.inner.shutdown.is_cancelled() {
            return false;
        }

        let mut run = lock(&self.inner.run);
        let running = run.as_ref().is_some_and(|r| !r.task.is_finished());
        if running && self.status() == ProberStatus::Running {
            return false;
        }

        let cancel = self.inner.shutdown.child_token();
        self.inner.status.send_replace(ProberStatus::Running);

        let this = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = this
                .inner
                .prober
                .run(Arc::clone(&this.inner.work), this.inner.outcomes.clone(), token.clone())
                .await;
            this.finish_run(result, &token);
        });

        *run = Some(RunHandle { cancel, task });
        true
    }

    fn finish_run(&self, result: Result<(), ProberError>, cancel: &CancellationToken) {
        match result {
            Ok(()) => {
                self.inner.status.send_replace(ProberStatus::Stopped);
            }
            Err(ProberError::NoUsableProxies(_)) => {
                self.inner.status.send_replace(ProberStatus::Exhausted);
                // A pass that finished while the workers were winding down
                // saw `Running` and left the restart to us.
                if !cancel.is_cancelled() && !self.pool().is_empty() {
                    tracing::info!(proxies = self.pool().len(), "Pool refilled during halt, resuming prober");
                    self.start();
                }
            }
        }
    }

    /// Stops the prober and waits for its workers to exit. Safe to call
    /// when nothing is running.
    pub async fn stop(&self) {
        let handle = lock(&self.inner.run).take();
        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.task.await {
                tracing::error!(error = %e, "Prober task failed");
            }
        }
        self.inner.status.send_replace(ProberStatus::Stopped);
    }

    /// Runs a validation pass now and waits for it.
    pub async fn force_refresh(&self) -> ValidationReport {
        self.refresh_and_resume().await
    }

    /// Stops everything and waits for the background tasks.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.inner.shutdown.cancel();

        let refresher = lock(&self.inner.refresher).take();
        if let Some(task) = refresher {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Refresh loop failed");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
