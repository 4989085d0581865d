//! Session coordinator: drives the start sequence, owns the browser handle
//! and the running monitor, and tears everything down on stop or shutdown.
//!
//! States run `Idle → Launching → AwaitingReadiness → Connecting →
//! AwaitingBanner → Monitoring → ShuttingDown → Idle`. A failure at any start
//! stage releases what was acquired and returns to `Idle`. A `stop` or
//! `shutdown` issued mid-start interrupts it at the current stage.
//!
//! Log access runs on the blocking pool; the log mutex is never held across
//! an await.

use crate::catcher::CrashPage;
use crate::chrome::{BrowserLauncher, BrowserProcessHandle};
use crate::config::CatchConfig;
use crate::monitor::{spawn_monitor, MonitorHandle};
use crate::storage::ResultLog;
use crate::types::{CatchError, CatchResult, CrashResult, SessionState};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Shared handle to the result log.
pub type SharedLog = Arc<Mutex<ResultLog>>;

/// Result of a single-shot latest-result query.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestOutcome {
    pub result: CrashResult,
    /// Set only when persistence was requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_error: Option<String>,
}

#[derive(Default)]
struct Inner {
    process: Option<BrowserProcessHandle>,
    monitor: Option<MonitorHandle>,
}

impl Inner {
    fn is_empty(&self) -> bool {
        self.process.is_none() && self.monitor.is_none()
    }
}

fn lock_or_recover<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Append `record` to the shared log on the blocking pool, logging any failure.
async fn persist(log: SharedLog, results_dir: PathBuf, record: CrashResult) -> CatchResult<()> {
    let game_id = record.game_id.clone();
    tokio::task::spawn_blocking(move || lock_or_recover(&*log).save(&record))
        .await
        .unwrap_or_else(|e| Err(CatchError::persistence(results_dir, std::io::Error::other(e))))
        .inspect_err(|e| {
            error!(game_id = %game_id, error = %e, "failed to save crash result");
        })
}

pub struct SessionCoordinator {
    config: CatchConfig,
    launcher: Arc<dyn BrowserLauncher>,
    page: Arc<dyn CrashPage>,
    log: SharedLog,
    inner: tokio::sync::Mutex<Inner>,
    state: watch::Sender<SessionState>,
    /// Interrupts the start sequence in progress, if any.
    start_cancel: Mutex<Option<CancellationToken>>,
    shutdown_started: AtomicBool,
}

impl SessionCoordinator {
    pub fn new(
        config: CatchConfig,
        launcher: Arc<dyn BrowserLauncher>,
        page: Arc<dyn CrashPage>,
        log: SharedLog,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            config,
            launcher,
            page,
            log,
            inner: tokio::sync::Mutex::new(Inner::default()),
            state,
            start_cancel: Mutex::new(None),
            shutdown_started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &CatchConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SessionState) {
        let prev = self.state.send_replace(next);
        if prev != next {
            debug!(from = %prev, to = %next, "session state");
        }
    }

    /// Launch or attach, wait for readiness, connect, wait for the banner,
    /// then monitor with persistence. Restarts an active session.
    ///
    /// Interrupted by [`stop`](Self::stop) or [`shutdown`](Self::shutdown),
    /// in which case it fails with [`CatchError::Cancelled`] after teardown.
    pub async fn start(&self) -> CatchResult<()> {
        let mut inner = self.inner.lock().await;
        let token = CancellationToken::new();
        *lock_or_recover(&self.start_cancel) = Some(token.clone());
        // Registered before the shutdown check, which `shutdown` sets first.
        if self.shutdown_started.load(Ordering::SeqCst) {
            lock_or_recover(&self.start_cancel).take();
            return Err(CatchError::Cancelled.at_stage(SessionState::Idle));
        }
        if self.state() != SessionState::Idle || !inner.is_empty() {
            info!(state = %self.state(), "session active, restarting");
            self.teardown(&mut inner).await;
        }

        let outcome = tokio::select! {
            result = self.run_start(&mut inner) => result,
            _ = token.cancelled() => {
                info!(stage = %self.state(), "session start interrupted");
                Err(CatchError::Cancelled.at_stage(self.state()))
            }
        };
        lock_or_recover(&self.start_cancel).take();

        match outcome {
            Ok(()) => {
                self.set_state(SessionState::Monitoring);
                info!(port = self.config.debug_port, "crash result monitoring started");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "session start failed");
                self.teardown(&mut inner).await;
                Err(e)
            }
        }
    }

    fn cancel_pending_start(&self) {
        if let Some(token) = lock_or_recover(&self.start_cancel).take() {
            token.cancel();
        }
    }

    async fn run_start(&self, inner: &mut Inner) -> CatchResult<()> {
        self.set_state(SessionState::Launching);
        let handle = self
            .launcher
            .launch()
            .await
            .map_err(|e| e.at_stage(SessionState::Launching))?;
        inner.process = Some(handle);

        self.set_state(SessionState::AwaitingReadiness);
        let attempt = self
            .launcher
            .wait_until_ready(self.config.ready_attempts, self.config.ready_delay)
            .await
            .map_err(|e| e.at_stage(SessionState::AwaitingReadiness))?;
        info!(port = self.config.debug_port, attempt, "debug endpoint ready");

        self.set_state(SessionState::Connecting);
        self.page
            .connect()
            .await
            .map_err(|e| e.at_stage(SessionState::Connecting))?;

        self.set_state(SessionState::AwaitingBanner);
        self.page
            .wait_for_banner(self.config.start_banner_timeout)
            .await
            .map_err(|e| e.at_stage(SessionState::AwaitingBanner))?;

        inner.monitor = Some(self.spawn_logged_monitor(true).await);
        Ok(())
    }

    /// A failed save leaves the cursor in place, so the result is retried
    /// on the next tick.
    async fn spawn_logged_monitor(&self, persist_results: bool) -> MonitorHandle {
        let cursor = if persist_results {
            self.last_logged_id().await
        } else {
            None
        };
        let log = self.log.clone();
        let results_dir = self.config.results_dir.clone();
        spawn_monitor(
            self.page.clone(),
            self.config.monitor_interval,
            cursor,
            move |record| {
                let log = log.clone();
                let results_dir = results_dir.clone();
                async move {
                    if persist_results {
                        persist(log, results_dir, record).await
                    } else {
                        Ok(())
                    }
                }
            },
        )
    }

    async fn last_logged_id(&self) -> Option<String> {
        let log = self.log.clone();
        tokio::task::spawn_blocking(move || {
            lock_or_recover(&*log).last_game_id().map(str::to_string)
        })
        .await
        .ok()
        .flatten()
    }

    async fn teardown(&self, inner: &mut Inner) {
        self.set_state(SessionState::ShuttingDown);

        if let Some(monitor) = inner.monitor.take() {
            monitor.stop();
        }
        self.page.disconnect().await;

        if let Some(process) = inner.process.take() {
            if self.config.close_browser_on_stop {
                self.launcher.terminate(&process).await;
            } else if process.owned_by_us() {
                info!(port = process.debug_port(), "leaving browser running");
            }
        }

        self.set_state(SessionState::Idle);
    }

    /// Stop monitoring, disconnect and, if configured, close the browser.
    /// Interrupts a start in progress. A no-op while idle.
    pub async fn stop(&self) {
        self.cancel_pending_start();
        let mut inner = self.inner.lock().await;
        if self.state() == SessionState::Idle && inner.is_empty() {
            debug!("stop requested while idle");
            return;
        }
        self.teardown(&mut inner).await;
        info!("crash result monitoring stopped");
    }

    /// Signal-triggered teardown. Runs at most once per coordinator; returns
    /// whether this call performed it.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return false;
        }
        info!("shutting down");
        if tokio::time::timeout(timeout, self.stop()).await.is_err() {
            error!(
                timeout_ms = timeout.as_millis() as u64,
                state = %self.state(),
                "shutdown timed out before teardown completed"
            );
        }
        true
    }

    /// Attach to the page without launching or monitoring.
    pub async fn connect_only(&self) -> CatchResult<()> {
        self.page.connect().await
    }

    /// Read the latest result, optionally appending it to the log.
    pub async fn last_result(&self, persist_result: bool) -> CatchResult<LatestOutcome> {
        let result = self.page.latest().await?;
        let mut outcome = LatestOutcome {
            result,
            saved: None,
            save_error: None,
        };
        if persist_result {
            let saved = persist(
                self.log.clone(),
                self.config.results_dir.clone(),
                outcome.result.clone(),
            )
            .await;
            match saved {
                Ok(()) => outcome.saved = Some(true),
                Err(e) => {
                    outcome.saved = Some(false);
                    outcome.save_error = Some(e.to_string());
                }
            }
        }
        Ok(outcome)
    }

    pub async fn all_results(&self) -> CatchResult<Vec<CrashResult>> {
        self.page.all().await
    }

    pub async fn balance(&self) -> CatchResult<f64> {
        self.page.balance().await
    }

    /// Start a monitor on the current connection, replacing any running one.
    pub async fn start_monitor(&self, persist_results: bool) {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.monitor.take() {
            info!("replacing active monitor");
            previous.stop();
        }
        inner.monitor = Some(self.spawn_logged_monitor(persist_results).await);
        info!(persist = persist_results, "monitor started");
    }

    /// Stop the running monitor. Returns `false` when none was active.
    pub async fn stop_monitor(&self) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.monitor.take() {
            Some(monitor) => {
                monitor.stop();
                info!("monitor stopped");
                true
            }
            None => false,
        }
    }

    pub async fn monitor_active(&self) -> bool {
        self.inner
            .lock()
            .await
            .monitor
            .as_ref()
            .is_some_and(MonitorHandle::is_active)
    }

    /// Game id last reported by the running monitor.
    pub async fn last_seen(&self) -> Option<String> {
        self.inner
            .lock()
            .await
            .monitor
            .as_ref()
            .and_then(MonitorHandle::last_seen)
    }
}
