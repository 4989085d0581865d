//! The poll loop: repeatedly read the latest result and report new ones.

use crate::catcher::CrashPage;
use crate::types::{CatchResult, CrashResult};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Dedup state of one monitoring run.
///
/// A result is new when its game id differs from the last one reported.
#[derive(Debug, Clone, Default)]
pub struct MonitoringSession {
    cursor: Option<String>,
}

impl MonitoringSession {
    /// Start from `cursor`, e.g. the last id already written to the log.
    pub fn new(cursor: Option<String>) -> Self {
        Self { cursor }
    }

    /// Whether `result` differs from the last accepted one.
    pub fn is_new(&self, result: &CrashResult) -> bool {
        self.cursor.as_deref() != Some(result.game_id.as_str())
    }

    /// Accept `result`, advancing the cursor to its id.
    pub fn accept(&mut self, result: &CrashResult) {
        self.cursor = Some(result.game_id.clone());
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }
}

/// Control handle for a running poll loop.
///
/// Dropping the handle stops the loop.
pub struct MonitorHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    cursor: watch::Receiver<Option<String>>,
}

impl MonitorHandle {
    /// Cancel future ticks. A tick already in flight still completes and
    /// may deliver one final result. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
            debug!("monitor stop requested");
        }
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Game id of the most recent result reported by this loop.
    pub fn last_seen(&self) -> Option<String> {
        self.cursor.borrow().clone()
    }

    /// Wait for the loop task to exit. Does not stop it.
    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Spawn the poll loop over `page`.
///
/// Every tick calls [`CrashPage::latest`]; a result whose id differs from
/// the cursor is passed to `on_new`. The cursor advances only when `on_new`
/// succeeds, so a failed handoff is retried on the next tick. Tick errors
/// are logged and polling continues. Ticks never overlap: the next one is
/// scheduled `interval` after the previous one completes.
pub fn spawn_monitor<F, Fut>(
    page: Arc<dyn CrashPage>,
    interval: Duration,
    cursor: Option<String>,
    mut on_new: F,
) -> MonitorHandle
where
    F: FnMut(CrashResult) -> Fut + Send + 'static,
    Fut: Future<Output = CatchResult<()>> + Send + 'static,
{
    let token = CancellationToken::new();
    let (cursor_tx, cursor_rx) = watch::channel(cursor.clone());
    let loop_token = token.clone();

    let task = tokio::spawn(async move {
        let mut session = MonitoringSession::new(cursor);
        let mut tick: u64 = 0;
        info!(interval_ms = interval.as_millis() as u64, "monitoring crash results");

        while !loop_token.is_cancelled() {
            tick += 1;
            match page.latest().await {
                Ok(result) if session.is_new(&result) => {
                    info!(
                        game_id = %result.game_id,
                        multiplier = %result.multiplier,
                        "new crash result"
                    );
                    match on_new(result.clone()).await {
                        Ok(()) => {
                            session.accept(&result);
                            cursor_tx.send_replace(Some(result.game_id));
                        }
                        Err(e) => warn!(
                            game_id = %result.game_id,
                            error = %e,
                            "result not handled, retrying next tick"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => debug!(tick, error = %e, "poll tick failed"),
            }

            tokio::select! {
                _ = loop_token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!(ticks = tick, "monitoring stopped");
    });

    MonitorHandle {
        token,
        task: Some(task),
        cursor: cursor_rx,
    }
}
