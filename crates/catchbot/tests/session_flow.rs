//! End-to-end session behaviour against scripted browser and page fakes.

use async_trait::async_trait;
use catchbot::storage::date_key;
use catchbot::{
    BrowserLauncher, BrowserProcessHandle, CatchConfig, CatchError, CatchResult, CrashPage,
    CrashResult, ResultLog, SessionCoordinator, SessionState,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Where a scripted launch goes wrong, if anywhere.
#[derive(Clone, Copy, PartialEq)]
enum LaunchFault {
    None,
    NoExecutable,
    NeverReady,
    SlowReady,
}

struct FakeLauncher {
    owned: bool,
    ready_attempt: u32,
    fault: LaunchFault,
    launches: AtomicU32,
    terminations: AtomicU32,
}

impl FakeLauncher {
    fn new(owned: bool) -> Arc<Self> {
        Self::with_fault(owned, LaunchFault::None)
    }

    fn with_fault(owned: bool, fault: LaunchFault) -> Arc<Self> {
        Arc::new(Self {
            owned,
            ready_attempt: 3,
            fault,
            launches: AtomicU32::new(0),
            terminations: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl BrowserLauncher for FakeLauncher {
    async fn launch(&self) -> CatchResult<BrowserProcessHandle> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fault == LaunchFault::NoExecutable {
            return Err(CatchError::ExecutableNotFound { searched: 4 });
        }
        let dir = PathBuf::from("/tmp/chrome_debug_9225");
        Ok(if self.owned {
            BrowserProcessHandle::launched(9225, PathBuf::from("/usr/bin/chromium"), dir)
        } else {
            BrowserProcessHandle::attached(9225, dir)
        })
    }

    async fn wait_until_ready(&self, max_attempts: u32, _delay: Duration) -> CatchResult<u32> {
        assert_eq!(max_attempts, 30);
        match self.fault {
            LaunchFault::NeverReady => Err(CatchError::ReadinessTimeout {
                port: 9225,
                attempts: max_attempts,
            }),
            LaunchFault::SlowReady => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(self.ready_attempt)
            }
            _ => Ok(self.ready_attempt),
        }
    }

    async fn terminate(&self, handle: &BrowserProcessHandle) {
        if handle.owned_by_us() {
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Page whose `latest()` replays a script and then repeats its last entry.
struct FakePage {
    script: Mutex<VecDeque<CrashResult>>,
    fail_connect: bool,
    fail_banner: bool,
    connects: AtomicU32,
    disconnects: AtomicU32,
}

impl FakePage {
    fn build(ids: &[&str], fail_connect: bool, fail_banner: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(ids.iter().map(|id| result(id)).collect()),
            fail_connect,
            fail_banner,
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
        })
    }

    fn new(ids: &[&str]) -> Arc<Self> {
        Self::build(ids, false, false)
    }

    fn unreachable() -> Arc<Self> {
        Self::build(&[], true, false)
    }

    /// Connects, but the game never shows its start banner.
    fn without_banner() -> Arc<Self> {
        Self::build(&[], false, true)
    }
}

#[async_trait]
impl CrashPage for FakePage {
    async fn connect(&self) -> CatchResult<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect {
            return Err(CatchError::EndpointUnreachable {
                port: 9225,
                reason: "connection refused".to_string(),
            });
        }
        Ok(())
    }

    async fn wait_for_banner(&self, timeout: Duration) -> CatchResult<()> {
        assert_eq!(timeout, Duration::from_secs(40));
        if self.fail_banner {
            return Err(CatchError::BannerTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn latest(&self) -> CatchResult<CrashResult> {
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            Ok(script.pop_front().unwrap())
        } else {
            script.front().cloned().ok_or(CatchError::NoResultItems)
        }
    }

    async fn all(&self) -> CatchResult<Vec<CrashResult>> {
        Ok(self.script.lock().unwrap().iter().cloned().collect())
    }

    async fn balance(&self) -> CatchResult<f64> {
        Ok(1050.25)
    }

    async fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn is_connected(&self) -> bool {
        !self.fail_connect
    }
}

fn result(id: &str) -> CrashResult {
    CrashResult::new(id, "2.34x", format!("{id} 2.34x")).unwrap()
}

fn config(results_dir: &Path) -> CatchConfig {
    CatchConfig {
        results_dir: results_dir.to_path_buf(),
        monitor_interval: Duration::from_millis(5),
        ..CatchConfig::default()
    }
}

fn coordinator(
    config: CatchConfig,
    launcher: Arc<FakeLauncher>,
    page: Arc<FakePage>,
) -> (SessionCoordinator, Arc<Mutex<ResultLog>>) {
    let log = Arc::new(Mutex::new(ResultLog::open(&config.results_dir).unwrap()));
    let session = SessionCoordinator::new(config, launcher, page, log.clone());
    (session, log)
}

fn data_rows(log: &Arc<Mutex<ResultLog>>) -> Vec<String> {
    let path = log.lock().unwrap().current_file_path().unwrap().to_path_buf();
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .skip(1)
        .map(str::to_string)
        .collect()
}

/// Unwrap a start failure, checking its stage, and return the cause.
fn start_failure(err: &CatchError, expected: SessionState) -> &CatchError {
    match err {
        CatchError::StartFailed { stage, source } => {
            assert_eq!(*stage, expected, "failed at the wrong stage: {err}");
            source
        }
        other => panic!("unexpected error: {other}"),
    }
}

async fn wait_for_state(session: &SessionCoordinator, state: SessionState) {
    let mut states = session.subscribe();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .expect("state never reached")
        .unwrap();
}

async fn wait_for_rows(log: &Arc<Mutex<ResultLog>>, count: usize) {
    for _ in 0..400 {
        if data_rows(log).len() >= count {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("expected {count} rows, found {:?}", data_rows(log));
}

#[tokio::test]
async fn test_start_monitors_and_logs_each_result_once() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(true);
    let page = FakePage::new(&["A1"]);
    let (session, log) = coordinator(config(dir.path()), launcher.clone(), page.clone());

    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Monitoring);

    wait_for_rows(&log, 1).await;
    // Further ticks see the same snapshot and append nothing.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let rows = data_rows(&log);
    assert_eq!(rows.len(), 1);
    assert!(rows[0].starts_with("A1,  2.34,  "));
    assert_eq!(session.last_seen().await.as_deref(), Some("A1"));

    session.stop().await;
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(page.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_twice_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(true);
    let page = FakePage::new(&["A1"]);
    let (session, _log) = coordinator(config(dir.path()), launcher.clone(), page.clone());

    session.start().await.unwrap();
    session.stop().await;
    session.stop().await;

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(page.disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_while_idle_does_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(true);
    let page = FakePage::new(&["A1"]);
    let (session, _log) = coordinator(config(dir.path()), launcher.clone(), page.clone());

    session.stop().await;
    assert_eq!(page.disconnects.load(Ordering::SeqCst), 0);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_new_results_are_appended_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new(&["A1", "A1", "B2", "B2", "C3"]);
    let (session, log) = coordinator(config(dir.path()), FakeLauncher::new(true), page);

    session.start().await.unwrap();
    wait_for_rows(&log, 3).await;
    session.stop().await;

    let ids: Vec<String> = data_rows(&log)
        .iter()
        .map(|row| row.split(',').next().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["A1", "B2", "C3"]);
}

#[tokio::test]
async fn test_restart_does_not_reappend_logged_result() {
    let dir = tempfile::tempdir().unwrap();
    let page = FakePage::new(&["A1"]);
    let (session, log) = coordinator(config(dir.path()), FakeLauncher::new(true), page.clone());

    session.start().await.unwrap();
    wait_for_rows(&log, 1).await;
    session.stop().await;

    session.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    session.stop().await;
    assert_eq!(data_rows(&log).len(), 1);
}

#[tokio::test]
async fn test_start_failure_reports_stage_and_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(true);
    let page = FakePage::unreachable();
    let (session, _log) = coordinator(config(dir.path()), launcher.clone(), page.clone());

    let err = session.start().await.unwrap_err();
    match &err {
        CatchError::StartFailed { stage, .. } => assert_eq!(*stage, SessionState::Connecting),
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("connecting"));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(page.disconnects.load(Ordering::SeqCst), 1);

    // Nothing left to tear down.
    session.stop().await;
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_browser_left_running_when_close_disabled() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.close_browser_on_stop = false;
    let launcher = FakeLauncher::new(true);
    let (session, _log) = coordinator(cfg, launcher.clone(), FakePage::new(&["A1"]));

    session.start().await.unwrap();
    session.stop().await;
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_attached_browser_is_never_terminated() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(false);
    let (session, _log) = coordinator(config(dir.path()), launcher.clone(), FakePage::new(&["A1"]));

    session.start().await.unwrap();
    session.stop().await;
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_start_while_active_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(true);
    let page = FakePage::new(&["A1"]);
    let (session, _log) = coordinator(config(dir.path()), launcher.clone(), page.clone());

    session.start().await.unwrap();
    session.start().await.unwrap();
    assert_eq!(session.state(), SessionState::Monitoring);
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 2);
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(page.connects.load(Ordering::SeqCst), 2);

    session.stop().await;
}

#[tokio::test]
async fn test_monitor_replacement_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let (session, log) = coordinator(config(dir.path()), FakeLauncher::new(true), FakePage::new(&["A1"]));

    assert!(!session.stop_monitor().await);

    session.start_monitor(false).await;
    assert!(session.monitor_active().await);
    session.start_monitor(false).await;
    assert!(session.monitor_active().await);

    assert!(session.stop_monitor().await);
    assert!(!session.stop_monitor().await);
    assert!(!session.monitor_active().await);

    // Monitoring without persistence leaves the log untouched.
    assert!(data_rows(&log).is_empty());
}

#[tokio::test]
async fn test_persisting_monitor_writes_results() {
    let dir = tempfile::tempdir().unwrap();
    let (session, log) = coordinator(config(dir.path()), FakeLauncher::new(true), FakePage::new(&["Z9"]));

    session.start_monitor(true).await;
    wait_for_rows(&log, 1).await;
    assert!(session.stop_monitor().await);
    assert!(data_rows(&log)[0].starts_with("Z9,"));
}

#[tokio::test]
async fn test_single_shot_queries() {
    let dir = tempfile::tempdir().unwrap();
    let (session, log) = coordinator(config(dir.path()), FakeLauncher::new(true), FakePage::new(&["Q7"]));

    session.connect_only().await.unwrap();

    let outcome = session.last_result(false).await.unwrap();
    assert_eq!(outcome.result.game_id, "Q7");
    assert_eq!(outcome.saved, None);
    assert!(data_rows(&log).is_empty());

    let outcome = session.last_result(true).await.unwrap();
    assert_eq!(outcome.saved, Some(true));
    assert_eq!(data_rows(&log).len(), 1);

    assert_eq!(session.all_results().await.unwrap().len(), 1);
    assert_eq!(session.balance().await.unwrap(), 1050.25);
}

#[tokio::test]
async fn test_shutdown_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::new(true);
    let (session, _log) = coordinator(config(dir.path()), launcher.clone(), FakePage::new(&["A1"]));

    session.start().await.unwrap();
    assert!(session.shutdown(Duration::from_secs(10)).await);
    assert!(!session.shutdown(Duration::from_secs(10)).await);
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_start_fails_at_launching_without_executable() {
    for close_browser_on_stop in [true, false] {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.close_browser_on_stop = close_browser_on_stop;
        let launcher = FakeLauncher::with_fault(true, LaunchFault::NoExecutable);
        let page = FakePage::new(&["A1"]);
        let (session, _log) = coordinator(cfg, launcher.clone(), page.clone());

        let err = session.start().await.unwrap_err();
        let cause = start_failure(&err, SessionState::Launching);
        assert!(matches!(cause, CatchError::ExecutableNotFound { .. }));
        assert_eq!(session.state(), SessionState::Idle);
        // No handle was acquired, so there is nothing to terminate.
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), 0);
        assert_eq!(page.connects.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_start_fails_at_readiness_timeout() {
    for (close_browser_on_stop, terminated) in [(true, 1), (false, 0)] {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.close_browser_on_stop = close_browser_on_stop;
        let launcher = FakeLauncher::with_fault(true, LaunchFault::NeverReady);
        let page = FakePage::new(&["A1"]);
        let (session, _log) = coordinator(cfg, launcher.clone(), page.clone());

        let err = session.start().await.unwrap_err();
        let cause = start_failure(&err, SessionState::AwaitingReadiness);
        assert!(matches!(
            cause,
            CatchError::ReadinessTimeout { port: 9225, attempts: 30 }
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), terminated);
        assert_eq!(page.connects.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_start_fails_at_banner_timeout() {
    for (close_browser_on_stop, terminated) in [(true, 1), (false, 0)] {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.close_browser_on_stop = close_browser_on_stop;
        let launcher = FakeLauncher::new(true);
        let page = FakePage::without_banner();
        let (session, log) = coordinator(cfg, launcher.clone(), page.clone());

        let err = session.start().await.unwrap_err();
        let cause = start_failure(&err, SessionState::AwaitingBanner);
        assert!(matches!(cause, CatchError::BannerTimeout { timeout_ms: 40_000 }));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), terminated);
        assert_eq!(page.disconnects.load(Ordering::SeqCst), 1);
        assert!(!session.monitor_active().await);
        assert!(data_rows(&log).is_empty());
    }
}

#[tokio::test]
async fn test_shutdown_interrupts_start_in_progress() {
    let dir = tempfile::tempdir().unwrap();
    let launcher = FakeLauncher::with_fault(true, LaunchFault::SlowReady);
    let page = FakePage::new(&["A1"]);
    let (session, _log) = coordinator(config(dir.path()), launcher.clone(), page.clone());
    let session = Arc::new(session);

    let starter = tokio::spawn({
        let session = session.clone();
        async move { session.start().await }
    });
    wait_for_state(&session, SessionState::AwaitingReadiness).await;

    assert!(session.shutdown(Duration::from_millis(500)).await);
    let err = tokio::time::timeout(Duration::from_secs(1), starter)
        .await
        .expect("start kept running after shutdown")
        .unwrap()
        .unwrap_err();
    let cause = start_failure(&err, SessionState::AwaitingReadiness);
    assert!(matches!(cause, CatchError::Cancelled));

    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(launcher.terminations.load(Ordering::SeqCst), 1);
    assert_eq!(page.connects.load(Ordering::SeqCst), 0);

    // A start after shutdown is refused outright.
    let err = session.start().await.unwrap_err();
    assert!(matches!(start_failure(&err, SessionState::Idle), CatchError::Cancelled));
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stop_interrupts_start_in_progress() {
    for (close_browser_on_stop, terminated) in [(true, 1), (false, 0)] {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.close_browser_on_stop = close_browser_on_stop;
        let launcher = FakeLauncher::with_fault(true, LaunchFault::SlowReady);
        let page = FakePage::new(&["A1"]);
        let (session, _log) = coordinator(cfg, launcher.clone(), page.clone());
        let session = Arc::new(session);

        let starter = tokio::spawn({
            let session = session.clone();
            async move { session.start().await }
        });
        wait_for_state(&session, SessionState::AwaitingReadiness).await;

        tokio::time::timeout(Duration::from_secs(1), session.stop())
            .await
            .expect("stop waited for the start to finish");
        let err = starter.await.unwrap().unwrap_err();
        assert!(matches!(
            start_failure(&err, SessionState::AwaitingReadiness),
            CatchError::Cancelled
        ));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(launcher.terminations.load(Ordering::SeqCst), terminated);
        assert!(!session.monitor_active().await);
    }
}

#[tokio::test]
async fn test_result_is_logged_once_the_log_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let now = chrono::Local::now().naive_local();
    let log = ResultLog::open_at(dir.path(), now - chrono::Duration::days(1)).unwrap();
    let log = Arc::new(Mutex::new(log));

    // Today's file cannot be created while a directory occupies its name.
    let blocked = dir.path().join(format!("{}.csv", date_key(now)));
    std::fs::create_dir(&blocked).unwrap();

    let session = SessionCoordinator::new(
        config(dir.path()),
        FakeLauncher::new(true),
        FakePage::new(&["A1"]),
        log.clone(),
    );
    session.start_monitor(true).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.last_seen().await, None);
    assert!(data_rows(&log).is_empty());

    std::fs::remove_dir(&blocked).unwrap();
    wait_for_rows(&log, 1).await;
    assert!(session.stop_monitor().await);

    let rows = data_rows(&log);
    assert_eq!(rows.len(), 1);
    assert!(rows[0].starts_with("A1,"));
    assert_eq!(log.lock().unwrap().current_file_path(), Some(blocked.as_path()));
}
