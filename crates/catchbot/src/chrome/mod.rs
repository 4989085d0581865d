//! Browser process lifecycle: discovery, launch, readiness and termination.
//!
//! The manager never kills a browser it did not start. Whether it started
//! one is recorded on the [`BrowserProcessHandle`] returned by
//! [`BrowserLauncher::launch`] and cannot change afterwards.

pub mod kill;
pub mod locate;
pub mod probe;

use crate::config::CatchConfig;
use crate::types::{CatchError, CatchResult};
use async_trait::async_trait;
use probe::{EndpointProbe, HttpProbe};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The browser process this session is using.
#[derive(Debug, Clone)]
pub struct BrowserProcessHandle {
    debug_port: u16,
    executable_path: Option<PathBuf>,
    user_data_dir: PathBuf,
    owned_by_us: bool,
}

impl BrowserProcessHandle {
    /// Handle for a browser that was already listening when we arrived.
    pub fn attached(debug_port: u16, user_data_dir: PathBuf) -> Self {
        Self {
            debug_port,
            executable_path: None,
            user_data_dir,
            owned_by_us: false,
        }
    }

    /// Handle for a browser we spawned.
    pub fn launched(debug_port: u16, executable_path: PathBuf, user_data_dir: PathBuf) -> Self {
        Self {
            debug_port,
            executable_path: Some(executable_path),
            user_data_dir,
            owned_by_us: true,
        }
    }

    pub fn debug_port(&self) -> u16 {
        self.debug_port
    }

    pub fn executable_path(&self) -> Option<&Path> {
        self.executable_path.as_deref()
    }

    pub fn user_data_dir(&self) -> &Path {
        &self.user_data_dir
    }

    /// Whether this session started the process and may terminate it.
    pub fn owned_by_us(&self) -> bool {
        self.owned_by_us
    }
}

/// Owns the external browser process.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Attach to a running instance or spawn a new one.
    async fn launch(&self) -> CatchResult<BrowserProcessHandle>;
    /// Probe until the debug endpoint answers; returns the 1-based attempt that succeeded.
    async fn wait_until_ready(&self, max_attempts: u32, delay: Duration) -> CatchResult<u32>;
    /// Best-effort kill of an owned browser. Never fails.
    async fn terminate(&self, handle: &BrowserProcessHandle);
}

/// Command-line arguments for a launched browser. The URL comes last.
pub fn chrome_args(debug_port: u16, user_data_dir: &Path, target_url: &str) -> Vec<String> {
    vec![
        format!("--remote-debugging-port={debug_port}"),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--lang=en-US".to_string(),
        "--accept-lang=en-US,en".to_string(),
        "--disable-translate".to_string(),
        "--disable-features=TranslateUI".to_string(),
        "--disable-sync".to_string(),
        "--no-first-run".to_string(),
        "--no-default-browser-check".to_string(),
        target_url.to_string(),
    ]
}

/// Recreate the profile directory; failure to delete (e.g. in use) is ignored.
pub fn reset_profile_dir(dir: &Path) -> std::io::Result<()> {
    if dir.exists() {
        info!(path = %dir.display(), "clearing cached browser profile");
        if let Err(e) = std::fs::remove_dir_all(dir) {
            debug!(error = %e, "profile directory in use, keeping it");
        }
    }
    std::fs::create_dir_all(dir)
}

/// Chrome/Chromium lifecycle manager.
pub struct ChromeManager {
    config: CatchConfig,
    probe: Arc<dyn EndpointProbe>,
}

impl ChromeManager {
    /// Manager using the HTTP endpoint probe.
    pub fn new(config: CatchConfig) -> Self {
        Self::with_probe(config, Arc::new(HttpProbe::new()))
    }

    /// Manager with a custom endpoint probe.
    pub fn with_probe(config: CatchConfig, probe: Arc<dyn EndpointProbe>) -> Self {
        Self { config, probe }
    }

    pub fn debug_port(&self) -> u16 {
        self.config.debug_port
    }

    /// Browser executable, or `None` if no known location exists.
    pub fn locate(&self) -> Option<PathBuf> {
        locate::locate(self.config.chrome_path.as_deref())
    }

    /// Bounded probe of the configured debug port.
    pub async fn is_endpoint_reachable(&self) -> bool {
        self.probe
            .is_reachable(self.config.debug_port, self.config.probe_timeout)
            .await
    }

    fn spawn_detached(&self, exe: &Path) -> CatchResult<()> {
        let args = chrome_args(
            self.config.debug_port,
            &self.config.user_data_dir,
            &self.config.target_url,
        );

        let mut cmd = std::process::Command::new(exe);
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        // Own process group / no console, so the browser outlives us and
        // does not receive our Ctrl-C.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        #[cfg(windows)]
        {
            use std::os::windows::process::CommandExt;
            const DETACHED_PROCESS: u32 = 0x0000_0008;
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            cmd.creation_flags(DETACHED_PROCESS | CREATE_NEW_PROCESS_GROUP);
        }

        let child = cmd.spawn().map_err(|source| CatchError::Spawn {
            path: exe.to_path_buf(),
            source,
        })?;
        info!(pid = child.id(), "browser process spawned");
        // Dropping the std Child does not kill or wait on it.
        drop(child);
        Ok(())
    }
}

#[async_trait]
impl BrowserLauncher for ChromeManager {
    async fn launch(&self) -> CatchResult<BrowserProcessHandle> {
        let port = self.config.debug_port;

        if self.is_endpoint_reachable().await {
            info!(port, "browser already running on debug port, attaching");
            return Ok(BrowserProcessHandle::attached(
                port,
                self.config.user_data_dir.clone(),
            ));
        }

        let exe = self.locate().ok_or_else(|| {
            warn!("could not find a Chrome/Chromium executable");
            CatchError::ExecutableNotFound {
                searched: locate::searched_count(self.config.chrome_path.as_deref()),
            }
        })?;
        info!(path = %exe.display(), port, "starting browser with remote debugging");

        let profile = &self.config.user_data_dir;
        reset_profile_dir(profile).map_err(|source| CatchError::Spawn {
            path: profile.clone(),
            source,
        })?;

        self.spawn_detached(&exe)?;
        info!(url = %self.config.target_url, "browser opened to target");

        Ok(BrowserProcessHandle::launched(port, exe, profile.clone()))
    }

    async fn wait_until_ready(&self, max_attempts: u32, delay: Duration) -> CatchResult<u32> {
        let port = self.config.debug_port;
        for attempt in 1..=max_attempts {
            if self.is_endpoint_reachable().await {
                info!(port, attempt, "browser debug port is available");
                return Ok(attempt);
            }
            if attempt < max_attempts {
                info!("waiting for browser to be ready... ({attempt}/{max_attempts})");
                tokio::time::sleep(delay).await;
            }
        }
        Err(CatchError::ReadinessTimeout {
            port,
            attempts: max_attempts,
        })
    }

    async fn terminate(&self, handle: &BrowserProcessHandle) {
        let port = handle.debug_port();
        if !handle.owned_by_us() {
            info!(port, "browser was started externally, not closing it");
            return;
        }

        info!(port, "closing browser");
        let pids = kill::pids_on_port(port).await;
        if pids.is_empty() {
            info!(port, "browser already closed or not found");
            return;
        }

        for pid in pids {
            if kill::kill_tree(pid).await {
                debug!(pid, "killed browser process tree");
            } else {
                debug!(pid, "process already gone");
            }
        }
        info!(port, "browser closed");
    }
}
