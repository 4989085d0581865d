//! Runtime configuration, resolved from environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Default remote debugging port.
pub const DEFAULT_DEBUG_PORT: u16 = 9225;

/// Default poll interval in milliseconds.
pub const DEFAULT_MONITOR_INTERVAL_MS: u64 = 500;

/// Default navigation target for a freshly launched browser.
pub const DEFAULT_TARGET_URL: &str = "https://bc.game/en/game/crash?type=classic";

/// Everything the catcher core needs, passed explicitly at construction.
#[derive(Debug, Clone)]
pub struct CatchConfig {
    /// Remote debugging port of the browser.
    pub debug_port: u16,
    /// URL opened by a browser we launch.
    pub target_url: String,
    /// Substrings a tab URL must all contain to be picked as the target page.
    pub page_match: Vec<String>,
    /// Explicit browser executable, checked before the platform list.
    pub chrome_path: Option<PathBuf>,
    /// Isolated profile directory for a launched browser.
    pub user_data_dir: PathBuf,
    /// Cadence of the poll loop.
    pub monitor_interval: Duration,
    /// Directory holding the per-date CSV files.
    pub results_dir: PathBuf,
    /// Whether stop/shutdown terminates a browser we launched.
    pub close_browser_on_stop: bool,
    /// Bound on a single endpoint probe.
    pub probe_timeout: Duration,
    /// Readiness probe attempts after launch.
    pub ready_attempts: u32,
    /// Delay between readiness attempts.
    pub ready_delay: Duration,
    /// Banner wait used once while starting a session.
    pub start_banner_timeout: Duration,
    /// Banner wait used before every extraction.
    pub banner_timeout: Duration,
}

impl Default for CatchConfig {
    fn default() -> Self {
        Self {
            debug_port: DEFAULT_DEBUG_PORT,
            target_url: DEFAULT_TARGET_URL.to_string(),
            page_match: vec!["bc.game".to_string(), "crash".to_string()],
            chrome_path: None,
            user_data_dir: profile_dir(DEFAULT_DEBUG_PORT),
            monitor_interval: Duration::from_millis(DEFAULT_MONITOR_INTERVAL_MS),
            results_dir: default_results_dir(),
            close_browser_on_stop: true,
            probe_timeout: Duration::from_millis(1000),
            ready_attempts: 30,
            ready_delay: Duration::from_millis(2000),
            start_banner_timeout: Duration::from_millis(40_000),
            banner_timeout: Duration::from_millis(10_000),
        }
    }
}

impl CatchConfig {
    /// Resolve configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Resolve configuration through an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(raw) = get("DEBUG_PORT") {
            match raw.parse::<u16>() {
                Ok(port) if port > 0 => config.debug_port = port,
                _ => tracing::warn!(value = %raw, "invalid DEBUG_PORT, using {DEFAULT_DEBUG_PORT}"),
            }
        }
        config.user_data_dir = profile_dir(config.debug_port);

        if let Some(url) = get("CHROME_TARGET_URL") {
            config.target_url = url;
        }
        if let Some(path) = get("CHROME_PATH") {
            config.chrome_path = Some(PathBuf::from(path));
        }
        if let Some(raw) = get("MONITOR_INTERVAL") {
            match raw.parse::<u64>() {
                Ok(ms) if ms > 0 => config.monitor_interval = Duration::from_millis(ms),
                _ => tracing::warn!(
                    value = %raw,
                    "invalid MONITOR_INTERVAL, using {DEFAULT_MONITOR_INTERVAL_MS}ms"
                ),
            }
        }
        if let Some(dir) = get("CSV_RESULTS_DIR") {
            config.results_dir = PathBuf::from(dir);
        }
        if let Some(flag) = get("CLOSE_DEBUG_BROWSER_WHEN_BOT_STOP") {
            config.close_browser_on_stop = flag == "true";
        }

        config
    }

    /// `http://localhost:<port>`, the debug endpoint root.
    pub fn endpoint_url(&self) -> String {
        format!("http://localhost:{}", self.debug_port)
    }
}

/// Per-port profile directory under the system temp dir.
pub fn profile_dir(port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("chrome_debug_{port}"))
}

fn default_results_dir() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("results")
}
