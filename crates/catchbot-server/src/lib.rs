//! CatchBot server: HTTP control surface plus process wiring.

pub mod rest;

use catchbot::{CatchConfig, CatchResult, ChromeManager, CrashCatcher, ResultLog, SessionCoordinator};
use std::sync::{Arc, Mutex};

/// Build the production coordinator: a real browser manager, a CDP-backed
/// page and the on-disk result log.
pub fn build_session(config: CatchConfig) -> CatchResult<Arc<SessionCoordinator>> {
    let log = ResultLog::open(&config.results_dir)?;
    let launcher = Arc::new(ChromeManager::new(config.clone()));
    let page = Arc::new(CrashCatcher::new(&config));
    Ok(Arc::new(SessionCoordinator::new(
        config,
        launcher,
        page,
        Arc::new(Mutex::new(log)),
    )))
}

/// Install the global tracing subscriber, writing to stderr.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn init_logging(level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
