//! CatchBot core: drives a remote-debuggable browser on a live crash game
//! page, reads each new round result from the page, and appends it to a
//! date-partitioned CSV log.

pub mod catcher;
pub mod chrome;
pub mod config;
pub mod monitor;
pub mod session;
pub mod shutdown;
pub mod storage;
pub mod types;

pub use catcher::{CrashCatcher, CrashPage};
pub use chrome::{BrowserLauncher, BrowserProcessHandle, ChromeManager};
pub use config::CatchConfig;
pub use monitor::{spawn_monitor, MonitorHandle, MonitoringSession};
pub use session::{LatestOutcome, SessionCoordinator, SharedLog};
pub use storage::ResultLog;
pub use types::{CatchError, CatchResult, CrashResult, ErrorKind, SessionState};
