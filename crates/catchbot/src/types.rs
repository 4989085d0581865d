//! Core data types and the error taxonomy shared by every component.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// One observed crash round, as read from the results banner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CrashResult {
    /// Round identifier; unique within a monitoring session.
    pub game_id: String,
    /// Multiplier text exactly as rendered (e.g. `2.34x`), never parsed.
    pub multiplier: String,
    /// Full trimmed text of the result item, kept for debugging.
    pub raw: String,
}

impl CrashResult {
    /// Build a result from extracted fields, rejecting blank ids or multipliers.
    pub fn new(
        game_id: impl Into<String>,
        multiplier: impl Into<String>,
        raw: impl Into<String>,
    ) -> Option<Self> {
        let game_id = game_id.into().trim().to_string();
        let multiplier = multiplier.into().trim().to_string();
        if game_id.is_empty() || multiplier.is_empty() {
            return None;
        }
        Some(Self {
            game_id,
            multiplier,
            raw: raw.into().trim().to_string(),
        })
    }
}

/// States of the session coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Launching,
    AwaitingReadiness,
    Connecting,
    AwaitingBanner,
    Monitoring,
    ShuttingDown,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Launching => "launching",
            SessionState::AwaitingReadiness => "awaiting_readiness",
            SessionState::Connecting => "connecting",
            SessionState::AwaitingBanner => "awaiting_banner",
            SessionState::Monitoring => "monitoring",
            SessionState::ShuttingDown => "shutting_down",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broad failure category, used for propagation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Executable discovery, spawn, or an interrupted start.
    Process,
    /// Debug endpoint, readiness or CDP connection.
    Connectivity,
    /// Banner wait or DOM extraction.
    Extraction,
    /// Result log open/write.
    Persistence,
}

/// All errors raised by the catcher core.
#[derive(thiserror::Error, Debug)]
pub enum CatchError {
    #[error("browser executable not found (checked {searched} locations); install Google Chrome or set CHROME_PATH")]
    ExecutableNotFound { searched: usize },

    #[error("failed to spawn browser {}: {source}", .path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("debug endpoint on port {port} is unreachable: {reason}")]
    EndpointUnreachable { port: u16, reason: String },

    #[error("browser debug port {port} did not become available after {attempts} attempts")]
    ReadinessTimeout { port: u16, attempts: u32 },

    #[error("not connected to the browser; connect first")]
    NotConnected,

    #[error("CDP error: {0}")]
    Cdp(String),

    #[error("results banner did not become visible within {timeout_ms}ms")]
    BannerTimeout { timeout_ms: u64 },

    #[error("results banner container is missing from the page")]
    MissingContainer,

    #[error("results banner contains no result items")]
    NoResultItems,

    #[error("could not extract {0} from the latest result item")]
    MissingField(&'static str),

    #[error("could not extract account balance from page")]
    BalanceUnavailable,

    #[error("page script evaluation failed: {0}")]
    Evaluation(String),

    #[error("result log {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled by a stop request")]
    Cancelled,

    #[error("session start failed while {stage}: {source}")]
    StartFailed {
        stage: SessionState,
        #[source]
        source: Box<CatchError>,
    },
}

impl CatchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CatchError::ExecutableNotFound { .. }
            | CatchError::Spawn { .. }
            | CatchError::Cancelled => ErrorKind::Process,
            CatchError::EndpointUnreachable { .. }
            | CatchError::ReadinessTimeout { .. }
            | CatchError::NotConnected
            | CatchError::Cdp(_) => ErrorKind::Connectivity,
            CatchError::BannerTimeout { .. }
            | CatchError::MissingContainer
            | CatchError::NoResultItems
            | CatchError::MissingField(_)
            | CatchError::BalanceUnavailable
            | CatchError::Evaluation(_) => ErrorKind::Extraction,
            CatchError::Persistence { .. } => ErrorKind::Persistence,
            CatchError::StartFailed { source, .. } => source.kind(),
        }
    }

    /// Tag this error with the start stage that raised it.
    pub fn at_stage(self, stage: SessionState) -> Self {
        match self {
            already @ CatchError::StartFailed { .. } => already,
            other => CatchError::StartFailed {
                stage,
                source: Box::new(other),
            },
        }
    }

    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CatchError::Persistence {
            path: path.into(),
            source,
        }
    }
}

impl From<chromiumoxide::error::CdpError> for CatchError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        CatchError::Cdp(e.to_string())
    }
}

pub type CatchResult<T> = Result<T, CatchError>;
