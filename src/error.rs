//! Error types shared across the monitor.
//!
//! Each external seam gets its own error so callers can decide what is fatal:
//! provider and notifier faults are recoverable per target, store faults
//! abort a single commit, config faults abort startup.

use std::path::PathBuf;
use thiserror::Error;

/// Failure while talking to the follow data provider.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("session rejected: {0}")]
    Auth(String),

    #[error("rate limited by provider")]
    RateLimited,

    #[error("network error: {0}")]
    Network(String),

    #[error("provider returned HTTP {0}")]
    Status(u16),

    #[error("could not decode provider response: {0}")]
    Decode(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::Status(status.as_u16())
        } else {
            ProviderError::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(e: serde_json::Error) -> Self {
        ProviderError::Decode(e.to_string())
    }
}

/// Failure delivering a single alert.
#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("notifier request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("notifier returned HTTP {0}")]
    Status(u16),

    #[error("notifier rate limited (retry after {retry_after:?}s)")]
    RateLimited { retry_after: Option<f64> },
}

/// Failure reading or writing the watermark state.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("state file {path} is not a valid watermark map: {reason}")]
    Corrupt { path: PathBuf, reason: String },
}

/// Invalid or unreadable configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("could not parse config {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Why a single target's detect → dispatch → persist unit did not complete.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("{phase} failed: {source}")]
    Provider {
        phase: &'static str,
        #[source]
        source: ProviderError,
    },

    #[error("persist failed: {0}")]
    Store(#[from] StoreError),
}

impl CycleError {
    pub fn phase(&self) -> &'static str {
        match self {
            CycleError::Provider { phase, .. } => phase,
            CycleError::Store(_) => "persist",
        }
    }
}
