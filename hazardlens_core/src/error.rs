//! Error types for the HazardLens core.

use crate::analyzer::AnalyzerError;
use crate::privacy::PrivacyError;
use crate::recovery::UserNotification;
use hazardlens_env::EnvError;
use thiserror::Error;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Top-level error for session operations.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("privacy pipeline failed: {0}")]
    Privacy(#[from] PrivacyError),

    #[error("hazard analysis failed: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("environment error: {0}")]
    Env(#[from] EnvError),

    /// A structural failure the session cannot continue past
    #[error("session blocked: {}", .0.message)]
    Blocked(UserNotification),

    #[error("session is stopped")]
    SessionStopped,

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),
}
