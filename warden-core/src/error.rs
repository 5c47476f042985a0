//! Error types for the Warden engine.
//!
//! Uses `thiserror` for structured variants. Only [`ConfigError`] is fatal;
//! every other error is contained at the call site so the monitoring loops
//! keep running.

use crate::event::ThreatSeverity;
use crate::incident::IncidentStatus;
use thiserror::Error;

/// Convenience alias used across the crate.
pub type Result<T> = std::result::Result<T, WardenError>;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum WardenError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("response action error: {0}")]
    Response(#[from] ResponseActionError),
    #[error("alert delivery error: {0}")]
    Delivery(#[from] AlertDeliveryError),
    #[error("invalid threat event: {0}")]
    Event(#[from] EventError),
    #[error("incident error: {0}")]
    Incident(#[from] IncidentError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Malformed rule tables, missing playbooks, out-of-range settings.
///
/// Raised at startup; the engine refuses to start monitoring with any of these.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid pattern in rule '{rule}': {message}")]
    InvalidPattern { rule: String, message: String },
    #[error("duplicate rule name '{0}'")]
    DuplicateRule(String),
    #[error("rule is missing a name")]
    UnnamedRule,
    #[error("no playbook configured for severity {0}")]
    MissingPlaybook(ThreatSeverity),
    #[error("playbook for severity {0} is defined more than once")]
    DuplicatePlaybook(ThreatSeverity),
    #[error("no handler registered for response action '{0}'")]
    MissingHandler(String),
    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("failed to load configuration: {0}")]
    Load(String),
    #[error("failed to read rules file '{path}': {message}")]
    RulesFile { path: String, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// A detector failed while inspecting input.
#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("detector '{detector}' failed: {message}")]
    Failed { detector: String, message: String },
    #[error("detector '{0}' panicked during scan")]
    Panicked(String),
    #[error("request log unavailable: {0}")]
    SourceUnavailable(String),
}

/// A single playbook action failed.
#[derive(Debug, Error)]
pub enum ResponseActionError {
    #[error("action '{action}' failed: {message}")]
    Failed { action: String, message: String },
    #[error("action '{action}' is not applicable: {reason}")]
    NotApplicable { action: String, reason: String },
    /// Failed in a way another attempt cannot fix.
    #[error("action '{action}' failed permanently: {message}")]
    Permanent { action: String, message: String },
    #[error("session store error: {0}")]
    SessionStore(String),
    #[error("backup service error: {0}")]
    Backup(String),
}

impl ResponseActionError {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            ResponseActionError::NotApplicable { .. } | ResponseActionError::Permanent { .. }
        )
    }
}

/// A notification channel could not deliver an alert.
#[derive(Debug, Error)]
pub enum AlertDeliveryError {
    #[error("channel '{channel}' failed after {attempts} attempt(s): {message}")]
    Exhausted {
        channel: String,
        attempts: u32,
        message: String,
    },
}

/// Transport-level errors raised by individual notification channels.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel '{channel}' is not configured: {reason}")]
    NotConfigured { channel: String, reason: String },
    #[error("channel '{channel}' send failed: {message}")]
    SendFailed { channel: String, message: String },
    #[error("channel '{channel}' I/O error: {source}")]
    Io {
        channel: String,
        #[source]
        source: std::io::Error,
    },
}

/// Malformed threat input.
#[derive(Debug, Error)]
pub enum EventError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("malformed event: {0}")]
    Malformed(String),
}

/// Incident lifecycle errors.
#[derive(Debug, Error)]
pub enum IncidentError {
    #[error("incident '{0}' not found")]
    NotFound(String),
    #[error("invalid incident transition from {from} to {to}")]
    InvalidTransition {
        from: IncidentStatus,
        to: IncidentStatus,
    },
    #[error("incident store error: {0}")]
    Store(String),
}
