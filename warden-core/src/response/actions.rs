//! Built-in playbook action handlers.
//!
//! Each handler is idempotent so the orchestrator can retry it safely.

use super::ActionKind;
use crate::alerts::AlertQueue;
use crate::collaborators::{BackupService, SessionStore};
use crate::detect::NetworkMonitor;
use crate::error::ResponseActionError;
use crate::event::ThreatEvent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::net::IpAddr;
use std::sync::Arc;

/// What a handler gets to work with.
#[derive(Debug, Clone)]
pub struct ActionContext {
    pub threat: Arc<ThreatEvent>,
    pub incident_id: Option<String>,
    pub now: DateTime<Utc>,
}

impl ActionContext {
    fn source_ip(&self, action: ActionKind) -> Result<&str, ResponseActionError> {
        let source = self.threat.source.as_str();
        source
            .parse::<IpAddr>()
            .map(|_| source)
            .map_err(|_| ResponseActionError::NotApplicable {
                action: action.to_string(),
                reason: format!("source '{source}' is not an IP address"),
            })
    }
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Returns a short description of what was done.
    async fn execute(&self, ctx: &ActionContext) -> Result<String, ResponseActionError>;
}

/// `blockSource(ip, ttl)`.
pub struct BlockSourceHandler {
    network: Arc<NetworkMonitor>,
    ttl: Duration,
}

impl BlockSourceHandler {
    pub fn new(network: Arc<NetworkMonitor>) -> Self {
        let ttl = network.default_block_ttl();
        Self { network, ttl }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }
}

#[async_trait]
impl ActionHandler for BlockSourceHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::BlockSource
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ResponseActionError> {
        let ip = ctx.source_ip(self.kind())?;
        let reason = format!("{} ({})", ctx.threat.threat_type, ctx.threat.id);
        let entry = self.network.block_source_at(ip, self.ttl, &reason, ctx.now);
        Ok(format!("blocked {ip} until {}", entry.expires_at.to_rfc3339()))
    }
}

/// `rateLimit(ip)`: halves the source's rate limit.
pub struct RateLimitHandler {
    network: Arc<NetworkMonitor>,
}

impl RateLimitHandler {
    pub fn new(network: Arc<NetworkMonitor>) -> Self {
        Self { network }
    }
}

#[async_trait]
impl ActionHandler for RateLimitHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::RateLimit
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ResponseActionError> {
        let ip = ctx.source_ip(self.kind())?;
        let limit = self.network.penalize_at(ip, ctx.now);
        Ok(format!("rate limit for {ip} lowered to {limit}"))
    }
}

/// `quarantineSession(id)`: needs a `session_id` in the threat detail.
pub struct QuarantineSessionHandler {
    sessions: Arc<dyn SessionStore>,
}

impl QuarantineSessionHandler {
    pub fn new(sessions: Arc<dyn SessionStore>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl ActionHandler for QuarantineSessionHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::QuarantineSession
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ResponseActionError> {
        let session_id = ctx
            .threat
            .detail_str("session_id")
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ResponseActionError::NotApplicable {
                action: self.kind().to_string(),
                reason: "threat carries no session id".into(),
            })?;
        self.sessions.mark_quarantined(session_id).await?;
        self.sessions.invalidate(session_id).await?;
        Ok(format!("session {session_id} quarantined"))
    }
}

/// `notify(scope)`: hands the threat to the alert queue.
pub struct NotifyHandler {
    queue: AlertQueue,
}

impl NotifyHandler {
    pub fn new(queue: AlertQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl ActionHandler for NotifyHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::Notify
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ResponseActionError> {
        if self.queue.try_enqueue(ctx.threat.clone()) {
            Ok("alert queued".into())
        } else {
            // already counted as dropped; retrying would count it again
            Err(ResponseActionError::Permanent {
                action: self.kind().to_string(),
                message: "alert queue is full".into(),
            })
        }
    }
}

/// `logIncident(threat)`: writes an audit record.
#[derive(Debug, Default)]
pub struct LogIncidentHandler;

#[async_trait]
impl ActionHandler for LogIncidentHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::LogIncident
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ResponseActionError> {
        let threat = &ctx.threat;
        tracing::info!(
            target: "warden::audit",
            threat_id = %threat.id,
            threat_type = %threat.threat_type,
            severity = %threat.severity,
            source = %threat.source,
            incident_id = ctx.incident_id.as_deref().unwrap_or("-"),
            detail = %serde_json::Value::Object(threat.detail.clone().into_iter().collect()),
            "Security incident logged"
        );
        Ok("audit record written".into())
    }
}

/// `triggerBackup()`.
pub struct TriggerBackupHandler {
    backup: Arc<dyn BackupService>,
}

impl TriggerBackupHandler {
    pub fn new(backup: Arc<dyn BackupService>) -> Self {
        Self { backup }
    }
}

#[async_trait]
impl ActionHandler for TriggerBackupHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::TriggerBackup
    }

    async fn execute(&self, ctx: &ActionContext) -> Result<String, ResponseActionError> {
        let reason = format!("{} threat {}", ctx.threat.severity, ctx.threat.id);
        let reference = self.backup.trigger_backup(&reason).await?;
        Ok(format!("backup {reference} started"))
    }
}
