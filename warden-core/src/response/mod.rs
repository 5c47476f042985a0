//! Severity-keyed response playbooks.
//!
//! A playbook is an ordered list of [`ActionKind`]s. The
//! [`ResponseOrchestrator`] runs one per threat, isolating every step so a
//! failing action never aborts the rest.

pub mod actions;
pub mod orchestrator;

pub use actions::{
    ActionContext, ActionHandler, BlockSourceHandler, LogIncidentHandler, NotifyHandler,
    QuarantineSessionHandler, RateLimitHandler, TriggerBackupHandler,
};
pub use orchestrator::{ResponseOrchestrator, StepRecorder};

use crate::error::ConfigError;
use crate::event::ThreatSeverity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// A single response action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    BlockSource,
    RateLimit,
    QuarantineSession,
    Notify,
    LogIncident,
    TriggerBackup,
}

impl ActionKind {
    pub const ALL: [ActionKind; 6] = [
        ActionKind::BlockSource,
        ActionKind::RateLimit,
        ActionKind::QuarantineSession,
        ActionKind::Notify,
        ActionKind::LogIncident,
        ActionKind::TriggerBackup,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::BlockSource => "block_source",
            ActionKind::RateLimit => "rate_limit",
            ActionKind::QuarantineSession => "quarantine_session",
            ActionKind::Notify => "notify",
            ActionKind::LogIncident => "log_incident",
            ActionKind::TriggerBackup => "trigger_backup",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The ordered actions run for one severity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybookPolicy {
    pub severity: ThreatSeverity,
    pub actions: Vec<ActionKind>,
}

impl PlaybookPolicy {
    pub fn new(severity: ThreatSeverity, actions: &[ActionKind]) -> Self {
        Self {
            severity,
            actions: actions.to_vec(),
        }
    }
}

pub fn default_playbooks() -> Vec<PlaybookPolicy> {
    use ActionKind::*;
    vec![
        PlaybookPolicy::new(ThreatSeverity::Low, &[LogIncident]),
        PlaybookPolicy::new(ThreatSeverity::Medium, &[RateLimit, LogIncident, Notify]),
        PlaybookPolicy::new(ThreatSeverity::High, &[BlockSource, Notify, LogIncident]),
        PlaybookPolicy::new(
            ThreatSeverity::Critical,
            &[BlockSource, QuarantineSession, Notify, LogIncident, TriggerBackup],
        ),
    ]
}

/// Every severity must have exactly one playbook.
pub fn validate_playbooks(playbooks: &[PlaybookPolicy]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for policy in playbooks {
        if !seen.insert(policy.severity) {
            return Err(ConfigError::DuplicatePlaybook(policy.severity));
        }
    }
    match ThreatSeverity::ALL.iter().find(|s| !seen.contains(*s)) {
        Some(missing) => Err(ConfigError::MissingPlaybook(*missing)),
        None => Ok(()),
    }
}

/// Result of one playbook step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepOutcome::Succeeded => write!(f, "SUCCEEDED"),
            StepOutcome::Failed => write!(f, "FAILED"),
            StepOutcome::Skipped => write!(f, "SKIPPED"),
        }
    }
}

/// A recorded playbook step, as stored on the owning incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseStep {
    pub step: ActionKind,
    pub timestamp: DateTime<Utc>,
    pub outcome: StepOutcome,
    pub attempts: u32,
    #[serde(default)]
    pub message: String,
}

/// Everything the orchestrator did for one threat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub threat_id: String,
    pub severity: ThreatSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub steps: Vec<ResponseStep>,
}

impl ExecutionTrace {
    pub fn count(&self, outcome: StepOutcome) -> usize {
        self.steps.iter().filter(|s| s.outcome == outcome).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.steps.iter().all(|s| s.outcome != StepOutcome::Failed)
    }

    pub fn failures(&self) -> Vec<ActionKind> {
        self.steps
            .iter()
            .filter(|s| s.outcome == StepOutcome::Failed)
            .map(|s| s.step)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_playbooks_cover_every_severity() {
        let playbooks = default_playbooks();
        assert!(validate_playbooks(&playbooks).is_ok());
        let critical = playbooks
            .iter()
            .find(|p| p.severity == ThreatSeverity::Critical)
            .unwrap();
        assert_eq!(
            critical.actions,
            vec![
                ActionKind::BlockSource,
                ActionKind::QuarantineSession,
                ActionKind::Notify,
                ActionKind::LogIncident,
                ActionKind::TriggerBackup,
            ]
        );
    }

    #[test]
    fn test_missing_playbook_rejected() {
        let mut playbooks = default_playbooks();
        playbooks.retain(|p| p.severity != ThreatSeverity::Medium);
        assert!(matches!(
            validate_playbooks(&playbooks),
            Err(ConfigError::MissingPlaybook(ThreatSeverity::Medium))
        ));
    }

    #[test]
    fn test_duplicate_playbook_rejected() {
        let mut playbooks = default_playbooks();
        playbooks.push(PlaybookPolicy::new(ThreatSeverity::Low, &[ActionKind::Notify]));
        assert!(matches!(
            validate_playbooks(&playbooks),
            Err(ConfigError::DuplicatePlaybook(ThreatSeverity::Low))
        ));
    }

    #[test]
    fn test_action_kind_serde() {
        let json = serde_json::to_string(&ActionKind::QuarantineSession).unwrap();
        assert_eq!(json, "\"quarantine_session\"");
        let parsed: ActionKind = serde_json::from_str("\"trigger_backup\"").unwrap();
        assert_eq!(parsed, ActionKind::TriggerBackup);
        assert_eq!(ActionKind::BlockSource.to_string(), "block_source");
    }

    #[test]
    fn test_trace_summaries() {
        let now = Utc::now();
        let step = |kind, outcome| ResponseStep {
            step: kind,
            timestamp: now,
            outcome,
            attempts: 1,
            message: String::new(),
        };
        let trace = ExecutionTrace {
            threat_id: "THR-000001".into(),
            severity: ThreatSeverity::High,
            incident_id: None,
            steps: vec![
                step(ActionKind::BlockSource, StepOutcome::Failed),
                step(ActionKind::Notify, StepOutcome::Succeeded),
                step(ActionKind::QuarantineSession, StepOutcome::Skipped),
            ],
        };
        assert!(!trace.all_succeeded());
        assert_eq!(trace.failures(), vec![ActionKind::BlockSource]);
        assert_eq!(trace.count(StepOutcome::Skipped), 1);
    }
}
