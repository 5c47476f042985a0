//! Incident lifecycle: reporting, routing, transitions, evidence and
//! persistence.
//!
//! ```text
//! OPEN -> IN_PROGRESS -> RESOLVED -> CLOSED
//!              ^            |
//!              +-- reopen --+
//! ```

use crate::config::IncidentsConfig;
use crate::error::IncidentError;
use crate::event::{ThreatEvent, ThreatSeverity, ThreatType};
use crate::health::{HealthReporter, HealthStatus, ModuleHealth};
use crate::persistence;
use crate::response::{ResponseStep, StepRecorder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    InProgress,
    Resolved,
    Closed,
}

impl IncidentStatus {
    /// Open and in-progress incidents still need work.
    pub fn is_active(&self) -> bool {
        matches!(self, IncidentStatus::Open | IncidentStatus::InProgress)
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncidentStatus::Open => write!(f, "OPEN"),
            IncidentStatus::InProgress => write!(f, "IN_PROGRESS"),
            IncidentStatus::Resolved => write!(f, "RESOLVED"),
            IncidentStatus::Closed => write!(f, "CLOSED"),
        }
    }
}

pub fn is_valid_transition(from: IncidentStatus, to: IncidentStatus) -> bool {
    use IncidentStatus::*;
    matches!(
        (from, to),
        (Open, InProgress) | (InProgress, Resolved) | (Resolved, Closed) | (Resolved, InProgress)
    )
}

/// Incident category for a threat type, used for team routing.
pub fn category_for(threat_type: &ThreatType) -> &'static str {
    if threat_type.is_injection() || *threat_type == ThreatType::INJECTION_CAMPAIGN {
        "injection"
    } else if *threat_type == ThreatType::MALICIOUS_SCRIPT {
        "malware"
    } else if [
        ThreatType::DDOS_ATTACK,
        ThreatType::RATE_LIMIT_EXCEEDED,
        ThreatType::GEO_BLOCKED,
        ThreatType::DISTRIBUTED_ATTACK,
        ThreatType::BLOCKED_SOURCE_ACTIVITY,
    ]
    .contains(threat_type)
    {
        "network"
    } else if [ThreatType::AUTH_FAILURE, ThreatType::COORDINATED_ATTACK].contains(threat_type) {
        "access"
    } else if [
        ThreatType::ANOMALY_DETECTED,
        ThreatType::ANOMALOUS_INTRUSION,
        ThreatType::RECONNAISSANCE,
        ThreatType::SUSPICIOUS_AGENT,
    ]
    .contains(threat_type)
    {
        "anomaly"
    } else {
        "general"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub collected_at: DateTime<Utc>,
}

impl Evidence {
    pub fn new(kind: impl Into<String>, description: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            kind: kind.into(),
            description: description.into(),
            data: serde_json::Value::Null,
            collected_at: now,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub timestamp: DateTime<Utc>,
    pub from: IncidentStatus,
    pub to: IncidentStatus,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// Externally reported incident data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentReport {
    pub title: String,
    pub description: String,
    pub category: String,
    pub severity: Option<ThreatSeverity>,
    pub threat_ids: Vec<String>,
    pub evidence: Vec<Evidence>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub category: String,
    pub severity: ThreatSeverity,
    pub status: IncidentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub response_actions: Vec<ResponseStep>,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub threat_ids: Vec<String>,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentMetrics {
    pub total: usize,
    pub by_status: BTreeMap<IncidentStatus, usize>,
    /// Open and in-progress incidents per severity.
    pub active_by_severity: BTreeMap<ThreatSeverity, usize>,
    pub evicted: u64,
}

#[derive(Debug, Default)]
struct IncidentState {
    /// Keyed by id; ids are zero-padded so key order is creation order.
    incidents: BTreeMap<String, Incident>,
    next_id: u64,
}

pub struct IncidentManager {
    state: Mutex<IncidentState>,
    persist_lock: Mutex<()>,
    store_path: Option<PathBuf>,
    max_incidents: usize,
    teams: BTreeMap<String, String>,
    default_team: String,
    evicted: AtomicU64,
    persist_failures: AtomicU64,
}

impl IncidentManager {
    pub fn new(config: &IncidentsConfig) -> Self {
        Self {
            state: Mutex::new(IncidentState {
                incidents: BTreeMap::new(),
                next_id: 1,
            }),
            persist_lock: Mutex::new(()),
            store_path: config.store_path.clone(),
            max_incidents: config.max_incidents.max(1),
            teams: config.teams.clone(),
            default_team: config.default_team.clone(),
            evicted: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
        }
    }

    /// Like [`IncidentManager::new`], restoring incidents from the configured
    /// store when it exists.
    pub fn load(config: &IncidentsConfig) -> Result<Self, IncidentError> {
        let manager = Self::new(config);
        let Some(path) = &manager.store_path else {
            return Ok(manager);
        };
        let stored: Vec<Incident> = persistence::load_json(path)
            .map_err(|e| IncidentError::Store(format!("{}: {e}", path.display())))?
            .unwrap_or_default();
        {
            let mut state = manager.lock();
            for incident in stored {
                let seq = incident
                    .id
                    .strip_prefix("INC-")
                    .and_then(|n| n.parse::<u64>().ok())
                    .unwrap_or(0);
                state.next_id = state.next_id.max(seq + 1);
                state.incidents.insert(incident.id.clone(), incident);
            }
            tracing::info!(
                count = state.incidents.len(),
                path = %path.display(),
                "Incidents restored"
            );
        }
        Ok(manager)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IncidentState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn report(&self, report: IncidentReport) -> String {
        self.report_at(report, Utc::now())
    }

    pub fn report_at(&self, report: IncidentReport, now: DateTime<Utc>) -> String {
        let category = match report.category.trim() {
            "" => "general".to_string(),
            c => c.to_ascii_lowercase(),
        };
        let title = if report.title.trim().is_empty() {
            format!("{category} incident")
        } else {
            report.title
        };
        let id = {
            let mut state = self.lock();
            let id = format!("INC-{:06}", state.next_id);
            state.next_id += 1;
            state.incidents.insert(
                id.clone(),
                Incident {
                    id: id.clone(),
                    title,
                    description: report.description,
                    category,
                    severity: report.severity.unwrap_or(ThreatSeverity::Medium),
                    status: IncidentStatus::Open,
                    assigned_to: None,
                    response_actions: Vec::new(),
                    evidence: report.evidence,
                    threat_ids: report.threat_ids,
                    history: Vec::new(),
                    created_at: now,
                    updated_at: now,
                },
            );
            self.evict_closed(&mut state);
            id
        };
        tracing::info!(incident_id = %id, "Incident opened");
        self.persist();
        id
    }

    /// Open an incident describing a registered threat.
    pub fn open_for_threat_at(&self, threat: &ThreatEvent, now: DateTime<Utc>) -> String {
        let description = match &threat.subtype {
            Some(subtype) => format!("{} ({subtype}) from {}", threat.threat_type, threat.source),
            None => format!("{} from {}", threat.threat_type, threat.source),
        };
        self.report_at(
            IncidentReport {
                title: format!("{} {}", threat.severity, threat.threat_type),
                description,
                category: category_for(&threat.threat_type).to_string(),
                severity: Some(threat.severity),
                threat_ids: vec![threat.id.clone()],
                evidence: vec![
                    Evidence::new("threat", format!("threat {}", threat.id), now)
                        .with_data(serde_json::to_value(threat).unwrap_or_default()),
                ],
            },
            now,
        )
    }

    pub fn get(&self, id: &str) -> Option<Incident> {
        self.lock().incidents.get(id).cloned()
    }

    /// All incidents, oldest first.
    pub fn list(&self) -> Vec<Incident> {
        self.lock().incidents.values().cloned().collect()
    }

    pub fn active(&self) -> Vec<Incident> {
        self.lock()
            .incidents
            .values()
            .filter(|i| i.status.is_active())
            .cloned()
            .collect()
    }

    pub fn team_for(&self, category: &str) -> &str {
        self.teams
            .get(category)
            .map(String::as_str)
            .unwrap_or(&self.default_team)
    }

    /// Assign to `assignee`, or route by category when `None`.
    pub fn assign(&self, id: &str, assignee: Option<&str>) -> Result<String, IncidentError> {
        let assigned = {
            let mut state = self.lock();
            let incident = state
                .incidents
                .get_mut(id)
                .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
            let assigned = match assignee.map(str::trim).filter(|a| !a.is_empty()) {
                Some(a) => a.to_string(),
                None => self.team_for(&incident.category).to_string(),
            };
            incident.assigned_to = Some(assigned.clone());
            incident.updated_at = Utc::now();
            assigned
        };
        tracing::info!(incident_id = id, assigned_to = %assigned, "Incident assigned");
        self.persist();
        Ok(assigned)
    }

    pub fn transition_at(
        &self,
        id: &str,
        to: IncidentStatus,
        actor: &str,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), IncidentError> {
        {
            let mut state = self.lock();
            let incident = state
                .incidents
                .get_mut(id)
                .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
            let from = incident.status;
            if !is_valid_transition(from, to) {
                return Err(IncidentError::InvalidTransition { from, to });
            }
            incident.history.push(TransitionRecord {
                timestamp: now,
                from,
                to,
                actor: actor.to_string(),
                note: note.map(str::to_string),
            });
            incident.status = to;
            incident.updated_at = now;
            tracing::info!(incident_id = id, %from, %to, actor, "Incident transitioned");
            if to == IncidentStatus::Closed {
                self.evict_closed(&mut state);
            }
        }
        self.persist();
        Ok(())
    }

    pub fn start(&self, id: &str, actor: &str) -> Result<(), IncidentError> {
        self.transition_at(id, IncidentStatus::InProgress, actor, None, Utc::now())
    }

    pub fn resolve(&self, id: &str, actor: &str, note: Option<&str>) -> Result<(), IncidentError> {
        self.transition_at(id, IncidentStatus::Resolved, actor, note, Utc::now())
    }

    pub fn reopen(&self, id: &str, actor: &str, note: Option<&str>) -> Result<(), IncidentError> {
        let current = self
            .get(id)
            .ok_or_else(|| IncidentError::NotFound(id.to_string()))?
            .status;
        if current != IncidentStatus::Resolved {
            return Err(IncidentError::InvalidTransition {
                from: current,
                to: IncidentStatus::InProgress,
            });
        }
        self.transition_at(id, IncidentStatus::InProgress, actor, note, Utc::now())
    }

    pub fn close(&self, id: &str, actor: &str) -> Result<(), IncidentError> {
        self.transition_at(id, IncidentStatus::Closed, actor, None, Utc::now())
    }

    pub fn add_evidence(&self, id: &str, evidence: Evidence) -> Result<(), IncidentError> {
        {
            let mut state = self.lock();
            let incident = state
                .incidents
                .get_mut(id)
                .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
            incident.updated_at = evidence.collected_at.max(incident.updated_at);
            incident.evidence.push(evidence);
        }
        self.persist();
        Ok(())
    }

    pub fn append_step(&self, id: &str, step: ResponseStep) -> Result<(), IncidentError> {
        {
            let mut state = self.lock();
            let incident = state
                .incidents
                .get_mut(id)
                .ok_or_else(|| IncidentError::NotFound(id.to_string()))?;
            incident.response_actions.push(step);
        }
        self.persist();
        Ok(())
    }

    pub fn metrics(&self) -> IncidentMetrics {
        let state = self.lock();
        let mut metrics = IncidentMetrics {
            total: state.incidents.len(),
            evicted: self.evicted.load(Ordering::Relaxed),
            ..Default::default()
        };
        for incident in state.incidents.values() {
            *metrics.by_status.entry(incident.status).or_default() += 1;
            if incident.status.is_active() {
                *metrics.active_by_severity.entry(incident.severity).or_default() += 1;
            }
        }
        metrics
    }

    fn evict_closed(&self, state: &mut IncidentState) {
        while state.incidents.len() > self.max_incidents {
            let Some(oldest_closed) = state
                .incidents
                .values()
                .find(|i| i.status == IncidentStatus::Closed)
                .map(|i| i.id.clone())
            else {
                break;
            };
            state.incidents.remove(&oldest_closed);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(incident_id = %oldest_closed, "Closed incident evicted");
        }
    }

    fn persist(&self) {
        let Some(path) = &self.store_path else {
            return;
        };
        let _guard = self.persist_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.list();
        if let Err(e) = persistence::atomic_write_json(path, &snapshot) {
            self.persist_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(path = %path.display(), error = %e, "Failed to persist incidents");
        }
    }
}

impl StepRecorder for IncidentManager {
    fn record_step(&self, incident_id: &str, step: &ResponseStep) {
        if let Err(e) = self.append_step(incident_id, step.clone()) {
            tracing::warn!(incident_id, error = %e, "Could not record response step");
        }
    }
}

impl HealthReporter for IncidentManager {
    fn name(&self) -> &str {
        "incidents"
    }

    fn health(&self) -> ModuleHealth {
        let m = self.metrics();
        let active: usize = m.active_by_severity.values().sum();
        let failures = self.persist_failures.load(Ordering::Relaxed);
        let mut health = ModuleHealth::healthy("incidents")
            .with_metric("total", m.total as f64)
            .with_metric("active", active as f64)
            .with_metric("evicted", m.evicted as f64)
            .with_metric("persist_failures", failures as f64);
        if failures > 0 {
            health = health.with_issue(
                HealthStatus::Warning,
                format!("{failures} incident store write(s) failed"),
            );
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ThreatSignal;
    use crate::response::{ActionKind, StepOutcome};
    use pretty_assertions::assert_eq;

    fn manager() -> IncidentManager {
        IncidentManager::new(&IncidentsConfig::default())
    }

    fn report(category: &str) -> IncidentReport {
        IncidentReport {
            title: "Suspicious login burst".into(),
            category: category.into(),
            severity: Some(ThreatSeverity::High),
            ..Default::default()
        }
    }

    #[test]
    fn test_report_assigns_sequential_ids() {
        let m = manager();
        assert_eq!(m.report(report("access")), "INC-000001");
        assert_eq!(m.report(report("access")), "INC-000002");
        assert_eq!(m.get("INC-000001").unwrap().status, IncidentStatus::Open);
    }

    #[test]
    fn test_full_lifecycle_with_reopen() {
        let m = manager();
        let id = m.report(report("network"));
        m.start(&id, "alice").unwrap();
        m.resolve(&id, "alice", Some("blocked")).unwrap();
        m.reopen(&id, "bob", Some("recurred")).unwrap();
        m.resolve(&id, "bob", None).unwrap();
        m.close(&id, "bob").unwrap();

        let incident = m.get(&id).unwrap();
        assert_eq!(incident.status, IncidentStatus::Closed);
        let path: Vec<(IncidentStatus, IncidentStatus)> =
            incident.history.iter().map(|h| (h.from, h.to)).collect();
        assert_eq!(
            path,
            vec![
                (IncidentStatus::Open, IncidentStatus::InProgress),
                (IncidentStatus::InProgress, IncidentStatus::Resolved),
                (IncidentStatus::Resolved, IncidentStatus::InProgress),
                (IncidentStatus::InProgress, IncidentStatus::Resolved),
                (IncidentStatus::Resolved, IncidentStatus::Closed),
            ]
        );
    }

    #[test]
    fn test_invalid_transitions_rejected() {
        let m = manager();
        let id = m.report(report("network"));
        assert!(matches!(
            m.resolve(&id, "x", None),
            Err(IncidentError::InvalidTransition {
                from: IncidentStatus::Open,
                to: IncidentStatus::Resolved
            })
        ));
        assert!(m.reopen(&id, "x", None).is_err());

        m.start(&id, "x").unwrap();
        m.resolve(&id, "x", None).unwrap();
        m.close(&id, "x").unwrap();
        assert!(m.reopen(&id, "x", None).is_err());
        assert!(m.start(&id, "x").is_err());
        assert!(matches!(m.start("INC-999999", "x"), Err(IncidentError::NotFound(_))));
    }

    #[test]
    fn test_assign_routes_by_category() {
        let m = manager();
        let id = m.report(report("injection"));
        assert_eq!(m.assign(&id, None).unwrap(), "application-security");
        let other = m.report(report("paperwork"));
        assert_eq!(m.assign(&other, None).unwrap(), "security-operations");
        assert_eq!(m.assign(&other, Some("carol")).unwrap(), "carol");
        assert_eq!(m.get(&other).unwrap().assigned_to.as_deref(), Some("carol"));
    }

    #[test]
    fn test_open_for_threat_links_evidence() {
        let m = manager();
        let now = Utc::now();
        let signal = ThreatSignal::new(ThreatType::SQL_INJECTION, ThreatSeverity::Critical, "10.0.0.1", now)
            .with_subtype("sql_tautology");
        let threat = ThreatEvent::from_signal("THR-000007".into(), signal);

        let id = m.open_for_threat_at(&threat, now);
        let incident = m.get(&id).unwrap();
        assert_eq!(incident.category, "injection");
        assert_eq!(incident.severity, ThreatSeverity::Critical);
        assert_eq!(incident.threat_ids, vec!["THR-000007"]);
        assert_eq!(incident.evidence[0].data["id"], "THR-000007");
    }

    #[test]
    fn test_steps_recorded_in_order() {
        let m = manager();
        let id = m.report(report("network"));
        for (kind, outcome) in [
            (ActionKind::BlockSource, StepOutcome::Failed),
            (ActionKind::Notify, StepOutcome::Succeeded),
        ] {
            m.record_step(
                &id,
                &ResponseStep {
                    step: kind,
                    timestamp: Utc::now(),
                    outcome,
                    attempts: 1,
                    message: String::new(),
                },
            );
        }
        let steps: Vec<ActionKind> = m.get(&id).unwrap().response_actions.iter().map(|s| s.step).collect();
        assert_eq!(steps, vec![ActionKind::BlockSource, ActionKind::Notify]);
    }

    #[test]
    fn test_closed_incidents_evicted_oldest_first() {
        let config = IncidentsConfig {
            max_incidents: 2,
            ..Default::default()
        };
        let m = IncidentManager::new(&config);
        let first = m.report(report("network"));
        m.start(&first, "x").unwrap();
        m.resolve(&first, "x", None).unwrap();
        m.close(&first, "x").unwrap();
        let second = m.report(report("network"));
        let third = m.report(report("network"));

        assert!(m.get(&first).is_none());
        assert!(m.get(&second).is_some());
        assert!(m.get(&third).is_some());
        assert_eq!(m.metrics().evicted, 1);

        // Nothing closed left: the cap is exceeded rather than dropping live work.
        m.report(report("network"));
        assert_eq!(m.metrics().total, 3);
    }

    #[test]
    fn test_persistence_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let config = IncidentsConfig {
            store_path: Some(dir.path().join("incidents.json")),
            ..Default::default()
        };
        let m = IncidentManager::load(&config).unwrap();
        let id = m.report(report("access"));
        m.start(&id, "dave").unwrap();
        m.add_evidence(&id, Evidence::new("log", "auth.log excerpt", Utc::now()))
            .unwrap();

        let restored = IncidentManager::load(&config).unwrap();
        let incident = restored.get(&id).unwrap();
        assert_eq!(incident.status, IncidentStatus::InProgress);
        assert_eq!(incident.evidence.len(), 1);
        assert_eq!(restored.report(report("access")), "INC-000002");
    }

    #[test]
    fn test_metrics_count_active_by_severity() {
        let m = manager();
        m.report(report("access"));
        let id = m.report(IncidentReport {
            severity: Some(ThreatSeverity::Critical),
            ..report("access")
        });
        m.start(&id, "x").unwrap();
        m.resolve(&id, "x", None).unwrap();

        let metrics = m.metrics();
        assert_eq!(metrics.active_by_severity.get(&ThreatSeverity::High), Some(&1));
        assert_eq!(metrics.active_by_severity.get(&ThreatSeverity::Critical), None);
        assert_eq!(metrics.by_status.get(&IncidentStatus::Resolved), Some(&1));
    }
}
