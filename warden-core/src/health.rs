//! Module health reporting and aggregation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};

/// Reports with more issues than this are treated as unhealthy.
pub const MAX_ISSUES_BEFORE_UNHEALTHY: usize = 3;

/// Module health status, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Unhealthy,
    Error,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Warning => write!(f, "WARNING"),
            HealthStatus::Unhealthy => write!(f, "UNHEALTHY"),
            HealthStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Health report for a single module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleHealth {
    pub name: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ModuleHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            issues: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn with_metric(mut self, key: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(key.into(), value);
        self
    }

    /// Record an issue and raise the status to at least `status`.
    pub fn with_issue(mut self, status: HealthStatus, issue: impl Into<String>) -> Self {
        self.issues.push(issue.into());
        self.status = self.status.max(status);
        self
    }

    /// Apply the issue-count rule.
    fn normalized(mut self) -> Self {
        if self.issues.len() > MAX_ISSUES_BEFORE_UNHEALTHY {
            self.status = self.status.max(HealthStatus::Unhealthy);
        }
        self
    }
}

/// Anything that can report its health to the coordinator.
pub trait HealthReporter: Send + Sync {
    fn name(&self) -> &str;
    fn health(&self) -> ModuleHealth;
}

/// Combined health snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub overall: HealthStatus,
    pub modules: Vec<ModuleHealth>,
    pub checked_at: DateTime<Utc>,
}

impl HealthSnapshot {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            overall: HealthStatus::Healthy,
            modules: Vec::new(),
            checked_at: now,
        }
    }

    pub fn count_with_status(&self, status: HealthStatus) -> usize {
        self.modules.iter().filter(|m| m.status == status).count()
    }
}

/// Polls registered modules and keeps the latest snapshot.
pub struct HealthMonitor {
    reporters: Vec<Arc<dyn HealthReporter>>,
    demotions: RwLock<HashMap<String, String>>,
    last: RwLock<HealthSnapshot>,
}

impl HealthMonitor {
    pub fn new(reporters: Vec<Arc<dyn HealthReporter>>) -> Self {
        Self {
            reporters,
            demotions: RwLock::new(HashMap::new()),
            last: RwLock::new(HealthSnapshot::empty(Utc::now())),
        }
    }

    pub fn module_names(&self) -> Vec<String> {
        self.reporters.iter().map(|r| r.name().to_string()).collect()
    }

    /// Demote a module to at least WARNING until [`clear_demotion`](Self::clear_demotion).
    pub fn demote(&self, module: &str, reason: impl Into<String>) {
        self.demotions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(module.to_string(), reason.into());
    }

    pub fn clear_demotion(&self, module: &str) {
        self.demotions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(module);
    }

    /// Poll every module and store the resulting snapshot.
    ///
    /// A reporter that panics is reported as `ERROR` instead of taking the
    /// health loop down with it.
    pub fn check_all(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let demotions = self
            .demotions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let modules: Vec<ModuleHealth> = self
            .reporters
            .iter()
            .map(|reporter| {
                let name = reporter.name().to_string();
                let report = std::panic::catch_unwind(AssertUnwindSafe(|| reporter.health()))
                    .unwrap_or_else(|_| {
                        tracing::error!(module = %name, "Health reporter panicked");
                        ModuleHealth::healthy(&name)
                            .with_issue(HealthStatus::Error, "health check panicked")
                    });
                let report = match demotions.get(&name) {
                    Some(reason) => report.with_issue(HealthStatus::Warning, reason.clone()),
                    None => report,
                };
                report.normalized()
            })
            .collect();

        let snapshot = HealthSnapshot {
            overall: aggregate_status(&modules),
            modules,
            checked_at: now,
        };

        if snapshot.overall > HealthStatus::Healthy {
            tracing::warn!(overall = %snapshot.overall, "Module health degraded");
        }

        *self.last.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        snapshot
    }

    /// Latest stored snapshot.
    pub fn last_snapshot(&self) -> HealthSnapshot {
        self.last
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Worst status among the given modules; `HEALTHY` when there are none.
pub fn aggregate_status(modules: &[ModuleHealth]) -> HealthStatus {
    modules
        .iter()
        .map(|m| m.status)
        .max()
        .unwrap_or(HealthStatus::Healthy)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedReporter(ModuleHealth);

    impl HealthReporter for FixedReporter {
        fn name(&self) -> &str {
            &self.0.name
        }
        fn health(&self) -> ModuleHealth {
            self.0.clone()
        }
    }

    struct PanickingReporter;

    impl HealthReporter for PanickingReporter {
        fn name(&self) -> &str {
            "crypto"
        }
        fn health(&self) -> ModuleHealth {
            panic!("boom")
        }
    }

    fn reporter(health: ModuleHealth) -> Arc<dyn HealthReporter> {
        Arc::new(FixedReporter(health))
    }

    #[test]
    fn test_status_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Warning);
        assert!(HealthStatus::Warning < HealthStatus::Unhealthy);
        assert!(HealthStatus::Unhealthy < HealthStatus::Error);
    }

    #[test]
    fn test_aggregate_is_worst_status() {
        let monitor = HealthMonitor::new(vec![
            reporter(ModuleHealth::healthy("auth")),
            reporter(ModuleHealth::healthy("audit").with_issue(HealthStatus::Warning, "slow")),
            reporter(ModuleHealth::healthy("network")),
        ]);
        let snapshot = monitor.check_all(Utc::now());
        assert_eq!(snapshot.overall, HealthStatus::Warning);
        assert_eq!(snapshot.modules.len(), 3);
    }

    #[test]
    fn test_empty_monitor_is_healthy() {
        let monitor = HealthMonitor::new(Vec::new());
        assert_eq!(monitor.check_all(Utc::now()).overall, HealthStatus::Healthy);
    }

    #[test]
    fn test_more_than_three_issues_is_unhealthy() {
        let mut health = ModuleHealth::healthy("auth");
        for i in 0..4 {
            health.issues.push(format!("issue {i}"));
        }
        let monitor = HealthMonitor::new(vec![reporter(health)]);
        let snapshot = monitor.check_all(Utc::now());
        assert_eq!(snapshot.modules[0].status, HealthStatus::Unhealthy);
        assert_eq!(snapshot.overall, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_three_issues_keeps_reported_status() {
        let mut health = ModuleHealth::healthy("auth");
        health.issues = vec!["a".into(), "b".into(), "c".into()];
        let monitor = HealthMonitor::new(vec![reporter(health)]);
        assert_eq!(monitor.check_all(Utc::now()).overall, HealthStatus::Healthy);
    }

    #[test]
    fn test_panicking_reporter_is_error() {
        let monitor = HealthMonitor::new(vec![
            reporter(ModuleHealth::healthy("auth")),
            Arc::new(PanickingReporter),
        ]);
        let snapshot = monitor.check_all(Utc::now());
        assert_eq!(snapshot.overall, HealthStatus::Error);
    }

    #[test]
    fn test_demotion_and_clear() {
        let monitor = HealthMonitor::new(vec![reporter(ModuleHealth::healthy("signatures"))]);
        monitor.demote("signatures", "scan failed");
        let snapshot = monitor.check_all(Utc::now());
        assert_eq!(snapshot.overall, HealthStatus::Warning);
        assert_eq!(snapshot.modules[0].issues, vec!["scan failed".to_string()]);

        monitor.clear_demotion("signatures");
        assert_eq!(monitor.check_all(Utc::now()).overall, HealthStatus::Healthy);
    }

    #[test]
    fn test_last_snapshot_is_stored() {
        let monitor = HealthMonitor::new(vec![reporter(ModuleHealth::healthy("auth"))]);
        let now = Utc::now();
        monitor.check_all(now);
        assert_eq!(monitor.last_snapshot().checked_at, now);
    }
}
