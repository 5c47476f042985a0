//! Aggregate security posture score.

use crate::collaborators::AuditSnapshot;
use crate::config::PostureConfig;
use crate::health::{HealthSnapshot, HealthStatus};
use serde::{Deserialize, Serialize};

/// Posture classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PostureLevel {
    /// Score below 40.
    Critical,
    /// Score 40-59.
    Poor,
    /// Score 60-74.
    Fair,
    /// Score 75-89.
    Good,
    /// Score 90-100.
    Strong,
}

impl PostureLevel {
    pub fn from_score(score: f64) -> Self {
        match score as u32 {
            0..=39 => PostureLevel::Critical,
            40..=59 => PostureLevel::Poor,
            60..=74 => PostureLevel::Fair,
            75..=89 => PostureLevel::Good,
            _ => PostureLevel::Strong,
        }
    }
}

impl std::fmt::Display for PostureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostureLevel::Critical => write!(f, "CRITICAL"),
            PostureLevel::Poor => write!(f, "POOR"),
            PostureLevel::Fair => write!(f, "FAIR"),
            PostureLevel::Good => write!(f, "GOOD"),
            PostureLevel::Strong => write!(f, "STRONG"),
        }
    }
}

/// Inputs to the posture calculation.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostureInputs<'a> {
    pub active_critical_threats: usize,
    pub audit: Option<AuditSnapshot>,
    pub health: Option<&'a HealthSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityPosture {
    /// 0..=100, one decimal.
    pub score: f64,
    pub level: PostureLevel,
    pub active_critical_threats: usize,
    pub critical_findings: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compliance_score: Option<f64>,
    pub threat_penalty: f64,
    pub finding_penalty: f64,
    pub module_penalty: f64,
}

/// Starts at 100, subtracts weighted penalties, then blends in the
/// compliance score when an audit snapshot is available.
pub fn compute_posture(config: &PostureConfig, inputs: PostureInputs<'_>) -> SecurityPosture {
    let threat_penalty = config.critical_threat_penalty * inputs.active_critical_threats as f64;
    let critical_findings = inputs.audit.map_or(0, |a| a.critical_findings);
    let finding_penalty = config.critical_finding_penalty * critical_findings as f64;
    let module_penalty = inputs.health.map_or(0.0, |snapshot| {
        snapshot
            .modules
            .iter()
            .map(|m| match m.status {
                HealthStatus::Healthy => 0.0,
                HealthStatus::Warning => config.warning_module_penalty,
                HealthStatus::Unhealthy => config.unhealthy_module_penalty,
                HealthStatus::Error => config.error_module_penalty,
            })
            .sum()
    });

    let base = (100.0 - threat_penalty - finding_penalty - module_penalty).clamp(0.0, 100.0);
    let compliance_score = inputs
        .audit
        .map(|a| a.compliance_score.clamp(0.0, 100.0));
    let blended = match compliance_score {
        Some(c) => base * (1.0 - config.compliance_weight) + c * config.compliance_weight,
        None => base,
    };
    let score = (blended.clamp(0.0, 100.0) * 10.0).round() / 10.0;

    SecurityPosture {
        score,
        level: PostureLevel::from_score(score),
        active_critical_threats: inputs.active_critical_threats,
        critical_findings,
        compliance_score,
        threat_penalty,
        finding_penalty,
        module_penalty,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::ModuleHealth;
    use chrono::Utc;

    #[test]
    fn test_clean_system_is_strong() {
        let posture = compute_posture(&PostureConfig::default(), PostureInputs::default());
        assert_eq!(posture.score, 100.0);
        assert_eq!(posture.level, PostureLevel::Strong);
    }

    #[test]
    fn test_threats_and_findings_subtract() {
        let posture = compute_posture(
            &PostureConfig::default(),
            PostureInputs {
                active_critical_threats: 2,
                audit: Some(AuditSnapshot {
                    compliance_score: 100.0,
                    critical_findings: 1,
                }),
                health: None,
            },
        );
        // base = 100 - 20 - 5 = 75; blended = 75 * 0.7 + 100 * 0.3 = 82.5
        assert_eq!(posture.score, 82.5);
        assert_eq!(posture.level, PostureLevel::Good);
    }

    #[test]
    fn test_module_health_penalty() {
        let snapshot = HealthSnapshot {
            overall: HealthStatus::Error,
            modules: vec![
                ModuleHealth::healthy("a").with_issue(HealthStatus::Warning, "slow"),
                ModuleHealth::healthy("b").with_issue(HealthStatus::Error, "down"),
            ],
            checked_at: Utc::now(),
        };
        let posture = compute_posture(
            &PostureConfig::default(),
            PostureInputs {
                health: Some(&snapshot),
                ..Default::default()
            },
        );
        assert_eq!(posture.module_penalty, 12.0);
        assert_eq!(posture.score, 88.0);
    }

    #[test]
    fn test_score_never_negative() {
        let posture = compute_posture(
            &PostureConfig::default(),
            PostureInputs {
                active_critical_threats: 50,
                ..Default::default()
            },
        );
        assert_eq!(posture.score, 0.0);
        assert_eq!(posture.level, PostureLevel::Critical);
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(PostureLevel::from_score(39.9), PostureLevel::Critical);
        assert_eq!(PostureLevel::from_score(40.0), PostureLevel::Poor);
        assert_eq!(PostureLevel::from_score(74.9), PostureLevel::Fair);
        assert_eq!(PostureLevel::from_score(90.0), PostureLevel::Strong);
    }
}
