//! Cross-signal correlation.
//!
//! A rule names the event types it needs, how many of each, and how the
//! contributing events must be related (same source, same /24, or any).
//! Every match produces a derived signal whose correlation key is a SHA-256
//! over the rule name and the sorted contributing ids, so correlating the
//! same window twice yields the same key and the registry drops the repeat.

use crate::error::ConfigError;
use crate::event::{ThreatEvent, ThreatSeverity, ThreatSignal, ThreatType};
use crate::health::{HealthReporter, ModuleHealth};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

const MODULE_NAME: &str = "correlation";
const CONFIDENCE_STEP: f64 = 0.05;
const MAX_CONFIDENCE: f64 = 0.99;

/// How contributing events must be related.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRelation {
    SameSource,
    /// Same IPv4 /24 network.
    SameSubnet,
    Any,
}

/// "At least `min_count` events of any of `types`".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRequirement {
    pub types: Vec<ThreatType>,
    pub min_count: usize,
    /// Count distinct sources instead of events.
    #[serde(default)]
    pub distinct_sources: bool,
}

impl TypeRequirement {
    pub fn new(types: &[ThreatType], min_count: usize) -> Self {
        Self {
            types: types.to_vec(),
            min_count,
            distinct_sources: false,
        }
    }

    pub fn from_distinct_sources(mut self) -> Self {
        self.distinct_sources = true;
        self
    }
}

/// A correlation pattern.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationRule {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub requirements: Vec<TypeRequirement>,
    pub relation: SourceRelation,
    pub derived_type: ThreatType,
    pub severity: ThreatSeverity,
    pub base_confidence: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// The built-in correlation table.
pub fn default_correlation_rules() -> Vec<CorrelationRule> {
    let injection = [
        ThreatType::SQL_INJECTION,
        ThreatType::CROSS_SITE_SCRIPTING,
        ThreatType::PATH_TRAVERSAL,
        ThreatType::COMMAND_INJECTION,
    ];
    vec![
        CorrelationRule {
            name: "coordinated_attack".into(),
            description: "Repeated authentication failures alongside another threat from the same source".into(),
            requirements: vec![
                TypeRequirement::new(&[ThreatType::AUTH_FAILURE], 5),
                TypeRequirement::new(&[ThreatType::THREAT_DETECTED], 1),
            ],
            relation: SourceRelation::SameSource,
            derived_type: ThreatType::COORDINATED_ATTACK,
            severity: ThreatSeverity::High,
            base_confidence: 0.8,
            enabled: true,
        },
        CorrelationRule {
            name: "distributed_attack".into(),
            description: "Volumetric signals from several hosts in one /24".into(),
            requirements: vec![
                TypeRequirement::new(&[ThreatType::DDOS_ATTACK, ThreatType::RATE_LIMIT_EXCEEDED], 3)
                    .from_distinct_sources(),
            ],
            relation: SourceRelation::SameSubnet,
            derived_type: ThreatType::DISTRIBUTED_ATTACK,
            severity: ThreatSeverity::Critical,
            base_confidence: 0.9,
            enabled: true,
        },
        CorrelationRule {
            name: "injection_campaign".into(),
            description: "Several injection attempts from one source".into(),
            requirements: vec![TypeRequirement::new(&injection, 3)],
            relation: SourceRelation::SameSource,
            derived_type: ThreatType::INJECTION_CAMPAIGN,
            severity: ThreatSeverity::Critical,
            base_confidence: 0.85,
            enabled: true,
        },
        CorrelationRule {
            name: "anomalous_intrusion".into(),
            description: "Behavioral anomaly from a source that also attempted injection".into(),
            requirements: vec![
                TypeRequirement::new(&[ThreatType::ANOMALY_DETECTED], 1),
                TypeRequirement::new(&injection, 1),
            ],
            relation: SourceRelation::SameSource,
            derived_type: ThreatType::ANOMALOUS_INTRUSION,
            severity: ThreatSeverity::High,
            base_confidence: 0.75,
            enabled: true,
        },
    ]
}

/// Validated correlation rules.
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<CorrelationRule>,
}

impl RuleSet {
    pub fn new(rules: Vec<CorrelationRule>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        for rule in &rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::UnnamedRule);
            }
            if !seen.insert(rule.name.clone()) {
                return Err(ConfigError::DuplicateRule(rule.name.clone()));
            }
            Self::check(rule)?;
        }
        Ok(Self {
            rules: rules.into_iter().filter(|r| r.enabled).collect(),
        })
    }

    fn check(rule: &CorrelationRule) -> Result<(), ConfigError> {
        let field = |f: &str| format!("correlation.rules.{}.{f}", rule.name);
        if rule.requirements.is_empty() {
            return Err(ConfigError::invalid(field("requirements"), "must not be empty"));
        }
        if rule
            .requirements
            .iter()
            .any(|req| req.types.is_empty() || req.min_count == 0)
        {
            return Err(ConfigError::invalid(
                field("requirements"),
                "each requirement needs at least one type and a positive count",
            ));
        }
        if !(0.0..=1.0).contains(&rule.base_confidence) {
            return Err(ConfigError::invalid(field("base_confidence"), "must be between 0 and 1"));
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }
}

/// Applies the rule table to a window of registered events.
pub struct Correlator {
    rules: RwLock<Arc<RuleSet>>,
    window: Duration,
    runs: AtomicU64,
    derived: AtomicU64,
    malformed: AtomicU64,
}

impl Correlator {
    pub fn new(rules: RuleSet, window: Duration) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
            window,
            runs: AtomicU64::new(0),
            derived: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
        }
    }

    pub fn with_defaults(window: Duration) -> Result<Self, ConfigError> {
        Ok(Self::new(RuleSet::new(default_correlation_rules())?, window))
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn update_rules(&self, rules: Vec<CorrelationRule>) -> Result<(), ConfigError> {
        let set = Arc::new(RuleSet::new(rules)?);
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = set;
        Ok(())
    }

    /// Evaluate every rule against primitive events inside `[now - window, now]`.
    ///
    /// Derived events never feed back into correlation. Malformed events are
    /// dropped with a warning.
    pub fn correlate_at(&self, events: &[Arc<ThreatEvent>], now: DateTime<Utc>) -> Vec<ThreatSignal> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        let cutoff = now - self.window;
        let candidates: Vec<&ThreatEvent> = events
            .iter()
            .map(Arc::as_ref)
            .filter(|e| e.timestamp >= cutoff && e.timestamp <= now && !e.is_derived())
            .filter(|e| {
                let ok = is_well_formed(e);
                if !ok {
                    self.malformed.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(threat_id = %e.id, "Dropping malformed event from correlation");
                }
                ok
            })
            .collect();

        let rules = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut derived = Vec::new();
        for rule in &rules.rules {
            for (group, members) in group_by_relation(&candidates, rule.relation) {
                if let Some(signal) = evaluate(rule, &group, &members, now) {
                    derived.push(signal);
                }
            }
        }

        if !derived.is_empty() {
            self.derived.fetch_add(derived.len() as u64, Ordering::Relaxed);
            tracing::info!(count = derived.len(), "Correlation produced derived events");
        }
        derived
    }
}

fn is_well_formed(event: &ThreatEvent) -> bool {
    !event.id.is_empty() && !event.threat_type.as_str().is_empty() && !event.source.trim().is_empty()
}

/// Group key to members, in deterministic key order.
fn group_by_relation<'a>(
    events: &[&'a ThreatEvent],
    relation: SourceRelation,
) -> BTreeMap<String, Vec<&'a ThreatEvent>> {
    let mut groups: BTreeMap<String, Vec<&ThreatEvent>> = BTreeMap::new();
    for event in events {
        let key = match relation {
            SourceRelation::SameSource => Some(event.source.clone()),
            SourceRelation::SameSubnet => subnet_24(&event.source),
            SourceRelation::Any => Some("*".to_string()),
        };
        if let Some(key) = key {
            groups.entry(key).or_default().push(*event);
        }
    }
    groups
}

/// `"a.b.c.0/24"` for an IPv4 address.
pub fn subnet_24(source: &str) -> Option<String> {
    let addr: std::net::Ipv4Addr = source.trim().parse().ok()?;
    let [a, b, c, _] = addr.octets();
    Some(format!("{a}.{b}.{c}.0/24"))
}

fn evaluate(
    rule: &CorrelationRule,
    group: &str,
    members: &[&ThreatEvent],
    now: DateTime<Utc>,
) -> Option<ThreatSignal> {
    let mut contributing: BTreeSet<&str> = BTreeSet::new();
    let mut surplus = 0usize;

    for req in &rule.requirements {
        let matching: Vec<&ThreatEvent> = members
            .iter()
            .copied()
            .filter(|e| req.types.contains(&e.threat_type))
            .collect();
        let count = if req.distinct_sources {
            matching.iter().map(|e| e.source.as_str()).collect::<HashSet<_>>().len()
        } else {
            matching.len()
        };
        if count < req.min_count {
            return None;
        }
        surplus += count - req.min_count;
        contributing.extend(matching.iter().map(|e| e.id.as_str()));
    }

    let ids: Vec<&str> = contributing.into_iter().collect();
    let confidence = (rule.base_confidence + CONFIDENCE_STEP * surplus as f64).min(MAX_CONFIDENCE);
    let source = match rule.relation {
        SourceRelation::Any => "multiple".to_string(),
        _ => group.to_string(),
    };

    Some(
        ThreatSignal::new(rule.derived_type.clone(), rule.severity, source, now)
            .with_subtype(rule.name.clone())
            .with_detail("rule", rule.name.clone())
            .with_detail("confidence", (confidence * 100.0).round() / 100.0)
            .with_detail("event_count", ids.len())
            .with_detail("contributing_events", ids.iter().map(|s| s.to_string()).collect::<Vec<_>>())
            .with_detail("description", rule.description.clone())
            .with_correlation_key(correlation_key(&rule.name, &ids)),
    )
}

/// SHA-256 over the rule name and sorted contributing ids.
pub fn correlation_key(rule: &str, sorted_ids: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rule.as_bytes());
    for id in sorted_ids {
        hasher.update(b"|");
        hasher.update(id.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

impl HealthReporter for Correlator {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn health(&self) -> ModuleHealth {
        let rules = self
            .rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        ModuleHealth::healthy(MODULE_NAME)
            .with_metric("rules", rules as f64)
            .with_metric("runs", self.runs.load(Ordering::Relaxed) as f64)
            .with_metric("derived", self.derived.load(Ordering::Relaxed) as f64)
            .with_metric("malformed_dropped", self.malformed.load(Ordering::Relaxed) as f64)
    }
}
