//! Threat events: the signal type shared by every detector and the registry.
//!
//! Detectors emit unregistered [`ThreatSignal`]s. The registry assigns an id
//! and freezes each one into a [`ThreatEvent`], which is read-only from then on.

use crate::error::EventError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str::FromStr;

/// Threat severity. Closed, totally ordered: `Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThreatSeverity {
    #[serde(alias = "low")]
    Low,
    #[serde(alias = "medium")]
    Medium,
    #[serde(alias = "high")]
    High,
    #[serde(alias = "critical")]
    Critical,
}

impl ThreatSeverity {
    /// All severities in ascending order.
    pub const ALL: [ThreatSeverity; 4] = [
        ThreatSeverity::Low,
        ThreatSeverity::Medium,
        ThreatSeverity::High,
        ThreatSeverity::Critical,
    ];
}

impl std::fmt::Display for ThreatSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ThreatSeverity::Low => write!(f, "LOW"),
            ThreatSeverity::Medium => write!(f, "MEDIUM"),
            ThreatSeverity::High => write!(f, "HIGH"),
            ThreatSeverity::Critical => write!(f, "CRITICAL"),
        }
    }
}

impl FromStr for ThreatSeverity {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(ThreatSeverity::Low),
            "medium" => Ok(ThreatSeverity::Medium),
            "high" => Ok(ThreatSeverity::High),
            "critical" => Ok(ThreatSeverity::Critical),
            other => Err(EventError::Malformed(format!("unknown severity '{other}'"))),
        }
    }
}

/// Threat classification.
///
/// String-backed so rule tables loaded from data can introduce new types.
/// Names are normalized to upper snake case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ThreatType(Cow<'static, str>);

impl ThreatType {
    pub const SQL_INJECTION: ThreatType = ThreatType::from_static("SQL_INJECTION");
    pub const CROSS_SITE_SCRIPTING: ThreatType = ThreatType::from_static("CROSS_SITE_SCRIPTING");
    pub const PATH_TRAVERSAL: ThreatType = ThreatType::from_static("PATH_TRAVERSAL");
    pub const COMMAND_INJECTION: ThreatType = ThreatType::from_static("COMMAND_INJECTION");
    pub const MALICIOUS_SCRIPT: ThreatType = ThreatType::from_static("MALICIOUS_SCRIPT");
    pub const SUSPICIOUS_AGENT: ThreatType = ThreatType::from_static("SUSPICIOUS_AGENT");
    pub const ANOMALY_DETECTED: ThreatType = ThreatType::from_static("ANOMALY_DETECTED");
    pub const DDOS_ATTACK: ThreatType = ThreatType::from_static("DDOS_ATTACK");
    pub const RATE_LIMIT_EXCEEDED: ThreatType = ThreatType::from_static("RATE_LIMIT_EXCEEDED");
    pub const GEO_BLOCKED: ThreatType = ThreatType::from_static("GEO_BLOCKED");
    pub const AUTH_FAILURE: ThreatType = ThreatType::from_static("AUTH_FAILURE");
    pub const THREAT_DETECTED: ThreatType = ThreatType::from_static("THREAT_DETECTED");
    pub const COORDINATED_ATTACK: ThreatType = ThreatType::from_static("COORDINATED_ATTACK");
    pub const DISTRIBUTED_ATTACK: ThreatType = ThreatType::from_static("DISTRIBUTED_ATTACK");
    pub const INJECTION_CAMPAIGN: ThreatType = ThreatType::from_static("INJECTION_CAMPAIGN");
    pub const ANOMALOUS_INTRUSION: ThreatType = ThreatType::from_static("ANOMALOUS_INTRUSION");
    pub const BLOCKED_SOURCE_ACTIVITY: ThreatType =
        ThreatType::from_static("BLOCKED_SOURCE_ACTIVITY");
    pub const RECONNAISSANCE: ThreatType = ThreatType::from_static("RECONNAISSANCE");

    const fn from_static(name: &'static str) -> Self {
        ThreatType(Cow::Borrowed(name))
    }

    /// Create a threat type from an arbitrary name.
    pub fn new(name: impl AsRef<str>) -> Self {
        let normalized = name
            .as_ref()
            .trim()
            .to_ascii_uppercase()
            .replace(['-', ' '], "_");
        ThreatType(Cow::Owned(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this type belongs to the injection family.
    pub fn is_injection(&self) -> bool {
        [
            ThreatType::SQL_INJECTION,
            ThreatType::CROSS_SITE_SCRIPTING,
            ThreatType::PATH_TRAVERSAL,
            ThreatType::COMMAND_INJECTION,
        ]
        .contains(self)
    }
}

impl std::fmt::Display for ThreatType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ThreatType {
    fn from(value: String) -> Self {
        ThreatType::new(value)
    }
}

impl From<&str> for ThreatType {
    fn from(value: &str) -> Self {
        ThreatType::new(value)
    }
}

impl From<ThreatType> for String {
    fn from(value: ThreatType) -> Self {
        value.0.into_owned()
    }
}

/// Free-form detail payload attached to a threat.
pub type ThreatDetail = BTreeMap<String, serde_json::Value>;

/// A detection that has not been registered yet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatSignal {
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub severity: ThreatSeverity,
    /// IP address or entity id.
    pub source: String,
    #[serde(default)]
    pub detail: ThreatDetail,
    pub timestamp: DateTime<Utc>,
    /// Set on derived (correlated) events; the registry dedupes on it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
}

impl ThreatSignal {
    pub fn new(
        threat_type: ThreatType,
        severity: ThreatSeverity,
        source: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            threat_type,
            subtype: None,
            severity,
            source: source.into(),
            detail: ThreatDetail::new(),
            timestamp,
            correlation_key: None,
        }
    }

    pub fn with_subtype(mut self, subtype: impl Into<String>) -> Self {
        self.subtype = Some(subtype.into());
        self
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_key(mut self, key: impl Into<String>) -> Self {
        self.correlation_key = Some(key.into());
        self
    }

    /// Check the fields every downstream consumer relies on.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.threat_type.as_str().is_empty() {
            return Err(EventError::MissingField("type"));
        }
        if self.source.trim().is_empty() {
            return Err(EventError::MissingField("source"));
        }
        if matches!(&self.correlation_key, Some(k) if k.is_empty()) {
            return Err(EventError::Malformed("empty correlation key".into()));
        }
        Ok(())
    }
}

/// A registered, immutable threat event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    pub severity: ThreatSeverity,
    pub source: String,
    #[serde(default)]
    pub detail: ThreatDetail,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_key: Option<String>,
}

impl ThreatEvent {
    pub(crate) fn from_signal(id: String, signal: ThreatSignal) -> Self {
        Self {
            id,
            threat_type: signal.threat_type,
            subtype: signal.subtype,
            severity: signal.severity,
            source: signal.source,
            detail: signal.detail,
            timestamp: signal.timestamp,
            correlation_key: signal.correlation_key,
        }
    }

    /// Whether this event was derived by correlation.
    pub fn is_derived(&self) -> bool {
        self.correlation_key.is_some()
    }

    /// String detail value, if present.
    pub fn detail_str(&self, key: &str) -> Option<&str> {
        self.detail.get(key).and_then(|v| v.as_str())
    }
}

/// Loosely-typed external threat report, as accepted by `report_threat`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawThreatReport {
    #[serde(default, rename = "type")]
    pub threat_type: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub detail: Option<ThreatDetail>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

impl RawThreatReport {
    /// Validate and convert into a signal. Severity defaults to `MEDIUM`.
    pub fn into_signal(self, now: DateTime<Utc>) -> Result<ThreatSignal, EventError> {
        let threat_type = self
            .threat_type
            .filter(|t| !t.trim().is_empty())
            .ok_or(EventError::MissingField("type"))?;
        let source = self
            .source
            .filter(|s| !s.trim().is_empty())
            .ok_or(EventError::MissingField("source"))?;
        let severity = match self.severity {
            Some(s) => s.parse()?,
            None => ThreatSeverity::Medium,
        };

        let mut signal = ThreatSignal::new(
            ThreatType::new(threat_type),
            severity,
            source.trim(),
            self.timestamp.unwrap_or(now),
        );
        signal.subtype = self.subtype;
        signal.detail = self.detail.unwrap_or_default();
        signal.validate()?;
        Ok(signal)
    }
}
