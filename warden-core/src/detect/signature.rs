//! Signature detection: data-driven pattern rules over request fields and scripts.
//!
//! Rules are `(name, pattern, type, severity)` records compiled with `regex`.
//! They can be replaced at runtime with [`SignatureDetector::update_rules`];
//! an invalid replacement set is rejected and the current rules stay in place.

use super::{Detector, truncate};
use crate::collaborators::RequestRecord;
use crate::error::{ConfigError, DetectorError};
use crate::event::{ThreatSeverity, ThreatSignal, ThreatType};
use crate::health::{HealthReporter, HealthStatus, ModuleHealth};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

const MODULE_NAME: &str = "signatures";
const MAX_EVIDENCE_LEN: usize = 120;

/// Input field a rule is tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanField {
    Url,
    Headers,
    Body,
    UserAgent,
    Script,
}

impl ScanField {
    /// Fixed order in which request fields are tested.
    pub const REQUEST_ORDER: [ScanField; 4] = [
        ScanField::Url,
        ScanField::Headers,
        ScanField::Body,
        ScanField::UserAgent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanField::Url => "url",
            ScanField::Headers => "headers",
            ScanField::Body => "body",
            ScanField::UserAgent => "user_agent",
            ScanField::Script => "script",
        }
    }
}

/// A signature rule as stored in configuration or a rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignatureRule {
    pub name: String,
    pub pattern: String,
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    pub severity: ThreatSeverity,
    /// Fields this rule applies to.
    #[serde(default = "default_request_fields")]
    pub fields: Vec<ScanField>,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_request_fields() -> Vec<ScanField> {
    vec![ScanField::Url, ScanField::Body]
}

fn default_true() -> bool {
    true
}

impl SignatureRule {
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        threat_type: ThreatType,
        severity: ThreatSeverity,
        fields: &[ScanField],
    ) -> Self {
        Self {
            name: name.into(),
            pattern: pattern.into(),
            threat_type,
            severity,
            fields: fields.to_vec(),
            description: String::new(),
            enabled: true,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

struct CompiledRule {
    rule: SignatureRule,
    regex: Regex,
}

/// A validated, compiled rule set.
pub struct RuleSet {
    rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// Compile rules, rejecting unnamed, duplicated, or unparseable entries.
    /// Disabled rules are validated but not kept.
    pub fn compile(rules: Vec<SignatureRule>) -> Result<Self, ConfigError> {
        let mut seen = HashSet::new();
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::UnnamedRule);
            }
            if !seen.insert(rule.name.clone()) {
                return Err(ConfigError::DuplicateRule(rule.name));
            }
            let regex = Regex::new(&rule.pattern).map_err(|e| ConfigError::InvalidPattern {
                rule: rule.name.clone(),
                message: e.to_string(),
            })?;
            if rule.fields.is_empty() {
                return Err(ConfigError::invalid(
                    format!("signatures.rules.{}.fields", rule.name),
                    "at least one field is required",
                ));
            }
            if rule.enabled {
                compiled.push(CompiledRule { rule, regex });
            }
        }
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rules: Vec<SignatureRule>,
}

/// Read `[[rules]]` tables from a TOML file.
pub fn load_rules_file(path: &Path) -> Result<Vec<SignatureRule>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::RulesFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    let parsed: RulesFile = toml::from_str(&content).map_err(|e| ConfigError::RulesFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    Ok(parsed.rules)
}

/// Pattern-matching detector for requests and scripts.
pub struct SignatureDetector {
    rules: RwLock<Arc<RuleSet>>,
    scans: AtomicU64,
    matches: AtomicU64,
}

impl SignatureDetector {
    pub fn new(rules: Vec<SignatureRule>) -> Result<Self, ConfigError> {
        Ok(Self {
            rules: RwLock::new(Arc::new(RuleSet::compile(rules)?)),
            scans: AtomicU64::new(0),
            matches: AtomicU64::new(0),
        })
    }

    /// Detector loaded with [`default_rules`].
    pub fn with_defaults() -> Result<Self, ConfigError> {
        Self::new(default_rules())
    }

    /// Swap in a new rule set. On error the current rules are kept.
    pub fn update_rules(&self, rules: Vec<SignatureRule>) -> Result<(), ConfigError> {
        let compiled = Arc::new(RuleSet::compile(rules)?);
        let count = compiled.len();
        *self.rules.write().unwrap_or_else(PoisonError::into_inner) = compiled;
        tracing::info!(rules = count, "Signature rules updated");
        Ok(())
    }

    pub fn rule_names(&self) -> Vec<String> {
        self.current()
            .rules
            .iter()
            .map(|c| c.rule.name.clone())
            .collect()
    }

    fn current(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Test every rule against every non-empty request field.
    ///
    /// Fields are tested in [`ScanField::REQUEST_ORDER`] and rules in table
    /// order, so identical input always yields the same signals in the same
    /// order. Every matching (field, rule) pair produces one signal.
    pub fn scan_request(&self, request: &RequestRecord) -> Vec<ThreatSignal> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        let rules = self.current();
        let mut signals = Vec::new();

        for field in ScanField::REQUEST_ORDER {
            let Some(text) = request_field(request, field) else {
                continue;
            };
            for compiled in rules.rules.iter().filter(|c| c.rule.fields.contains(&field)) {
                if let Some(m) = compiled.regex.find(&text) {
                    signals.push(
                        signal_for(&compiled.rule, &request.ip, request.timestamp, field, m.as_str())
                            .with_detail("method", request.method.clone())
                            .with_detail("url", truncate(&request.url, MAX_EVIDENCE_LEN)),
                    );
                }
            }
        }

        self.record_matches(signals.len());
        signals
    }

    pub fn scan_script(&self, content: &str, origin: &str) -> Vec<ThreatSignal> {
        self.scan_script_at(content, origin, Utc::now())
    }

    /// Test script rules against executable content pushed by a host.
    pub fn scan_script_at(
        &self,
        content: &str,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Vec<ThreatSignal> {
        self.scans.fetch_add(1, Ordering::Relaxed);
        if content.trim().is_empty() {
            return Vec::new();
        }
        let source = if origin.trim().is_empty() {
            "unknown-origin"
        } else {
            origin
        };

        let signals: Vec<ThreatSignal> = self
            .current()
            .rules
            .iter()
            .filter(|c| c.rule.fields.contains(&ScanField::Script))
            .filter_map(|c| {
                c.regex.find(content).map(|m| {
                    signal_for(&c.rule, source, now, ScanField::Script, m.as_str())
                        .with_detail("origin", source.to_string())
                })
            })
            .collect();

        self.record_matches(signals.len());
        signals
    }

    fn record_matches(&self, count: usize) {
        if count > 0 {
            self.matches.fetch_add(count as u64, Ordering::Relaxed);
        }
    }
}

fn signal_for(
    rule: &SignatureRule,
    source: &str,
    timestamp: DateTime<Utc>,
    field: ScanField,
    matched: &str,
) -> ThreatSignal {
    let mut signal = ThreatSignal::new(rule.threat_type.clone(), rule.severity, source, timestamp)
        .with_subtype(rule.name.clone())
        .with_detail("rule", rule.name.clone())
        .with_detail("field", field.as_str())
        .with_detail("matched", truncate(matched, MAX_EVIDENCE_LEN));
    if !rule.description.is_empty() {
        signal = signal.with_detail("description", rule.description.clone());
    }
    signal
}

/// Text of a request field, percent-decoded where attackers commonly encode.
fn request_field(request: &RequestRecord, field: ScanField) -> Option<Cow<'_, str>> {
    let text: Cow<'_, str> = match field {
        ScanField::Url => decode(&request.url),
        ScanField::Body => decode(&request.body),
        ScanField::UserAgent => {
            if request.user_agent.is_empty() {
                request
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("user-agent"))
                    .map(|(_, v)| Cow::Borrowed(v.as_str()))
                    .unwrap_or(Cow::Borrowed(""))
            } else {
                Cow::Borrowed(request.user_agent.as_str())
            }
        }
        ScanField::Headers => Cow::Owned(
            request
                .headers
                .iter()
                .map(|(k, v)| format!("{k}: {v}"))
                .collect::<Vec<_>>()
                .join("\n"),
        ),
        ScanField::Script => return None,
    };
    if text.trim().is_empty() { None } else { Some(text) }
}

fn decode(raw: &str) -> Cow<'_, str> {
    if !raw.contains('%') && !raw.contains('+') {
        return Cow::Borrowed(raw);
    }
    let spaced = raw.replace('+', " ");
    Cow::Owned(String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned())
}

impl HealthReporter for SignatureDetector {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn health(&self) -> ModuleHealth {
        let rules = self.current();
        let mut health = ModuleHealth::healthy(MODULE_NAME)
            .with_metric("rules", rules.len() as f64)
            .with_metric("scans", self.scans.load(Ordering::Relaxed) as f64)
            .with_metric("matches", self.matches.load(Ordering::Relaxed) as f64);
        if rules.is_empty() {
            health = health.with_issue(HealthStatus::Warning, "no signature rules loaded");
        }
        health
    }
}

impl Detector for SignatureDetector {
    fn inspect_request(
        &self,
        request: &RequestRecord,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ThreatSignal>, DetectorError> {
        Ok(self.scan_request(request))
    }
}

/// Built-in rule table.
pub fn default_rules() -> Vec<SignatureRule> {
    use ScanField::*;
    use ThreatSeverity::*;

    let request = [Url, Body];
    vec![
        // SQL injection
        SignatureRule::new(
            "sql_tautology",
            r#"(?i)'\s*(or|and)\s+['"]?\w+['"]?\s*=\s*['"]?\w+"#,
            ThreatType::SQL_INJECTION,
            Critical,
            &[Url, Body, Headers],
        )
        .with_description("Boolean tautology used to bypass a WHERE clause"),
        SignatureRule::new(
            "sql_union_select",
            r"(?i)\bunion\b(\s+all)?\s+select\b",
            ThreatType::SQL_INJECTION,
            Critical,
            &request,
        )
        .with_description("UNION-based data extraction"),
        SignatureRule::new(
            "sql_stacked_query",
            r"(?i);\s*(drop|delete|truncate|alter|insert|update)\s+\w+",
            ThreatType::SQL_INJECTION,
            High,
            &request,
        ),
        SignatureRule::new(
            "sql_time_based",
            r#"(?i)\b(sleep|benchmark|pg_sleep|waitfor\s+delay)\s*[\('"]"#,
            ThreatType::SQL_INJECTION,
            High,
            &request,
        ),
        // Cross-site scripting
        SignatureRule::new(
            "xss_script_tag",
            r"(?i)<\s*script\b",
            ThreatType::CROSS_SITE_SCRIPTING,
            High,
            &[Url, Body, Headers],
        ),
        SignatureRule::new(
            "xss_event_handler",
            r"(?i)<[^>]+\bon(error|load|click|mouseover|focus)\s*=",
            ThreatType::CROSS_SITE_SCRIPTING,
            High,
            &request,
        ),
        SignatureRule::new(
            "xss_javascript_uri",
            r"(?i)javascript\s*:",
            ThreatType::CROSS_SITE_SCRIPTING,
            Medium,
            &request,
        ),
        // Path traversal
        SignatureRule::new(
            "path_traversal_dotdot",
            r"(\.\./|\.\.\\){2,}",
            ThreatType::PATH_TRAVERSAL,
            High,
            &request,
        ),
        SignatureRule::new(
            "path_traversal_sensitive_file",
            r"(?i)(/etc/(passwd|shadow|hosts)\b|\bwin\.ini\b)",
            ThreatType::PATH_TRAVERSAL,
            Critical,
            &request,
        ),
        // Command injection
        SignatureRule::new(
            "command_chaining",
            r"(?i)(;|&&|\|\||\$\(|`)\s*(cat|ls|rm|wget|curl|nc|bash|sh|whoami|id|uname)\b",
            ThreatType::COMMAND_INJECTION,
            Critical,
            &request,
        ),
        // Scanners and attack tooling
        SignatureRule::new(
            "scanner_user_agent",
            r"(?i)(sqlmap|nikto|nmap|masscan|acunetix|nessus|dirbuster|gobuster|wpscan|zgrab)",
            ThreatType::SUSPICIOUS_AGENT,
            Medium,
            &[UserAgent],
        ),
        // Executable content
        SignatureRule::new(
            "script_obfuscated_eval",
            r"(?i)eval\s*\(\s*(atob|unescape|String\.fromCharCode)\s*\(",
            ThreatType::MALICIOUS_SCRIPT,
            Critical,
            &[Script],
        ),
        SignatureRule::new(
            "script_cookie_exfiltration",
            r"(?i)(fetch|sendBeacon|new\s+Image)[\s\S]{0,120}document\.cookie|document\.cookie[\s\S]{0,120}(fetch|sendBeacon|XMLHttpRequest)",
            ThreatType::MALICIOUS_SCRIPT,
            High,
            &[Script],
        ),
        SignatureRule::new(
            "script_crypto_miner",
            r"(?i)(coinhive|coin-hive|cryptonight|webminepool|minero\.cc)",
            ThreatType::MALICIOUS_SCRIPT,
            High,
            &[Script],
        ),
        SignatureRule::new(
            "script_keylogger",
            r#"(?i)addEventListener\s*\(\s*['"]key(down|press|up)['"][\s\S]{0,200}(fetch|XMLHttpRequest|sendBeacon)"#,
            ThreatType::MALICIOUS_SCRIPT,
            High,
            &[Script],
        ),
        SignatureRule::new(
            "script_dynamic_function",
            r"(?i)new\s+Function\s*\(",
            ThreatType::MALICIOUS_SCRIPT,
            Medium,
            &[Script],
        ),
    ]
}
