//! Configuration for the Warden engine.
//!
//! Loaded with `figment` in layers: built-in defaults, the user config file,
//! an explicit config file, then `WARDEN_`-prefixed environment variables
//! (`WARDEN_NETWORK__DDOS_THRESHOLD=200`). [`WardenConfig::validate`] must pass
//! before any monitoring starts.

use crate::correlation::{CorrelationRule, RuleSet as CorrelationRuleSet, default_correlation_rules};
use crate::detect::signature::{self, RuleSet as SignatureRuleSet, SignatureRule};
use crate::error::ConfigError;
use crate::event::ThreatSeverity;
use crate::response::{PlaybookPolicy, default_playbooks, validate_playbooks};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    pub monitoring: MonitoringConfig,
    pub signatures: SignatureConfig,
    pub behavior: BehaviorConfig,
    pub network: NetworkConfig,
    pub registry: RegistryConfig,
    pub correlation: CorrelationConfig,
    pub response: ResponseConfig,
    pub alerts: AlertsConfig,
    pub incidents: IncidentsConfig,
    pub posture: PostureConfig,
    pub gateway: GatewayConfig,
}

/// Periodic task cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub scan_interval_secs: u64,
    pub deep_analysis_interval_secs: u64,
    pub health_check_interval_secs: u64,
    /// Upper bound on draining the alert queue at shutdown.
    pub shutdown_timeout_secs: u64,
    /// Capacity of the script inspection queue.
    pub script_queue_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 5,
            deep_analysis_interval_secs: 60,
            health_check_interval_secs: 30,
            shutdown_timeout_secs: 10,
            script_queue_capacity: 64,
        }
    }
}

/// Signature rule sources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignatureConfig {
    /// Start from the built-in rule table.
    pub include_defaults: bool,
    /// TOML file with additional `[[rules]]`.
    pub rules_file: Option<PathBuf>,
    /// Inline rules.
    pub rules: Vec<SignatureRule>,
}

impl Default for SignatureConfig {
    fn default() -> Self {
        Self {
            include_defaults: true,
            rules_file: None,
            rules: Vec::new(),
        }
    }
}

impl SignatureConfig {
    /// Built-in rules, then the rules file, then inline rules.
    pub fn resolve_rules(&self) -> Result<Vec<SignatureRule>, ConfigError> {
        let mut rules = if self.include_defaults {
            signature::default_rules()
        } else {
            Vec::new()
        };
        if let Some(path) = &self.rules_file {
            rules.extend(signature::load_rules_file(path)?);
        }
        rules.extend(self.rules.iter().cloned());
        Ok(rules)
    }
}

/// Behavioral baseline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorConfig {
    /// Deviation, in standard deviations, that scores 1.0.
    pub k: f64,
    /// Observations needed before an entity can be scored.
    pub min_samples: u64,
    /// Lower bound applied to the standard deviation.
    pub std_floor: f64,
    /// Scores strictly above this raise `ANOMALY_DETECTED`.
    pub threshold: f64,
    /// Features used for scoring; empty means every observed feature.
    pub features: Vec<String>,
    /// Feed request-derived features during the scan loop.
    pub traffic_features: bool,
    pub profile_retention_secs: u64,
    pub max_profiles: usize,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            k: 3.0,
            min_samples: 10,
            std_floor: 0.1,
            threshold: 0.7,
            features: Vec::new(),
            traffic_features: true,
            profile_retention_secs: 86_400,
            max_profiles: 10_000,
        }
    }
}

/// Volume, rate, block, and geo policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// More than this many requests inside the window is a DDoS.
    pub ddos_threshold: usize,
    pub ddos_window_secs: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_secs: u64,
    pub block_ttl_secs: u64,
    /// ISO 3166-1 alpha-2 country codes.
    pub blocked_countries: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ddos_threshold: 100,
            ddos_window_secs: 60,
            rate_limit_max: 100,
            rate_limit_window_secs: 60,
            block_ttl_secs: 3_600,
            blocked_countries: Vec::new(),
        }
    }
}

/// Registry bounds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_active: usize,
    pub max_history: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_active: 1_000,
            max_history: 10_000,
        }
    }
}

/// Which pattern mining strategy the deep-analysis task uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternMinerKind {
    #[default]
    Noop,
    Frequency,
}

/// Correlation window and rule table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub window_secs: u64,
    pub include_defaults: bool,
    pub rules: Vec<CorrelationRule>,
    pub pattern_miner: PatternMinerKind,
    /// Events per source in the window that the frequency miner flags.
    pub frequency_threshold: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            include_defaults: true,
            rules: Vec::new(),
            pattern_miner: PatternMinerKind::Noop,
            frequency_threshold: 50,
        }
    }
}

impl CorrelationConfig {
    pub fn resolve_rules(&self) -> Vec<CorrelationRule> {
        let mut rules = if self.include_defaults {
            default_correlation_rules()
        } else {
            Vec::new()
        };
        rules.extend(self.rules.iter().cloned());
        rules
    }
}

/// Playbooks and action execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    pub playbooks: Vec<PlaybookPolicy>,
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Threats at or above this severity open an incident automatically.
    pub incident_min_severity: ThreatSeverity,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            playbooks: default_playbooks(),
            max_attempts: 3,
            retry_base_delay_ms: 200,
            retry_max_delay_ms: 5_000,
            incident_min_severity: ThreatSeverity::High,
        }
    }
}

/// Alert dispatch settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub cooldown_secs: u64,
    pub queue_capacity: usize,
    /// Delivery attempts per channel.
    pub max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    /// Per-type message templates keyed by threat type.
    pub templates: BTreeMap<String, String>,
    pub default_template: String,
    pub channels: ChannelsConfig,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: 60,
            queue_capacity: 256,
            max_attempts: 3,
            retry_base_delay_ms: 250,
            retry_max_delay_ms: 5_000,
            templates: BTreeMap::new(),
            default_template: crate::alerts::template::DEFAULT_TEMPLATE.to_string(),
            channels: ChannelsConfig::default(),
        }
    }
}

/// Notification channels. Console and display are on by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub console: bool,
    pub display: bool,
    pub display_capacity: usize,
    /// JSON-lines file alerts are appended to.
    pub store_path: Option<PathBuf>,
    pub webhook: Option<WebhookChannelConfig>,
    pub email: Option<EmailChannelConfig>,
    pub sms: Option<SmsChannelConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            console: true,
            display: true,
            display_capacity: 50,
            store_path: None,
            webhook: None,
            email: None,
            sms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    pub url: String,
    #[serde(default = "default_webhook_timeout")]
    pub timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    pub username: String,
    /// Usually supplied as `WARDEN_ALERTS__CHANNELS__EMAIL__PASSWORD`.
    #[serde(default)]
    pub password: String,
    pub from_address: String,
    pub recipients: Vec<String>,
}

fn default_smtp_port() -> u16 {
    587
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SmsChannelConfig {
    pub account_sid: String,
    #[serde(default)]
    pub auth_token: String,
    pub from_number: String,
    pub recipients: Vec<String>,
}

/// Incident store and routing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IncidentsConfig {
    /// JSON file incidents are persisted to.
    pub store_path: Option<PathBuf>,
    /// Closed incidents beyond this count are evicted oldest first.
    pub max_incidents: usize,
    pub default_team: String,
    /// Category to team routing table.
    pub teams: BTreeMap<String, String>,
}

impl Default for IncidentsConfig {
    fn default() -> Self {
        let teams = [
            ("injection", "application-security"),
            ("malware", "endpoint-security"),
            ("network", "network-operations"),
            ("access", "identity-and-access"),
            ("anomaly", "threat-intelligence"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        Self {
            store_path: None,
            max_incidents: 1_000,
            default_team: "security-operations".into(),
            teams,
        }
    }
}

/// Security posture weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostureConfig {
    pub critical_threat_penalty: f64,
    pub critical_finding_penalty: f64,
    /// Share of the final score taken from the audit compliance score.
    pub compliance_weight: f64,
    pub warning_module_penalty: f64,
    pub unhealthy_module_penalty: f64,
    pub error_module_penalty: f64,
}

impl Default for PostureConfig {
    fn default() -> Self {
        Self {
            critical_threat_penalty: 10.0,
            critical_finding_penalty: 5.0,
            compliance_weight: 0.3,
            warning_module_penalty: 2.0,
            unhealthy_module_penalty: 5.0,
            error_module_penalty: 10.0,
        }
    }
}

/// HTTP gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: "127.0.0.1:8088".into(),
        }
    }
}

impl GatewayConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|e| ConfigError::invalid("gateway.bind", format!("{e}")))
    }
}

impl WardenConfig {
    /// Fail closed on anything that would leave the engine with undefined
    /// behavior.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let m = &self.monitoring;
        positive("monitoring.scan_interval_secs", m.scan_interval_secs)?;
        positive("monitoring.deep_analysis_interval_secs", m.deep_analysis_interval_secs)?;
        positive("monitoring.health_check_interval_secs", m.health_check_interval_secs)?;
        positive("monitoring.shutdown_timeout_secs", m.shutdown_timeout_secs)?;
        positive("monitoring.script_queue_capacity", m.script_queue_capacity as u64)?;

        SignatureRuleSet::compile(self.signatures.resolve_rules()?)?;

        let b = &self.behavior;
        if !(b.k.is_finite() && b.k > 0.0) {
            return Err(ConfigError::invalid("behavior.k", "must be a positive number"));
        }
        if !(b.std_floor.is_finite() && b.std_floor > 0.0) {
            return Err(ConfigError::invalid("behavior.std_floor", "must be a positive number"));
        }
        if !(b.threshold > 0.0 && b.threshold < 1.0) {
            return Err(ConfigError::invalid("behavior.threshold", "must be in (0, 1)"));
        }
        positive("behavior.min_samples", b.min_samples)?;
        positive("behavior.max_profiles", b.max_profiles as u64)?;
        positive("behavior.profile_retention_secs", b.profile_retention_secs)?;

        let n = &self.network;
        positive("network.ddos_threshold", n.ddos_threshold as u64)?;
        positive("network.ddos_window_secs", n.ddos_window_secs)?;
        positive("network.rate_limit_max", u64::from(n.rate_limit_max))?;
        positive("network.rate_limit_window_secs", n.rate_limit_window_secs)?;
        positive("network.block_ttl_secs", n.block_ttl_secs)?;
        if let Some(code) = n.blocked_countries.iter().find(|c| c.trim().len() != 2) {
            return Err(ConfigError::invalid(
                "network.blocked_countries",
                format!("'{code}' is not a two-letter country code"),
            ));
        }

        positive("registry.max_active", self.registry.max_active as u64)?;
        positive("registry.max_history", self.registry.max_history as u64)?;

        positive("correlation.window_secs", self.correlation.window_secs)?;
        CorrelationRuleSet::new(self.correlation.resolve_rules())?;
        if self.correlation.pattern_miner == PatternMinerKind::Frequency {
            positive("correlation.frequency_threshold", self.correlation.frequency_threshold as u64)?;
        }

        validate_playbooks(&self.response.playbooks)?;
        positive("response.max_attempts", u64::from(self.response.max_attempts))?;

        let a = &self.alerts;
        if a.cooldown_secs > 86_400 {
            return Err(ConfigError::invalid("alerts.cooldown_secs", "must be at most 86400"));
        }
        positive("alerts.queue_capacity", a.queue_capacity as u64)?;
        crate::alerts::template::validate_templates(&a.default_template, &a.templates)?;
        positive("alerts.max_attempts", u64::from(a.max_attempts))?;
        positive("alerts.channels.display_capacity", a.channels.display_capacity as u64)?;
        if let Some(webhook) = &a.channels.webhook {
            if !(webhook.url.starts_with("http://") || webhook.url.starts_with("https://")) {
                return Err(ConfigError::invalid("alerts.channels.webhook.url", "must be an http(s) URL"));
            }
        }
        if let Some(email) = &a.channels.email {
            if email.smtp_host.is_empty() || email.recipients.is_empty() {
                return Err(ConfigError::invalid(
                    "alerts.channels.email",
                    "smtp_host and at least one recipient are required",
                ));
            }
        }
        if let Some(sms) = &a.channels.sms {
            if sms.account_sid.is_empty() || sms.recipients.is_empty() {
                return Err(ConfigError::invalid(
                    "alerts.channels.sms",
                    "account_sid and at least one recipient are required",
                ));
            }
        }

        positive("incidents.max_incidents", self.incidents.max_incidents as u64)?;
        if self.incidents.default_team.trim().is_empty() {
            return Err(ConfigError::invalid("incidents.default_team", "must not be empty"));
        }

        let p = &self.posture;
        for (field, value) in [
            ("posture.critical_threat_penalty", p.critical_threat_penalty),
            ("posture.critical_finding_penalty", p.critical_finding_penalty),
            ("posture.warning_module_penalty", p.warning_module_penalty),
            ("posture.unhealthy_module_penalty", p.unhealthy_module_penalty),
            ("posture.error_module_penalty", p.error_module_penalty),
        ] {
            if !(value.is_finite() && (0.0..=100.0).contains(&value)) {
                return Err(ConfigError::invalid(field, "must be between 0 and 100"));
            }
        }
        if !(0.0..=1.0).contains(&p.compliance_weight) {
            return Err(ConfigError::invalid("posture.compliance_weight", "must be between 0 and 1"));
        }

        if self.gateway.enabled {
            self.gateway.socket_addr()?;
        }
        Ok(())
    }
}

fn positive(field: &str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        Err(ConfigError::invalid(field, "must be greater than zero"))
    } else {
        Ok(())
    }
}

/// Path of the user-level config file, if a home directory can be determined.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "warden", "warden")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load configuration from defaults, the user config, `explicit`, and the environment.
pub fn load_config(explicit: Option<&Path>) -> Result<WardenConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(WardenConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if let Some(path) = explicit {
        if !path.exists() {
            return Err(ConfigError::Load(format!(
                "config file '{}' does not exist",
                path.display()
            )));
        }
        figment = figment.merge(Toml::file(path));
    }

    // WARDEN_NETWORK__DDOS_THRESHOLD, WARDEN_ALERTS__COOLDOWN_SECS, ...
    figment = figment.merge(Env::prefixed("WARDEN_").split("__"));

    figment
        .extract()
        .map_err(|e| ConfigError::Load(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ActionKind;

    #[test]
    fn test_defaults_validate() {
        assert!(WardenConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_values() {
        let config = WardenConfig::default();
        assert_eq!(config.monitoring.scan_interval_secs, 5);
        assert_eq!(config.behavior.min_samples, 10);
        assert_eq!(config.network.ddos_threshold, 100);
        assert_eq!(config.registry.max_active, 1_000);
        assert_eq!(config.alerts.cooldown_secs, 60);
        assert_eq!(config.response.incident_min_severity, ThreatSeverity::High);
        assert!((config.posture.compliance_weight - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = WardenConfig::default();
        config.monitoring.scan_interval_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("monitoring.scan_interval_secs"));
    }

    #[test]
    fn test_invalid_signature_pattern_rejected() {
        let mut config = WardenConfig::default();
        config.signatures.rules.push(SignatureRule::new(
            "broken",
            "[unclosed",
            crate::event::ThreatType::SQL_INJECTION,
            ThreatSeverity::High,
            &[signature::ScanField::Body],
        ));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_missing_playbook_rejected() {
        let mut config = WardenConfig::default();
        config
            .response
            .playbooks
            .retain(|p| p.severity != ThreatSeverity::Medium);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingPlaybook(ThreatSeverity::Medium))
        ));
    }

    #[test]
    fn test_duplicate_playbook_rejected() {
        let mut config = WardenConfig::default();
        config.response.playbooks.push(PlaybookPolicy {
            severity: ThreatSeverity::Low,
            actions: vec![ActionKind::LogIncident],
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePlaybook(ThreatSeverity::Low))
        ));
    }

    #[test]
    fn test_out_of_range_values_rejected() {
        let mut config = WardenConfig::default();
        config.posture.compliance_weight = 1.5;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.behavior.threshold = 1.0;
        assert!(config.validate().is_err());

        let mut config = WardenConfig::default();
        config.network.blocked_countries = vec!["Narnia".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("warden.toml");
        std::fs::write(
            &path,
            r#"
[network]
ddos_threshold = 250
blocked_countries = ["KP"]

[alerts]
cooldown_secs = 120

[[response.playbooks]]
severity = "low"
actions = ["log_incident"]

[[response.playbooks]]
severity = "medium"
actions = ["log_incident"]

[[response.playbooks]]
severity = "high"
actions = ["block_source", "log_incident"]

[[response.playbooks]]
severity = "critical"
actions = ["block_source", "notify", "log_incident"]
"#,
        )
        .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.network.ddos_threshold, 250);
        assert_eq!(config.network.blocked_countries, vec!["KP".to_string()]);
        assert_eq!(config.alerts.cooldown_secs, 120);
        // untouched sections keep defaults
        assert_eq!(config.registry.max_history, 10_000);
        assert_eq!(config.response.playbooks.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_missing_explicit_file() {
        let result = load_config(Some(Path::new("/nonexistent/warden.toml")));
        assert!(matches!(result, Err(ConfigError::Load(_))));
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = WardenConfig::default();
        let text = toml::to_string(&config).unwrap();
        let parsed: WardenConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_gateway_bind_validated_when_enabled() {
        let mut config = WardenConfig::default();
        config.gateway.enabled = true;
        config.gateway.bind = "not-an-address".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_alert_templates_must_compile() {
        let mut config = WardenConfig::default();
        config
            .alerts
            .templates
            .insert("SQL_INJECTION".into(), "SQLi from {{source}}".into());
        assert!(config.validate().is_ok());

        config.alerts.default_template = "{{#each detail}}unclosed".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field, .. }) if field == "alerts.default_template"
        ));
    }
}
