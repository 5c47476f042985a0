//! Handlebars message templates.
//!
//! The render context exposes `type`, `subtype`, `severity`, `source`,
//! `id`, `timestamp` and `detail.<key>`. Rendering is non-strict, so
//! unknown fields render as an empty string. Output is not HTML-escaped.

use crate::error::ConfigError;
use crate::event::{ThreatEvent, ThreatType};
use handlebars::{Handlebars, Template};
use serde_json::json;
use std::collections::BTreeMap;

pub const DEFAULT_TEMPLATE: &str =
    "[{{severity}}] {{type}} detected from {{source}} (threat {{id}} at {{timestamp}})";

const DEFAULT_NAME: &str = "default";

/// Per-type templates with a default fallback.
#[derive(Clone)]
pub struct TemplateSet {
    registry: Handlebars<'static>,
}

impl TemplateSet {
    /// Templates that fail to compile are skipped and fall back to the
    /// default; [`validate_templates`] rejects them at config time.
    pub fn new(default: impl Into<String>, templates: &BTreeMap<String, String>) -> Self {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(false);
        registry.register_escape_fn(handlebars::no_escape);

        let default = default.into();
        if let Err(e) = registry.register_template_string(DEFAULT_NAME, &default) {
            tracing::warn!(error = %e, "Default alert template does not compile, using built-in");
            let _ = registry.register_template_string(DEFAULT_NAME, DEFAULT_TEMPLATE);
        }
        for (ty, tpl) in templates {
            let name = ThreatType::new(ty).to_string();
            if let Err(e) = registry.register_template_string(&name, tpl) {
                tracing::warn!(threat_type = %name, error = %e, "Skipping alert template");
            }
        }
        Self { registry }
    }

    pub fn has_template_for(&self, threat_type: &ThreatType) -> bool {
        self.registry.has_template(threat_type.as_str())
    }

    pub fn render(&self, event: &ThreatEvent) -> String {
        let name = if self.has_template_for(&event.threat_type) {
            event.threat_type.as_str()
        } else {
            DEFAULT_NAME
        };
        self.registry
            .render(name, &context(event))
            .unwrap_or_else(|e| {
                tracing::warn!(template = name, error = %e, "Alert template failed to render");
                format!("[{}] {} detected from {}", event.severity, event.threat_type, event.source)
            })
    }
}

impl Default for TemplateSet {
    fn default() -> Self {
        Self::new(DEFAULT_TEMPLATE, &BTreeMap::new())
    }
}

impl std::fmt::Debug for TemplateSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.registry.get_templates().keys().collect();
        names.sort();
        f.debug_struct("TemplateSet").field("templates", &names).finish()
    }
}

fn context(event: &ThreatEvent) -> serde_json::Value {
    json!({
        "type": event.threat_type.as_str(),
        "subtype": event.subtype,
        "severity": event.severity.to_string(),
        "source": event.source,
        "id": event.id,
        "timestamp": event.timestamp.to_rfc3339(),
        "detail": event.detail,
    })
}

/// Compile every configured template so a bad one fails startup.
pub fn validate_templates(
    default: &str,
    templates: &BTreeMap<String, String>,
) -> Result<(), ConfigError> {
    Template::compile(default)
        .map_err(|e| ConfigError::invalid("alerts.default_template", e.to_string()))?;
    for (ty, tpl) in templates {
        Template::compile(tpl)
            .map_err(|e| ConfigError::invalid(format!("alerts.templates.{ty}"), e.to_string()))?;
    }
    Ok(())
}
