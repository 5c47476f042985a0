//! Cooldown-based alert deduplication and channel fan-out.

use super::Alert;
use super::channels::NotificationChannel;
use super::template::TemplateSet;
use crate::config::AlertsConfig;
use crate::error::{AlertDeliveryError, ChannelError};
use crate::event::{ThreatEvent, ThreatType};
use crate::health::{HealthReporter, HealthStatus, ModuleHealth};
use crate::retry::{RetryPolicy, with_retry};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Dedup key for alerts about the same kind of threat from the same source.
pub fn cooldown_key(threat_type: &ThreatType, source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(threat_type.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(source.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Sent to every channel. Individual channels may still have failed.
    Dispatched(Alert),
    /// A previous alert with the same key is still cooling down.
    Suppressed {
        cooldown_key: String,
        last_dispatch: DateTime<Utc>,
    },
}

impl DispatchOutcome {
    pub fn alert(&self) -> Option<&Alert> {
        match self {
            DispatchOutcome::Dispatched(alert) => Some(alert),
            DispatchOutcome::Suppressed { .. } => None,
        }
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, DispatchOutcome::Suppressed { .. })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatcherMetrics {
    pub dispatched: u64,
    pub suppressed: u64,
    pub delivery_failures: u64,
    pub tracked_keys: usize,
}

pub struct AlertDispatcher {
    channels: Vec<Arc<dyn NotificationChannel>>,
    templates: TemplateSet,
    cooldown: Duration,
    retry: RetryPolicy,
    last_dispatch: Mutex<HashMap<String, DateTime<Utc>>>,
    next_id: AtomicU64,
    dispatched: AtomicU64,
    suppressed: AtomicU64,
    delivery_failures: AtomicU64,
}

impl AlertDispatcher {
    pub fn new(
        channels: Vec<Arc<dyn NotificationChannel>>,
        templates: TemplateSet,
        cooldown: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            channels,
            templates,
            cooldown,
            retry,
            last_dispatch: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            dispatched: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
            delivery_failures: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AlertsConfig, channels: Vec<Arc<dyn NotificationChannel>>) -> Self {
        Self::new(
            channels,
            TemplateSet::new(config.default_template.clone(), &config.templates),
            crate::seconds(config.cooldown_secs),
            RetryPolicy::new(
                config.max_attempts,
                config.retry_base_delay_ms,
                config.retry_max_delay_ms,
            ),
        )
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.name().to_string()).collect()
    }

    pub async fn dispatch(&self, threat: &ThreatEvent) -> DispatchOutcome {
        self.dispatch_at(threat, Utc::now()).await
    }

    pub async fn dispatch_at(&self, threat: &ThreatEvent, now: DateTime<Utc>) -> DispatchOutcome {
        let key = cooldown_key(&threat.threat_type, &threat.source);
        {
            let mut last = self
                .last_dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(previous) = last.get(&key).copied()
                && now - previous < self.cooldown
            {
                self.suppressed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(threat_id = %threat.id, cooldown_key = %key, "Alert suppressed by cooldown");
                return DispatchOutcome::Suppressed {
                    cooldown_key: key,
                    last_dispatch: previous,
                };
            }
            last.insert(key.clone(), now);
        }

        let id = format!("ALR-{:06}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut alert = Alert {
            id,
            threat_ref: threat.id.clone(),
            threat_type: threat.threat_type.clone(),
            severity: threat.severity,
            source: threat.source.clone(),
            message: self.templates.render(threat),
            channels_attempted: self.channel_names(),
            channels_delivered: Vec::new(),
            dispatched_at: now,
            cooldown_key: key,
        };

        let sends = self.channels.iter().map(|channel| {
            let alert = &alert;
            async move {
                let (result, attempts) = with_retry(
                    &self.retry,
                    channel.name(),
                    |e: &ChannelError| !matches!(e, ChannelError::NotConfigured { .. }),
                    || channel.send(alert),
                )
                .await;
                (channel.name().to_string(), result, attempts)
            }
        });
        let results = futures::future::join_all(sends).await;

        for (name, result, attempts) in results {
            match result {
                Ok(()) => alert.channels_delivered.push(name),
                Err(e) => {
                    self.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    let err = AlertDeliveryError::Exhausted {
                        channel: name,
                        attempts,
                        message: e.to_string(),
                    };
                    tracing::error!(alert_id = %alert.id, error = %err, "Alert delivery failed");
                }
            }
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            alert_id = %alert.id,
            threat_id = %alert.threat_ref,
            delivered = alert.channels_delivered.len(),
            attempted = alert.channels_attempted.len(),
            "Alert dispatched"
        );
        DispatchOutcome::Dispatched(alert)
    }

    /// Forget cooldown entries that can no longer suppress anything.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut last = self
            .last_dispatch
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = last.len();
        last.retain(|_, at| now - *at < self.cooldown);
        before - last.len()
    }

    pub fn metrics(&self) -> DispatcherMetrics {
        DispatcherMetrics {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
            tracked_keys: self
                .last_dispatch
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len(),
        }
    }
}

impl HealthReporter for AlertDispatcher {
    fn name(&self) -> &str {
        "alerts"
    }

    fn health(&self) -> ModuleHealth {
        let m = self.metrics();
        let mut health = ModuleHealth::healthy("alerts")
            .with_metric("dispatched", m.dispatched as f64)
            .with_metric("suppressed", m.suppressed as f64)
            .with_metric("delivery_failures", m.delivery_failures as f64)
            .with_metric("channels", self.channels.len() as f64);
        if self.channels.is_empty() {
            health = health.with_issue(HealthStatus::Warning, "no notification channels configured");
        }
        health
    }
}
