//! Pluggable analytics strategies for the deep-analysis task.
//!
//! Both strategies default to no-ops; the coordinator calls them without
//! knowing which implementation it holds.

use crate::correlation::correlation_key;
use crate::event::{ThreatEvent, ThreatSeverity, ThreatSignal, ThreatType};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Finds higher-level patterns in a window of events.
pub trait PatternMiner: Send + Sync {
    fn name(&self) -> &str;
    fn mine(&self, events: &[Arc<ThreatEvent>], now: DateTime<Utc>) -> Vec<ThreatSignal>;
}

/// A forecast produced by a [`ThreatPredictor`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatPrediction {
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// 0..=1.
    pub likelihood: f64,
    pub horizon_secs: u64,
    #[serde(default)]
    pub rationale: String,
}

/// Forecasts likely upcoming threats.
pub trait ThreatPredictor: Send + Sync {
    fn name(&self) -> &str;
    fn predict(&self, events: &[Arc<ThreatEvent>], now: DateTime<Utc>) -> Vec<ThreatPrediction>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPatternMiner;

impl PatternMiner for NoopPatternMiner {
    fn name(&self) -> &str {
        "noop"
    }

    fn mine(&self, _events: &[Arc<ThreatEvent>], _now: DateTime<Utc>) -> Vec<ThreatSignal> {
        Vec::new()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopThreatPredictor;

impl ThreatPredictor for NoopThreatPredictor {
    fn name(&self) -> &str {
        "noop"
    }

    fn predict(&self, _events: &[Arc<ThreatEvent>], _now: DateTime<Utc>) -> Vec<ThreatPrediction> {
        Vec::new()
    }
}

/// Flags sources with more than `threshold` primitive events in the window.
///
/// Raises at most one `RECONNAISSANCE` signal per source per window-aligned
/// bucket.
#[derive(Debug, Clone)]
pub struct FrequencyPatternMiner {
    threshold: usize,
    window: Duration,
}

impl FrequencyPatternMiner {
    pub fn new(threshold: usize, window: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            window,
        }
    }
}

impl PatternMiner for FrequencyPatternMiner {
    fn name(&self) -> &str {
        "frequency"
    }

    fn mine(&self, events: &[Arc<ThreatEvent>], now: DateTime<Utc>) -> Vec<ThreatSignal> {
        let cutoff = now - self.window;
        let mut per_source: BTreeMap<&str, BTreeMap<&str, usize>> = BTreeMap::new();
        for event in events
            .iter()
            .filter(|e| !e.is_derived() && e.timestamp >= cutoff && e.timestamp <= now)
        {
            *per_source
                .entry(event.source.as_str())
                .or_default()
                .entry(event.threat_type.as_str())
                .or_default() += 1;
        }

        let window_secs = self.window.num_seconds().max(1);
        let bucket = now.timestamp().div_euclid(window_secs).to_string();

        per_source
            .into_iter()
            .filter_map(|(source, types)| {
                let total: usize = types.values().sum();
                if total <= self.threshold {
                    return None;
                }
                let breakdown: serde_json::Map<String, serde_json::Value> = types
                    .into_iter()
                    .map(|(t, c)| (t.to_string(), serde_json::Value::from(c)))
                    .collect();
                Some(
                    ThreatSignal::new(ThreatType::RECONNAISSANCE, ThreatSeverity::Medium, source, now)
                        .with_subtype("high_event_frequency")
                        .with_detail("event_count", total)
                        .with_detail("threshold", self.threshold)
                        .with_detail("by_type", serde_json::Value::Object(breakdown))
                        .with_correlation_key(correlation_key("frequency_miner", &[source, bucket.as_str()])),
                )
            })
            .collect()
    }
}
