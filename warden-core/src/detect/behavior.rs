//! Behavioral baselines with streaming statistics.
//!
//! Each entity gets a profile of per-feature running mean and variance
//! (Welford's algorithm). No raw history is kept. A feature with fewer than
//! `min_samples` values is still forming its baseline and is never scored, even
//! when other features of the same profile are mature.

use super::Detector;
use crate::collaborators::RequestRecord;
use crate::config::BehaviorConfig;
use crate::error::DetectorError;
use crate::event::{ThreatSeverity, ThreatSignal, ThreatType};
use crate::health::{HealthReporter, HealthStatus, ModuleHealth};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

const MODULE_NAME: &str = "behavior";
const HIGH_SEVERITY_SCORE: f64 = 0.95;

/// One observation: feature name to value.
pub type BehaviorObservation = BTreeMap<String, f64>;

/// Running statistics for a single feature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    /// Sum of squared differences from the mean.
    m2: f64,
    pub count: u64,
}

impl FeatureStats {
    pub fn update(&mut self, value: f64) {
        self.count += 1;
        let delta = value - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (value - self.mean);
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            (self.m2 / self.count as f64).max(0.0)
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn is_mature(&self, min_samples: u64) -> bool {
        self.count >= min_samples
    }
}

/// Baseline for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub entity_id: String,
    pub features: BTreeMap<String, FeatureStats>,
    pub sample_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl BehaviorProfile {
    fn new(entity_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.to_string(),
            features: BTreeMap::new(),
            sample_count: 0,
            last_updated: now,
        }
    }

    fn update(&mut self, observation: &BehaviorObservation, now: DateTime<Utc>) {
        for (name, value) in observation.iter().filter(|(_, v)| v.is_finite()) {
            self.features.entry(name.clone()).or_default().update(*value);
        }
        self.sample_count += 1;
        self.last_updated = now;
    }
}

/// Anomaly score of `observation` against `profile`, in `[0, 1]`.
///
/// Averages `min(|x - mean| / (k * max(sd, std_floor)), 1)` over the scored
/// features present in the observation with a mature baseline. Features listed
/// in `config.features` restrict the set; an empty list scores every feature.
pub fn anomaly_score(
    profile: &BehaviorProfile,
    observation: &BehaviorObservation,
    config: &BehaviorConfig,
) -> f64 {
    let components = score_components(profile, observation, config);
    if components.is_empty() {
        0.0
    } else {
        components.iter().map(|(_, c)| c).sum::<f64>() / components.len() as f64
    }
}

/// `(feature, component)` for every scorable feature of the observation.
fn score_components<'a>(
    profile: &BehaviorProfile,
    observation: &'a BehaviorObservation,
    config: &BehaviorConfig,
) -> Vec<(&'a str, f64)> {
    observation
        .iter()
        .filter(|(name, value)| {
            value.is_finite() && (config.features.is_empty() || config.features.contains(*name))
        })
        .filter_map(|(name, value)| {
            let stats = profile
                .features
                .get(name)
                .filter(|s| s.is_mature(config.min_samples))?;
            let spread = config.k * stats.std_dev().max(config.std_floor);
            Some((name.as_str(), ((value - stats.mean).abs() / spread).min(1.0)))
        })
        .collect()
}

/// Per-entity streaming baseline and deviation scoring.
pub struct BehaviorAnalyzer {
    config: BehaviorConfig,
    profiles: Mutex<HashMap<String, BehaviorProfile>>,
    observations: AtomicU64,
    anomalies: AtomicU64,
    evictions: AtomicU64,
}

impl BehaviorAnalyzer {
    pub fn new(config: BehaviorConfig) -> Self {
        Self {
            config,
            profiles: Mutex::new(HashMap::new()),
            observations: AtomicU64::new(0),
            anomalies: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &BehaviorConfig {
        &self.config
    }

    pub fn observe(&self, entity_id: &str, features: &BehaviorObservation) -> Option<ThreatSignal> {
        self.observe_at(entity_id, features, Utc::now())
    }

    /// Score the observation against the current baseline, then fold it in.
    ///
    /// Returns `None` while no feature of the observation has a mature baseline.
    pub fn observe_at(
        &self,
        entity_id: &str,
        features: &BehaviorObservation,
        now: DateTime<Utc>,
    ) -> Option<ThreatSignal> {
        self.observations.fetch_add(1, Ordering::Relaxed);
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);

        if !profiles.contains_key(entity_id) && profiles.len() >= self.config.max_profiles {
            self.evict_oldest(&mut profiles);
        }
        let profile = profiles
            .entry(entity_id.to_string())
            .or_insert_with(|| BehaviorProfile::new(entity_id, now));

        let components = score_components(profile, features, &self.config);
        if components.is_empty() {
            profile.update(features, now);
            return None;
        }

        let score = components.iter().map(|(_, c)| c).sum::<f64>() / components.len() as f64;
        let sample_count = profile.sample_count;
        let deviating: Vec<String> = components
            .iter()
            .filter(|(_, c)| *c >= 1.0)
            .map(|(name, _)| name.to_string())
            .collect();
        profile.update(features, now);
        drop(profiles);

        if score <= self.config.threshold {
            return None;
        }

        self.anomalies.fetch_add(1, Ordering::Relaxed);
        let severity = if score >= HIGH_SEVERITY_SCORE {
            ThreatSeverity::High
        } else {
            ThreatSeverity::Medium
        };
        tracing::debug!(entity = entity_id, score, "Behavioral anomaly");
        Some(
            ThreatSignal::new(ThreatType::ANOMALY_DETECTED, severity, entity_id, now)
                .with_subtype("behavioral_deviation")
                .with_detail("score", (score * 1000.0).round() / 1000.0)
                .with_detail("deviating_features", deviating)
                .with_detail("baseline_samples", sample_count),
        )
    }

    /// Features derived from a request: URL length, body length, header count.
    pub fn request_features(request: &RequestRecord) -> BehaviorObservation {
        BTreeMap::from([
            ("url_length".to_string(), request.url.len() as f64),
            ("body_length".to_string(), request.body.len() as f64),
            ("header_count".to_string(), request.headers.len() as f64),
        ])
    }

    pub fn profile(&self, entity_id: &str) -> Option<BehaviorProfile> {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(entity_id)
            .cloned()
    }

    pub fn profile_count(&self) -> usize {
        self.profiles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Drop profiles idle longer than the retention period. Returns the count removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - crate::seconds(self.config.profile_retention_secs);
        let mut profiles = self.profiles.lock().unwrap_or_else(PoisonError::into_inner);
        let before = profiles.len();
        profiles.retain(|_, p| p.last_updated >= cutoff);
        let removed = before - profiles.len();
        if removed > 0 {
            tracing::debug!(removed, "Expired behavior profiles");
        }
        removed
    }

    fn evict_oldest(&self, profiles: &mut HashMap<String, BehaviorProfile>) {
        let oldest = profiles
            .values()
            .min_by_key(|p| p.last_updated)
            .map(|p| p.entity_id.clone());
        if let Some(entity) = oldest {
            profiles.remove(&entity);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

impl HealthReporter for BehaviorAnalyzer {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn health(&self) -> ModuleHealth {
        let profiles = self.profile_count();
        let mut health = ModuleHealth::healthy(MODULE_NAME)
            .with_metric("profiles", profiles as f64)
            .with_metric("observations", self.observations.load(Ordering::Relaxed) as f64)
            .with_metric("anomalies", self.anomalies.load(Ordering::Relaxed) as f64)
            .with_metric("evictions", self.evictions.load(Ordering::Relaxed) as f64);
        if profiles >= self.config.max_profiles {
            health = health.with_issue(HealthStatus::Warning, "profile capacity reached");
        }
        health
    }
}

impl Detector for BehaviorAnalyzer {
    fn inspect_request(
        &self,
        request: &RequestRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<ThreatSignal>, DetectorError> {
        if !self.config.traffic_features {
            return Ok(Vec::new());
        }
        let features = Self::request_features(request);
        Ok(self.observe_at(&request.ip, &features, now).into_iter().collect())
    }
}
