//! Threat registry: assigns ids, dedupes derived events, bounds memory.
//!
//! History and the active set are both FIFO-bounded. Derived events are
//! deduplicated on their correlation key for as long as the keyed event is
//! still in history.

use crate::config::RegistryConfig;
use crate::error::EventError;
use crate::event::{ThreatEvent, ThreatSeverity, ThreatSignal};
use crate::health::{HealthReporter, HealthStatus, ModuleHealth};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};

const MODULE_NAME: &str = "registry";

/// Result of registering a signal.
#[derive(Debug, Clone)]
pub enum Registration {
    New(Arc<ThreatEvent>),
    /// A derived event with the same correlation key already exists.
    Duplicate(String),
}

impl Registration {
    pub fn id(&self) -> &str {
        match self {
            Registration::New(event) => &event.id,
            Registration::Duplicate(id) => id,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Registration::New(_))
    }

    pub fn into_new(self) -> Option<Arc<ThreatEvent>> {
        match self {
            Registration::New(event) => Some(event),
            Registration::Duplicate(_) => None,
        }
    }
}

/// Registry counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryMetrics {
    pub total_registered: u64,
    pub active: usize,
    pub history: usize,
    pub duplicates_suppressed: u64,
    pub active_evicted: u64,
    pub history_evicted: u64,
    pub resolved: u64,
    pub by_type: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<ThreatSeverity, u64>,
    pub active_by_severity: BTreeMap<ThreatSeverity, usize>,
}

#[derive(Default)]
struct RegistryState {
    next_id: u64,
    history: VecDeque<Arc<ThreatEvent>>,
    active: VecDeque<Arc<ThreatEvent>>,
    correlation_keys: HashMap<String, String>,
    metrics: RegistryMetrics,
}

impl RegistryState {
    fn remove_key_of(&mut self, event: &ThreatEvent) {
        if let Some(key) = &event.correlation_key {
            if self.correlation_keys.get(key) == Some(&event.id) {
                self.correlation_keys.remove(key);
            }
        }
    }
}

/// Bounded store of registered threat events.
pub struct ThreatRegistry {
    config: RegistryConfig,
    state: Mutex<RegistryState>,
}

impl ThreatRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            state: Mutex::new(RegistryState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Validate, assign an id, and store. A correlation key already present
    /// is a no-op that reports the existing id.
    pub fn register(&self, signal: ThreatSignal) -> Result<Registration, EventError> {
        signal.validate()?;
        let mut state = self.lock();

        if let Some(key) = &signal.correlation_key {
            if let Some(existing) = state.correlation_keys.get(key) {
                let existing = existing.clone();
                state.metrics.duplicates_suppressed += 1;
                return Ok(Registration::Duplicate(existing));
            }
        }

        state.next_id += 1;
        let id = format!("THR-{:06}", state.next_id);
        let event = Arc::new(ThreatEvent::from_signal(id.clone(), signal));

        if let Some(key) = &event.correlation_key {
            state.correlation_keys.insert(key.clone(), id.clone());
        }
        state.metrics.total_registered += 1;
        *state
            .metrics
            .by_type
            .entry(event.threat_type.to_string())
            .or_default() += 1;
        *state.metrics.by_severity.entry(event.severity).or_default() += 1;

        state.history.push_back(event.clone());
        while state.history.len() > self.config.max_history {
            if let Some(evicted) = state.history.pop_front() {
                state.remove_key_of(&evicted);
                let before = state.active.len();
                state.active.retain(|e| e.id != evicted.id);
                state.metrics.active_evicted += (before - state.active.len()) as u64;
                state.metrics.history_evicted += 1;
            }
        }

        state.active.push_back(event.clone());
        while state.active.len() > self.config.max_active {
            if let Some(evicted) = state.active.pop_front() {
                tracing::debug!(threat_id = %evicted.id, "Active threat evicted at cap");
                state.metrics.active_evicted += 1;
            }
        }

        tracing::info!(
            threat_id = %event.id,
            threat_type = %event.threat_type,
            severity = %event.severity,
            source = %event.source,
            "Threat registered"
        );
        Ok(Registration::New(event))
    }

    pub fn get(&self, id: &str) -> Option<Arc<ThreatEvent>> {
        self.lock().history.iter().find(|e| e.id == id).cloned()
    }

    /// Remove a threat from the active set. Returns whether it was active.
    pub fn resolve(&self, id: &str) -> bool {
        let mut state = self.lock();
        let before = state.active.len();
        state.active.retain(|e| e.id != id);
        let removed = state.active.len() < before;
        if removed {
            state.metrics.resolved += 1;
            tracing::info!(threat_id = id, "Threat resolved");
        }
        removed
    }

    pub fn is_active(&self, id: &str) -> bool {
        self.lock().active.iter().any(|e| e.id == id)
    }

    /// Active threats, oldest first.
    pub fn active(&self) -> Vec<Arc<ThreatEvent>> {
        self.lock().active.iter().cloned().collect()
    }

    pub fn active_count(&self) -> usize {
        self.lock().active.len()
    }

    pub fn history_len(&self) -> usize {
        self.lock().history.len()
    }

    /// History events with `timestamp >= cutoff`, oldest first.
    pub fn events_since(&self, cutoff: DateTime<Utc>) -> Vec<Arc<ThreatEvent>> {
        self.lock()
            .history
            .iter()
            .filter(|e| e.timestamp >= cutoff)
            .cloned()
            .collect()
    }

    /// Most recent history events, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Arc<ThreatEvent>> {
        self.lock().history.iter().rev().take(limit).cloned().collect()
    }

    /// Sources with the most events in history, descending, ties by source.
    pub fn top_sources(&self, limit: usize) -> Vec<(String, usize)> {
        let state = self.lock();
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for event in &state.history {
            *counts.entry(event.source.as_str()).or_default() += 1;
        }
        let mut sorted: Vec<(String, usize)> = counts
            .into_iter()
            .map(|(s, c)| (s.to_string(), c))
            .collect();
        sorted.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        sorted.truncate(limit);
        sorted
    }

    /// Re-apply both caps. Returns the number of active entries evicted.
    pub fn enforce_caps(&self) -> usize {
        let mut state = self.lock();
        let mut evicted = 0;
        while state.active.len() > self.config.max_active {
            state.active.pop_front();
            evicted += 1;
        }
        while state.history.len() > self.config.max_history {
            if let Some(old) = state.history.pop_front() {
                state.remove_key_of(&old);
                state.metrics.history_evicted += 1;
            }
        }
        state.metrics.active_evicted += evicted as u64;
        evicted
    }

    pub fn metrics(&self) -> RegistryMetrics {
        let state = self.lock();
        let mut metrics = state.metrics.clone();
        metrics.active = state.active.len();
        metrics.history = state.history.len();
        metrics.active_by_severity = BTreeMap::new();
        for event in &state.active {
            *metrics.active_by_severity.entry(event.severity).or_default() += 1;
        }
        metrics
    }

    pub fn active_with_severity(&self, severity: ThreatSeverity) -> usize {
        self.lock()
            .active
            .iter()
            .filter(|e| e.severity == severity)
            .count()
    }
}

impl HealthReporter for ThreatRegistry {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn health(&self) -> ModuleHealth {
        let metrics = self.metrics();
        let mut health = ModuleHealth::healthy(MODULE_NAME)
            .with_metric("active", metrics.active as f64)
            .with_metric("history", metrics.history as f64)
            .with_metric("total_registered", metrics.total_registered as f64)
            .with_metric("active_evicted", metrics.active_evicted as f64);
        if metrics.active >= self.config.max_active {
            health = health.with_issue(HealthStatus::Warning, "active threat set at capacity");
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ThreatType;
    use chrono::Duration;

    fn registry(max_active: usize, max_history: usize) -> ThreatRegistry {
        ThreatRegistry::new(RegistryConfig {
            max_active,
            max_history,
        })
    }

    fn signal(source: &str) -> ThreatSignal {
        ThreatSignal::new(ThreatType::AUTH_FAILURE, ThreatSeverity::Low, source, Utc::now())
    }

    #[test]
    fn test_ids_are_sequential() {
        let r = registry(10, 10);
        assert_eq!(r.register(signal("a")).unwrap().id(), "THR-000001");
        assert_eq!(r.register(signal("b")).unwrap().id(), "THR-000002");
    }

    #[test]
    fn test_invalid_signal_rejected() {
        let r = registry(10, 10);
        assert!(r.register(signal("")).is_err());
        assert_eq!(r.history_len(), 0);
    }

    #[test]
    fn test_active_cap_is_fifo() {
        let r = registry(3, 100);
        for i in 0..5 {
            r.register(signal(&format!("10.0.0.{i}"))).unwrap();
        }
        let active: Vec<String> = r.active().iter().map(|e| e.source.clone()).collect();
        assert_eq!(active, vec!["10.0.0.2", "10.0.0.3", "10.0.0.4"]);
        assert_eq!(r.history_len(), 5);
        assert_eq!(r.metrics().active_evicted, 2);
    }

    #[test]
    fn test_history_cap_evicts_oldest() {
        let r = registry(100, 3);
        for i in 0..5 {
            r.register(signal(&format!("10.0.0.{i}"))).unwrap();
        }
        assert_eq!(r.history_len(), 3);
        assert!(r.get("THR-000001").is_none());
        assert!(r.get("THR-000005").is_some());
        // evicted from history means evicted from the active set too
        assert_eq!(r.active_count(), 3);
    }

    #[test]
    fn test_correlation_key_dedup() {
        let r = registry(10, 10);
        let derived = signal("1.2.3.4").with_correlation_key("abc");
        let first = r.register(derived.clone()).unwrap();
        assert!(first.is_new());
        let second = r.register(derived).unwrap();
        assert!(!second.is_new());
        assert_eq!(second.id(), first.id());
        assert_eq!(r.history_len(), 1);
        assert_eq!(r.metrics().duplicates_suppressed, 1);
    }

    #[test]
    fn test_key_forgotten_after_eviction() {
        let r = registry(10, 1);
        r.register(signal("a").with_correlation_key("k")).unwrap();
        r.register(signal("b")).unwrap();
        assert!(r.register(signal("a").with_correlation_key("k")).unwrap().is_new());
    }

    #[test]
    fn test_resolve_removes_from_active_only() {
        let r = registry(10, 10);
        let id = r.register(signal("a")).unwrap().id().to_string();
        assert!(r.resolve(&id));
        assert!(!r.is_active(&id));
        assert!(r.get(&id).is_some());
        assert!(!r.resolve(&id));
    }

    #[test]
    fn test_events_since() {
        let r = registry(10, 10);
        let now = Utc::now();
        let mut old = signal("a");
        old.timestamp = now - Duration::minutes(10);
        r.register(old).unwrap();
        r.register(signal("b")).unwrap();
        let recent = r.events_since(now - Duration::minutes(5));
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].source, "b");
    }

    #[test]
    fn test_top_sources() {
        let r = registry(10, 10);
        for s in ["a", "b", "b", "c", "c", "c"] {
            r.register(signal(s)).unwrap();
        }
        assert_eq!(
            r.top_sources(2),
            vec![("c".to_string(), 3), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_metrics_by_type_and_severity() {
        let r = registry(10, 10);
        r.register(signal("a")).unwrap();
        r.register(ThreatSignal::new(
            ThreatType::SQL_INJECTION,
            ThreatSeverity::Critical,
            "b",
            Utc::now(),
        ))
        .unwrap();
        let m = r.metrics();
        assert_eq!(m.total_registered, 2);
        assert_eq!(m.by_type["SQL_INJECTION"], 1);
        assert_eq!(m.active_by_severity[&ThreatSeverity::Critical], 1);
        assert_eq!(r.active_with_severity(ThreatSeverity::Critical), 1);
    }
}
