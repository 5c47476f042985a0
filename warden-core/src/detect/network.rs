//! Network monitoring: per-source volume, rate limits, block list, geo policy.
//!
//! All expirations are lazy: windows are aged and blocks expire when the
//! entry is next touched. [`NetworkMonitor::sweep`] reclaims idle entries to
//! bound memory but is not needed for correct answers.

use super::Detector;
use crate::collaborators::{GeoIpResolver, RequestRecord};
use crate::config::NetworkConfig;
use crate::error::DetectorError;
use crate::event::{ThreatSeverity, ThreatSignal, ThreatType};
use crate::health::{HealthReporter, HealthStatus, ModuleHealth};
use crate::seconds as secs;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

const MODULE_NAME: &str = "network";

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateDecision {
    Allow,
    Deny,
}

/// A blocked source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockEntry {
    pub ip: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
    #[serde(skip)]
    activity_reported: bool,
}

impl BlockEntry {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Default)]
struct TrafficWindow {
    hits: VecDeque<DateTime<Utc>>,
    /// A DDoS signal was raised; no further one until this instant.
    quiet_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct RateWindow {
    window_start: DateTime<Utc>,
    count: u32,
    max: u32,
    denial_reported: bool,
}

/// Tracks request volume and enforcement state per source IP.
pub struct NetworkMonitor {
    config: NetworkConfig,
    geo: Option<Arc<dyn GeoIpResolver>>,
    traffic: Mutex<HashMap<String, TrafficWindow>>,
    rates: Mutex<HashMap<String, RateWindow>>,
    blocks: Mutex<HashMap<String, BlockEntry>>,
    /// Last GEO_BLOCKED report per IP; re-reported once a block TTL has passed.
    geo_reported: Mutex<HashMap<String, DateTime<Utc>>>,
    requests: AtomicU64,
    ddos_signals: AtomicU64,
    rate_denials: AtomicU64,
}

impl NetworkMonitor {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            geo: None,
            traffic: Mutex::new(HashMap::new()),
            rates: Mutex::new(HashMap::new()),
            blocks: Mutex::new(HashMap::new()),
            geo_reported: Mutex::new(HashMap::new()),
            requests: AtomicU64::new(0),
            ddos_signals: AtomicU64::new(0),
            rate_denials: AtomicU64::new(0),
        }
    }

    pub fn with_geo_resolver(mut self, resolver: Arc<dyn GeoIpResolver>) -> Self {
        self.geo = Some(resolver);
        self
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    fn ddos_window(&self) -> Duration {
        secs(self.config.ddos_window_secs)
    }

    fn rate_window(&self) -> Duration {
        secs(self.config.rate_limit_window_secs)
    }

    /// Record one request from `ip` at `timestamp`.
    pub fn record_request(&self, ip: &str, timestamp: DateTime<Utc>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        let mut traffic = self.traffic.lock().unwrap_or_else(PoisonError::into_inner);
        let window = traffic.entry(ip.to_string()).or_default();
        window.hits.push_back(timestamp);
        // Only need to know whether the count exceeds the threshold.
        while window.hits.len() > self.config.ddos_threshold + 1 {
            window.hits.pop_front();
        }
    }

    pub fn is_ddos(&self, ip: &str) -> bool {
        self.is_ddos_at(ip, Utc::now())
    }

    /// More than `ddos_threshold` requests from `ip` in the window ending at `now`.
    pub fn is_ddos_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        let mut traffic = self.traffic.lock().unwrap_or_else(PoisonError::into_inner);
        match traffic.get_mut(ip) {
            Some(window) => self.in_window_count(window, now) > self.config.ddos_threshold,
            None => false,
        }
    }

    fn in_window_count(&self, window: &mut TrafficWindow, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.ddos_window();
        while window.hits.front().is_some_and(|t| *t <= cutoff) {
            window.hits.pop_front();
        }
        window.hits.iter().filter(|t| **t <= now).count()
    }

    /// Raise at most one DDoS signal per window for `ip`.
    fn ddos_signal(&self, ip: &str, now: DateTime<Utc>) -> Option<ThreatSignal> {
        let mut traffic = self.traffic.lock().unwrap_or_else(PoisonError::into_inner);
        let window = traffic.get_mut(ip)?;
        let count = self.in_window_count(window, now);
        if count <= self.config.ddos_threshold {
            return None;
        }
        if window.quiet_until.is_some_and(|until| now < until) {
            return None;
        }
        window.quiet_until = Some(now + self.ddos_window());
        self.ddos_signals.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(ip, requests = count, "DDoS threshold exceeded");
        Some(
            ThreatSignal::new(ThreatType::DDOS_ATTACK, ThreatSeverity::Critical, ip, now)
                .with_subtype("volumetric")
                .with_detail("requests_in_window", count)
                .with_detail("threshold", self.config.ddos_threshold)
                .with_detail("window_secs", self.config.ddos_window_secs),
        )
    }

    pub fn check_rate_limit(&self, ip: &str) -> RateDecision {
        self.check_rate_limit_at(ip, Utc::now())
    }

    /// Count a request against the fixed window for `ip` and decide.
    pub fn check_rate_limit_at(&self, ip: &str, now: DateTime<Utc>) -> RateDecision {
        self.consume_rate(ip, now).0
    }

    /// Returns the decision and whether this is the first denial in the window.
    fn consume_rate(&self, ip: &str, now: DateTime<Utc>) -> (RateDecision, bool) {
        let mut rates = self.rates.lock().unwrap_or_else(PoisonError::into_inner);
        let window = rates.entry(ip.to_string()).or_insert_with(|| RateWindow {
            window_start: now,
            count: 0,
            max: self.config.rate_limit_max,
            denial_reported: false,
        });
        if now - window.window_start >= self.rate_window() {
            window.window_start = now;
            window.count = 0;
            window.denial_reported = false;
        }
        window.count = window.count.saturating_add(1);
        if window.count > window.max {
            self.rate_denials.fetch_add(1, Ordering::Relaxed);
            let first = !window.denial_reported;
            window.denial_reported = true;
            (RateDecision::Deny, first)
        } else {
            (RateDecision::Allow, false)
        }
    }

    /// Halve the rate limit for `ip` (never below one). Returns the new limit.
    pub fn penalize(&self, ip: &str) -> u32 {
        self.penalize_at(ip, Utc::now())
    }

    pub fn penalize_at(&self, ip: &str, now: DateTime<Utc>) -> u32 {
        let mut rates = self.rates.lock().unwrap_or_else(PoisonError::into_inner);
        let window = rates.entry(ip.to_string()).or_insert_with(|| RateWindow {
            window_start: now,
            count: 0,
            max: self.config.rate_limit_max,
            denial_reported: false,
        });
        window.max = (window.max / 2).max(1);
        tracing::info!(ip, limit = window.max, "Rate limit tightened");
        window.max
    }

    /// Current rate limit for `ip`.
    pub fn rate_limit_for(&self, ip: &str) -> u32 {
        self.rates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(ip)
            .map_or(self.config.rate_limit_max, |w| w.max)
    }

    /// Block `ip` for `ttl`. Re-blocking extends the expiry.
    pub fn block_source_at(&self, ip: &str, ttl: Duration, reason: &str, now: DateTime<Utc>) -> BlockEntry {
        let entry = BlockEntry {
            ip: ip.to_string(),
            blocked_at: now,
            expires_at: now + ttl,
            reason: reason.to_string(),
            activity_reported: false,
        };
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(ip.to_string(), entry.clone());
        tracing::warn!(ip, expires_at = %entry.expires_at, reason, "Source blocked");
        entry
    }

    pub fn block_source(&self, ip: &str, ttl: Duration, reason: &str) -> BlockEntry {
        self.block_source_at(ip, ttl, reason, Utc::now())
    }

    pub fn default_block_ttl(&self) -> Duration {
        secs(self.config.block_ttl_secs)
    }

    pub fn is_blocked(&self, ip: &str) -> bool {
        self.is_blocked_at(ip, Utc::now())
    }

    /// Whether `ip` is blocked at `now`. Expired entries are removed on the way.
    pub fn is_blocked_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        match blocks.get(ip) {
            Some(entry) if entry.is_active_at(now) => true,
            Some(_) => {
                blocks.remove(ip);
                tracing::debug!(ip, "Block expired");
                false
            }
            None => false,
        }
    }

    pub fn unblock(&self, ip: &str) -> bool {
        self.blocks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(ip)
            .is_some()
    }

    /// Active blocks at `now`, soonest expiry first.
    pub fn blocked_sources_at(&self, now: DateTime<Utc>) -> Vec<BlockEntry> {
        let blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let mut active: Vec<BlockEntry> = blocks
            .values()
            .filter(|b| b.is_active_at(now))
            .cloned()
            .collect();
        active.sort_by(|a, b| a.expires_at.cmp(&b.expires_at).then_with(|| a.ip.cmp(&b.ip)));
        active
    }

    /// First request from a blocked source after the block yields one signal.
    pub fn blocked_activity_at(&self, ip: &str, now: DateTime<Utc>) -> Option<ThreatSignal> {
        let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = blocks.get_mut(ip).filter(|e| e.is_active_at(now))?;
        if entry.activity_reported {
            return None;
        }
        entry.activity_reported = true;
        Some(
            ThreatSignal::new(ThreatType::BLOCKED_SOURCE_ACTIVITY, ThreatSeverity::Low, ip, now)
                .with_detail("block_reason", entry.reason.clone())
                .with_detail("expires_at", entry.expires_at.to_rfc3339()),
        )
    }

    /// Whether `ip` resolves to a blocked country. Unresolvable addresses are allowed.
    pub fn is_geo_blocked(&self, ip: &str) -> bool {
        self.blocked_country(ip).is_some()
    }

    fn blocked_country(&self, ip: &str) -> Option<String> {
        if self.config.blocked_countries.is_empty() {
            return None;
        }
        let location = self.geo.as_ref()?.resolve(ip)?;
        self.config
            .blocked_countries
            .iter()
            .any(|c| c.trim().eq_ignore_ascii_case(&location.country))
            .then_some(location.country)
    }

    /// Reclaim expired blocks and idle windows. Returns the number of entries removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let mut removed = 0;
        {
            let mut blocks = self.blocks.lock().unwrap_or_else(PoisonError::into_inner);
            let before = blocks.len();
            blocks.retain(|_, b| b.is_active_at(now));
            removed += before - blocks.len();
        }
        {
            let cutoff = now - self.ddos_window();
            let mut traffic = self.traffic.lock().unwrap_or_else(PoisonError::into_inner);
            let before = traffic.len();
            traffic.retain(|_, w| w.hits.back().is_some_and(|t| *t > cutoff));
            removed += before - traffic.len();
        }
        {
            // penalties outlive the window for as long as a block would
            let idle = self.rate_window().max(self.default_block_ttl());
            let mut rates = self.rates.lock().unwrap_or_else(PoisonError::into_inner);
            let before = rates.len();
            rates.retain(|_, w| now - w.window_start < idle);
            removed += before - rates.len();
        }
        {
            let ttl = self.default_block_ttl();
            let mut reported = self.geo_reported.lock().unwrap_or_else(PoisonError::into_inner);
            let before = reported.len();
            reported.retain(|_, at| now - *at < ttl);
            removed += before - reported.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "Network state swept");
        }
        removed
    }

    fn tracked_sources(&self) -> usize {
        self.traffic
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl HealthReporter for NetworkMonitor {
    fn name(&self) -> &str {
        MODULE_NAME
    }

    fn health(&self) -> ModuleHealth {
        let blocked = self.blocked_sources_at(Utc::now()).len();
        let mut health = ModuleHealth::healthy(MODULE_NAME)
            .with_metric("requests", self.requests.load(Ordering::Relaxed) as f64)
            .with_metric("tracked_sources", self.tracked_sources() as f64)
            .with_metric("blocked_sources", blocked as f64)
            .with_metric("ddos_signals", self.ddos_signals.load(Ordering::Relaxed) as f64)
            .with_metric("rate_denials", self.rate_denials.load(Ordering::Relaxed) as f64);
        if !self.config.blocked_countries.is_empty() && self.geo.is_none() {
            health = health.with_issue(
                HealthStatus::Warning,
                "geo policy configured without a resolver",
            );
        }
        health
    }
}

impl Detector for NetworkMonitor {
    fn inspect_request(
        &self,
        request: &RequestRecord,
        _now: DateTime<Utc>,
    ) -> Result<Vec<ThreatSignal>, DetectorError> {
        let ip = request.ip.as_str();
        let ts = request.timestamp;
        let mut signals = Vec::new();

        self.record_request(ip, ts);
        signals.extend(self.ddos_signal(ip, ts));

        if let (RateDecision::Deny, true) = self.consume_rate(ip, ts) {
            signals.push(
                ThreatSignal::new(ThreatType::RATE_LIMIT_EXCEEDED, ThreatSeverity::Medium, ip, ts)
                    .with_detail("limit", self.rate_limit_for(ip))
                    .with_detail("window_secs", self.config.rate_limit_window_secs),
            );
        }

        if let Some(country) = self.blocked_country(ip) {
            let due = {
                let ttl = self.default_block_ttl();
                let mut reported = self.geo_reported.lock().unwrap_or_else(PoisonError::into_inner);
                match reported.get(ip) {
                    Some(at) if ts - *at < ttl => false,
                    _ => {
                        reported.insert(ip.to_string(), ts);
                        true
                    }
                }
            };
            if due {
                signals.push(
                    ThreatSignal::new(ThreatType::GEO_BLOCKED, ThreatSeverity::Medium, ip, ts)
                        .with_detail("country", country),
                );
            }
        }

        Ok(signals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::StaticGeoResolver;

    fn monitor() -> NetworkMonitor {
        NetworkMonitor::new(NetworkConfig::default())
    }

    fn burst(m: &NetworkMonitor, ip: &str, n: usize, start: DateTime<Utc>) -> Vec<ThreatSignal> {
        let mut signals = Vec::new();
        for i in 0..n {
            let req = RequestRecord::new(ip, "/", start + Duration::milliseconds(i as i64 * 100));
            signals.extend(m.inspect_request(&req, req.timestamp).unwrap());
        }
        signals
    }

    #[test]
    fn test_ddos_boundary() {
        let m = monitor();
        let t0 = Utc::now();
        for i in 0..100 {
            m.record_request("9.9.9.9", t0 + Duration::milliseconds(i * 100));
        }
        let now = t0 + Duration::seconds(20);
        assert!(!m.is_ddos_at("9.9.9.9", now));
        m.record_request("9.9.9.9", t0 + Duration::seconds(11));
        assert!(m.is_ddos_at("9.9.9.9", now));
    }

    #[test]
    fn test_ddos_window_ages_out() {
        let m = monitor();
        let t0 = Utc::now();
        for _ in 0..101 {
            m.record_request("9.9.9.9", t0);
        }
        assert!(m.is_ddos_at("9.9.9.9", t0 + Duration::seconds(1)));
        assert!(!m.is_ddos_at("9.9.9.9", t0 + Duration::seconds(61)));
    }

    #[test]
    fn test_ddos_signal_once_per_window() {
        let m = monitor();
        let signals = burst(&m, "9.9.9.9", 150, Utc::now());
        let ddos: Vec<_> = signals
            .iter()
            .filter(|s| s.threat_type == ThreatType::DDOS_ATTACK)
            .collect();
        assert_eq!(ddos.len(), 1);
        assert_eq!(ddos[0].severity, ThreatSeverity::Critical);
    }

    #[test]
    fn test_rate_limit_fixed_window() {
        let m = monitor();
        let t0 = Utc::now();
        for _ in 0..100 {
            assert_eq!(m.check_rate_limit_at("1.1.1.1", t0), RateDecision::Allow);
        }
        assert_eq!(m.check_rate_limit_at("1.1.1.1", t0), RateDecision::Deny);
        // new window
        assert_eq!(
            m.check_rate_limit_at("1.1.1.1", t0 + Duration::seconds(60)),
            RateDecision::Allow
        );
    }

    #[test]
    fn test_rate_limit_signal_once_per_window() {
        let m = monitor();
        let signals = burst(&m, "1.1.1.1", 120, Utc::now());
        let limited = signals
            .iter()
            .filter(|s| s.threat_type == ThreatType::RATE_LIMIT_EXCEEDED)
            .count();
        assert_eq!(limited, 1);
    }

    #[test]
    fn test_penalize_halves_limit() {
        let m = monitor();
        assert_eq!(m.penalize("1.1.1.1"), 50);
        assert_eq!(m.penalize("1.1.1.1"), 25);
        assert_eq!(m.rate_limit_for("1.1.1.1"), 25);
        for _ in 0..10 {
            m.penalize("1.1.1.1");
        }
        assert_eq!(m.rate_limit_for("1.1.1.1"), 1);
    }

    #[test]
    fn test_block_expires() {
        let m = monitor();
        let t0 = Utc::now();
        m.block_source_at("6.6.6.6", Duration::seconds(10), "test", t0);
        assert!(m.is_blocked_at("6.6.6.6", t0));
        assert!(m.is_blocked_at("6.6.6.6", t0 + Duration::seconds(9)));
        assert!(!m.is_blocked_at("6.6.6.6", t0 + Duration::seconds(10)));
        assert!(m.blocked_sources_at(t0).is_empty());
    }

    #[test]
    fn test_unblock() {
        let m = monitor();
        m.block_source("6.6.6.6", Duration::seconds(60), "test");
        assert!(m.unblock("6.6.6.6"));
        assert!(!m.is_blocked("6.6.6.6"));
        assert!(!m.unblock("6.6.6.6"));
    }

    #[test]
    fn test_blocked_activity_reported_once() {
        let m = monitor();
        let t0 = Utc::now();
        m.block_source_at("6.6.6.6", Duration::seconds(60), "ddos", t0);
        let first = m.blocked_activity_at("6.6.6.6", t0).unwrap();
        assert_eq!(first.threat_type, ThreatType::BLOCKED_SOURCE_ACTIVITY);
        assert!(m.blocked_activity_at("6.6.6.6", t0).is_none());
        assert!(m.blocked_activity_at("7.7.7.7", t0).is_none());
    }

    #[test]
    fn test_geo_policy() {
        let geo = StaticGeoResolver::new().with_prefix("203.0.113.", "KP");
        let config = NetworkConfig {
            blocked_countries: vec!["kp".into()],
            ..NetworkConfig::default()
        };
        let m = NetworkMonitor::new(config).with_geo_resolver(Arc::new(geo));
        assert!(m.is_geo_blocked("203.0.113.5"));
        assert!(!m.is_geo_blocked("8.8.8.8"));

        let signals = burst(&m, "203.0.113.5", 3, Utc::now());
        let geo_hits = signals
            .iter()
            .filter(|s| s.threat_type == ThreatType::GEO_BLOCKED)
            .count();
        assert_eq!(geo_hits, 1);
    }

    #[test]
    fn test_geo_report_repeats_after_ttl_and_is_swept() {
        let geo = StaticGeoResolver::new().with_prefix("203.0.113.", "KP");
        let config = NetworkConfig {
            blocked_countries: vec!["KP".into()],
            block_ttl_secs: 60,
            ..NetworkConfig::default()
        };
        let m = NetworkMonitor::new(config).with_geo_resolver(Arc::new(geo));
        let geo_hits = |signals: Vec<ThreatSignal>| {
            signals
                .iter()
                .filter(|s| s.threat_type == ThreatType::GEO_BLOCKED)
                .count()
        };
        let t0 = Utc::now();

        assert_eq!(geo_hits(burst(&m, "203.0.113.9", 2, t0)), 1);
        assert_eq!(geo_hits(burst(&m, "203.0.113.9", 1, t0 + Duration::seconds(30))), 0);
        assert_eq!(geo_hits(burst(&m, "203.0.113.9", 1, t0 + Duration::seconds(61))), 1);

        let tracked = || m.geo_reported.lock().unwrap().len();
        assert_eq!(tracked(), 1);
        m.sweep(t0 + Duration::seconds(100));
        assert_eq!(tracked(), 1);
        m.sweep(t0 + Duration::seconds(121));
        assert_eq!(tracked(), 0);
    }

    #[test]
    fn test_geo_without_resolver_warns() {
        let config = NetworkConfig {
            blocked_countries: vec!["KP".into()],
            ..NetworkConfig::default()
        };
        let m = NetworkMonitor::new(config);
        assert!(!m.is_geo_blocked("203.0.113.5"));
        assert_eq!(m.health().status, HealthStatus::Warning);
    }

    #[test]
    fn test_sweep_reclaims_state() {
        let m = monitor();
        let t0 = Utc::now();
        m.record_request("1.1.1.1", t0);
        m.check_rate_limit_at("1.1.1.1", t0);
        m.block_source_at("2.2.2.2", Duration::seconds(5), "test", t0);
        let removed = m.sweep(t0 + Duration::seconds(7_200));
        assert_eq!(removed, 3);
        assert_eq!(m.tracked_sources(), 0);
    }
}
