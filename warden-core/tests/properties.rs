//! Property tests for the invariants the detectors and registry promise.

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;
use warden_core::alerts::{AlertDispatcher, TemplateSet};
use warden_core::config::{BehaviorConfig, NetworkConfig, RegistryConfig};
use warden_core::detect::BehaviorObservation;
use warden_core::detect::behavior::anomaly_score;
use warden_core::registry::Registration;
use warden_core::retry::RetryPolicy;
use warden_core::{
    Alert, BehaviorAnalyzer, ChannelError, Correlator, NetworkMonitor, NotificationChannel,
    ThreatRegistry, ThreatSeverity, ThreatSignal, ThreatType,
};

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
}

fn observation(value: f64) -> BehaviorObservation {
    BehaviorObservation::from([("requests_per_minute".to_string(), value)])
}

/// Baseline of `samples` values spread around `mean`.
fn trained(samples: u64, mean: f64) -> BehaviorAnalyzer {
    let analyzer = BehaviorAnalyzer::new(BehaviorConfig::default());
    for i in 0..samples {
        let value = if i % 2 == 0 { mean - 1.0 } else { mean + 1.0 };
        analyzer.observe_at("entity", &observation(value), epoch());
    }
    analyzer
}

proptest! {
    #[test]
    fn test_active_set_respects_cap(cap in 1usize..20, registered in 0usize..60) {
        let registry = ThreatRegistry::new(RegistryConfig { max_active: cap, max_history: 100 });
        for i in 0..registered {
            registry
                .register(ThreatSignal::new(
                    ThreatType::AUTH_FAILURE,
                    ThreatSeverity::Low,
                    format!("10.0.0.{}", i % 250),
                    epoch() + Duration::seconds(i as i64),
                ))
                .unwrap();
        }
        registry.enforce_caps();
        prop_assert!(registry.active_count() <= cap);
    }

    #[test]
    fn test_no_anomaly_before_baseline(values in prop::collection::vec(-1e6f64..1e6, 1..10)) {
        let config = BehaviorConfig::default();
        prop_assert!(values.len() as u64 <= config.min_samples);
        let analyzer = BehaviorAnalyzer::new(config);
        for value in values {
            prop_assert!(analyzer.observe_at("entity", &observation(value), epoch()).is_none());
        }
    }

    #[test]
    fn test_score_is_monotonic_in_deviation(
        a in 0.001f64..500.0,
        b in 0.001f64..500.0,
        negative in any::<bool>(),
    ) {
        let analyzer = trained(20, 50.0);
        let profile = analyzer.profile("entity").unwrap();
        let (far, near) = if a >= b { (a, b) } else { (b, a) };
        let sign = if negative { -1.0 } else { 1.0 };

        let far_score = anomaly_score(&profile, &observation(50.0 + sign * far), analyzer.config());
        let near_score = anomaly_score(&profile, &observation(50.0 + sign * near), analyzer.config());
        prop_assert!(far_score >= near_score);
        prop_assert!((0.0..=1.0).contains(&far_score));
    }

    #[test]
    fn test_ddos_boundary(threshold in 1usize..200) {
        let monitor = NetworkMonitor::new(NetworkConfig {
            ddos_threshold: threshold,
            ..NetworkConfig::default()
        });
        let now = epoch() + Duration::seconds(30);
        for i in 0..threshold {
            monitor.record_request("198.51.100.9", epoch() + Duration::milliseconds(i as i64));
        }
        prop_assert!(!monitor.is_ddos_at("198.51.100.9", now));

        monitor.record_request("198.51.100.9", now);
        prop_assert!(monitor.is_ddos_at("198.51.100.9", now));
    }
}

struct NullChannel;

#[async_trait]
impl NotificationChannel for NullChannel {
    fn name(&self) -> &str {
        "null"
    }

    async fn send(&self, _alert: &Alert) -> Result<(), ChannelError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_cooldown_boundary() {
    let registry = ThreatRegistry::new(RegistryConfig::default());
    let t0 = epoch();
    let threat = registry
        .register(ThreatSignal::new(
            ThreatType::CROSS_SITE_SCRIPTING,
            ThreatSeverity::High,
            "203.0.113.5",
            t0,
        ))
        .unwrap()
        .into_new()
        .unwrap();

    for (offset, suppressed) in [(0, true), (1, true), (59, true), (60, false), (600, false)] {
        let dispatcher = AlertDispatcher::new(
            vec![Arc::new(NullChannel) as Arc<dyn NotificationChannel>],
            TemplateSet::default(),
            Duration::seconds(60),
            RetryPolicy::once(),
        );
        assert!(!dispatcher.dispatch_at(&threat, t0).await.is_suppressed());
        assert_eq!(
            dispatcher
                .dispatch_at(&threat, t0 + Duration::seconds(offset))
                .await
                .is_suppressed(),
            suppressed,
            "offset {offset}s"
        );
    }
}

#[test]
fn test_block_expires_exactly_at_ttl() {
    let monitor = NetworkMonitor::new(NetworkConfig::default());
    let t0 = epoch();
    let ttl = Duration::seconds(120);
    monitor.block_source_at("192.0.2.44", ttl, "test", t0);

    assert!(monitor.is_blocked_at("192.0.2.44", t0));
    assert!(monitor.is_blocked_at("192.0.2.44", t0 + ttl - Duration::seconds(1)));
    assert!(!monitor.is_blocked_at("192.0.2.44", t0 + ttl));
}

#[test]
fn test_correlation_is_idempotent() {
    let registry = ThreatRegistry::new(RegistryConfig::default());
    let now = epoch() + Duration::minutes(2);
    for i in 0..6 {
        registry
            .register(ThreatSignal::new(
                ThreatType::AUTH_FAILURE,
                ThreatSeverity::Low,
                "1.2.3.4",
                now - Duration::seconds(i),
            ))
            .unwrap();
    }
    registry
        .register(ThreatSignal::new(
            ThreatType::THREAT_DETECTED,
            ThreatSeverity::Medium,
            "1.2.3.4",
            now,
        ))
        .unwrap();

    let correlator = Correlator::with_defaults(Duration::minutes(5)).unwrap();
    let events = registry.events_since(now - correlator.window());
    let first = correlator.correlate_at(&events, now);
    let second = correlator.correlate_at(&events, now);
    assert_eq!(first, second);
    assert!(!first.is_empty());

    for derived in first {
        assert!(registry.register(derived).unwrap().is_new());
    }
    for derived in second {
        assert!(matches!(
            registry.register(derived),
            Ok(Registration::Duplicate(_))
        ));
    }
}
