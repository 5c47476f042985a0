//! End-to-end scenarios across detectors, correlation, response and alerting.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use warden_core::alerts::{AlertDispatcher, TemplateSet};
use warden_core::config::BehaviorConfig;
use warden_core::detect::BehaviorObservation;
use warden_core::registry::Registration;
use warden_core::response::{ActionContext, ActionHandler, StepOutcome};
use warden_core::retry::RetryPolicy;
use warden_core::{
    ActionKind, Alert, BehaviorAnalyzer, ChannelError, Correlator, CoordinatorBuilder,
    NotificationChannel, RawThreatReport, RequestRecord, ResponseActionError, SignatureDetector,
    ThreatRegistry, ThreatSeverity, ThreatSignal, ThreatType, WardenConfig,
};

fn quiet_config() -> WardenConfig {
    let mut config = WardenConfig::default();
    config.alerts.channels.console = false;
    config.response.max_attempts = 1;
    config
}

#[derive(Default)]
struct CountingChannel {
    delivered: AtomicUsize,
}

#[async_trait]
impl NotificationChannel for CountingChannel {
    fn name(&self) -> &str {
        "counting"
    }

    async fn send(&self, _alert: &Alert) -> Result<(), ChannelError> {
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct BrokenBlockHandler;

#[async_trait]
impl ActionHandler for BrokenBlockHandler {
    fn kind(&self) -> ActionKind {
        ActionKind::BlockSource
    }

    async fn execute(&self, _ctx: &ActionContext) -> Result<String, ResponseActionError> {
        Err(ResponseActionError::Failed {
            action: "block_source".into(),
            message: "firewall unreachable".into(),
        })
    }
}

#[test]
fn test_s1_coordinated_attack_correlated_once() {
    let now = Utc::now();
    let registry = ThreatRegistry::new(Default::default());
    for i in 0..6 {
        registry
            .register(ThreatSignal::new(
                ThreatType::AUTH_FAILURE,
                ThreatSeverity::Low,
                "1.2.3.4",
                now - Duration::seconds(30 * i),
            ))
            .unwrap();
    }
    registry
        .register(ThreatSignal::new(
            ThreatType::THREAT_DETECTED,
            ThreatSeverity::Medium,
            "1.2.3.4",
            now - Duration::seconds(10),
        ))
        .unwrap();

    let correlator = Correlator::with_defaults(Duration::minutes(5)).unwrap();
    let events = registry.events_since(now - correlator.window());
    let derived = correlator.correlate_at(&events, now);

    assert_eq!(derived.len(), 1);
    assert_eq!(derived[0].threat_type, ThreatType::COORDINATED_ATTACK);
    assert_eq!(derived[0].severity, ThreatSeverity::High);
}

#[test]
fn test_s2_sql_tautology_is_critical() {
    let detector = SignatureDetector::with_defaults().unwrap();
    let request = RequestRecord::new("198.51.100.1", "/login", Utc::now()).with_body("' OR 1=1 --");
    let signals = detector.scan_request(&request);

    let sqli = signals
        .iter()
        .find(|s| s.threat_type == ThreatType::SQL_INJECTION)
        .unwrap();
    assert_eq!(sqli.severity, ThreatSeverity::Critical);
}

#[test]
fn test_s3_session_duration_anomaly() {
    let analyzer = BehaviorAnalyzer::new(BehaviorConfig::default());
    let now = Utc::now();
    // ten samples alternating 4s and 6s: mean 5s, standard deviation 1s
    for i in 0..10 {
        let value = if i % 2 == 0 { 4.0 } else { 6.0 };
        let obs = BehaviorObservation::from([("session_duration".to_string(), value)]);
        assert!(analyzer.observe_at("user-42", &obs, now).is_none());
    }
    let profile = analyzer.profile("user-42").unwrap();
    let stats = profile.features["session_duration"];
    assert!((stats.mean - 5.0).abs() < 1e-9);
    assert!((stats.std_dev() - 1.0).abs() < 1e-9);

    let spike = BehaviorObservation::from([("session_duration".to_string(), 50.0)]);
    let score = warden_core::detect::behavior::anomaly_score(&profile, &spike, analyzer.config());
    assert!(score > 0.7);

    let signal = analyzer.observe_at("user-42", &spike, now).unwrap();
    assert_eq!(signal.threat_type, ThreatType::ANOMALY_DETECTED);
}

#[tokio::test]
async fn test_s4_ddos_triggers_block_via_critical_playbook() {
    let coordinator = CoordinatorBuilder::new(quiet_config()).build().unwrap();
    let start = Utc::now();
    let requests: Vec<RequestRecord> = (0..101)
        .map(|i| RequestRecord::new("203.0.113.77", "/", start + Duration::milliseconds(i * 100)))
        .collect();
    let now = start + Duration::seconds(11);

    let summary = coordinator.scan_requests_at(&requests, now).await;

    assert!(coordinator.network().is_ddos_at("203.0.113.77", now));
    let ddos = summary
        .outcomes
        .iter()
        .find(|o| o.threat.threat_type == ThreatType::DDOS_ATTACK)
        .unwrap();
    assert_eq!(ddos.threat.severity, ThreatSeverity::Critical);
    assert_eq!(ddos.trace.steps[0].step, ActionKind::BlockSource);
    assert_eq!(ddos.trace.steps[0].outcome, StepOutcome::Succeeded);
    assert!(coordinator.network().is_blocked_at("203.0.113.77", now));
}

#[tokio::test]
async fn test_s5_alert_cooldown() {
    let channel = Arc::new(CountingChannel::default());
    let dispatcher = AlertDispatcher::new(
        vec![channel.clone() as Arc<dyn NotificationChannel>],
        TemplateSet::default(),
        Duration::seconds(60),
        RetryPolicy::once(),
    );
    let registry = ThreatRegistry::new(Default::default());
    let t0 = Utc::now();
    let threat = registry
        .register(ThreatSignal::new(ThreatType::SQL_INJECTION, ThreatSeverity::Critical, "1.1.1.1", t0))
        .unwrap()
        .into_new()
        .unwrap();

    assert!(!dispatcher.dispatch_at(&threat, t0).await.is_suppressed());
    assert!(dispatcher.dispatch_at(&threat, t0 + Duration::seconds(30)).await.is_suppressed());
    assert_eq!(channel.delivered.load(Ordering::SeqCst), 1);

    assert!(!dispatcher.dispatch_at(&threat, t0 + Duration::seconds(61)).await.is_suppressed());
    assert_eq!(channel.delivered.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_step_does_not_abort_playbook() {
    let coordinator = CoordinatorBuilder::new(quiet_config())
        .with_action_handler(Arc::new(BrokenBlockHandler))
        .build()
        .unwrap();
    let raw = RawThreatReport {
        threat_type: Some("SQL_INJECTION".into()),
        severity: Some("CRITICAL".into()),
        source: Some("192.0.2.200".into()),
        detail: Some([("session_id".to_string(), serde_json::json!("sess-1"))].into()),
        ..Default::default()
    };
    let outcome = coordinator.report_threat(raw).await.unwrap().unwrap();

    let steps: Vec<(ActionKind, StepOutcome)> =
        outcome.trace.steps.iter().map(|s| (s.step, s.outcome)).collect();
    assert_eq!(
        steps,
        vec![
            (ActionKind::BlockSource, StepOutcome::Failed),
            (ActionKind::QuarantineSession, StepOutcome::Succeeded),
            (ActionKind::Notify, StepOutcome::Succeeded),
            (ActionKind::LogIncident, StepOutcome::Succeeded),
            (ActionKind::TriggerBackup, StepOutcome::Succeeded),
        ]
    );

    let incident = coordinator
        .incident(outcome.incident_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(incident.response_actions, outcome.trace.steps);
    assert!(!coordinator.network().is_blocked("192.0.2.200"));
}

#[tokio::test]
async fn test_deep_analysis_registers_correlated_threat_once() {
    let coordinator = CoordinatorBuilder::new(quiet_config()).build().unwrap();
    let now = Utc::now();
    for i in 0..6 {
        coordinator
            .ingest_signal_at(
                ThreatSignal::new(
                    ThreatType::AUTH_FAILURE,
                    ThreatSeverity::Low,
                    "1.2.3.4",
                    now - Duration::seconds(i),
                ),
                now,
            )
            .await;
    }
    coordinator
        .ingest_signal_at(
            ThreatSignal::new(ThreatType::THREAT_DETECTED, ThreatSeverity::Medium, "1.2.3.4", now),
            now,
        )
        .await;

    let first = coordinator.run_deep_analysis_at(now).await;
    assert_eq!(first.correlated.len(), 1);
    assert_eq!(first.correlated[0].threat.threat_type, ThreatType::COORDINATED_ATTACK);
    assert!(first.correlated[0].incident_id.is_some());

    let second = coordinator.run_deep_analysis_at(now).await;
    assert!(second.correlated.is_empty());

    let derived = &first.correlated[0].threat;
    let replay = ThreatSignal::new(
        derived.threat_type.clone(),
        derived.severity,
        derived.source.clone(),
        now,
    )
    .with_correlation_key(derived.correlation_key.clone().unwrap());
    assert!(matches!(
        coordinator.registry().register(replay),
        Ok(Registration::Duplicate(id)) if id == derived.id
    ));
}
