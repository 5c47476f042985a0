//! The coordinator wires every component together and exposes the public API.
//!
//! All collaborators are injected through [`CoordinatorBuilder`]; nothing is
//! looked up globally. The periodic tasks in [`crate::runtime`] call the
//! `run_*` methods here, and the snapshot methods (`threat_metrics`,
//! `security_status`, `executive_dashboard`) only read.

use crate::alerts::{
    Alert, AlertDispatcher, AlertQueue, AlertQueueReceiver, DispatchOutcome, DispatcherMetrics,
    DisplayChannel, NotificationChannel, alert_queue, build_channels,
};
use crate::analytics::{
    FrequencyPatternMiner, NoopPatternMiner, NoopThreatPredictor, PatternMiner, ThreatPrediction,
    ThreatPredictor,
};
use crate::collaborators::{
    AuditSource, BackupService, GeoIpResolver, InMemorySessionStore, LoggingBackupService,
    RequestLogSource, RequestRecord, SessionStore,
};
use crate::config::{PatternMinerKind, WardenConfig};
use crate::correlation::{Correlator, RuleSet as CorrelationRuleSet};
use crate::detect::{BehaviorAnalyzer, BehaviorObservation, Detector, NetworkMonitor, SignatureDetector};
use crate::error::{ConfigError, DetectorError, EventError, IncidentError, WardenError};
use crate::event::{RawThreatReport, ThreatEvent, ThreatSeverity, ThreatSignal};
use crate::health::{HealthMonitor, HealthReporter, HealthSnapshot, HealthStatus, ModuleHealth};
use crate::incident::{Evidence, Incident, IncidentManager, IncidentMetrics, IncidentReport};
use crate::inspector::{ScriptInspector, ScriptSubmission, script_channel};
use crate::posture::{PostureInputs, SecurityPosture, compute_posture};
use crate::registry::{Registration, RegistryMetrics, ThreatRegistry};
use crate::response::{
    ActionHandler, BlockSourceHandler, ExecutionTrace, LogIncidentHandler, NotifyHandler,
    QuarantineSessionHandler, RateLimitHandler, ResponseOrchestrator, StepRecorder,
    TriggerBackupHandler,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;

const DASHBOARD_TOP_SOURCES: usize = 5;
const DASHBOARD_RECENT: usize = 10;

/// What happened to one newly registered threat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreatOutcome {
    pub threat: ThreatEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    pub trace: ExecutionTrace,
}

/// Result of scanning a batch of requests.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub requests: usize,
    pub blocked_requests: usize,
    pub signals: usize,
    pub detector_failures: usize,
    pub outcomes: Vec<ThreatOutcome>,
}

/// Result of one deep-analysis pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeepAnalysisReport {
    pub events_considered: usize,
    pub correlated: Vec<ThreatOutcome>,
    pub mined: Vec<ThreatOutcome>,
    pub predictions: Vec<ThreatPrediction>,
}

/// Alerts handled while draining the queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub drained: usize,
    pub abandoned: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreatMetrics {
    pub registry: RegistryMetrics,
    pub alerts: DispatcherMetrics,
    pub alerts_enqueued: u64,
    pub alerts_dropped: u64,
    pub alerts_pending: usize,
    pub incidents: IncidentMetrics,
    pub blocked_sources: usize,
    pub behavior_profiles: usize,
    pub scan_cycles: u64,
    pub requests_scanned: u64,
    pub detector_failures: u64,
    pub rejected_reports: u64,
    pub scripts_scanned: u64,
    pub scripts_dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityStatus {
    pub overall: HealthStatus,
    pub posture: SecurityPosture,
    pub active_threats: usize,
    pub open_incidents: usize,
    pub blocked_sources: usize,
    pub modules: Vec<ModuleHealth>,
    pub health_checked_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCount {
    pub source: String,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSummary {
    pub healthy: usize,
    pub warning: usize,
    pub unhealthy: usize,
    pub error: usize,
}

impl ModuleSummary {
    fn from_snapshot(snapshot: &HealthSnapshot) -> Self {
        Self {
            healthy: snapshot.count_with_status(HealthStatus::Healthy),
            warning: snapshot.count_with_status(HealthStatus::Warning),
            unhealthy: snapshot.count_with_status(HealthStatus::Unhealthy),
            error: snapshot.count_with_status(HealthStatus::Error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutiveDashboard {
    pub generated_at: DateTime<Utc>,
    pub posture: SecurityPosture,
    pub overall_health: HealthStatus,
    pub total_threats: u64,
    pub active_threats: usize,
    pub blocked_sources: usize,
    pub open_incidents: usize,
    pub open_incidents_by_severity: BTreeMap<ThreatSeverity, usize>,
    pub top_sources: Vec<SourceCount>,
    pub recent_critical: Vec<ThreatEvent>,
    pub recent_alerts: Vec<Alert>,
    pub modules: ModuleSummary,
    pub predictions: Vec<ThreatPrediction>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentFinding {
    pub severity: ThreatSeverity,
    pub area: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityAssessment {
    pub assessed_at: DateTime<Utc>,
    pub posture: SecurityPosture,
    pub health: HealthSnapshot,
    pub findings: Vec<AssessmentFinding>,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Default)]
struct Counters {
    scan_cycles: AtomicU64,
    requests_scanned: AtomicU64,
    detector_failures: AtomicU64,
    rejected_reports: AtomicU64,
    scripts_scanned: AtomicU64,
}

/// Builds a [`Coordinator`] from configuration plus injected collaborators.
pub struct CoordinatorBuilder {
    config: WardenConfig,
    request_log: Option<Arc<dyn RequestLogSource>>,
    geo: Option<Arc<dyn GeoIpResolver>>,
    sessions: Option<Arc<dyn SessionStore>>,
    backup: Option<Arc<dyn BackupService>>,
    audit: Option<Arc<dyn AuditSource>>,
    detectors: Vec<Arc<dyn Detector>>,
    reporters: Vec<Arc<dyn HealthReporter>>,
    channels: Vec<Arc<dyn NotificationChannel>>,
    handlers: Vec<Arc<dyn ActionHandler>>,
    pattern_miner: Option<Arc<dyn PatternMiner>>,
    predictor: Option<Arc<dyn ThreatPredictor>>,
}

impl CoordinatorBuilder {
    pub fn new(config: WardenConfig) -> Self {
        Self {
            config,
            request_log: None,
            geo: None,
            sessions: None,
            backup: None,
            audit: None,
            detectors: Vec::new(),
            reporters: Vec::new(),
            channels: Vec::new(),
            handlers: Vec::new(),
            pattern_miner: None,
            predictor: None,
        }
    }

    pub fn with_request_log(mut self, source: Arc<dyn RequestLogSource>) -> Self {
        self.request_log = Some(source);
        self
    }

    pub fn with_geo_resolver(mut self, resolver: Arc<dyn GeoIpResolver>) -> Self {
        self.geo = Some(resolver);
        self
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_backup_service(mut self, backup: Arc<dyn BackupService>) -> Self {
        self.backup = Some(backup);
        self
    }

    pub fn with_audit_source(mut self, audit: Arc<dyn AuditSource>) -> Self {
        self.audit = Some(audit);
        self
    }

    /// Adds a detector that runs after the built-in ones on every request.
    pub fn with_detector(mut self, detector: Arc<dyn Detector>) -> Self {
        self.detectors.push(detector);
        self
    }

    /// Registers an external subsystem (auth, crypto, audit, ...) for health
    /// aggregation.
    pub fn with_health_reporter(mut self, reporter: Arc<dyn HealthReporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Adds a channel on top of those enabled in `alerts.channels`.
    pub fn with_channel(mut self, channel: Arc<dyn NotificationChannel>) -> Self {
        self.channels.push(channel);
        self
    }

    /// Replaces the built-in handler for the same action kind.
    pub fn with_action_handler(mut self, handler: Arc<dyn ActionHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn with_pattern_miner(mut self, miner: Arc<dyn PatternMiner>) -> Self {
        self.pattern_miner = Some(miner);
        self
    }

    pub fn with_threat_predictor(mut self, predictor: Arc<dyn ThreatPredictor>) -> Self {
        self.predictor = Some(predictor);
        self
    }

    /// Validates configuration and wires every component. Fails closed: no
    /// coordinator exists with an invalid rule table or playbook.
    pub fn build(self) -> Result<Coordinator, WardenError> {
        let config = self.config;
        config.validate()?;

        let signatures = Arc::new(SignatureDetector::new(config.signatures.resolve_rules()?)?);
        let behavior = Arc::new(BehaviorAnalyzer::new(config.behavior.clone()));
        let mut network = NetworkMonitor::new(config.network.clone());
        if let Some(geo) = self.geo {
            network = network.with_geo_resolver(geo);
        }
        let network = Arc::new(network);

        let registry = Arc::new(ThreatRegistry::new(config.registry.clone()));
        let window = crate::seconds(config.correlation.window_secs);
        let correlator = Arc::new(Correlator::new(
            CorrelationRuleSet::new(config.correlation.resolve_rules())?,
            window,
        ));
        let pattern_miner: Arc<dyn PatternMiner> = match self.pattern_miner {
            Some(miner) => miner,
            None => match config.correlation.pattern_miner {
                PatternMinerKind::Noop => Arc::new(NoopPatternMiner),
                PatternMinerKind::Frequency => Arc::new(FrequencyPatternMiner::new(
                    config.correlation.frequency_threshold,
                    window,
                )),
            },
        };
        let predictor: Arc<dyn ThreatPredictor> = match self.predictor {
            Some(predictor) => predictor,
            None => Arc::new(NoopThreatPredictor),
        };

        let (queue, receiver) = alert_queue(config.alerts.queue_capacity);
        let built = build_channels(&config.alerts.channels)
            .map_err(|e| ConfigError::invalid("alerts.channels", e.to_string()))?;
        let mut channels = built.channels;
        channels.extend(self.channels);
        let dispatcher = Arc::new(AlertDispatcher::from_config(&config.alerts, channels));

        let sessions: Arc<dyn SessionStore> = match self.sessions {
            Some(sessions) => sessions,
            None => Arc::new(InMemorySessionStore::new()),
        };
        let backup: Arc<dyn BackupService> = match self.backup {
            Some(backup) => backup,
            None => Arc::new(LoggingBackupService::new()),
        };
        let mut handlers: Vec<Arc<dyn ActionHandler>> = vec![
            Arc::new(BlockSourceHandler::new(network.clone())) as Arc<dyn ActionHandler>,
            Arc::new(RateLimitHandler::new(network.clone())),
            Arc::new(QuarantineSessionHandler::new(sessions)),
            Arc::new(NotifyHandler::new(queue.clone())),
            Arc::new(LogIncidentHandler),
            Arc::new(TriggerBackupHandler::new(backup)),
        ];
        // Later registrations win per action kind.
        handlers.extend(self.handlers);
        let orchestrator = Arc::new(ResponseOrchestrator::from_config(&config.response, handlers)?);

        let incidents = Arc::new(IncidentManager::load(&config.incidents)?);

        let mut detectors: Vec<Arc<dyn Detector>> =
            vec![network.clone() as Arc<dyn Detector>, signatures.clone(), behavior.clone()];
        detectors.extend(self.detectors);

        let mut reporters: Vec<Arc<dyn HealthReporter>> = detectors
            .iter()
            .map(|d| d.clone() as Arc<dyn HealthReporter>)
            .collect();
        reporters.push(registry.clone());
        reporters.push(correlator.clone());
        reporters.push(orchestrator.clone());
        reporters.push(dispatcher.clone());
        reporters.push(incidents.clone());
        reporters.extend(self.reporters);

        let (script_inspector, script_rx) = script_channel(config.monitoring.script_queue_capacity);

        tracing::info!(
            detectors = detectors.len(),
            modules = reporters.len(),
            channels = dispatcher.channel_names().len(),
            "Coordinator ready"
        );

        Ok(Coordinator {
            signatures,
            behavior,
            network,
            detectors,
            registry,
            correlator,
            pattern_miner,
            predictor,
            orchestrator,
            dispatcher,
            display: built.display,
            alert_queue: queue,
            alert_rx: tokio::sync::Mutex::new(receiver),
            incidents,
            health: HealthMonitor::new(reporters),
            request_log: self.request_log,
            audit: self.audit,
            script_inspector,
            script_rx: Mutex::new(Some(script_rx)),
            scan_cursor: Mutex::new(None),
            predictions: RwLock::new(Vec::new()),
            counters: Counters::default(),
            started_at: Utc::now(),
            config,
        })
    }
}

pub struct Coordinator {
    config: WardenConfig,
    signatures: Arc<SignatureDetector>,
    behavior: Arc<BehaviorAnalyzer>,
    network: Arc<NetworkMonitor>,
    /// Built-in detectors first, then injected ones.
    detectors: Vec<Arc<dyn Detector>>,
    registry: Arc<ThreatRegistry>,
    correlator: Arc<Correlator>,
    pattern_miner: Arc<dyn PatternMiner>,
    predictor: Arc<dyn ThreatPredictor>,
    orchestrator: Arc<ResponseOrchestrator>,
    dispatcher: Arc<AlertDispatcher>,
    display: Option<Arc<DisplayChannel>>,
    alert_queue: AlertQueue,
    alert_rx: tokio::sync::Mutex<AlertQueueReceiver>,
    incidents: Arc<IncidentManager>,
    health: HealthMonitor,
    request_log: Option<Arc<dyn RequestLogSource>>,
    audit: Option<Arc<dyn AuditSource>>,
    script_inspector: ScriptInspector,
    script_rx: Mutex<Option<mpsc::Receiver<ScriptSubmission>>>,
    scan_cursor: Mutex<Option<ScanCursor>>,
    predictions: RwLock<Vec<ThreatPrediction>>,
    counters: Counters,
    started_at: DateTime<Utc>,
}

impl Coordinator {
    pub fn builder(config: WardenConfig) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    pub fn config(&self) -> &WardenConfig {
        &self.config
    }

    pub fn signatures(&self) -> &SignatureDetector {
        &self.signatures
    }

    pub fn behavior(&self) -> &BehaviorAnalyzer {
        &self.behavior
    }

    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    pub fn registry(&self) -> &ThreatRegistry {
        &self.registry
    }

    pub fn incidents(&self) -> &IncidentManager {
        &self.incidents
    }

    pub fn health_monitor(&self) -> &HealthMonitor {
        &self.health
    }

    pub fn alert_queue(&self) -> &AlertQueue {
        &self.alert_queue
    }

    pub fn script_inspector(&self) -> ScriptInspector {
        self.script_inspector.clone()
    }

    /// Hands the script queue to the inspection task. `None` once taken.
    pub fn take_script_receiver(&self) -> Option<mpsc::Receiver<ScriptSubmission>> {
        self.script_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    // --- Threat intake ---

    /// Validates and registers an externally reported threat, then responds
    /// to it. Returns `Ok(None)` when it duplicates an active threat.
    pub async fn report_threat(
        &self,
        raw: RawThreatReport,
    ) -> Result<Option<ThreatOutcome>, EventError> {
        self.report_threat_at(raw, Utc::now()).await
    }

    pub async fn report_threat_at(
        &self,
        raw: RawThreatReport,
        now: DateTime<Utc>,
    ) -> Result<Option<ThreatOutcome>, EventError> {
        let signal = raw.into_signal(now).inspect_err(|e| {
            self.counters.rejected_reports.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(error = %e, "Rejected threat report");
        })?;
        Ok(self.ingest_signal_at(signal, now).await)
    }

    /// Registers a signal, opens an incident when severe enough, and runs the
    /// playbook for its severity.
    pub async fn ingest_signal_at(
        &self,
        signal: ThreatSignal,
        now: DateTime<Utc>,
    ) -> Option<ThreatOutcome> {
        let threat = match self.registry.register(signal) {
            Ok(Registration::New(threat)) => threat,
            Ok(Registration::Duplicate(id)) => {
                tracing::debug!(threat_id = %id, "Duplicate threat suppressed");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dropping malformed threat signal");
                return None;
            }
        };

        let incident_id = (threat.severity >= self.config.response.incident_min_severity)
            .then(|| self.incidents.open_for_threat_at(&threat, now));
        let recorder: &dyn StepRecorder = &*self.incidents;
        let trace = self
            .orchestrator
            .execute_at(
                threat.clone(),
                incident_id.as_deref().map(|id| (id, recorder)),
                now,
            )
            .await;

        Some(ThreatOutcome {
            threat: threat.as_ref().clone(),
            incident_id,
            trace,
        })
    }

    async fn ingest_all(&self, signals: Vec<ThreatSignal>, now: DateTime<Utc>) -> Vec<ThreatOutcome> {
        let mut outcomes = Vec::new();
        for signal in signals {
            if let Some(outcome) = self.ingest_signal_at(signal, now).await {
                outcomes.push(outcome);
            }
        }
        outcomes
    }

    pub fn resolve_threat(&self, id: &str) -> bool {
        let resolved = self.registry.resolve(id);
        if resolved {
            tracing::info!(threat_id = %id, "Threat resolved");
        }
        resolved
    }

    // --- Scanning ---

    /// Runs every detector over `requests`.
    ///
    /// Requests from a blocked source are not inspected. A detector that
    /// errors or panics is demoted in module health and the remaining
    /// detectors still run.
    pub async fn scan_requests_at(
        &self,
        requests: &[RequestRecord],
        now: DateTime<Utc>,
    ) -> ScanSummary {
        let mut summary = ScanSummary {
            requests: requests.len(),
            ..Default::default()
        };
        let mut signals = Vec::new();
        let mut failing: BTreeSet<String> = BTreeSet::new();

        for request in requests {
            if self.network.is_blocked_at(&request.ip, now) {
                summary.blocked_requests += 1;
                signals.extend(self.network.blocked_activity_at(&request.ip, now));
                continue;
            }
            for detector in &self.detectors {
                match inspect_guarded(detector.as_ref(), request, now) {
                    Ok(found) => signals.extend(found),
                    Err(e) => {
                        summary.detector_failures += 1;
                        tracing::error!(detector = %detector.name(), error = %e, "Detector failed");
                        self.health.demote(detector.name(), e.to_string());
                        failing.insert(detector.name().to_string());
                    }
                }
            }
        }

        if summary.requests > summary.blocked_requests {
            for detector in &self.detectors {
                if !failing.contains(detector.name()) {
                    self.health.clear_demotion(detector.name());
                }
            }
        }

        self.counters
            .requests_scanned
            .fetch_add(requests.len() as u64, Ordering::Relaxed);
        self.counters
            .detector_failures
            .fetch_add(summary.detector_failures as u64, Ordering::Relaxed);
        summary.signals = signals.len();
        summary.outcomes = self.ingest_all(signals, now).await;
        summary
    }

    pub async fn run_scan_cycle(&self) -> ScanSummary {
        self.run_scan_cycle_at(Utc::now()).await
    }

    /// Pulls requests newer than the last scanned one from the request log
    /// and scans them.
    pub async fn run_scan_cycle_at(&self, now: DateTime<Utc>) -> ScanSummary {
        self.counters.scan_cycles.fetch_add(1, Ordering::Relaxed);
        let Some(log) = &self.request_log else {
            return ScanSummary::default();
        };

        let since = self
            .scan_cursor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or_else(
                || now - crate::seconds(self.config.monitoring.scan_interval_secs),
                |c| c.at,
            );

        let fetched = match log.get_recent_requests(since).await {
            Ok(requests) => requests,
            Err(e) => {
                tracing::warn!(error = %e, "Request log unavailable, skipping scan cycle");
                return ScanSummary::default();
            }
        };

        let requests = {
            let mut cursor = self.scan_cursor.lock().unwrap_or_else(PoisonError::into_inner);
            let fresh = match cursor.as_mut() {
                Some(c) => c.admit(fetched),
                None => fetched,
            };
            ScanCursor::advance(&mut cursor, &fresh);
            fresh
        };

        let summary = self.scan_requests_at(&requests, now).await;
        if summary.signals > 0 {
            tracing::info!(
                requests = summary.requests,
                signals = summary.signals,
                registered = summary.outcomes.len(),
                "Scan cycle complete"
            );
        }
        summary
    }

    pub async fn scan_script(&self, content: &str, origin: &str) -> Vec<ThreatOutcome> {
        self.scan_script_at(content, origin, Utc::now()).await
    }

    pub async fn scan_script_at(
        &self,
        content: &str,
        origin: &str,
        now: DateTime<Utc>,
    ) -> Vec<ThreatOutcome> {
        self.counters.scripts_scanned.fetch_add(1, Ordering::Relaxed);
        let signals = self.signatures.scan_script_at(content, origin, now);
        self.ingest_all(signals, now).await
    }

    pub async fn observe_behavior(
        &self,
        entity_id: &str,
        features: &BehaviorObservation,
    ) -> Option<ThreatOutcome> {
        self.observe_behavior_at(entity_id, features, Utc::now()).await
    }

    /// Feeds one observation into the entity's baseline.
    pub async fn observe_behavior_at(
        &self,
        entity_id: &str,
        features: &BehaviorObservation,
        now: DateTime<Utc>,
    ) -> Option<ThreatOutcome> {
        let signal = self.behavior.observe_at(entity_id, features, now)?;
        self.ingest_signal_at(signal, now).await
    }

    // --- Deep analysis ---

    pub async fn run_deep_analysis(&self) -> DeepAnalysisReport {
        self.run_deep_analysis_at(Utc::now()).await
    }

    /// Correlates and mines the events inside the correlation window.
    pub async fn run_deep_analysis_at(&self, now: DateTime<Utc>) -> DeepAnalysisReport {
        let events = self.registry.events_since(now - self.correlator.window());

        let derived = self.correlator.correlate_at(&events, now);
        let correlated = self.ingest_all(derived, now).await;

        let mined_signals = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.pattern_miner.mine(&events, now)
        }))
        .unwrap_or_else(|_| {
            tracing::error!(miner = %self.pattern_miner.name(), "Pattern miner panicked");
            Vec::new()
        });
        let mined = self.ingest_all(mined_signals, now).await;

        let predictions = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.predictor.predict(&events, now)
        }))
        .unwrap_or_else(|_| {
            tracing::error!(predictor = %self.predictor.name(), "Threat predictor panicked");
            Vec::new()
        });
        *self.predictions.write().unwrap_or_else(PoisonError::into_inner) = predictions.clone();

        tracing::debug!(
            events = events.len(),
            correlated = correlated.len(),
            mined = mined.len(),
            "Deep analysis complete"
        );
        DeepAnalysisReport {
            events_considered: events.len(),
            correlated,
            mined,
            predictions,
        }
    }

    // --- Health ---

    pub fn run_health_check(&self) -> HealthSnapshot {
        self.run_health_check_at(Utc::now())
    }

    /// Reclaims expired state, then polls every registered module.
    pub fn run_health_check_at(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let network = self.network.sweep(now);
        let profiles = self.behavior.sweep(now);
        let cooldowns = self.dispatcher.sweep(now);
        let evicted = self.registry.enforce_caps();
        if network + profiles + cooldowns + evicted > 0 {
            tracing::debug!(network, profiles, cooldowns, evicted, "Expired state reclaimed");
        }
        self.health.check_all(now)
    }

    // --- Alerts ---

    /// Waits for the next queued alert. Cancel-safe.
    pub async fn next_alert(&self) -> Option<Arc<ThreatEvent>> {
        self.alert_rx.lock().await.recv().await
    }

    pub async fn dispatch_alert(&self, threat: &ThreatEvent) -> DispatchOutcome {
        self.dispatcher.dispatch(threat).await
    }

    pub async fn dispatch_alert_at(&self, threat: &ThreatEvent, now: DateTime<Utc>) -> DispatchOutcome {
        self.dispatcher.dispatch_at(threat, now).await
    }

    /// Dispatches everything currently queued without waiting for more.
    pub async fn dispatch_pending_at(&self, now: DateTime<Utc>) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::new();
        loop {
            let next = self.alert_rx.lock().await.try_recv();
            let Some(threat) = next else { break };
            outcomes.push(self.dispatcher.dispatch_at(&threat, now).await);
        }
        outcomes
    }

    /// Dispatches queued alerts until the queue is empty or `timeout` passes.
    pub async fn drain_alerts(&self, timeout: StdDuration) -> DrainReport {
        let mut drained = 0;
        let finished = tokio::time::timeout(timeout, async {
            loop {
                let next = self.alert_rx.lock().await.try_recv();
                let Some(threat) = next else { break };
                self.dispatcher.dispatch(&threat).await;
                drained += 1;
            }
        })
        .await;
        let abandoned = self.alert_rx.lock().await.len();
        if finished.is_err() {
            tracing::warn!(drained, abandoned, "Alert drain timed out");
        }
        DrainReport { drained, abandoned }
    }

    // --- Incidents ---

    pub fn report_security_incident(&self, report: IncidentReport) -> String {
        self.incidents.report(report)
    }

    /// Assigns to `assignee`, or to the team routed for the incident's
    /// category when `None`. Returns the assignee.
    pub fn assign_incident(&self, id: &str, assignee: Option<&str>) -> Result<String, IncidentError> {
        self.incidents.assign(id, assignee)
    }

    pub fn start_incident(&self, id: &str, actor: &str) -> Result<(), IncidentError> {
        self.incidents.start(id, actor)
    }

    pub fn resolve_incident(&self, id: &str, actor: &str, note: Option<&str>) -> Result<(), IncidentError> {
        self.incidents.resolve(id, actor, note)
    }

    pub fn reopen_incident(&self, id: &str, actor: &str, note: Option<&str>) -> Result<(), IncidentError> {
        self.incidents.reopen(id, actor, note)
    }

    pub fn close_incident(&self, id: &str, actor: &str) -> Result<(), IncidentError> {
        self.incidents.close(id, actor)
    }

    pub fn add_incident_evidence(&self, id: &str, evidence: Evidence) -> Result<(), IncidentError> {
        self.incidents.add_evidence(id, evidence)
    }

    pub fn incident(&self, id: &str) -> Option<Incident> {
        self.incidents.get(id)
    }

    // --- Snapshots ---

    fn posture(&self, health: &HealthSnapshot) -> SecurityPosture {
        let audit = self.audit.as_ref().and_then(|source| {
            std::panic::catch_unwind(AssertUnwindSafe(|| source.audit_snapshot()))
                .inspect_err(|_| tracing::error!("Audit source panicked"))
                .ok()
        });
        compute_posture(
            &self.config.posture,
            PostureInputs {
                active_critical_threats: self.registry.active_with_severity(ThreatSeverity::Critical),
                audit,
                health: Some(health),
            },
        )
    }

    pub fn threat_metrics(&self) -> ThreatMetrics {
        ThreatMetrics {
            registry: self.registry.metrics(),
            alerts: self.dispatcher.metrics(),
            alerts_enqueued: self.alert_queue.enqueued(),
            alerts_dropped: self.alert_queue.dropped(),
            alerts_pending: self.alert_queue.pending(),
            incidents: self.incidents.metrics(),
            blocked_sources: self.network.blocked_sources_at(Utc::now()).len(),
            behavior_profiles: self.behavior.profile_count(),
            scan_cycles: self.counters.scan_cycles.load(Ordering::Relaxed),
            requests_scanned: self.counters.requests_scanned.load(Ordering::Relaxed),
            detector_failures: self.counters.detector_failures.load(Ordering::Relaxed),
            rejected_reports: self.counters.rejected_reports.load(Ordering::Relaxed),
            scripts_scanned: self.counters.scripts_scanned.load(Ordering::Relaxed),
            scripts_dropped: self.script_inspector.dropped(),
        }
    }

    /// Uses the last health snapshot; never polls modules.
    pub fn security_status(&self) -> SecurityStatus {
        let health = self.health.last_snapshot();
        SecurityStatus {
            overall: health.overall,
            posture: self.posture(&health),
            active_threats: self.registry.active_count(),
            open_incidents: self.incidents.active().len(),
            blocked_sources: self.network.blocked_sources_at(Utc::now()).len(),
            health_checked_at: health.checked_at,
            modules: health.modules,
            started_at: self.started_at,
        }
    }

    pub fn executive_dashboard(&self) -> ExecutiveDashboard {
        let now = Utc::now();
        let health = self.health.last_snapshot();
        let posture = self.posture(&health);
        let registry = self.registry.metrics();
        let blocked_sources = self.network.blocked_sources_at(now).len();

        let mut open_incidents_by_severity = BTreeMap::new();
        let open = self.incidents.active();
        for incident in &open {
            *open_incidents_by_severity.entry(incident.severity).or_insert(0) += 1;
        }

        let recent_critical = self
            .registry
            .recent(self.registry.history_len())
            .into_iter()
            .filter(|e| e.severity == ThreatSeverity::Critical)
            .take(DASHBOARD_RECENT)
            .map(|e| e.as_ref().clone())
            .collect();

        let recommendations = recommendations(
            &posture,
            &health,
            self.alert_queue.dropped(),
            blocked_sources,
        );

        ExecutiveDashboard {
            generated_at: now,
            overall_health: health.overall,
            total_threats: registry.total_registered,
            active_threats: registry.active,
            blocked_sources,
            open_incidents: open.len(),
            open_incidents_by_severity,
            top_sources: self
                .registry
                .top_sources(DASHBOARD_TOP_SOURCES)
                .into_iter()
                .map(|(source, count)| SourceCount { source, count })
                .collect(),
            recent_critical,
            recent_alerts: self
                .display
                .as_ref()
                .map(|d| d.recent(DASHBOARD_RECENT))
                .unwrap_or_default(),
            modules: ModuleSummary::from_snapshot(&health),
            predictions: self
                .predictions
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            posture,
            recommendations,
        }
    }

    pub fn perform_security_assessment(&self) -> SecurityAssessment {
        self.perform_security_assessment_at(Utc::now())
    }

    /// Runs a fresh health check and grades the result.
    pub fn perform_security_assessment_at(&self, now: DateTime<Utc>) -> SecurityAssessment {
        let health = self.run_health_check_at(now);
        let posture = self.posture(&health);
        let dropped = self.alert_queue.dropped();
        let blocked = self.network.blocked_sources_at(now).len();

        let mut findings = Vec::new();
        for module in health.modules.iter().filter(|m| m.status > HealthStatus::Healthy) {
            let severity = match module.status {
                HealthStatus::Error => ThreatSeverity::High,
                HealthStatus::Unhealthy => ThreatSeverity::Medium,
                _ => ThreatSeverity::Low,
            };
            findings.push(AssessmentFinding {
                severity,
                area: format!("module:{}", module.name),
                message: format!("{} is {}: {}", module.name, module.status, module.issues.join("; ")),
            });
        }
        if posture.active_critical_threats > 0 {
            findings.push(AssessmentFinding {
                severity: ThreatSeverity::Critical,
                area: "threats".into(),
                message: format!("{} active critical threat(s)", posture.active_critical_threats),
            });
        }
        if posture.critical_findings > 0 {
            findings.push(AssessmentFinding {
                severity: ThreatSeverity::High,
                area: "audit".into(),
                message: format!("{} critical audit finding(s)", posture.critical_findings),
            });
        }
        if let Some(score) = posture.compliance_score.filter(|s| *s < 80.0) {
            findings.push(AssessmentFinding {
                severity: if score < 60.0 { ThreatSeverity::High } else { ThreatSeverity::Medium },
                area: "compliance".into(),
                message: format!("compliance score {score:.1} is below 80"),
            });
        }
        if dropped > 0 {
            findings.push(AssessmentFinding {
                severity: ThreatSeverity::Medium,
                area: "alerts".into(),
                message: format!("{dropped} alert(s) dropped on a full queue"),
            });
        }
        if blocked > 0 {
            findings.push(AssessmentFinding {
                severity: ThreatSeverity::Low,
                area: "network".into(),
                message: format!("{blocked} source(s) currently blocked"),
            });
        }
        findings.sort_by(|a, b| b.severity.cmp(&a.severity));

        tracing::info!(
            score = posture.score,
            level = %posture.level,
            findings = findings.len(),
            "Security assessment complete"
        );

        SecurityAssessment {
            assessed_at: now,
            recommendations: recommendations(&posture, &health, dropped, blocked),
            posture,
            health,
            findings,
        }
    }
}

fn inspect_guarded(
    detector: &dyn Detector,
    request: &RequestRecord,
    now: DateTime<Utc>,
) -> Result<Vec<ThreatSignal>, DetectorError> {
    std::panic::catch_unwind(AssertUnwindSafe(|| detector.inspect_request(request, now)))
        .unwrap_or_else(|_| Err(DetectorError::Panicked(detector.name().to_string())))
}

fn recommendations(
    posture: &SecurityPosture,
    health: &HealthSnapshot,
    alerts_dropped: u64,
    blocked_sources: usize,
) -> Vec<String> {
    let mut out = Vec::new();
    for module in health.modules.iter().filter(|m| m.status >= HealthStatus::Unhealthy) {
        out.push(format!("Investigate module '{}' ({})", module.name, module.status));
    }
    if posture.active_critical_threats > 0 {
        out.push(format!(
            "Resolve {} active critical threat(s)",
            posture.active_critical_threats
        ));
    }
    if posture.critical_findings > 0 {
        out.push(format!(
            "Remediate {} critical audit finding(s)",
            posture.critical_findings
        ));
    }
    if let Some(score) = posture.compliance_score.filter(|s| *s < 80.0) {
        out.push(format!("Raise compliance score (currently {score:.1})"));
    }
    if alerts_dropped > 0 {
        out.push(format!(
            "Increase alerts.queue_capacity: {alerts_dropped} alert(s) were dropped"
        ));
    }
    if blocked_sources > 0 {
        out.push(format!("Review {blocked_sources} blocked source(s)"));
    }
    if out.is_empty() {
        out.push("No action required".into());
    }
    out
}

/// Newest request timestamp already scanned, plus fingerprints of the
/// requests scanned at exactly that instant. Log sources return requests at or
/// after the cursor, so a request logged late with the cursor's timestamp is
/// still picked up once.
#[derive(Debug)]
struct ScanCursor {
    at: DateTime<Utc>,
    seen: HashMap<u64, usize>,
}

impl ScanCursor {
    fn fingerprint(request: &RequestRecord) -> u64 {
        let mut hasher = DefaultHasher::new();
        request.hash(&mut hasher);
        hasher.finish()
    }

    /// Drop requests already scanned. Identical requests at the cursor
    /// instant are counted, so a repeat is admitted once per new copy.
    fn admit(&mut self, fetched: Vec<RequestRecord>) -> Vec<RequestRecord> {
        let mut seen = self.seen.clone();
        fetched
            .into_iter()
            .filter(|r| match r.timestamp.cmp(&self.at) {
                std::cmp::Ordering::Less => false,
                std::cmp::Ordering::Greater => true,
                std::cmp::Ordering::Equal => match seen.get_mut(&Self::fingerprint(r)) {
                    Some(n) if *n > 0 => {
                        *n -= 1;
                        false
                    }
                    _ => true,
                },
            })
            .collect()
    }

    fn advance(cursor: &mut Option<ScanCursor>, scanned: &[RequestRecord]) {
        let Some(newest) = scanned.iter().map(|r| r.timestamp).max() else {
            return;
        };
        let current = cursor.get_or_insert_with(|| ScanCursor {
            at: newest,
            seen: HashMap::new(),
        });
        if newest > current.at {
            *current = ScanCursor {
                at: newest,
                seen: HashMap::new(),
            };
        }
        if newest == current.at {
            for r in scanned.iter().filter(|r| r.timestamp == newest) {
                *current.seen.entry(Self::fingerprint(r)).or_default() += 1;
            }
        }
    }
}
