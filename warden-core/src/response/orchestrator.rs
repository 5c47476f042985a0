//! Fault-isolated playbook execution.

use super::actions::{ActionContext, ActionHandler};
use super::{ActionKind, ExecutionTrace, PlaybookPolicy, ResponseStep, StepOutcome, validate_playbooks};
use crate::config::ResponseConfig;
use crate::error::{ConfigError, ResponseActionError};
use crate::event::{ThreatEvent, ThreatSeverity};
use crate::health::{HealthReporter, HealthStatus, ModuleHealth};
use crate::retry::{RetryPolicy, with_retry};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Receives each step as soon as it finishes.
pub trait StepRecorder: Send + Sync {
    fn record_step(&self, incident_id: &str, step: &ResponseStep);
}

pub struct ResponseOrchestrator {
    playbooks: BTreeMap<ThreatSeverity, Vec<ActionKind>>,
    handlers: HashMap<ActionKind, Arc<dyn ActionHandler>>,
    retry: RetryPolicy,
    executions: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
}

impl ResponseOrchestrator {
    /// Fails when a severity has no playbook or an action has no handler.
    pub fn new(
        playbooks: &[PlaybookPolicy],
        handlers: Vec<Arc<dyn ActionHandler>>,
        retry: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        validate_playbooks(playbooks)?;
        let handlers: HashMap<ActionKind, Arc<dyn ActionHandler>> =
            handlers.into_iter().map(|h| (h.kind(), h)).collect();
        for policy in playbooks {
            if let Some(missing) = policy.actions.iter().find(|a| !handlers.contains_key(*a)) {
                return Err(ConfigError::MissingHandler(missing.to_string()));
            }
        }

        Ok(Self {
            playbooks: playbooks
                .iter()
                .map(|p| (p.severity, p.actions.clone()))
                .collect(),
            handlers,
            retry,
            executions: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        })
    }

    pub fn from_config(
        config: &ResponseConfig,
        handlers: Vec<Arc<dyn ActionHandler>>,
    ) -> Result<Self, ConfigError> {
        Self::new(
            &config.playbooks,
            handlers,
            RetryPolicy::new(
                config.max_attempts,
                config.retry_base_delay_ms,
                config.retry_max_delay_ms,
            ),
        )
    }

    pub fn playbook_for(&self, severity: ThreatSeverity) -> &[ActionKind] {
        self.playbooks
            .get(&severity)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub async fn execute(&self, threat: Arc<ThreatEvent>) -> ExecutionTrace {
        self.execute_at(threat, None, Utc::now()).await
    }

    /// Runs the playbook for the threat's severity.
    ///
    /// A failing step is recorded `FAILED` and the next step still runs.
    /// When an incident is given, every step is handed to `recorder` as soon
    /// as it completes.
    pub async fn execute_at(
        &self,
        threat: Arc<ThreatEvent>,
        incident: Option<(&str, &dyn StepRecorder)>,
        now: DateTime<Utc>,
    ) -> ExecutionTrace {
        self.executions.fetch_add(1, Ordering::Relaxed);
        let ctx = ActionContext {
            threat: threat.clone(),
            incident_id: incident.map(|(id, _)| id.to_string()),
            now,
        };
        let mut trace = ExecutionTrace {
            threat_id: threat.id.clone(),
            severity: threat.severity,
            incident_id: ctx.incident_id.clone(),
            steps: Vec::new(),
        };

        for &kind in self.playbook_for(threat.severity) {
            let step = self.run_step(kind, &ctx).await;
            match step.outcome {
                StepOutcome::Succeeded => self.succeeded.fetch_add(1, Ordering::Relaxed),
                StepOutcome::Failed => self.failed.fetch_add(1, Ordering::Relaxed),
                StepOutcome::Skipped => self.skipped.fetch_add(1, Ordering::Relaxed),
            };
            if let Some((incident_id, recorder)) = incident {
                recorder.record_step(incident_id, &step);
            }
            trace.steps.push(step);
        }

        tracing::info!(
            threat_id = %trace.threat_id,
            severity = %trace.severity,
            steps = trace.steps.len(),
            failed = trace.count(StepOutcome::Failed),
            "Playbook executed"
        );
        trace
    }

    async fn run_step(&self, kind: ActionKind, ctx: &ActionContext) -> ResponseStep {
        let Some(handler) = self.handlers.get(&kind) else {
            return ResponseStep {
                step: kind,
                timestamp: ctx.now,
                outcome: StepOutcome::Failed,
                attempts: 0,
                message: "no handler registered".into(),
            };
        };

        let (result, attempts) = with_retry(
            &self.retry,
            kind.as_str(),
            ResponseActionError::is_retryable,
            || {
                AssertUnwindSafe(handler.execute(ctx))
                    .catch_unwind()
                    .map(move |r| {
                        r.unwrap_or_else(|_| {
                            Err(ResponseActionError::Failed {
                                action: kind.to_string(),
                                message: "handler panicked".into(),
                            })
                        })
                    })
            },
        )
        .await;

        let (outcome, message) = match result {
            Ok(message) => (StepOutcome::Succeeded, message),
            Err(ResponseActionError::NotApplicable { reason, .. }) => (StepOutcome::Skipped, reason),
            Err(e) => {
                tracing::error!(
                    threat_id = %ctx.threat.id,
                    action = %kind,
                    attempts,
                    error = %e,
                    "Response action failed"
                );
                (StepOutcome::Failed, e.to_string())
            }
        };
        ResponseStep {
            step: kind,
            timestamp: ctx.now,
            outcome,
            attempts,
            message,
        }
    }
}

impl HealthReporter for ResponseOrchestrator {
    fn name(&self) -> &str {
        "response"
    }

    fn health(&self) -> ModuleHealth {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let mut health = ModuleHealth::healthy("response")
            .with_metric("executions", self.executions.load(Ordering::Relaxed) as f64)
            .with_metric("steps_succeeded", succeeded as f64)
            .with_metric("steps_failed", failed as f64)
            .with_metric("steps_skipped", self.skipped.load(Ordering::Relaxed) as f64);
        if failed > succeeded && failed > 0 {
            health = health.with_issue(
                HealthStatus::Warning,
                format!("{failed} response steps failed, {succeeded} succeeded"),
            );
        }
        health
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ThreatSignal, ThreatType};
    use crate::response::default_playbooks;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicU32;

    struct StubHandler {
        kind: ActionKind,
        calls: AtomicU32,
        fail_times: u32,
        not_applicable: bool,
    }

    impl StubHandler {
        fn ok(kind: ActionKind) -> Arc<Self> {
            Self::failing(kind, 0)
        }

        fn failing(kind: ActionKind, fail_times: u32) -> Arc<Self> {
            Arc::new(Self {
                kind,
                calls: AtomicU32::new(0),
                fail_times,
                not_applicable: false,
            })
        }
    }

    #[async_trait]
    impl ActionHandler for StubHandler {
        fn kind(&self) -> ActionKind {
            self.kind
        }

        async fn execute(&self, _ctx: &ActionContext) -> Result<String, ResponseActionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.not_applicable {
                return Err(ResponseActionError::NotApplicable {
                    action: self.kind.to_string(),
                    reason: "n/a".into(),
                });
            }
            if call < self.fail_times {
                return Err(ResponseActionError::Failed {
                    action: self.kind.to_string(),
                    message: "injected".into(),
                });
            }
            Ok("done".into())
        }
    }

    struct PanickingHandler;

    #[async_trait]
    impl ActionHandler for PanickingHandler {
        fn kind(&self) -> ActionKind {
            ActionKind::QuarantineSession
        }

        async fn execute(&self, _ctx: &ActionContext) -> Result<String, ResponseActionError> {
            panic!("session store exploded");
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, ActionKind, StepOutcome)>>);

    impl StepRecorder for Recorder {
        fn record_step(&self, incident_id: &str, step: &ResponseStep) {
            self.0
                .lock()
                .unwrap()
                .push((incident_id.to_string(), step.step, step.outcome));
        }
    }

    fn threat(severity: ThreatSeverity) -> Arc<ThreatEvent> {
        let signal = ThreatSignal::new(ThreatType::DDOS_ATTACK, severity, "10.0.0.9", Utc::now());
        Arc::new(ThreatEvent::from_signal("THR-000001".into(), signal))
    }

    fn all_ok() -> Vec<Arc<dyn ActionHandler>> {
        ActionKind::ALL
            .iter()
            .map(|k| StubHandler::ok(*k) as Arc<dyn ActionHandler>)
            .collect()
    }

    #[test]
    fn test_missing_handler_is_config_error() {
        let handlers = vec![StubHandler::ok(ActionKind::LogIncident) as Arc<dyn ActionHandler>];
        let err = ResponseOrchestrator::new(&default_playbooks(), handlers, RetryPolicy::once())
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingHandler(_)));
    }

    #[tokio::test]
    async fn test_playbook_order_follows_policy() {
        let orch = ResponseOrchestrator::new(&default_playbooks(), all_ok(), RetryPolicy::once()).unwrap();
        let trace = orch.execute(threat(ThreatSeverity::Medium)).await;
        let steps: Vec<ActionKind> = trace.steps.iter().map(|s| s.step).collect();
        assert_eq!(
            steps,
            vec![ActionKind::RateLimit, ActionKind::LogIncident, ActionKind::Notify]
        );
        assert!(trace.all_succeeded());
    }

    #[tokio::test]
    async fn test_retry_recovers_transient_failure() {
        let mut handlers = all_ok();
        let flaky = StubHandler::failing(ActionKind::LogIncident, 2);
        handlers.push(flaky.clone());
        let orch = ResponseOrchestrator::new(&default_playbooks(), handlers, RetryPolicy::new(3, 0, 0)).unwrap();

        let trace = orch.execute(threat(ThreatSeverity::Low)).await;
        assert_eq!(trace.steps[0].outcome, StepOutcome::Succeeded);
        assert_eq!(trace.steps[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_not_applicable_is_skipped_without_retry() {
        let mut handlers = all_ok();
        let na = Arc::new(StubHandler {
            kind: ActionKind::QuarantineSession,
            calls: AtomicU32::new(0),
            fail_times: 0,
            not_applicable: true,
        });
        handlers.push(na.clone());
        let orch = ResponseOrchestrator::new(&default_playbooks(), handlers, RetryPolicy::new(3, 0, 0)).unwrap();

        let trace = orch.execute(threat(ThreatSeverity::Critical)).await;
        assert_eq!(trace.steps[1].outcome, StepOutcome::Skipped);
        assert_eq!(na.calls.load(Ordering::SeqCst), 1);
        assert!(trace.all_succeeded());
    }

    #[tokio::test]
    async fn test_panicking_step_is_isolated_and_recorded() {
        let mut handlers = all_ok();
        handlers.push(Arc::new(PanickingHandler));
        let orch = ResponseOrchestrator::new(&default_playbooks(), handlers, RetryPolicy::once()).unwrap();
        let recorder = Recorder::default();

        let trace = orch
            .execute_at(
                threat(ThreatSeverity::Critical),
                Some(("INC-000001", &recorder as &dyn StepRecorder)),
                Utc::now(),
            )
            .await;

        assert_eq!(trace.failures(), vec![ActionKind::QuarantineSession]);
        assert_eq!(trace.steps.len(), 5);
        let recorded = recorder.0.lock().unwrap();
        assert_eq!(recorded.len(), 5);
        assert!(recorded.iter().all(|(id, _, _)| id == "INC-000001"));
        assert_eq!(recorded[4].1, ActionKind::TriggerBackup);
        assert_eq!(recorded[4].2, StepOutcome::Succeeded);
    }
}
