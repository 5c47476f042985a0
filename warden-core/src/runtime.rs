//! Background tasks driving a [`Coordinator`].
//!
//! Five tasks share one cancellation token: scan, deep analysis and health
//! check on their own tickers, plus alert dispatch and script inspection
//! fed by queues. Cancellation is observed between ticks only, so a tick
//! that has started always runs to completion.

use crate::coordinator::{Coordinator, DrainReport};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// What [`RuntimeHandle::shutdown`] observed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownReport {
    /// Alerts dispatched while draining.
    pub drained: usize,
    /// Alerts still queued when the drain timed out.
    pub abandoned: usize,
    /// Tasks that ended in a panic.
    pub failed_tasks: usize,
}

impl From<DrainReport> for ShutdownReport {
    fn from(report: DrainReport) -> Self {
        Self {
            drained: report.drained,
            abandoned: report.abandoned,
            failed_tasks: 0,
        }
    }
}

pub struct SecurityRuntime;

impl SecurityRuntime {
    /// Spawns every task on the current tokio runtime.
    pub fn start(coordinator: Arc<Coordinator>) -> RuntimeHandle {
        let token = CancellationToken::new();
        let monitoring = coordinator.config().monitoring.clone();
        let mut tasks = Vec::with_capacity(5);

        let c = coordinator.clone();
        tasks.push((
            "scan",
            spawn_periodic(
                "scan",
                Duration::from_secs(monitoring.scan_interval_secs),
                token.clone(),
                move || {
                    let c = c.clone();
                    async move {
                        c.run_scan_cycle().await;
                    }
                },
            ),
        ));

        let c = coordinator.clone();
        tasks.push((
            "deep-analysis",
            spawn_periodic(
                "deep-analysis",
                Duration::from_secs(monitoring.deep_analysis_interval_secs),
                token.clone(),
                move || {
                    let c = c.clone();
                    async move {
                        c.run_deep_analysis().await;
                    }
                },
            ),
        ));

        let c = coordinator.clone();
        tasks.push((
            "health-check",
            spawn_periodic(
                "health-check",
                Duration::from_secs(monitoring.health_check_interval_secs),
                token.clone(),
                move || {
                    let c = c.clone();
                    async move {
                        c.run_health_check();
                    }
                },
            ),
        ));

        tasks.push(("alert-dispatch", spawn_dispatch(coordinator.clone(), token.clone())));
        tasks.push(("script-inspection", spawn_script_inspection(coordinator.clone(), token.clone())));

        tracing::info!(
            scan_interval_secs = monitoring.scan_interval_secs,
            deep_analysis_interval_secs = monitoring.deep_analysis_interval_secs,
            health_check_interval_secs = monitoring.health_check_interval_secs,
            "Security runtime started"
        );

        RuntimeHandle {
            coordinator,
            token,
            tasks,
            shutdown_timeout: Duration::from_secs(monitoring.shutdown_timeout_secs),
        }
    }
}

/// Owner of the running tasks.
pub struct RuntimeHandle {
    coordinator: Arc<Coordinator>,
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
    shutdown_timeout: Duration,
}

impl RuntimeHandle {
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Token cancelled at shutdown; other services can share it.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Stops ticking, waits for in-flight ticks, then drains the alert
    /// queue within `monitoring.shutdown_timeout_secs`.
    pub async fn shutdown(self) -> ShutdownReport {
        tracing::info!("Security runtime shutting down");
        self.token.cancel();

        let mut failed_tasks = 0;
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                failed_tasks += 1;
                tracing::error!(task = name, error = %e, "Runtime task ended abnormally");
            }
        }

        let mut report = ShutdownReport::from(self.coordinator.drain_alerts(self.shutdown_timeout).await);
        report.failed_tasks = failed_tasks;
        tracing::info!(
            drained = report.drained,
            abandoned = report.abandoned,
            failed_tasks = report.failed_tasks,
            "Security runtime stopped"
        );
        report
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    token: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        tracing::debug!(task = name, "Periodic task stopped");
    })
}

fn spawn_dispatch(coordinator: Arc<Coordinator>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = coordinator.next_alert() => match next {
                    Some(threat) => {
                        coordinator.dispatch_alert(&threat).await;
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(task = "alert-dispatch", "Dispatch task stopped");
    })
}

fn spawn_script_inspection(coordinator: Arc<Coordinator>, token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut rx) = coordinator.take_script_receiver() else {
            tracing::warn!("Script queue already taken; inspection task not started");
            return;
        };
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = rx.recv() => match next {
                    Some(submission) => {
                        let outcomes = coordinator
                            .scan_script_at(&submission.content, &submission.origin, submission.received_at)
                            .await;
                        if !outcomes.is_empty() {
                            tracing::info!(
                                origin = %submission.origin,
                                threats = outcomes.len(),
                                "Malicious script content detected"
                            );
                        }
                    }
                    None => break,
                },
            }
        }
        tracing::debug!(task = "script-inspection", "Script inspection task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryRequestLog, RequestRecord};
    use crate::config::WardenConfig;
    use crate::coordinator::CoordinatorBuilder;
    use crate::event::RawThreatReport;
    use chrono::Utc;

    fn config() -> WardenConfig {
        let mut config = WardenConfig::default();
        config.alerts.channels.console = false;
        config.response.max_attempts = 1;
        config
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_tasks_tick_until_shutdown() {
        let coordinator = Arc::new(CoordinatorBuilder::new(config()).build().unwrap());
        let handle = SecurityRuntime::start(coordinator.clone());

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(coordinator.threat_metrics().scan_cycles >= 2);
        assert!(!coordinator.health_monitor().last_snapshot().modules.is_empty());

        let report = handle.shutdown().await;
        assert_eq!(report, ShutdownReport::default());

        let cycles = coordinator.threat_metrics().scan_cycles;
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(coordinator.threat_metrics().scan_cycles, cycles);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_task_reads_request_log() {
        let log = Arc::new(InMemoryRequestLog::new(10));
        let coordinator = Arc::new(
            CoordinatorBuilder::new(config())
                .with_request_log(log.clone())
                .build()
                .unwrap(),
        );
        let handle = SecurityRuntime::start(coordinator.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;

        log.push(RequestRecord::new("192.0.2.44", "/item", Utc::now()).with_body("' OR 1=1 --"));
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(coordinator.threat_metrics().requests_scanned, 1);
        assert!(coordinator.registry().active_count() >= 1);
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_task_delivers_queued_alerts() {
        let coordinator = Arc::new(CoordinatorBuilder::new(config()).build().unwrap());
        let handle = SecurityRuntime::start(coordinator.clone());

        let raw = RawThreatReport {
            threat_type: Some("DDOS_ATTACK".into()),
            severity: Some("HIGH".into()),
            source: Some("10.9.9.9".into()),
            ..Default::default()
        };
        coordinator.report_threat(raw).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.threat_metrics().alerts.dispatched, 1);
        let report = handle.shutdown().await;
        assert_eq!(report.drained, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_script_inspection_task_scans_submissions() {
        let coordinator = Arc::new(CoordinatorBuilder::new(config()).build().unwrap());
        let inspector = coordinator.script_inspector();
        let handle = SecurityRuntime::start(coordinator.clone());

        assert!(inspector.submit("document.write(unescape('%3Cscript'))", "cdn.example.net/x.js"));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(coordinator.threat_metrics().scripts_scanned, 1);
        handle.shutdown().await;
    }
}
