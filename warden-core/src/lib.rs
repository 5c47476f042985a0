//! Warden: threat detection, correlation and incident response.
//!
//! Detectors turn requests, scripts and behavior observations into threat
//! signals. The registry stores them, the correlator derives composite
//! threats, the response orchestrator runs a severity-keyed playbook, and the
//! alert dispatcher fans notifications out across channels. The
//! [`Coordinator`] wires all of it together; [`SecurityRuntime`] drives it
//! with cancellable periodic tasks.
//!
//! ```no_run
//! # async fn demo() -> Result<(), warden_core::WardenError> {
//! use std::sync::Arc;
//! use warden_core::{CoordinatorBuilder, SecurityRuntime, WardenConfig};
//!
//! let coordinator = Arc::new(CoordinatorBuilder::new(WardenConfig::default()).build()?);
//! let runtime = SecurityRuntime::start(coordinator.clone());
//! // ...
//! let report = runtime.shutdown().await;
//! println!("drained {} alerts", report.drained);
//! # Ok(())
//! # }
//! ```

pub mod alerts;
pub mod analytics;
pub mod collaborators;
pub mod config;
pub mod coordinator;
pub mod correlation;
pub mod detect;
pub mod error;
pub mod event;
pub mod gateway;
pub mod health;
pub mod incident;
pub mod inspector;
pub mod persistence;
pub mod posture;
pub mod registry;
pub mod response;
pub mod retry;
pub mod runtime;

pub use alerts::{Alert, AlertDispatcher, DispatchOutcome, NotificationChannel};
pub use analytics::{PatternMiner, ThreatPrediction, ThreatPredictor};
pub use collaborators::{
    AuditSnapshot, AuditSource, BackupService, GeoIpResolver, GeoLocation, RequestLogSource,
    RequestRecord, SessionStore,
};
pub use config::{WardenConfig, load_config};
pub use coordinator::{
    Coordinator, CoordinatorBuilder, ExecutiveDashboard, SecurityAssessment, SecurityStatus,
    ThreatMetrics, ThreatOutcome,
};
pub use correlation::{CorrelationRule, Correlator};
pub use detect::{BehaviorAnalyzer, Detector, NetworkMonitor, SignatureDetector, SignatureRule};
pub use error::{
    AlertDeliveryError, ChannelError, ConfigError, DetectorError, EventError, IncidentError,
    ResponseActionError, WardenError,
};
pub use event::{RawThreatReport, ThreatEvent, ThreatSeverity, ThreatSignal, ThreatType};
pub use health::{HealthReporter, HealthSnapshot, HealthStatus, ModuleHealth};
pub use incident::{Incident, IncidentManager, IncidentReport, IncidentStatus};
pub use inspector::ScriptInspector;
pub use posture::{PostureLevel, SecurityPosture};
pub use registry::ThreatRegistry;
pub use response::{ActionKind, ExecutionTrace, PlaybookPolicy, ResponseOrchestrator};
pub use runtime::{RuntimeHandle, SecurityRuntime, ShutdownReport};

/// Config seconds as a chrono duration. Clamped to about a century so
/// oversized values cannot overflow date arithmetic.
pub(crate) fn seconds(value: u64) -> chrono::Duration {
    chrono::Duration::seconds(value.min(3_153_600_000) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seconds_clamps() {
        assert_eq!(seconds(60), chrono::Duration::minutes(1));
        assert_eq!(seconds(u64::MAX), seconds(3_153_600_000));
    }
}
