//! Detectors: turn raw observations into threat signals.
//!
//! Every detector is a [`Detector`] and also reports its own health. The
//! coordinator drives them from the scan loop; a detector that fails or
//! panics is contained and demoted rather than stopping the loop.

pub mod behavior;
pub mod network;
pub mod signature;

use crate::collaborators::RequestRecord;
use crate::error::DetectorError;
use crate::event::ThreatSignal;
use crate::health::HealthReporter;
use chrono::{DateTime, Utc};

pub use behavior::{BehaviorAnalyzer, BehaviorObservation, BehaviorProfile, FeatureStats};
pub use network::{BlockEntry, NetworkMonitor, RateDecision};
pub use signature::{ScanField, SignatureDetector, SignatureRule};

/// A component that inspects individual requests.
pub trait Detector: HealthReporter {
    /// Inspect one request. Windows are keyed on `request.timestamp`;
    /// expirations are checked against `now`.
    fn inspect_request(
        &self,
        request: &RequestRecord,
        now: DateTime<Utc>,
    ) -> Result<Vec<ThreatSignal>, DetectorError>;
}

/// Truncate `s` to at most `max` characters, appending `...` when cut.
pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{cut}...")
    }
}
