//! Alert deduplication and fan-out.

pub mod channels;
pub mod dispatcher;
pub mod queue;
pub mod template;

pub use channels::{
    BuiltChannels, ConsoleChannel, DisplayChannel, EmailChannel, NotificationChannel, SmsChannel,
    SmsSender, SmtpSender, StoreChannel, WebhookChannel, build_channels,
};
pub use dispatcher::{AlertDispatcher, DispatchOutcome, DispatcherMetrics, cooldown_key};
pub use queue::{AlertQueue, AlertQueueReceiver, alert_queue};
pub use template::{DEFAULT_TEMPLATE, TemplateSet};

use crate::event::{ThreatSeverity, ThreatType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A notification produced for one threat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    /// Id of the threat the alert is about.
    pub threat_ref: String,
    #[serde(rename = "type")]
    pub threat_type: ThreatType,
    pub severity: ThreatSeverity,
    pub source: String,
    pub message: String,
    #[serde(default)]
    pub channels_attempted: Vec<String>,
    #[serde(default)]
    pub channels_delivered: Vec<String>,
    pub dispatched_at: DateTime<Utc>,
    pub cooldown_key: String,
}
