//! External collaborator interfaces consumed by the engine.
//!
//! The engine never reaches for globals: every collaborator is a trait object
//! handed to the [`CoordinatorBuilder`](crate::coordinator::CoordinatorBuilder).
//! In-memory implementations are provided for tests and the CLI daemon.

use crate::error::{DetectorError, ResponseActionError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

/// A single HTTP request observed by the host application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestRecord {
    pub ip: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub user_agent: String,
    pub timestamp: DateTime<Utc>,
}

impl RequestRecord {
    pub fn new(ip: impl Into<String>, url: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            ip: ip.into(),
            url: url.into(),
            method: "GET".into(),
            timestamp,
            ..Default::default()
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Source of recently observed requests.
#[async_trait]
pub trait RequestLogSource: Send + Sync {
    /// Requests with a timestamp at or after `since`. The coordinator drops
    /// the ones it has already scanned.
    async fn get_recent_requests(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestRecord>, DetectorError>;
}

/// Geographic location of an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub city: String,
}

/// Resolves IP addresses to locations.
pub trait GeoIpResolver: Send + Sync {
    fn resolve(&self, ip: &str) -> Option<GeoLocation>;
}

/// Session management owned by the authentication subsystem.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn invalidate(&self, session_id: &str) -> Result<(), ResponseActionError>;
    async fn mark_quarantined(&self, session_id: &str) -> Result<(), ResponseActionError>;
}

/// Compliance data supplied by the audit subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AuditSnapshot {
    /// 0..=100.
    pub compliance_score: f64,
    pub critical_findings: usize,
}

pub trait AuditSource: Send + Sync {
    fn audit_snapshot(&self) -> AuditSnapshot;
}

/// Backup trigger used by the critical playbook.
#[async_trait]
pub trait BackupService: Send + Sync {
    /// Start a backup and return a reference to it.
    async fn trigger_backup(&self, reason: &str) -> Result<String, ResponseActionError>;
}

// --- In-memory implementations ---

/// Bounded in-memory request log.
pub struct InMemoryRequestLog {
    records: Mutex<VecDeque<RequestRecord>>,
    capacity: usize,
}

impl InMemoryRequestLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, record: RequestRecord) {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryRequestLog {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl RequestLogSource for InMemoryRequestLog {
    async fn get_recent_requests(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestRecord>, DetectorError> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(records
            .iter()
            .filter(|r| r.timestamp >= since)
            .cloned()
            .collect())
    }
}

/// Resolver backed by a fixed table of address prefixes.
///
/// The longest matching prefix wins, so `"203.0.113.7"` beats `"203.0.113."`.
#[derive(Debug, Default)]
pub struct StaticGeoResolver {
    prefixes: Vec<(String, GeoLocation)>,
}

impl StaticGeoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>, country: &str) -> Self {
        self.prefixes.push((
            prefix.into(),
            GeoLocation {
                country: country.to_ascii_uppercase(),
                region: String::new(),
                city: String::new(),
            },
        ));
        self
    }
}

impl GeoIpResolver for StaticGeoResolver {
    fn resolve(&self, ip: &str) -> Option<GeoLocation> {
        self.prefixes
            .iter()
            .filter(|(prefix, _)| ip.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, loc)| loc.clone())
    }
}

const DEFAULT_SESSION_CAPACITY: usize = 10_000;

/// Insertion-ordered set that forgets its oldest member past `capacity`.
#[derive(Debug)]
struct BoundedSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl BoundedSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, value: &str) {
        if !self.members.insert(value.to_string()) {
            return;
        }
        self.order.push_back(value.to_string());
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.members.remove(&oldest);
            }
        }
    }
}

/// Session store that remembers the most recent invalidated and quarantined
/// sessions, up to a fixed capacity each. Hosts with a real session backend
/// inject their own [`SessionStore`].
#[derive(Debug)]
pub struct InMemorySessionStore {
    invalidated: Mutex<BoundedSet>,
    quarantined: Mutex<BoundedSet>,
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_SESSION_CAPACITY)
    }
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            invalidated: Mutex::new(BoundedSet::new(capacity)),
            quarantined: Mutex::new(BoundedSet::new(capacity)),
        }
    }

    pub fn is_quarantined(&self, session_id: &str) -> bool {
        self.quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .contains(session_id)
    }

    pub fn is_invalidated(&self, session_id: &str) -> bool {
        self.invalidated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .members
            .contains(session_id)
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn invalidate(&self, session_id: &str) -> Result<(), ResponseActionError> {
        self.invalidated
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
        Ok(())
    }

    async fn mark_quarantined(&self, session_id: &str) -> Result<(), ResponseActionError> {
        self.quarantined
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id);
        Ok(())
    }
}

/// Audit source returning a fixed snapshot.
#[derive(Debug, Clone, Copy)]
pub struct StaticAuditSource(pub AuditSnapshot);

impl AuditSource for StaticAuditSource {
    fn audit_snapshot(&self) -> AuditSnapshot {
        self.0
    }
}

/// Backup service that only records requests.
#[derive(Debug, Default)]
pub struct LoggingBackupService {
    requests: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl LoggingBackupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_count(&self) -> usize {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl BackupService for LoggingBackupService {
    async fn trigger_backup(&self, reason: &str) -> Result<String, ResponseActionError> {
        let reference = format!("backup-{}", uuid::Uuid::new_v4());
        tracing::info!(backup = %reference, reason, "Backup requested");
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference.clone(), Utc::now());
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_request_log_filters_by_time() {
        let log = InMemoryRequestLog::new(10);
        let t0 = Utc::now();
        log.push(RequestRecord::new("1.1.1.1", "/a", t0));
        log.push(RequestRecord::new("1.1.1.1", "/b", t0 + Duration::seconds(5)));

        assert_eq!(log.get_recent_requests(t0).await.unwrap().len(), 2);
        let recent = log.get_recent_requests(t0 + Duration::seconds(1)).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].url, "/b");
    }

    #[test]
    fn test_request_log_is_bounded() {
        let log = InMemoryRequestLog::new(3);
        let now = Utc::now();
        for i in 0..10 {
            log.push(RequestRecord::new("1.1.1.1", format!("/{i}"), now));
        }
        assert_eq!(log.len(), 3);
    }

    #[test]
    fn test_static_geo_longest_prefix() {
        let geo = StaticGeoResolver::new()
            .with_prefix("203.0.", "au")
            .with_prefix("203.0.113.", "nz");
        assert_eq!(geo.resolve("203.0.113.9").unwrap().country, "NZ");
        assert_eq!(geo.resolve("203.0.5.1").unwrap().country, "AU");
        assert!(geo.resolve("8.8.8.8").is_none());
    }

    #[tokio::test]
    async fn test_session_store_records_quarantine() {
        let store = InMemorySessionStore::new();
        store.mark_quarantined("sess-1").await.unwrap();
        assert!(store.is_quarantined("sess-1"));
        assert!(!store.is_invalidated("sess-1"));
    }

    #[tokio::test]
    async fn test_session_store_forgets_oldest_past_capacity() {
        let store = InMemorySessionStore::with_capacity(2);
        for id in ["sess-1", "sess-2", "sess-2", "sess-3"] {
            store.invalidate(id).await.unwrap();
        }
        assert!(!store.is_invalidated("sess-1"));
        assert!(store.is_invalidated("sess-2"));
        assert!(store.is_invalidated("sess-3"));
        assert_eq!(store.invalidated.lock().unwrap().order.len(), 2);
    }

    #[tokio::test]
    async fn test_logging_backup_service() {
        let backup = LoggingBackupService::new();
        let reference = backup.trigger_backup("test").await.unwrap();
        assert!(reference.starts_with("backup-"));
        assert_eq!(backup.request_count(), 1);
    }
}
