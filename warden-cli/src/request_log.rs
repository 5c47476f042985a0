//! Request log source backed by a JSON-lines file the host appends to.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use warden_core::{DetectorError, RequestLogSource, RequestRecord};

/// Reads lines appended since the previous poll. A truncated file is read
/// again from the start.
pub struct JsonlRequestLog {
    path: PathBuf,
    offset: Mutex<u64>,
}

impl JsonlRequestLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: Mutex::new(0),
        }
    }
}

#[async_trait]
impl RequestLogSource for JsonlRequestLog {
    async fn get_recent_requests(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<RequestRecord>, DetectorError> {
        let mut offset = self.offset.lock().await;
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(DetectorError::SourceUnavailable(e.to_string())),
        };
        let len = file
            .metadata()
            .await
            .map_err(|e| DetectorError::SourceUnavailable(e.to_string()))?
            .len();
        if len < *offset {
            *offset = 0;
        }
        file.seek(std::io::SeekFrom::Start(*offset))
            .await
            .map_err(|e| DetectorError::SourceUnavailable(e.to_string()))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .await
            .map_err(|e| DetectorError::SourceUnavailable(e.to_string()))?;

        // Leave a trailing partial line for the next poll.
        let complete = buf.rfind('\n').map_or(0, |i| i + 1);
        *offset += complete as u64;

        let mut records = Vec::new();
        for line in buf[..complete].lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<RequestRecord>(line) {
                Ok(record) if record.timestamp >= since => records.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Skipping malformed request log line"),
            }
        }
        Ok(records)
    }
}
