//! Notification channels.
//!
//! Each channel implements [`NotificationChannel`]. Email and SMS delegate
//! the transport to [`SmtpSender`] / [`SmsSender`] so tests can swap in mocks.

use super::Alert;
use crate::config::{ChannelsConfig, EmailChannelConfig, SmsChannelConfig, WebhookChannelConfig};
use crate::error::ChannelError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, alert: &Alert) -> Result<(), ChannelError>;
}

/// Writes alerts to the log.
#[derive(Debug, Default)]
pub struct ConsoleChannel;

#[async_trait]
impl NotificationChannel for ConsoleChannel {
    fn name(&self) -> &str {
        "console"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        tracing::warn!(
            target: "warden::alerts",
            alert_id = %alert.id,
            threat_id = %alert.threat_ref,
            severity = %alert.severity,
            source = %alert.source,
            "{}",
            alert.message
        );
        Ok(())
    }
}

/// Appends alerts as JSON lines to a file.
#[derive(Debug)]
pub struct StoreChannel {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl StoreChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> ChannelError {
        ChannelError::Io {
            channel: "store".into(),
            source,
        }
    }
}

#[async_trait]
impl NotificationChannel for StoreChannel {
    fn name(&self) -> &str {
        "store"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let mut line = serde_json::to_string(alert).map_err(|e| ChannelError::SendFailed {
            channel: "store".into(),
            message: e.to_string(),
        })?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| self.io_error(e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| self.io_error(e))?;
        file.flush().await.map_err(|e| self.io_error(e))
    }
}

/// Keeps the most recent alerts in memory for dashboards.
#[derive(Debug)]
pub struct DisplayChannel {
    capacity: usize,
    buffer: Mutex<VecDeque<Alert>>,
}

impl DisplayChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            buffer: Mutex::new(VecDeque::new()),
        }
    }

    /// Newest first.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NotificationChannel for DisplayChannel {
    fn name(&self) -> &str {
        "display"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let mut buffer = self.buffer.lock().unwrap_or_else(PoisonError::into_inner);
        buffer.push_back(alert.clone());
        while buffer.len() > self.capacity {
            buffer.pop_front();
        }
        Ok(())
    }
}

/// POSTs the alert as JSON.
#[derive(Debug)]
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(config: &WebhookChannelConfig) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ChannelError::NotConfigured {
                channel: "webhook".into(),
                reason: e.to_string(),
            })?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| ChannelError::SendFailed {
                channel: "webhook".into(),
                message: format!("HTTP error: {e}"),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ChannelError::SendFailed {
                channel: "webhook".into(),
                message: format!("endpoint returned {status}"),
            });
        }
        Ok(())
    }
}

/// SMTP transport used by [`EmailChannel`].
#[async_trait]
pub trait SmtpSender: Send + Sync {
    /// Returns the server's response code on success.
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<String, String>;
}

/// lettre-backed STARTTLS sender.
pub struct LettreSmtp {
    host: String,
    port: u16,
    username: String,
    password: String,
    from_address: String,
}

impl LettreSmtp {
    pub fn new(config: &EmailChannelConfig) -> Self {
        Self {
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            username: config.username.clone(),
            password: config.password.clone(),
            from_address: config.from_address.clone(),
        }
    }
}

#[async_trait]
impl SmtpSender for LettreSmtp {
    async fn send_email(&self, to: &str, subject: &str, body: &str) -> Result<String, String> {
        let email = lettre::Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| format!("Invalid from address: {e}"))?,
            )
            .to(to.parse().map_err(|e| format!("Invalid to address: {e}"))?)
            .subject(subject)
            .body(body.to_string())
            .map_err(|e| format!("Failed to build email: {e}"))?;

        let creds = lettre::transport::smtp::authentication::Credentials::new(
            self.username.clone(),
            self.password.clone(),
        );
        let mailer =
            lettre::AsyncSmtpTransport::<lettre::Tokio1Executor>::starttls_relay(&self.host)
                .map_err(|e| format!("SMTP relay error: {e}"))?
                .port(self.port)
                .credentials(creds)
                .build();

        use lettre::AsyncTransport;
        let response = mailer
            .send(email)
            .await
            .map_err(|e| format!("SMTP send error: {e}"))?;
        Ok(format!("{}", response.code()))
    }
}

pub struct EmailChannel {
    sender: Arc<dyn SmtpSender>,
    recipients: Vec<String>,
}

impl EmailChannel {
    pub fn new(sender: Arc<dyn SmtpSender>, recipients: Vec<String>) -> Self {
        Self { sender, recipients }
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let subject = format!("[Warden] {} {}", alert.severity, alert.threat_type);
        let mut failures = Vec::new();
        for to in &self.recipients {
            if let Err(e) = self.sender.send_email(to, &subject, &alert.message).await {
                failures.push(format!("{to}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::SendFailed {
                channel: "email".into(),
                message: failures.join("; "),
            })
        }
    }
}

/// SMS transport used by [`SmsChannel`].
#[async_trait]
pub trait SmsSender: Send + Sync {
    /// Returns the provider's message id on success.
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, String>;
}

/// Twilio REST sender.
pub struct TwilioSms {
    client: reqwest::Client,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

impl TwilioSms {
    pub fn new(config: &SmsChannelConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            account_sid: config.account_sid.clone(),
            auth_token: config.auth_token.clone(),
            from_number: config.from_number.clone(),
        }
    }
}

#[async_trait]
impl SmsSender for TwilioSms {
    async fn send_sms(&self, to: &str, body: &str) -> Result<String, String> {
        let url = format!(
            "https://api.twilio.com/2010-04-01/Accounts/{}/Messages.json",
            self.account_sid
        );
        let auth = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            format!("{}:{}", self.account_sid, self.auth_token),
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", format!("Basic {auth}"))
            .form(&[("To", to), ("From", &self.from_number), ("Body", body)])
            .send()
            .await
            .map_err(|e| format!("HTTP error: {e}"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| format!("JSON parse error: {e}"))?;
        if !status.is_success() {
            let msg = body["message"].as_str().unwrap_or("unknown error");
            return Err(format!("Twilio API error ({status}): {msg}"));
        }
        Ok(body["sid"].as_str().unwrap_or("unknown").to_string())
    }
}

pub struct SmsChannel {
    sender: Arc<dyn SmsSender>,
    recipients: Vec<String>,
}

impl SmsChannel {
    pub fn new(sender: Arc<dyn SmsSender>, recipients: Vec<String>) -> Self {
        Self { sender, recipients }
    }
}

/// SMS bodies are kept to a single segment.
const SMS_MAX_CHARS: usize = 160;

#[async_trait]
impl NotificationChannel for SmsChannel {
    fn name(&self) -> &str {
        "sms"
    }

    async fn send(&self, alert: &Alert) -> Result<(), ChannelError> {
        let body = crate::detect::truncate(&alert.message, SMS_MAX_CHARS - 3);
        let mut failures = Vec::new();
        for to in &self.recipients {
            if let Err(e) = self.sender.send_sms(to, &body).await {
                failures.push(format!("{to}: {e}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(ChannelError::SendFailed {
                channel: "sms".into(),
                message: failures.join("; "),
            })
        }
    }
}

/// Channels built from configuration, plus the display buffer if enabled.
pub struct BuiltChannels {
    pub channels: Vec<Arc<dyn NotificationChannel>>,
    pub display: Option<Arc<DisplayChannel>>,
}

pub fn build_channels(config: &ChannelsConfig) -> Result<BuiltChannels, ChannelError> {
    let mut channels: Vec<Arc<dyn NotificationChannel>> = Vec::new();
    if config.console {
        channels.push(Arc::new(ConsoleChannel));
    }
    let display = config
        .display
        .then(|| Arc::new(DisplayChannel::new(config.display_capacity)));
    if let Some(display) = &display {
        channels.push(display.clone());
    }
    if let Some(path) = &config.store_path {
        channels.push(Arc::new(StoreChannel::new(path.clone())));
    }
    if let Some(webhook) = &config.webhook {
        channels.push(Arc::new(WebhookChannel::new(webhook)?));
    }
    if let Some(email) = &config.email {
        channels.push(Arc::new(EmailChannel::new(
            Arc::new(LettreSmtp::new(email)),
            email.recipients.clone(),
        )));
    }
    if let Some(sms) = &config.sms {
        channels.push(Arc::new(SmsChannel::new(
            Arc::new(TwilioSms::new(sms)),
            sms.recipients.clone(),
        )));
    }
    Ok(BuiltChannels { channels, display })
}
