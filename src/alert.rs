//! Failure and system alerts.
//!
//! A job alert fires once per job whose retries are exhausted; a system alert
//! fires when the engine degrades. Every alert is logged, then fanned out to
//! the configured webhook and SMTP channels.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::Client;
use serde::Serialize;
use tracing::{error, info};

use crate::config::{AlertConfig, EmailConfig};
use crate::jobs::JobKind;

const SUBJECT_PREFIX: &str = "[maintd alert]";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FailureAlert {
    pub job_id: String,
    pub job_name: String,
    pub kind: JobKind,
    /// Error text of the last attempt.
    pub error: String,
    pub attempts: u32,
    pub at: DateTime<Utc>,
}

/// An engine-level problem, e.g. the run store being unreachable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemAlert {
    pub issue: String,
    pub details: String,
    pub at: DateTime<Utc>,
}

/// Destination for alerts. Errors are logged by the caller and never retried.
#[async_trait]
pub trait AlertDispatcher: Send + Sync {
    async fn notify(&self, alert: &FailureAlert) -> Result<()>;

    async fn notify_system(&self, alert: &SystemAlert) -> Result<()> {
        LogAlerter.notify_system(alert).await
    }
}

/// Writes the alert to the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlerter;

#[async_trait]
impl AlertDispatcher for LogAlerter {
    async fn notify(&self, alert: &FailureAlert) -> Result<()> {
        error!(
            job = %alert.job_id,
            kind = %alert.kind,
            attempts = alert.attempts,
            error = %alert.error,
            "job failed after all retry attempts"
        );
        Ok(())
    }

    async fn notify_system(&self, alert: &SystemAlert) -> Result<()> {
        error!(issue = %alert.issue, details = %alert.details, "system issue");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Webhook
// ---------------------------------------------------------------------------

/// POSTs the alert as JSON. Non-2xx responses count as failures.
pub struct WebhookAlerter {
    client: Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn post<T: Serialize + Sync>(&self, payload: &T) -> Result<()> {
        self.client
            .post(&self.url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("alert webhook {} unreachable", self.url))?
            .error_for_status()
            .context("alert webhook rejected the alert")?;
        Ok(())
    }
}

#[async_trait]
impl AlertDispatcher for WebhookAlerter {
    async fn notify(&self, alert: &FailureAlert) -> Result<()> {
        self.post(alert).await?;
        info!(job = %alert.job_id, url = %self.url, "failure alert delivered");
        Ok(())
    }

    async fn notify_system(&self, alert: &SystemAlert) -> Result<()> {
        self.post(alert).await?;
        info!(issue = %alert.issue, url = %self.url, "system alert delivered");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Email
// ---------------------------------------------------------------------------

/// Sends alerts as plain-text mail over SMTP.
pub struct EmailAlerter {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
    to: Vec<Mailbox>,
}

impl EmailAlerter {
    pub fn new(cfg: &EmailConfig, timeout: Duration) -> Result<Self> {
        let from: Mailbox = cfg
            .from
            .parse()
            .with_context(|| format!("invalid alert sender '{}'", cfg.from))?;
        let to = cfg
            .to
            .iter()
            .map(|addr| {
                addr.parse::<Mailbox>()
                    .with_context(|| format!("invalid alert recipient '{addr}'"))
            })
            .collect::<Result<Vec<_>>>()?;
        if to.is_empty() {
            anyhow::bail!("alert.email needs at least one recipient");
        }

        let mut builder = match (cfg.tls, cfg.smtp_port) {
            (true, 465) => AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.smtp_host)
                .context("invalid SMTP relay")?,
            (true, _) => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.smtp_host)
                .context("invalid SMTP relay")?,
            (false, _) => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.smtp_host),
        }
        .port(cfg.smtp_port)
        .timeout(Some(timeout));

        let username = cfg
            .username
            .clone()
            .or_else(|| std::env::var("SMTP_USERNAME").ok());
        let password = cfg
            .password
            .clone()
            .or_else(|| std::env::var("SMTP_PASSWORD").ok());
        if let (Some(user), Some(pass)) = (username, password) {
            builder = builder.credentials(Credentials::new(user, pass));
        }

        Ok(Self {
            transport: builder.build(),
            from,
            to,
        })
    }

    fn message(&self, subject: &str, body: String) -> Result<Message> {
        let mut builder = Message::builder()
            .from(self.from.clone())
            .subject(format!("{SUBJECT_PREFIX} {subject}"))
            .header(ContentType::TEXT_PLAIN);
        for recipient in &self.to {
            builder = builder.to(recipient.clone());
        }
        builder.body(body).context("failed to build alert email")
    }

    async fn send(&self, message: Message) -> Result<()> {
        self.transport
            .send(message)
            .await
            .context("SMTP delivery failed")?;
        Ok(())
    }
}

fn failure_mail(alert: &FailureAlert) -> (String, String) {
    let subject = format!("Task Failure: {}", alert.job_id);
    let body = format!(
        "Task execution failed\n\nJob: {} ({})\nKind: {}\nAttempts: {}\nTime: {}\n\nError:\n{}\n",
        alert.job_name,
        alert.job_id,
        alert.kind,
        alert.attempts,
        alert.at.to_rfc3339(),
        alert.error
    );
    (subject, body)
}

fn system_mail(alert: &SystemAlert) -> (String, String) {
    let subject = format!("System Issue: {}", alert.issue);
    let body = format!(
        "System issue detected\n\nIssue: {}\nTime: {}\n\nDetails:\n{}\n\nImmediate action may be required.\n",
        alert.issue,
        alert.at.to_rfc3339(),
        alert.details
    );
    (subject, body)
}

#[async_trait]
impl AlertDispatcher for EmailAlerter {
    async fn notify(&self, alert: &FailureAlert) -> Result<()> {
        let (subject, body) = failure_mail(alert);
        self.send(self.message(&subject, body)?).await?;
        info!(job = %alert.job_id, recipients = self.to.len(), "failure alert mailed");
        Ok(())
    }

    async fn notify_system(&self, alert: &SystemAlert) -> Result<()> {
        let (subject, body) = system_mail(alert);
        self.send(self.message(&subject, body)?).await?;
        info!(issue = %alert.issue, recipients = self.to.len(), "system alert mailed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Logs every alert, then hands it to each channel. One failing channel does
/// not stop the others.
#[derive(Default)]
pub struct AlertChannels {
    channels: Vec<(&'static str, Box<dyn AlertDispatcher>)>,
}

impl AlertChannels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_channel(mut self, name: &'static str, channel: Box<dyn AlertDispatcher>) -> Self {
        self.channels.push((name, channel));
        self
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn summarize(failed: Vec<String>) -> Result<()> {
        if failed.is_empty() {
            Ok(())
        } else {
            anyhow::bail!("alert delivery failed: {}", failed.join("; "))
        }
    }
}

#[async_trait]
impl AlertDispatcher for AlertChannels {
    async fn notify(&self, alert: &FailureAlert) -> Result<()> {
        LogAlerter.notify(alert).await?;
        let mut failed = Vec::new();
        for (name, channel) in &self.channels {
            if let Err(e) = channel.notify(alert).await {
                failed.push(format!("{name}: {e:#}"));
            }
        }
        Self::summarize(failed)
    }

    async fn notify_system(&self, alert: &SystemAlert) -> Result<()> {
        LogAlerter.notify_system(alert).await?;
        let mut failed = Vec::new();
        for (name, channel) in &self.channels {
            if let Err(e) = channel.notify_system(alert).await {
                failed.push(format!("{name}: {e:#}"));
            }
        }
        Self::summarize(failed)
    }
}

/// Every configured channel behind one dispatcher. Log-only when none is set.
pub fn from_config(cfg: &AlertConfig) -> Result<Arc<dyn AlertDispatcher>> {
    let timeout = Duration::from_secs(cfg.timeout_secs);
    let mut channels = AlertChannels::new();
    if let Some(url) = cfg.webhook_url.as_deref().filter(|u| !u.trim().is_empty()) {
        channels = channels.with_channel("webhook", Box::new(WebhookAlerter::new(url, timeout)?));
    }
    if let Some(email) = &cfg.email {
        channels = channels.with_channel("email", Box::new(EmailAlerter::new(email, timeout)?));
    }
    Ok(Arc::new(channels))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    fn alert() -> FailureAlert {
        FailureAlert {
            job_id: "backup_daily".into(),
            job_name: "Daily Backup".into(),
            kind: JobKind::Backup,
            error: "disk full".into(),
            attempts: 3,
            at: Utc::now(),
        }
    }

    fn email_config() -> EmailConfig {
        EmailConfig {
            smtp_host: "smtp.example.com".into(),
            from: "maintd@example.com".into(),
            to: vec!["ops@example.com".into()],
            ..Default::default()
        }
    }

    async fn hook_server(status: u16) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(matchers::method("POST"))
            .and(matchers::path("/hook"))
            .respond_with(ResponseTemplate::new(status))
            .expect(1)
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_log_alerter_never_fails() {
        assert!(LogAlerter.notify(&alert()).await.is_ok());
    }

    #[tokio::test]
    async fn test_webhook_posts_json() {
        let server = hook_server(204).await;
        let hook = WebhookAlerter::new(format!("{}/hook", server.uri()), Duration::from_secs(5))
            .unwrap();
        hook.notify(&alert()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(body["job_id"], "backup_daily");
        assert_eq!(body["kind"], "backup");
        assert_eq!(body["attempts"], 3);
        assert_eq!(body["error"], "disk full");
    }

    #[tokio::test]
    async fn test_webhook_error_status_is_reported() {
        let server = hook_server(500).await;
        let hook = WebhookAlerter::new(format!("{}/hook", server.uri()), Duration::from_secs(5))
            .unwrap();
        assert!(hook.notify(&alert()).await.is_err());
    }

    #[tokio::test]
    async fn test_webhook_posts_system_issue() {
        let server = hook_server(200).await;
        let hook = WebhookAlerter::new(format!("{}/hook", server.uri()), Duration::from_secs(5))
            .unwrap();
        let issue = SystemAlert {
            issue: "degraded_mode".into(),
            details: "run store unreachable".into(),
            at: Utc::now(),
        };
        hook.notify_system(&issue).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = requests[0].body_json().unwrap();
        assert_eq!(body["issue"], "degraded_mode");
        assert_eq!(body["details"], "run store unreachable");
    }

    #[tokio::test]
    async fn test_one_failing_channel_does_not_block_others() {
        let broken = hook_server(503).await;
        let healthy = hook_server(204).await;
        let channels = AlertChannels::new()
            .with_channel(
                "broken",
                Box::new(
                    WebhookAlerter::new(format!("{}/hook", broken.uri()), Duration::from_secs(5))
                        .unwrap(),
                ),
            )
            .with_channel(
                "healthy",
                Box::new(
                    WebhookAlerter::new(format!("{}/hook", healthy.uri()), Duration::from_secs(5))
                        .unwrap(),
                ),
            );

        let err = channels.notify(&alert()).await.unwrap_err().to_string();
        assert!(err.contains("broken"), "got: {err}");
        assert!(!err.contains("healthy"), "got: {err}");
        assert_eq!(healthy.received_requests().await.unwrap().len(), 1);
    }

    #[test]
    fn test_email_rejects_bad_addresses() {
        let mut cfg = email_config();
        cfg.from = "not-an-address".into();
        assert!(EmailAlerter::new(&cfg, Duration::from_secs(5)).is_err());

        let mut cfg = email_config();
        cfg.to = vec!["nope".into()];
        assert!(EmailAlerter::new(&cfg, Duration::from_secs(5)).is_err());

        let mut cfg = email_config();
        cfg.to.clear();
        let err = EmailAlerter::new(&cfg, Duration::from_secs(5))
            .err()
            .unwrap()
            .to_string();
        assert!(err.contains("at least one recipient"), "got: {err}");
    }

    #[test]
    fn test_email_transport_modes() {
        for (port, tls) in [(587, true), (465, true), (25, false)] {
            let cfg = EmailConfig {
                smtp_port: port,
                tls,
                ..email_config()
            };
            assert!(EmailAlerter::new(&cfg, Duration::from_secs(5)).is_ok(), "port {port}");
        }
    }

    #[test]
    fn test_failure_mail_contents() {
        let mut cfg = email_config();
        cfg.to.push("Oncall <oncall@example.com>".into());
        let mailer = EmailAlerter::new(&cfg, Duration::from_secs(5)).unwrap();

        let (subject, body) = failure_mail(&alert());
        let raw = String::from_utf8(mailer.message(&subject, body).unwrap().formatted()).unwrap();
        assert!(raw.contains("Subject: [maintd alert] Task Failure: backup_daily"), "{raw}");
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("oncall@example.com"));
        assert!(raw.contains("Attempts: 3"));
        assert!(raw.contains("disk full"));
    }

    #[test]
    fn test_from_config_picks_channels() {
        let mut cfg = AlertConfig::default();
        assert!(from_config(&cfg).is_ok());
        cfg.webhook_url = Some("http://127.0.0.1:9/alerts".into());
        cfg.email = Some(email_config());
        assert!(from_config(&cfg).is_ok());

        cfg.email = Some(EmailConfig::default());
        assert!(from_config(&cfg).is_err());
    }
}
