//! Run notifications.
//!
//! - **[`LogNotifier`]** writes the summary to the log.
//! - **[`SlackNotifier`]** posts a colored attachment to an incoming
//!   webhook.
//!
//! Delivery failures come back as errors; the engine records them as a
//! warning and never fails a run because of them.

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reposync_core::models::{Notification, NotificationKind};
use reposync_core::traits::Notifier;

use crate::config::NotificationsConfig;
use crate::http::{self, send_with_retry};

pub fn create_notifier(config: &NotificationsConfig) -> Result<Arc<dyn Notifier>> {
    match config.provider.as_str() {
        "log" => Ok(Arc::new(LogNotifier)),
        "slack" => match std::env::var(&config.webhook_env) {
            Ok(url) if !url.trim().is_empty() => Ok(Arc::new(SlackNotifier::new(url, config)?)),
            _ => {
                tracing::warn!(
                    "{} not set, Slack notifications fall back to the log",
                    config.webhook_env
                );
                Ok(Arc::new(LogNotifier))
            }
        },
        other => bail!("Unknown notifications provider: {}", other),
    }
}

pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification.kind {
            NotificationKind::Success => {
                tracing::info!(title = %notification.title, "{}", notification.message)
            }
            NotificationKind::Warning => {
                tracing::warn!(title = %notification.title, "{}", notification.message)
            }
            NotificationKind::Error => {
                tracing::error!(title = %notification.title, "{}", notification.message)
            }
        }
        Ok(())
    }
}

pub struct SlackNotifier {
    client: reqwest::Client,
    webhook_url: String,
    channel: Option<String>,
    username: String,
}

impl SlackNotifier {
    pub fn new(webhook_url: String, config: &NotificationsConfig) -> Result<Self> {
        Ok(Self {
            client: http::client(10)?,
            webhook_url,
            channel: config.channel.clone(),
            username: config.username.clone(),
        })
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let payload = slack_payload(notification, self.channel.as_deref(), &self.username);
        send_with_retry("Slack webhook", 2, || {
            self.client.post(&self.webhook_url).json(&payload)
        })
        .await?;
        tracing::debug!("Slack notification sent");
        Ok(())
    }
}

fn slack_payload(
    notification: &Notification,
    channel: Option<&str>,
    username: &str,
) -> serde_json::Value {
    let (color, emoji) = match notification.kind {
        NotificationKind::Success => ("good", ":white_check_mark:"),
        NotificationKind::Warning => ("warning", ":warning:"),
        NotificationKind::Error => ("danger", ":x:"),
    };
    let result = &notification.result;

    let mut fields = vec![
        field("Duration", format!("{:.1}s", result.duration_ms as f64 / 1000.0), true),
        field("Repositories", result.repositories_scanned.to_string(), true),
        field(
            "Files synced",
            format!("{} / {}", result.files_synced, result.files_changed),
            true,
        ),
        field(
            "Vectors",
            format!(
                "{} written, {} deleted",
                result.vectors_upserted, result.vectors_deleted
            ),
            true,
        ),
    ];
    if !result.warnings.is_empty() {
        fields.push(field("Warnings", result.warnings.len().to_string(), true));
    }
    if let Some(first) = result.errors.first() {
        fields.push(field("Error", format!("```{}```", first), false));
    }

    let mut payload = serde_json::json!({
        "username": username,
        "attachments": [{
            "color": color,
            "title": format!("{} {}", emoji, notification.title),
            "text": notification.message,
            "fields": fields,
            "footer": "reposync",
            "ts": notification.timestamp.timestamp(),
        }],
    });
    if let Some(channel) = channel {
        payload["channel"] = serde_json::json!(channel);
    }
    payload
}

fn field(title: &str, value: String, short: bool) -> serde_json::Value {
    serde_json::json!({ "title": title, "value": value, "short": short })
}
