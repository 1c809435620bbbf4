//! Persisting notifier with email (Resend) and Slack webhook channels.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

use super::{NotificationRequest, Notifier, NotifyError, LINK_HEALTH_ISSUE};
use crate::config::NotificationConfig;
use crate::db::{DbError, Notification, Store, User};
use crate::html::escape_html;

const EMAIL_TEMPLATE: &str = include_str!("templates/email.html");
const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// Delivers notifications to every configured channel.
pub struct NotificationDispatcher {
    store: Arc<Store>,
    http: reqwest::Client,
    config: NotificationConfig,
    app_name: String,
    app_url: String,
}

impl NotificationDispatcher {
    pub fn new(
        store: Arc<Store>,
        http: reqwest::Client,
        config: NotificationConfig,
        app_name: impl Into<String>,
        app_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            http,
            config,
            app_name: app_name.into(),
            app_url: app_url.into(),
        }
    }

    async fn send_email(&self, user: &User, notification: &Notification) -> Result<(), NotifyError> {
        let Some(api_key) = &self.config.resend_api_key else {
            return Ok(());
        };
        if user.email.is_empty() {
            return Ok(());
        }

        let body = json!({
            "from": self.config.support_email,
            "to": [user.email],
            "subject": format!("{} - {}", self.app_name, notification.title),
            "html": self.render_email(notification),
        });

        self.http
            .post(RESEND_ENDPOINT)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| NotifyError::Channel(format!("email: {}", e)))?;

        tracing::info!("Email notification sent to {}", user.email);
        Ok(())
    }

    async fn send_slack(&self, notification: &Notification) -> Result<(), NotifyError> {
        let Some(webhook) = &self.config.slack_webhook_url else {
            return Ok(());
        };

        self.http
            .post(webhook)
            .json(&slack_message(notification))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| NotifyError::Channel(format!("slack: {}", e)))?;

        tracing::info!("Slack notification sent for notification {}", notification.id);
        Ok(())
    }

    fn render_email(&self, notification: &Notification) -> String {
        EMAIL_TEMPLATE
            .replace("{{app_name}}", &escape_html(&self.app_name))
            .replace("{{app_url}}", &escape_html(&self.app_url))
            .replace("{{type_class}}", type_class(&notification.kind))
            .replace("{{type_label}}", &escape_html(&notification.kind.replace('_', " ")))
            .replace("{{title}}", &escape_html(&notification.title))
            .replace("{{message}}", &escape_html(&notification.message))
            .replace("{{details}}", &email_details(&notification.data))
    }
}

#[async_trait]
impl Notifier for NotificationDispatcher {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotifyError> {
        let user = match self.store.get_user(request.user_id) {
            Ok(user) => user,
            Err(DbError::NotFound) => {
                tracing::warn!(
                    "Dropping {} notification for unknown user {}",
                    request.kind,
                    request.user_id
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let notification = self.store.add_notification(
            user.id,
            &request.kind,
            &request.title,
            &request.message,
            &request.data,
        )?;

        if let Err(e) = self.send_email(&user, &notification).await {
            tracing::error!("Failed to send email notification: {}", e);
        }
        if let Err(e) = self.send_slack(&notification).await {
            tracing::error!("Failed to send Slack notification: {}", e);
        }

        self.store.mark_notification_sent(notification.id, Utc::now())?;
        Ok(())
    }
}

fn type_class(kind: &str) -> &'static str {
    match kind {
        LINK_HEALTH_ISSUE => "error",
        "HIGH_TRAFFIC" | "LINK_EXPIRED" | "PLAN_LIMIT_REACHED" => "warning",
        "TEAM_MEMBER_ADDED" => "success",
        _ => "info",
    }
}

fn email_details(data: &Value) -> String {
    let field = |key: &str| data.get(key).and_then(Value::as_str).map(escape_html);

    let mut details = String::new();
    if let Some(code) = field("shortCode") {
        details.push_str(&format!("<p><strong>Short Code:</strong> {}</p>", code));
    }
    if let Some(url) = field("originalUrl") {
        details.push_str(&format!(
            "<p><strong>Original URL:</strong> <a href=\"{0}\">{0}</a></p>",
            url
        ));
    }
    if let Some(error) = field("error") {
        details.push_str(&format!("<p><strong>Error:</strong> {}</p>", error));
    }

    if details.is_empty() {
        return details;
    }
    format!("<div class=\"details\">{}</div>", details)
}

/// Slack Block Kit payload for a notification.
fn slack_message(notification: &Notification) -> Value {
    let mut blocks = vec![
        json!({
            "type": "header",
            "text": { "type": "plain_text", "text": notification.title }
        }),
        json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": notification.message }
        }),
        json!({
            "type": "context",
            "elements": [{
                "type": "mrkdwn",
                "text": format!("*Time:* {}", notification.created_at.format("%Y-%m-%d %H:%M:%S UTC"))
            }]
        }),
    ];

    if notification.data.get("linkId").is_some() {
        let short_code = notification.data.get("shortCode").and_then(Value::as_str).unwrap_or("N/A");
        let url = notification.data.get("originalUrl").and_then(Value::as_str).unwrap_or("N/A");
        blocks.push(json!({
            "type": "section",
            "text": { "type": "mrkdwn", "text": format!("*Link:* {}\n*URL:* {}", short_code, url) }
        }));
    }

    json!({ "text": notification.title, "blocks": blocks })
}
