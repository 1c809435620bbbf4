//! Notification fan-out.
//!
//! Alerting paths hand a [`NotificationRequest`] to a [`Notifier`]. The
//! production notifier is [`NotificationDispatcher`], which persists the
//! notification and then tries each outbound channel independently.

mod dispatcher;

pub use dispatcher::*;

use async_trait::async_trait;
use thiserror::Error;

use crate::db::DbError;

/// Notification type for failing link destinations.
pub const LINK_HEALTH_ISSUE: &str = "LINK_HEALTH_ISSUE";

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("database error: {0}")]
    Db(#[from] DbError),
    #[error("channel error: {0}")]
    Channel(String),
}

/// A notification addressed to a single user.
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationRequest {
    pub user_id: i64,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub data: serde_json::Value,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, request: NotificationRequest) -> Result<(), NotifyError>;
}

/// Send the same notification to several users. Individual failures are
/// logged and do not stop the remaining sends.
pub async fn notify_users(notifier: &dyn Notifier, user_ids: &[i64], template: &NotificationRequest) {
    for &user_id in user_ids {
        let request = NotificationRequest {
            user_id,
            ..template.clone()
        };
        if let Err(e) = notifier.notify(request).await {
            tracing::error!("Failed to send notification to user {}: {}", user_id, e);
        }
    }
}
