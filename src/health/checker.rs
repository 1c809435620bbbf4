//! The health checker service.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;

use super::classify;
use crate::clock::Clock;
use crate::db::{HealthStatus, MemberRole, NewHealthCheck, Store};
use crate::notify::{notify_users, NotificationRequest, Notifier, LINK_HEALTH_ISSUE};
use crate::probe::{ProbeError, Prober};

/// Result of one on-demand or scheduled check, as returned by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckResult {
    pub status: HealthStatus,
    pub status_code: Option<u16>,
    pub response_time: Option<i64>,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Probes a destination, records the outcome and alerts on ERROR.
pub struct HealthChecker {
    store: Arc<Store>,
    prober: Arc<dyn Prober>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
}

impl HealthChecker {
    pub fn new(
        store: Arc<Store>,
        prober: Arc<dyn Prober>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            prober,
            notifier,
            clock,
        }
    }

    /// Check one link's destination.
    ///
    /// Never fails: probe errors (including a panicking probe) become an
    /// ERROR result, and persistence or notification failures are logged.
    pub async fn check(&self, link_id: i64, url: &str) -> HealthCheckResult {
        let prober = self.prober.clone();
        let target = url.to_string();
        let outcome = match tokio::spawn(async move { prober.probe(&target).await }).await {
            Ok(outcome) => outcome,
            Err(e) => Err(ProbeError::Network(format!("probe task failed: {}", e))),
        };

        let classification = classify(&outcome);
        let checked_at = self.clock.now();

        if let Err(e) = self.store.record_health_check(&NewHealthCheck {
            link_id,
            url: url.to_string(),
            status: classification.status,
            status_code: classification.status_code,
            response_time: classification.response_time,
            error: classification.error.clone(),
            checked_at,
        }) {
            tracing::error!("Failed to record health check for link {}: {}", link_id, e);
        }

        if classification.status == HealthStatus::Error {
            tracing::warn!(
                "Link {} is unhealthy: {}",
                link_id,
                classification.error.as_deref().unwrap_or("unknown error")
            );
            let error = classification.error.clone().unwrap_or_default();
            self.send_health_alert(link_id, url, &error).await;
        }

        HealthCheckResult {
            status: classification.status,
            status_code: classification.status_code,
            response_time: classification.response_time,
            error: classification.error,
            checked_at,
        }
    }

    /// Notify the link owner and the organization's owners/admins, once each.
    async fn send_health_alert(&self, link_id: i64, url: &str, error: &str) {
        let link = match self.store.get_link(link_id) {
            Ok(link) => link,
            Err(e) => {
                tracing::error!("Failed to load link {} for health alert: {}", link_id, e);
                return;
            }
        };

        let mut recipients = vec![link.user_id];
        if let Some(org_id) = link.organization_id {
            match self
                .store
                .get_members_with_roles(org_id, &[MemberRole::Owner, MemberRole::Admin])
            {
                Ok(members) => recipients.extend(members.iter().map(|u| u.id)),
                Err(e) => tracing::error!("Failed to load members of organization {}: {}", org_id, e),
            }
        }
        let mut seen = std::collections::HashSet::new();
        recipients.retain(|id| seen.insert(*id));

        let template = NotificationRequest {
            user_id: 0,
            kind: LINK_HEALTH_ISSUE.to_string(),
            title: "Link Health Alert".to_string(),
            message: format!("Link {} is experiencing issues: {}", link.short_code, error),
            data: json!({
                "linkId": link.id,
                "shortCode": link.short_code,
                "originalUrl": url,
                "error": error,
            }),
        };

        notify_users(self.notifier.as_ref(), &recipients, &template).await;
    }
}
