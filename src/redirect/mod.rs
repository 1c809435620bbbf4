//! Short-code resolution.
//!
//! A request walks the gating checks in a fixed order (active, not expired,
//! under the click limit, password) and the first failing check decides the
//! outcome. Only a request that passes every gate records a click and bumps
//! the counter.
//!
//! The counter is read when the gates are evaluated and incremented after,
//! so concurrent redirects on a link one click short of `max_clicks` can
//! overshoot the limit by a few clicks.

mod tracking;

pub use tracking::*;

use chrono::{DateTime, Utc};
use std::net::IpAddr;
use std::sync::Arc;

use crate::clock::Clock;
use crate::db::{DbError, Link, NewClick, Store};
use crate::password::PasswordHasher;

/// Why a link no longer redirects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiredReason {
    Deactivated,
    Expired,
    ClickLimit,
}

impl ExpiredReason {
    pub fn message(&self) -> &'static str {
        match self {
            ExpiredReason::Deactivated => "This link has been deactivated",
            ExpiredReason::Expired => "This link has expired",
            ExpiredReason::ClickLimit => "This link has reached its click limit",
        }
    }
}

pub const INCORRECT_PASSWORD: &str = "Incorrect password";

/// Evaluate the availability checks (active, not expired, under the click
/// limit) in order. `None` means the link may be served.
pub fn availability_gate(link: &Link, now: DateTime<Utc>) -> Option<ExpiredReason> {
    if !link.is_active {
        return Some(ExpiredReason::Deactivated);
    }
    if link.expires_at.is_some_and(|expires_at| now > expires_at) {
        return Some(ExpiredReason::Expired);
    }
    match link.max_clicks {
        Some(max_clicks) if link.current_clicks >= max_clicks => Some(ExpiredReason::ClickLimit),
        _ => None,
    }
}

/// Terminal outcome of resolving a short code.
#[derive(Debug, Clone)]
pub enum Resolution {
    NotFound,
    Expired { link: Link, reason: ExpiredReason },
    PasswordRequired { link: Link, error: Option<&'static str> },
    Redirect { link: Link },
}

/// Request details captured on a click.
#[derive(Debug, Clone, Default)]
pub struct ClickContext {
    pub ip: Option<IpAddr>,
    pub user_agent: Option<String>,
    pub referer: Option<String>,
}

/// Resolves short codes against the store.
pub struct Resolver {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    hasher: PasswordHasher,
    geo: Arc<dyn GeoLocator>,
}

impl Resolver {
    pub fn new(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        hasher: PasswordHasher,
        geo: Arc<dyn GeoLocator>,
    ) -> Self {
        Self {
            store,
            clock,
            hasher,
            geo,
        }
    }

    pub async fn resolve(
        &self,
        short_code: &str,
        password: Option<&str>,
        ctx: &ClickContext,
    ) -> Result<Resolution, DbError> {
        let Some(link) = self.store.get_link_by_code(short_code)? else {
            return Ok(Resolution::NotFound);
        };

        if let Some(reason) = availability_gate(&link, self.clock.now()) {
            return Ok(Resolution::Expired { link, reason });
        }

        if let Some(hash) = link.password_hash.clone() {
            let Some(password) = password.filter(|p| !p.is_empty()) else {
                return Ok(Resolution::PasswordRequired { link, error: None });
            };
            if !self.password_matches(password, hash).await {
                return Ok(Resolution::PasswordRequired {
                    link,
                    error: Some(INCORRECT_PASSWORD),
                });
            }
        }

        if link.enable_tracking {
            if let Err(e) = self.track_click(&link, ctx).await {
                tracing::error!("Click tracking failed for {}: {}", link.short_code, e);
            }
        }

        self.store.increment_clicks(link.id)?;
        tracing::debug!("Redirecting {} to {}", link.short_code, link.original_url);

        Ok(Resolution::Redirect { link })
    }

    /// Argon2 verification is CPU-bound, so it runs off the async workers.
    async fn password_matches(&self, password: &str, hash: String) -> bool {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        let verified =
            tokio::task::spawn_blocking(move || hasher.verify_password(&password, &hash)).await;

        match verified {
            Ok(Ok(matches)) => matches,
            Ok(Err(e)) => {
                tracing::error!("Stored link password hash is unusable: {}", e);
                false
            }
            Err(e) => {
                tracing::error!("Password verification task failed: {}", e);
                false
            }
        }
    }

    async fn track_click(&self, link: &Link, ctx: &ClickContext) -> Result<i64, DbError> {
        let ua = ctx.user_agent.as_deref().unwrap_or_default();
        let parsed = (!ua.is_empty()).then(|| parse_user_agent(ua));
        let location = match ctx.ip {
            Some(ip) => self.geo.locate(ip).await,
            None => None,
        }
        .unwrap_or_default();

        let click = NewClick {
            link_id: link.id,
            ip_address: ctx.ip.map(anonymize_ip),
            user_agent: ctx.user_agent.clone(),
            referer: ctx.referer.clone(),
            country: location.country,
            city: location.city,
            device: parsed.as_ref().map(|p| p.device.to_string()),
            browser: parsed.as_ref().map(|p| p.browser.to_string()),
            os: parsed.as_ref().map(|p| p.os.to_string()),
        };

        self.store.add_click(&click, self.clock.now())
    }
}
