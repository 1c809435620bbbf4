//! Per-client rate limiting and client address extraction.

use axum::{
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, Extensions, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use std::convert::Infallible;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::Arc;

use super::{ApiError, AppState};
use crate::config::RateLimitConfig;

pub type IpRateLimiter = RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, DefaultClock>;

/// Token bucket allowing `max_requests` per `window` per client address.
/// Returns `None` when limiting is disabled.
pub fn build_rate_limiter(cfg: &RateLimitConfig) -> Option<Arc<IpRateLimiter>> {
    let burst = NonZeroU32::new(cfg.max_requests)?;
    let quota = Quota::with_period(cfg.window / cfg.max_requests)?.allow_burst(burst);
    Some(Arc::new(RateLimiter::keyed(quota)))
}

/// First `X-Forwarded-For` entry, else the peer address.
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());

    forwarded.or_else(|| {
        extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

/// Extractor for the requesting client's address.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(ClientIp(client_ip(&parts.headers, &parts.extensions)))
    }
}

/// Middleware rejecting clients that exhausted their budget. Service health
/// endpoints are exempt.
pub async fn rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if let Some(limiter) = &state.rate_limiter {
        if !request.uri().path().starts_with("/health") {
            let key = client_ip(request.headers(), request.extensions())
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
            if limiter.check_key(&key).is_err() {
                tracing::warn!("Rate limit exceeded for {}", key);
                return ApiError::RateLimited.into_response();
            }
        }
    }

    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_disabled_when_zero() {
        let cfg = RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 0,
        };
        assert!(build_rate_limiter(&cfg).is_none());
    }

    #[test]
    fn test_budget_is_per_address() {
        let cfg = RateLimitConfig {
            window: Duration::from_secs(900),
            max_requests: 3,
        };
        let limiter = build_rate_limiter(&cfg).unwrap();
        let a: IpAddr = "203.0.113.1".parse().unwrap();
        let b: IpAddr = "203.0.113.2".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check_key(&a).is_ok());
        }
        assert!(limiter.check_key(&a).is_err());
        assert!(limiter.check_key(&b).is_ok());
    }

    #[test]
    fn test_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        let mut extensions = Extensions::new();
        extensions.insert(ConnectInfo(SocketAddr::from(([10, 0, 0, 5], 4000))));

        assert_eq!(
            client_ip(&headers, &extensions),
            Some("10.0.0.5".parse().unwrap())
        );

        headers.insert("x-forwarded-for", "198.51.100.7, 10.0.0.1".parse().unwrap());
        assert_eq!(
            client_ip(&headers, &extensions),
            Some("198.51.100.7".parse().unwrap())
        );
    }
}
