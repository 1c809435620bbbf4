//! Web server module.

mod error;
mod handlers;
mod rate_limit;

pub use error::ApiError;
pub use handlers::*;
pub use rate_limit::{build_rate_limiter, IpRateLimiter};

use crate::clock::Clock;
use crate::config::ServerConfig;
use crate::db::Store;
use crate::health::HealthChecker;
use crate::password::PasswordHasher;
use crate::redirect::Resolver;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub resolver: Arc<Resolver>,
    pub checker: Arc<HealthChecker>,
    pub hasher: PasswordHasher,
    pub clock: Arc<dyn Clock>,
    pub rate_limiter: Option<Arc<IpRateLimiter>>,
    pub started_at: Instant,
}

/// Web server for LinkGuardian.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    pub fn routes(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            // Service health
            .route("/health", get(handlers::handle_health))
            .route("/health/live", get(handlers::handle_live))
            .route("/health/ready", get(handlers::handle_ready))
            // API endpoints
            .route(
                "/api/v1/links",
                get(handlers::handle_list_links).post(handlers::handle_create_link),
            )
            .route("/api/v1/links/bulk", post(handlers::handle_bulk_create_links))
            .route(
                "/api/v1/links/{id}",
                get(handlers::handle_get_link)
                    .put(handlers::handle_update_link)
                    .delete(handlers::handle_delete_link),
            )
            .route("/api/v1/links/{id}/health", post(handlers::handle_check_link_health))
            .route("/api/v1/links/{id}/health-checks", get(handlers::handle_get_health_checks))
            .route("/api/v1/users", post(handlers::handle_create_user))
            .route("/api/v1/users/{id}/notifications", get(handlers::handle_get_notifications))
            .route("/api/v1/organizations", post(handlers::handle_create_organization))
            .route("/api/v1/organizations/{id}/members", post(handlers::handle_add_member))
            .route(
                "/api/v1/organizations/{id}/members/{user_id}",
                delete(handlers::handle_remove_member),
            )
            // Static assets
            .route("/favicon.ico", get(handlers::handle_favicon))
            // Short links
            .route("/{short_code}", get(handlers::handle_redirect))
            .route("/{short_code}/preview", get(handlers::handle_preview))
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                rate_limit::rate_limit,
            ))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        if let Some(limiter) = self.state.rate_limiter.clone() {
            spawn_limiter_cleanup(limiter, self.state.config.rate_limit.window);
        }

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

/// Drop idle per-client buckets so the limiter does not grow without bound.
fn spawn_limiter_cleanup(limiter: Arc<IpRateLimiter>, window: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(window.max(Duration::from_secs(60)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            limiter.retain_recent();
            limiter.shrink_to_fit();
        }
    });
}

#[cfg(test)]
mod tests;
