//! LinkGuardian - short links with destination health monitoring.

mod clock;
mod config;
mod db;
mod health;
mod html;
mod notify;
mod password;
mod probe;
mod redirect;
mod scheduler;
mod web;

use clock::{Clock, SystemClock};
use config::ServerConfig;
use db::Store;
use health::HealthChecker;
use notify::NotificationDispatcher;
use password::PasswordHasher;
use probe::HttpProber;
use redirect::{GeoLocator, IpInfoLocator, NoGeoLocation, Resolver};
use scheduler::HealthScheduler;
use web::{build_rate_limiter, AppState, Server};

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const SCHEDULED_PROBE_JITTER: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("linkguardian=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting {} on port {}...", cfg.app_name, cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let hasher = PasswordHasher::new();

    let prober = Arc::new(HttpProber::new(cfg.health_check_timeout)?);
    let notifier = Arc::new(NotificationDispatcher::new(
        store.clone(),
        http.clone(),
        cfg.notifications.clone(),
        cfg.app_name.clone(),
        cfg.app_url.clone(),
    ));
    let geo: Arc<dyn GeoLocator> = match &cfg.ipinfo_token {
        Some(token) => Arc::new(IpInfoLocator::new(http.clone(), token.clone())),
        None => {
            tracing::info!("No IPInfo token configured; click geolocation disabled");
            Arc::new(NoGeoLocation)
        }
    };

    let checker = Arc::new(HealthChecker::new(
        store.clone(),
        prober,
        notifier,
        clock.clone(),
    ));
    let resolver = Arc::new(Resolver::new(
        store.clone(),
        clock.clone(),
        hasher.clone(),
        geo,
    ));

    // Start scheduler
    let scheduler = Arc::new(
        HealthScheduler::new(
            checker.clone(),
            store.clone(),
            clock.clone(),
            cfg.health_check_interval,
            cfg.health_check_batch_size,
        )
        .with_jitter(SCHEDULED_PROBE_JITTER),
    );
    let scheduler_task = scheduler.start();

    // Start web server
    let state = AppState {
        rate_limiter: build_rate_limiter(&cfg.rate_limit),
        config: cfg,
        store,
        resolver,
        checker,
        hasher,
        clock,
        started_at: Instant::now(),
    };
    let server = Server::new(state);

    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    scheduler.stop().await;
    if let Err(e) = scheduler_task.await {
        tracing::warn!("Scheduler task ended abnormally: {}", e);
    }
    Ok(())
}
