//! Configuration module for LinkGuardian.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the web server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "linkguardian.db")
    pub db_path: String,
    /// How often the scheduler runs, and how stale a check must be to be redone
    pub health_check_interval: Duration,
    /// Per-probe timeout
    pub health_check_timeout: Duration,
    /// Maximum links probed per scheduler tick
    pub health_check_batch_size: usize,
    pub app_name: String,
    pub app_url: String,
    /// Host used to build `shortUrl` values in API responses
    pub short_domain: String,
    pub notifications: NotificationConfig,
    /// ipinfo.io token for click geolocation
    pub ipinfo_token: Option<String>,
    pub rate_limit: RateLimitConfig,
}

/// Outbound notification channel settings.
#[derive(Debug, Clone, Default)]
pub struct NotificationConfig {
    pub support_email: String,
    pub resend_api_key: Option<String>,
    pub slack_webhook_url: Option<String>,
}

/// Per-IP request budget. `max_requests == 0` disables limiting.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "linkguardian.db".to_string(),
            health_check_interval: Duration::from_millis(300_000),
            health_check_timeout: Duration::from_millis(10_000),
            health_check_batch_size: 100,
            app_name: "LinkGuardian".to_string(),
            app_url: "http://localhost:8080".to_string(),
            short_domain: "localhost:8080".to_string(),
            notifications: NotificationConfig {
                support_email: "noreply@linkguardian.com".to_string(),
                resend_api_key: None,
                slack_webhook_url: None,
            },
            ipinfo_token: None,
            rate_limit: RateLimitConfig {
                window: Duration::from_millis(900_000),
                max_requests: 100,
            },
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables (all prefixed `LINKGUARDIAN_`):
    /// - `HTTP_PORT`, `DB_PATH`
    /// - `HEALTH_CHECK_INTERVAL_MS`, `HEALTH_CHECK_TIMEOUT_MS`, `HEALTH_CHECK_BATCH_SIZE`
    /// - `APP_NAME`, `APP_URL`, `SHORT_DOMAIN`
    /// - `SUPPORT_EMAIL`, `RESEND_API_KEY`, `SLACK_WEBHOOK_URL`
    /// - `IPINFO_TOKEN`
    /// - `RATE_LIMIT_WINDOW_MS`, `RATE_LIMIT_MAX_REQUESTS`
    ///
    /// Values that fail to parse leave the default in place.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Some(port) = parsed("HTTP_PORT") {
            cfg.http_port = port;
        }
        if let Some(db_path) = string("DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(ms) = parsed::<u64>("HEALTH_CHECK_INTERVAL_MS").filter(|ms| *ms > 0) {
            cfg.health_check_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed::<u64>("HEALTH_CHECK_TIMEOUT_MS").filter(|ms| *ms > 0) {
            cfg.health_check_timeout = Duration::from_millis(ms);
        }
        if let Some(size) = parsed::<usize>("HEALTH_CHECK_BATCH_SIZE").filter(|s| *s > 0) {
            cfg.health_check_batch_size = size;
        }

        if let Some(name) = string("APP_NAME") {
            cfg.app_name = name;
        }
        if let Some(url) = string("APP_URL") {
            cfg.app_url = url;
        }
        if let Some(domain) = string("SHORT_DOMAIN") {
            cfg.short_domain = domain;
        }

        if let Some(email) = string("SUPPORT_EMAIL") {
            cfg.notifications.support_email = email;
        }
        cfg.notifications.resend_api_key = string("RESEND_API_KEY");
        cfg.notifications.slack_webhook_url = string("SLACK_WEBHOOK_URL");
        cfg.ipinfo_token = string("IPINFO_TOKEN");

        if let Some(ms) = parsed::<u64>("RATE_LIMIT_WINDOW_MS").filter(|ms| *ms > 0) {
            cfg.rate_limit.window = Duration::from_millis(ms);
        }
        if let Some(max) = parsed("RATE_LIMIT_MAX_REQUESTS") {
            cfg.rate_limit.max_requests = max;
        }

        cfg
    }
}

fn string(key: &str) -> Option<String> {
    env::var(format!("LINKGUARDIAN_{}", key))
        .ok()
        .filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(key: &str) -> Option<T> {
    string(key).and_then(|v| v.trim().parse().ok())
}
