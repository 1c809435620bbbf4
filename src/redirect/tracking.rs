//! Click metadata: IP anonymization, user-agent parsing, geolocation.

use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

/// Drop the host part of an address before it is stored.
///
/// IPv4 keeps the first three octets (`a.b.c.0`); IPv6 keeps the first four
/// groups (`a:b:c:d::`).
pub fn anonymize_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => {
            let [a, b, c, _] = v4.octets();
            format!("{}.{}.{}.0", a, b, c)
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return anonymize_ip(IpAddr::V4(v4));
            }
            let s = v6.segments();
            format!("{:x}:{:x}:{:x}:{:x}::", s[0], s[1], s[2], s[3])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserAgentInfo {
    pub browser: &'static str,
    pub os: &'static str,
    pub device: &'static str,
}

/// Coarse user-agent classification by substring.
///
/// Order matters: Chrome and Edge user agents also contain "safari", and
/// Android user agents contain "linux".
pub fn parse_user_agent(user_agent: &str) -> UserAgentInfo {
    let ua = user_agent.to_lowercase();

    let browser = if ua.contains("edg") {
        "Edge"
    } else if ua.contains("opr") || ua.contains("opera") {
        "Opera"
    } else if ua.contains("chrome") || ua.contains("crios") {
        "Chrome"
    } else if ua.contains("firefox") || ua.contains("fxios") {
        "Firefox"
    } else if ua.contains("safari") {
        "Safari"
    } else {
        "Unknown"
    };

    let os = if ua.contains("windows") {
        "Windows"
    } else if ua.contains("iphone") || ua.contains("ipad") || ua.contains("ios") {
        "iOS"
    } else if ua.contains("mac") {
        "macOS"
    } else if ua.contains("android") {
        "Android"
    } else if ua.contains("linux") {
        "Linux"
    } else {
        "Unknown"
    };

    let device = if ua.contains("tablet") || ua.contains("ipad") {
        "Tablet"
    } else if ua.contains("mobile") {
        "Mobile"
    } else {
        "Desktop"
    };

    UserAgentInfo { browser, os, device }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Location {
    pub country: Option<String>,
    pub city: Option<String>,
}

/// Resolves a client address to a coarse location.
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn locate(&self, ip: IpAddr) -> Option<Location>;
}

/// Locator used when no geolocation provider is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoGeoLocation;

#[async_trait]
impl GeoLocator for NoGeoLocation {
    async fn locate(&self, _ip: IpAddr) -> Option<Location> {
        None
    }
}

/// ipinfo.io lookup.
pub struct IpInfoLocator {
    http: reqwest::Client,
    token: String,
}

impl IpInfoLocator {
    pub fn new(http: reqwest::Client, token: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
        }
    }
}

#[async_trait]
impl GeoLocator for IpInfoLocator {
    async fn locate(&self, ip: IpAddr) -> Option<Location> {
        if !is_public(ip) {
            return None;
        }

        let result = self
            .http
            .get(format!("https://ipinfo.io/{}", ip))
            .bearer_auth(&self.token)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .and_then(|r| r.error_for_status());

        match result {
            Ok(response) => match response.json::<Location>().await {
                Ok(location) => Some(location),
                Err(e) => {
                    tracing::warn!("IPInfo response for {} could not be parsed: {}", ip, e);
                    None
                }
            },
            Err(e) => {
                tracing::warn!("IPInfo lookup for {} failed: {}", ip, e);
                None
            }
        }
    }
}

fn is_public(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !(v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()),
        IpAddr::V6(v6) => !(v6.is_loopback() || v6.is_unspecified()),
    }
}
