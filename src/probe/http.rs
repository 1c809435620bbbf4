//! HTTP probe implementation.

use async_trait::async_trait;
use reqwest::redirect::Policy;
use std::time::{Duration, Instant};

use super::{ProbeError, ProbeResponse, Prober};

/// Redirects followed before a probe gives up.
pub const MAX_REDIRECTS: usize = 5;

/// Probes destinations with a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpProber {
    client: reqwest::Client,
    timeout: Duration,
}

impl HttpProber {
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(Policy::limited(MAX_REDIRECTS))
            .user_agent(concat!("LinkGuardian-HealthCheck/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    fn map_err(&self, e: reqwest::Error) -> ProbeError {
        if e.is_timeout() {
            ProbeError::Timeout(self.timeout)
        } else {
            ProbeError::Network(e.to_string())
        }
    }
}

#[async_trait]
impl Prober for HttpProber {
    async fn probe(&self, url: &str) -> Result<ProbeResponse, ProbeError> {
        let start = Instant::now();

        let response = self.client.get(url).send().await.map_err(|e| self.map_err(e))?;
        let status_code = response.status().as_u16();

        // Read the full body to measure complete transfer time
        let _body = response.bytes().await.map_err(|e| self.map_err(e))?;

        Ok(ProbeResponse {
            status_code,
            response_time: start.elapsed(),
        })
    }
}
