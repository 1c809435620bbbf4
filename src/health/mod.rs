//! Link health checking: classify one probe, persist it, alert on failure.

mod checker;

pub use checker::*;

use std::time::Duration;

use crate::db::HealthStatus;
use crate::probe::{ProbeError, ProbeResponse};

/// Responses slower than this are downgraded to WARNING.
pub const SLOW_RESPONSE_THRESHOLD: Duration = Duration::from_millis(5000);

/// A probe outcome reduced to what gets stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: HealthStatus,
    pub status_code: Option<u16>,
    /// Milliseconds
    pub response_time: Option<i64>,
    pub error: Option<String>,
}

/// Classify a single probe outcome.
///
/// Rules are evaluated in order: transport failure, 5xx, 4xx, slow response.
pub fn classify(outcome: &Result<ProbeResponse, ProbeError>) -> Classification {
    let response = match outcome {
        Ok(response) => response,
        Err(e) => {
            return Classification {
                status: HealthStatus::Error,
                status_code: None,
                response_time: None,
                error: Some(e.to_string()),
            }
        }
    };

    let code = response.status_code;
    let (status, error) = if code >= 500 {
        (HealthStatus::Error, Some(format!("HTTP {}", code)))
    } else if code >= 400 {
        (HealthStatus::Warning, Some(format!("HTTP {}", code)))
    } else if response.response_time > SLOW_RESPONSE_THRESHOLD {
        (HealthStatus::Warning, Some("Slow response time".to_string()))
    } else {
        (HealthStatus::Healthy, None)
    };

    Classification {
        status,
        status_code: Some(code),
        response_time: Some(response.response_time.as_millis() as i64),
        error,
    }
}
