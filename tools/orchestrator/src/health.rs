//! Health Gate
//!
//! Bounded-retry readiness probing. Running out of attempts is a reported
//! outcome (`ready == false`), never an error.

use std::time::Duration;

use reqwest::{redirect, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use warden_shared::{HealthCheckResult, HealthTarget, ProbeResponse, Result, WardenError};

/// Attempt budget for one readiness wait
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// A single probe with no waiting, as used by verification and `status`
    pub const ONCE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        interval: Duration::ZERO,
    };
}

#[derive(Clone)]
pub struct HealthGate {
    client: Client,
    attempt_timeout: Duration,
}

impl HealthGate {
    pub fn new(attempt_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(attempt_timeout)
            .connect_timeout(attempt_timeout)
            // 3xx counts as ready by default, so observe it instead of following it
            .redirect(redirect::Policy::none())
            .build()
            .map_err(|e| WardenError::Internal(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, attempt_timeout })
    }

    /// One probe, bounded by the per-attempt timeout
    pub async fn probe(&self, target: &HealthTarget) -> ProbeResponse {
        // The client timeout should fire first; this outer bound covers DNS or TLS stalls
        let request = self.client.get(&target.url).send();
        match tokio::time::timeout(self.attempt_timeout + Duration::from_millis(250), request).await {
            Err(_) => ProbeResponse::Timeout,
            Ok(Ok(resp)) => ProbeResponse::Status(resp.status().as_u16()),
            Ok(Err(e)) if e.is_timeout() => ProbeResponse::Timeout,
            Ok(Err(e)) => ProbeResponse::Error(short_error(&e)),
        }
    }

    /// Probe up to `policy.max_attempts` times, sleeping `policy.interval` between attempts.
    ///
    /// Cancellation is observed between attempts; a probe already in flight
    /// finishes first.
    pub async fn await_ready(
        &self,
        service: &str,
        target: &HealthTarget,
        policy: RetryPolicy,
        cancel: &CancellationToken,
    ) -> HealthCheckResult {
        let mut attempts = 0;
        let mut last_response = ProbeResponse::NotAttempted;

        while attempts < policy.max_attempts {
            if cancel.is_cancelled() {
                break;
            }

            attempts += 1;
            last_response = self.probe(target).await;
            if let ProbeResponse::Status(code) = last_response {
                if target.accepts(code) {
                    debug!(service, attempts, status = code, "ready");
                    return HealthCheckResult {
                        service: service.to_string(),
                        attempts,
                        ready: true,
                        last_response,
                    };
                }
            }
            debug!(service, attempt = attempts, response = %last_response, "not ready yet");

            if attempts < policy.max_attempts && !policy.interval.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(policy.interval) => {}
                }
            }
        }

        if policy.max_attempts > 1 {
            warn!(service, attempts, response = %last_response, "not ready within attempt budget");
        }
        HealthCheckResult {
            service: service.to_string(),
            attempts,
            ready: false,
            last_response,
        }
    }
}

/// reqwest errors nest the useful cause; keep the innermost message
fn short_error(err: &reqwest::Error) -> String {
    let mut source: &dyn std::error::Error = err;
    while let Some(next) = source.source() {
        source = next;
    }
    if err.is_connect() {
        format!("connect failed: {}", source)
    } else {
        source.to_string()
    }
}
