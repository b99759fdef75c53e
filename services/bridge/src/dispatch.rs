//! Upstream event delivery with bounded retry.
//!
//! One call to [`Dispatcher::deliver`] makes up to three attempts with
//! exponential backoff (1 s doubling, capped at 10 s).  4xx responses are
//! permanent and never retried; network errors, timeouts, and 5xx are
//! transient.  A 401 is classified transient so rotated credentials are
//! picked up by the replay loop once the operator fixes them.
//!
//! The dispatcher itself is stateless; durability on failure is the
//! caller's job (see the pipeline and pending store).

use crate::config::UpstreamAuth;
use crate::tenants::Tenant;
use acs_protocol::UpstreamPayload;
use std::time::Duration;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Final classification of a delivery after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Upstream answered 2xx.
    Delivered,
    /// Network error, timeout, or 5xx persisted through all attempts.
    Transient(String),
    /// Upstream answered 4xx; retrying cannot help.
    Permanent(u16),
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered)
    }
}

enum Attempt {
    Ok,
    Transient(String),
    Permanent(u16),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// HTTP delivery client shared by the ingest pipeline and the retry loop.
pub struct Dispatcher {
    client: reqwest::Client,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl Dispatcher {
    /// Build a dispatcher with the standard retry policy and the given
    /// per-attempt timeout.
    pub fn new(attempt_timeout: Duration) -> Result<Dispatcher, reqwest::Error> {
        Self::with_policy(attempt_timeout, 3, Duration::from_secs(1), Duration::from_secs(10))
    }

    /// Build a dispatcher with an explicit retry policy (exposed for tests).
    pub fn with_policy(
        attempt_timeout: Duration,
        max_attempts: u32,
        backoff_base: Duration,
        backoff_max: Duration,
    ) -> Result<Dispatcher, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(attempt_timeout).build()?;
        Ok(Dispatcher {
            client,
            max_attempts,
            backoff_base,
            backoff_max,
        })
    }

    /// Deliver `payload` to `tenant`'s upstream endpoint.
    pub async fn deliver(&self, tenant: &Tenant, payload: &UpstreamPayload) -> DispatchOutcome {
        let mut delay = self.backoff_base;
        let mut last_reason = String::new();

        for attempt in 1..=self.max_attempts {
            match self.attempt(tenant, payload).await {
                Attempt::Ok => {
                    debug!(tenant = %tenant.name, attempt, "event delivered upstream");
                    return DispatchOutcome::Delivered;
                }
                Attempt::Permanent(status) => {
                    warn!(
                        tenant = %tenant.name,
                        status,
                        "upstream rejected event permanently"
                    );
                    return DispatchOutcome::Permanent(status);
                }
                Attempt::Transient(reason) => {
                    if attempt < self.max_attempts {
                        warn!(
                            tenant = %tenant.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            %reason,
                            "upstream attempt failed, backing off"
                        );
                        tokio::time::sleep(delay).await;
                        delay = (delay * 2).min(self.backoff_max);
                    }
                    last_reason = reason;
                }
            }
        }

        warn!(tenant = %tenant.name, reason = %last_reason, "upstream delivery failed after retries");
        DispatchOutcome::Transient(last_reason)
    }

    async fn attempt(&self, tenant: &Tenant, payload: &UpstreamPayload) -> Attempt {
        let mut request = self.client.post(&tenant.upstream_url).json(payload);
        request = match &tenant.auth {
            UpstreamAuth::Basic { username, password } => {
                request.basic_auth(username, Some(password))
            }
            UpstreamAuth::Bearer { token } => request.bearer_auth(token),
        };

        match request.send().await {
            Err(e) => Attempt::Transient(e.to_string()),
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    Attempt::Ok
                } else if status.as_u16() == 401 || status.is_server_error() {
                    Attempt::Transient(format!("HTTP {}", status.as_u16()))
                } else if status.is_client_error() {
                    Attempt::Permanent(status.as_u16())
                } else {
                    // 3xx without a followable redirect and friends.
                    Attempt::Transient(format!("HTTP {}", status.as_u16()))
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
