//! Request execution with retries and elapsed-time retirement.
//!
//! A [`RequestExecutor`] sends one logical request for one simulated user. It
//! retries 5xx answers and non-timeout transport failures while the logical
//! request stays inside the retirement threshold, and retires the user for
//! good once the service turns out to be too slow:
//!
//! - a per-attempt timeout fires: retire immediately, never retried;
//! - a response arrives after the threshold: retire, whatever its status;
//! - transport failures keep coming until the threshold is used up: retire
//!   and hand back the last transport error.
//!
//! Once retired, every call fails with [`Error::AlreadyRetired`] before any
//! request is built or sent.

use bytes::Bytes;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info, warn};

use crate::errors::{Error, ErrorCategory};
use crate::metrics::{
    ATTEMPTS_TOTAL, REQUESTS_TOTAL, REQUEST_DURATION_SECONDS, RETIREMENTS_TOTAL, RETRIES_TOTAL,
};
use crate::response::TimedResponse;

/// Why a user was retired, used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetireReason {
    /// The per-attempt timeout fired.
    Timeout,
    /// A response arrived after the retirement threshold.
    SlowResponse,
    /// Transport failures used up the retirement threshold.
    TransportBudget,
}

impl RetireReason {
    pub fn label(&self) -> &'static str {
        match self {
            RetireReason::Timeout => "timeout",
            RetireReason::SlowResponse => "slow_response",
            RetireReason::TransportBudget => "transport_budget",
        }
    }
}

/// Executes requests for a single simulated user.
///
/// The executor is driven through `&mut self`, so one user never has two
/// logical requests in flight and the retirement flag needs no locking.
///
/// The reqwest client should be built with [`crate::client::build_client`]:
/// its timeout is the per-attempt deadline, and its cookie jar is the user's
/// session.
pub struct RequestExecutor {
    client: reqwest::Client,
    retirement_threshold: Duration,
    retry_interval: Duration,
    retired: bool,
}

impl RequestExecutor {
    pub fn new(client: reqwest::Client, retirement_threshold: Duration, retry_interval: Duration) -> Self {
        Self {
            client,
            retirement_threshold,
            retry_interval,
            retired: false,
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retired
    }

    /// Sends `request` until it yields a status below 500 or the user retires.
    ///
    /// The returned elapsed time runs from the first attempt to the arrival of
    /// the final response headers.
    pub async fn execute(&mut self, request: reqwest::Request) -> Result<TimedResponse, Error> {
        if self.retired {
            return Err(Error::AlreadyRetired);
        }

        let body = snapshot_body(&request)?;
        let content_length = body.as_ref().map_or(0, Bytes::len);
        let start = Instant::now();
        let mut attempt_no: u32 = 0;

        loop {
            attempt_no += 1;
            let attempt = fresh_attempt(&request, body.as_ref());
            ATTEMPTS_TOTAL.inc();

            let result = self.client.execute(attempt).await;
            let elapsed = start.elapsed();

            let response = match result {
                Ok(response) => response,
                Err(e) if e.is_timeout() => {
                    self.retire(RetireReason::Timeout);
                    return Err(Error::ElapsedTimeOverRetire(e.to_string()));
                }
                Err(e) => {
                    let category = ErrorCategory::from_reqwest_error(&e);
                    warn!(
                        method = %request.method(),
                        url = %request.url(),
                        error = %e,
                        error_category = category.label(),
                        elapsed_secs = elapsed.as_secs_f64(),
                        content_length,
                        attempt = attempt_no,
                        "Request attempt failed"
                    );
                    if elapsed < self.retirement_threshold {
                        RETRIES_TOTAL.with_label_values(&[category.label()]).inc();
                        continue;
                    }
                    self.retire(RetireReason::TransportBudget);
                    return Err(Error::Transport(e));
                }
            };

            if elapsed > self.retirement_threshold {
                drop(response);
                self.retire(RetireReason::SlowResponse);
                return Err(Error::ElapsedTimeOverRetire(format!(
                    "this user gave up browsing because response time is too long. [{:.5} s]",
                    elapsed.as_secs_f64()
                )));
            }

            let status = response.status();
            if status.as_u16() >= 500 {
                match response.bytes().await {
                    Ok(body) => info!(
                        status = status.as_u16(),
                        body = %String::from_utf8_lossy(&body),
                        attempt = attempt_no,
                        "Retrying after server error"
                    ),
                    Err(e) => info!(
                        status = status.as_u16(),
                        error = %e,
                        attempt = attempt_no,
                        "Retrying after server error, body read failed"
                    ),
                }
                RETRIES_TOTAL
                    .with_label_values(&[ErrorCategory::ServerError.label()])
                    .inc();
                sleep(self.retry_interval).await;
                continue;
            }

            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(Error::Transport)?;

            REQUESTS_TOTAL
                .with_label_values(&[request.method().as_str(), status.as_str()])
                .inc();
            REQUEST_DURATION_SECONDS.observe(elapsed.as_secs_f64());
            debug!(
                method = %request.method(),
                url = %request.url(),
                status = status.as_u16(),
                elapsed_ms = elapsed.as_millis() as u64,
                attempts = attempt_no,
                "Request completed"
            );

            return Ok(TimedResponse {
                status,
                headers,
                body,
                elapsed,
                served_from_cache: false,
                body_from_cache: false,
            });
        }
    }

    fn retire(&mut self, reason: RetireReason) {
        if !self.retired {
            self.retired = true;
            RETIREMENTS_TOTAL.with_label_values(&[reason.label()]).inc();
            info!(reason = reason.label(), "User retired");
        }
    }
}

/// Copies the request body once so every attempt can replay it.
fn snapshot_body(request: &reqwest::Request) -> Result<Option<Bytes>, Error> {
    match request.body() {
        None => Ok(None),
        Some(body) => body
            .as_bytes()
            .map(|b| Some(Bytes::copy_from_slice(b)))
            .ok_or_else(|| Error::Unexpected("streaming request bodies cannot be replayed".into())),
    }
}

fn fresh_attempt(template: &reqwest::Request, body: Option<&Bytes>) -> reqwest::Request {
    let mut attempt = reqwest::Request::new(template.method().clone(), template.url().clone());
    *attempt.headers_mut() = template.headers().clone();
    *attempt.timeout_mut() = template.timeout().copied();
    *attempt.version_mut() = template.version();
    if let Some(body) = body {
        *attempt.body_mut() = Some(reqwest::Body::from(body.clone()));
    }
    attempt
}
