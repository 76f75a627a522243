//! A single webhook delivery attempt: compute backoff, persist the attempt,
//! perform the HTTP POST, then finalize or reschedule.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::StatusCode;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::config::retired_keep;
use crate::dispatcher::EngineInner;
use crate::store::chrono_dur;
use crate::types::{Hook, HookResult, RESULT_ERROR_DELIVERING};

/// Wait before each attempt, by number of earlier attempts. After the table
/// runs out, twice the last interval.
pub(crate) const INTERVALS: [Duration; 11] = [
    Duration::from_secs(60),
    Duration::from_secs(2 * 60),
    Duration::from_secs(4 * 60),
    Duration::from_secs(450),
    Duration::from_secs(15 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(3600),
    Duration::from_secs(2 * 3600),
    Duration::from_secs(4 * 3600),
    Duration::from_secs(8 * 3600),
    Duration::from_secs(16 * 3600),
];

/// Histogram buckets for `webhook_request_duration_seconds`, for the metrics
/// exporter to install.
pub const REQUEST_DURATION_BUCKETS: [f64; 9] = [0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 20.0, 30.0];

/// Maximum HTTP response body bytes kept in a result.
const MAX_RESPONSE: usize = 512;

#[cfg(feature = "metrics")]
fn metric_request_duration(d: Duration) {
    metrics::histogram!("webhook_request_duration_seconds").record(d.as_secs_f64());
}

#[cfg(not(feature = "metrics"))]
fn metric_request_duration(_d: Duration) {}

#[cfg(feature = "metrics")]
fn metric_result(code: &str) {
    metrics::counter!("webhook_results_total", "code" => code.to_string()).increment(1);
}

#[cfg(not(feature = "metrics"))]
fn metric_result(_code: &str) {}

#[cfg(feature = "metrics")]
pub(crate) fn metric_panic(kind: &'static str) {
    metrics::counter!("webhook_panics_total", "kind" => kind).increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn metric_panic(_kind: &'static str) {}

pub(crate) fn backoff_for(attempts: u32) -> Duration {
    match INTERVALS.get(attempts as usize) {
        Some(d) => *d,
        None => INTERVALS[INTERVALS.len() - 1] * 2,
    }
}

/// Apply ±1% uniform jitter.
pub(crate) fn with_jitter(d: Duration) -> Duration {
    let nanos = d.as_nanos() as i64;
    let adjust = nanos / 10_000 * fastrand::i64(-100..100);
    Duration::from_nanos((nanos + adjust) as u64)
}

/// Attempt delivery of one hook. Called from a spawned task; the caller sends
/// the completion signal and guards against panics.
pub(crate) async fn deliver(inner: Arc<EngineInner>, mut h: Hook) {
    debug!(
        webhookid = h.id,
        attempts = h.attempts,
        msgid = h.queue_msg_id,
        account = %h.account,
        url = %h.url,
        event = %h.event_tag(),
        "attempting to deliver webhook"
    );

    // Set attempts and next_attempt early: if something fails while
    // processing, at least we won't retry immediately.
    let backoff = with_jitter(backoff_for(h.attempts));
    h.attempts += 1;
    let now = Utc::now();
    h.next_attempt = now + chrono_dur(backoff);
    h.results.push(HookResult {
        start: now,
        duration: Duration::ZERO,
        url: h.url.clone(),
        success: false,
        code: 0,
        error: RESULT_ERROR_DELIVERING.into(),
        response: String::new(),
    });
    if let Err(err) = inner.store.update_hook(&h) {
        // Includes the hook having been superseded before we started; the
        // remaining pending work is picked up on the next scheduler pass.
        error!(webhookid = h.id, %err, "storing webhook delivery attempt");
        return;
    }

    let attempt_start = Utc::now();
    let started = Instant::now();
    let post = hook_post(
        &inner.client,
        inner.config.attempt_timeout,
        h.id,
        h.attempts,
        &h.url,
        &h.authorization,
        &h.payload,
    )
    .await;

    let last = h.results.len() - 1;
    let result = &mut h.results[last];
    result.duration = started.elapsed();
    result.code = post.code;
    result.response = post.response;
    match &post.error {
        Some(e) => {
            result.success = false;
            result.error = e.clone();
        }
        None => {
            result.success = true;
            result.error = String::new();
        }
    }
    let success = result.success;

    if !success && h.attempts <= INTERVALS.len() as u32 {
        debug!(
            webhookid = h.id,
            attempts = h.attempts,
            error = %post.error.as_deref().unwrap_or_default(),
            "webhook delivery failed, will try again later"
        );
        if let Err(err) = inner.store.update_after_attempt(&h) {
            error!(webhookid = h.id, %err, "updating failed webhook delivery attempt");
        }
        return;
    }

    debug!(webhookid = h.id, success, "webhook delivery completed");

    let keep = retired_keep(inner.accounts.as_ref(), &h.account);
    if let Err(err) = inner.store.retire_hook(&h, success, attempt_start, keep) {
        error!(webhookid = h.id, %err, "moving delivered webhook to retired hooks");
    }
}

pub(crate) struct PostResult {
    /// HTTP status code, 0 for transport errors.
    pub code: u16,
    /// At most 512 bytes of the response body.
    pub response: String,
    /// Set unless the round-trip completed with status 200.
    pub error: Option<String>,
}

/// One HTTP POST of a webhook payload.
pub(crate) async fn hook_post(
    client: &reqwest::Client,
    timeout: Duration,
    hook_id: u64,
    attempt: u32,
    url: &str,
    authorization: &str,
    payload: &str,
) -> PostResult {
    let mut req = client
        .post(url)
        .timeout(timeout)
        .header(
            reqwest::header::USER_AGENT,
            concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"), " (webhook)"),
        )
        .header(reqwest::header::CONTENT_TYPE, "application/json; charset=utf-8")
        .header("X-Mox-Webhook-ID", hook_id.to_string())
        .header("X-Mox-Webhook-Attempt", attempt.to_string());
    if !authorization.is_empty() {
        req = req.header(reqwest::header::AUTHORIZATION, authorization);
    }

    let started = Instant::now();
    let resp = req.body(payload.to_string()).send().await;
    metric_request_duration(started.elapsed());

    let resp = match resp {
        Ok(resp) => resp,
        Err(err) => {
            metric_result("error");
            debug!(webhookid = hook_id, %err, "webhook http transaction");
            return PostResult {
                code: 0,
                response: String::new(),
                error: Some(format!("http transact: {err}")),
            };
        }
    };

    let status = resp.status();
    // Full status code for known codes, "<major>xx" for others.
    let label = match status.canonical_reason() {
        Some(_) => status.as_u16().to_string(),
        None => format!("{}xx", status.as_u16() / 100),
    };
    metric_result(&label);
    debug!(
        webhookid = hook_id,
        statuscode = status.as_u16(),
        "webhook http post result"
    );

    let body = resp.bytes().await.unwrap_or_default();
    let error = if status != StatusCode::OK {
        Some(format!("http status {status}, expected 200 ok"))
    } else {
        None
    };
    PostResult {
        code: status.as_u16(),
        response: truncate_response(&body),
        error,
    }
}

/// Lossy-decode at most [`MAX_RESPONSE`] bytes of a response body.
fn truncate_response(body: &[u8]) -> String {
    String::from_utf8_lossy(&body[..body.len().min(MAX_RESPONSE)]).into_owned()
}
