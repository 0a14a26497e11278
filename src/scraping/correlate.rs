//! Action → response correlation over CDP network events.
//!
//! The marketplace UI fires one API call per meaningful interaction (filter
//! click, page turn, detail navigation). [`await_response`] pairs a UI action
//! with the response it provokes: subscribe to `Network.responseReceived`
//! *before* running the action, then resolve with the first event whose URL
//! contains the registered pattern. Unrelated in-flight responses are left
//! untouched — exactly one matching response is consumed per call.
//!
//! Timeouts are an expected outcome, not an exception: the result is an
//! explicit [`Correlation`] variant so the paginator's termination condition
//! stays a testable branch.

use std::future::Future;
use std::time::Duration;

use base64::Engine as _;
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventResponseReceived, GetResponseBodyParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::{Result, ScoutError};

/// A network response captured off the wire, body included.
#[derive(Debug, Clone)]
pub struct CapturedResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
}

impl CapturedResponse {
    /// 2xx?
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body)
            .map_err(|e| ScoutError::parse(format!("response body of {}", self.url), e))
    }
}

/// Outcome of one correlation attempt.
#[derive(Debug)]
pub enum Correlation {
    Captured(CapturedResponse),
    TimedOut,
}

impl Correlation {
    pub fn into_ok_response(self) -> Option<CapturedResponse> {
        match self {
            Correlation::Captured(r) if r.ok() => Some(r),
            _ => None,
        }
    }
}

/// Execute `action` and resolve with the first response whose URL contains
/// `url_pattern`, waiting at most `timeout` after the action completes.
///
/// The subscription is scoped to this call: the event stream is dropped on
/// every exit path, so no listener leaks onto the page. Responses that were
/// already in flight before the subscription existed are never seen.
pub async fn await_response<F, Fut>(
    page: &Page,
    url_pattern: &str,
    timeout: Duration,
    action: F,
) -> Result<Correlation>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<()>>,
{
    // Network events only flow once the domain is enabled. Idempotent.
    page.execute(EnableParams::default()).await?;

    let mut events = page.event_listener::<EventResponseReceived>().await?;

    // The action (click / navigation) runs to completion first; matching
    // events that fire meanwhile stay buffered in the stream.
    action().await?;

    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let next = tokio::time::timeout_at(deadline, events.next()).await;
        match next {
            Ok(Some(event)) => {
                if !event.response.url.contains(url_pattern) {
                    continue;
                }
                let status = event.response.status as u16;
                debug!(
                    "correlated response: {} ({})",
                    event.response.url, status
                );
                let body = fetch_body(page, &event.request_id).await.unwrap_or_default();
                return Ok(Correlation::Captured(CapturedResponse {
                    url: event.response.url.clone(),
                    status,
                    body,
                }));
            }
            // Stream closed (page died) or deadline hit — same outcome.
            Ok(None) => return Ok(Correlation::TimedOut),
            Err(_) => {
                debug!(
                    "no response matching '{}' within {:?}",
                    url_pattern, timeout
                );
                return Ok(Correlation::TimedOut);
            }
        }
    }
}

/// Retrieve a response body by request id.
///
/// CDP refuses `Network.getResponseBody` until the request has finished
/// loading, which can be shortly *after* `responseReceived` fires — so this
/// polls briefly instead of failing on the first miss.
pub(crate) async fn fetch_body(
    page: &Page,
    request_id: &chromiumoxide::cdp::browser_protocol::network::RequestId,
) -> Option<String> {
    for _ in 0..20 {
        match page
            .execute(GetResponseBodyParams::new(request_id.clone()))
            .await
        {
            Ok(resp) => {
                let raw = &resp.body;
                if resp.base64_encoded {
                    let decoded = base64::engine::general_purpose::STANDARD
                        .decode(raw.as_bytes())
                        .ok()?;
                    return Some(String::from_utf8_lossy(&decoded).into_owned());
                }
                return Some(raw.clone());
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
    warn!("response body for request {:?} never became readable", request_id);
    None
}
