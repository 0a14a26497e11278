//! Bounded retry with a fixed delay.
//!
//! Every fallible external call that is expected to flake (AI endpoint,
//! image download, notification POST) is wrapped explicitly at its call
//! site; nothing retries implicitly.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

/// Retry policy: `attempts` total tries with a fixed `delay` between them.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// Profile for the AI analysis call: transient HTTP/JSON failures are
    /// expected there, so it gets the widest budget.
    pub const fn analysis() -> Self {
        Self::new(5, Duration::from_secs(10))
    }

    /// Profile for notification sinks.
    pub const fn notify() -> Self {
        Self::new(3, Duration::from_secs(5))
    }

    /// Profile for a single image download.
    pub const fn image() -> Self {
        Self::new(2, Duration::from_secs(3))
    }
}

/// Run `op` under `policy`, returning the first success or the *last* error
/// once the attempt budget is exhausted. Each failure is logged with the
/// attempt counter and `label` so a run can be diagnosed without replaying it.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = policy.attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                warn!("{}: attempt {}/{} failed: {}", label, attempt, attempts, e);
                last_err = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt ran"))
}
