//! Anti-bot circuit breaker.
//!
//! Two independent block signatures are recognized:
//!
//! * **Challenge overlay** — a verification dialog the site throws over the
//!   search page shortly after load. Page-level: the task aborts immediately
//!   and returns what it processed; only a fresh run (a page reload) can
//!   recover.
//! * **Account validation code** — `FAIL_SYS_USER_VALIDATE` embedded in a
//!   detail-API payload. Account-level: the task sleeps through a long
//!   randomized cooldown before terminating cleanly, so the account is not
//!   hammered while it is flagged.
//!
//! Both are terminal for the current task, never for sibling tasks.

use std::sync::OnceLock;
use std::time::Duration;

use aho_corasick::AhoCorasick;
use chromiumoxide::Page;
use tracing::{error, info};

use crate::core::BlockSignal;
use crate::scraping::browser;

/// CSS selector of the verification overlay.
const CHALLENGE_OVERLAY_SELECTOR: &str = "div.baxia-dialog-mask";

/// How long the overlay probe waits. The dialog pops within a second or two
/// of page load when it comes at all; absence is the normal case and must
/// stay cheap.
const OVERLAY_PROBE_WINDOW: Duration = Duration::from_secs(2);

/// Substrings in an API payload that mean the account tripped validation.
const PAYLOAD_BLOCK_PATTERNS: &[&str] = &["FAIL_SYS_USER_VALIDATE"];

static PAYLOAD_MATCHER: OnceLock<AhoCorasick> = OnceLock::new();

fn payload_matcher() -> &'static AhoCorasick {
    PAYLOAD_MATCHER
        .get_or_init(|| AhoCorasick::new(PAYLOAD_BLOCK_PATTERNS).expect("valid block patterns"))
}

/// Probe the page for the challenge overlay with a short bounded wait.
///
/// Returns `Some(OverlayChallenge)` only when the overlay is actually
/// visible; a timeout means the page is clean.
pub async fn probe_challenge_overlay(page: &Page) -> Option<BlockSignal> {
    if browser::wait_for_visible(page, CHALLENGE_OVERLAY_SELECTOR, OVERLAY_PROBE_WINDOW).await {
        error!("🚨 Challenge overlay detected ({})", CHALLENGE_OVERLAY_SELECTOR);
        Some(BlockSignal::OverlayChallenge)
    } else {
        None
    }
}

/// Scan a raw API payload for the account-validation block code.
pub fn scan_payload(body: &str) -> Option<BlockSignal> {
    if payload_matcher().is_match(body) {
        error!("🚨 Account validation code found in API payload");
        Some(BlockSignal::AccountValidate)
    } else {
        None
    }
}

/// Sleep through the account-level cooldown: 5–10 minutes, randomized so
/// repeated trips don't land on a fixed cadence.
pub async fn cooldown() {
    let secs = {
        use rand::RngExt;
        rand::rng().random_range(300..=600)
    };
    info!(
        "Account flagged: cooling down for {}s before terminating the task",
        secs
    );
    tokio::time::sleep(Duration::from_secs(secs)).await;
    info!("Cooldown finished, terminating task cleanly");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_payload_hits_validation_code() {
        let body = r#"{"api":"mtop.taobao.idle.pc.detail","ret":["FAIL_SYS_USER_VALIDATE::RGV587_ERROR"],"data":{}}"#;
        assert_eq!(scan_payload(body), Some(BlockSignal::AccountValidate));
    }

    #[test]
    fn test_scan_payload_clean_body() {
        let body = r#"{"api":"mtop.taobao.idle.pc.detail","ret":["SUCCESS::调用成功"],"data":{"itemDO":{}}}"#;
        assert_eq!(scan_payload(body), None);
    }

    #[tokio::test]
    async fn test_cooldown_sleeps_in_band() {
        tokio::time::pause();
        let fut = cooldown();
        tokio::pin!(fut);
        // Nothing before the lower bound...
        assert!(
            tokio::time::timeout(Duration::from_secs(299), fut.as_mut())
                .await
                .is_err()
        );
        // ...and always done by the upper bound.
        tokio::time::timeout(Duration::from_secs(302), fut)
            .await
            .expect("cooldown must finish within 300-600s");
    }
}
