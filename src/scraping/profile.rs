//! Profile sub-scraper: consolidates a seller's public reputation.
//!
//! For one seller id, an isolated page is opened and a collector task is
//! subscribed to the three profile endpoints **before** navigation: head
//! summary (first match wins), item list, and rating list. The two list
//! endpoints lazy-load on scroll; the collector watches each payload for
//! its "no more pages" marker, and the scroll loop treats a quiet period as
//! completion.
//!
//! Trade-off, kept deliberately: a scroll round that sees no signal within
//! its window assumes the list finished loading rather than still loading.
//! A slow server can therefore truncate a very large profile — acceptable
//! because reputation data is supplementary; forward progress wins.
//!
//! Every exit path — success, early bail, error — aborts the collector and
//! closes the page, so a failed sub-resource never leaks a page handle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::network::{EnableParams, EventResponseReceived};
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::json_path::pluck_bool;
use crate::core::types::SellerProfile;
use crate::core::Result;
use crate::path;
use crate::scraping::browser::scroll_to_bottom;
use crate::scraping::correlate::fetch_body;
use crate::scraping::pacing::random_pause;
use crate::scraping::parse;

pub const PROFILE_HEAD_PATTERN: &str = "mtop.idle.web.user.page.head";
pub const PROFILE_ITEMS_PATTERN: &str = "mtop.idle.web.xyh.item.list";
pub const PROFILE_RATINGS_PATTERN: &str = "mtop.idle.web.trade.rate.list";

/// How long one scroll round waits for the "no more pages" signal before
/// assuming the list is fully loaded.
const SCROLL_ROUND_WINDOW: Duration = Duration::from_secs(8);
/// Bound on the head-summary capture.
const HEAD_CAPTURE_WINDOW: Duration = Duration::from_secs(15);

/// Shared accumulation between the collector task and the scroll driver.
struct Collected {
    head: Mutex<Option<Value>>,
    items: Mutex<Vec<Value>>,
    ratings: Mutex<Vec<Value>>,
}

/// Collect a seller's full public profile.
///
/// Never fails outright: any sub-resource that cannot be captured degrades
/// the returned profile instead of aborting the caller's item.
pub async fn scrape_seller_profile(browser: &Browser, user_id: &str) -> SellerProfile {
    info!("Collecting profile for seller {}", user_id);

    let page = match browser.new_page("about:blank").await {
        Ok(p) => p,
        Err(e) => {
            warn!("profile page for seller {} failed to open: {}", user_id, e);
            return SellerProfile::default();
        }
    };

    let collected = Arc::new(Collected {
        head: Mutex::new(None),
        items: Mutex::new(Vec::new()),
        ratings: Mutex::new(Vec::new()),
    });
    let (head_tx, mut head_rx) = watch::channel(false);
    let (items_tx, items_rx) = watch::channel(false);
    let (ratings_tx, ratings_rx) = watch::channel(false);

    // Subscribe before navigation so the first responses are never missed.
    let collector = match spawn_collector(
        &page,
        Arc::clone(&collected),
        head_tx,
        items_tx,
        ratings_tx,
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => {
            warn!("profile listener registration failed for {}: {}", user_id, e);
            page.close().await.ok();
            return SellerProfile::default();
        }
    };

    let profile = drive_profile_page(
        &page,
        user_id,
        &collected,
        &mut head_rx,
        items_rx,
        ratings_rx,
    )
    .await
    .unwrap_or_else(|e| {
        warn!("profile collection for seller {} degraded: {}", user_id, e);
        SellerProfile::default()
    });

    collector.abort();
    page.close().await.ok();
    info!("Profile collection for seller {} complete", user_id);
    profile
}

async fn spawn_collector(
    page: &Page,
    collected: Arc<Collected>,
    head_tx: watch::Sender<bool>,
    items_tx: watch::Sender<bool>,
    ratings_tx: watch::Sender<bool>,
) -> Result<tokio::task::JoinHandle<()>> {
    page.execute(EnableParams::default()).await?;
    let mut events = page.event_listener::<EventResponseReceived>().await?;
    let body_page = page.clone();

    Ok(tokio::spawn(async move {
        while let Some(event) = events.next().await {
            let url = event.response.url.as_str();
            let target = if url.contains(PROFILE_HEAD_PATTERN) {
                Endpoint::Head
            } else if url.contains(PROFILE_ITEMS_PATTERN) {
                Endpoint::Items
            } else if url.contains(PROFILE_RATINGS_PATTERN) {
                Endpoint::Ratings
            } else {
                continue;
            };

            let payload = match fetch_body(&body_page, &event.request_id).await {
                Some(body) => serde_json::from_str::<Value>(&body).ok(),
                None => None,
            };

            match (target, payload) {
                (Endpoint::Head, Some(json)) => {
                    let mut head = collected.head.lock().expect("head lock");
                    if head.is_none() {
                        *head = Some(json);
                        let _ = head_tx.send(true);
                        debug!("profile head captured");
                    }
                    // Later matches are ignored — first wins.
                }
                (Endpoint::Items, Some(json)) => {
                    let cards = crate::core::json_path::pluck_array(&json, path!["data", "cardList"]);
                    let total = {
                        let mut items = collected.items.lock().expect("items lock");
                        items.extend(cards.iter().cloned());
                        items.len()
                    };
                    debug!("profile item list: {} cards so far", total);
                    if !pluck_bool(&json, path!["data", "nextPage"], true) {
                        let _ = items_tx.send(true);
                    }
                }
                (Endpoint::Ratings, Some(json)) => {
                    let cards = crate::core::json_path::pluck_array(&json, path!["data", "cardList"]);
                    let total = {
                        let mut ratings = collected.ratings.lock().expect("ratings lock");
                        ratings.extend(cards.iter().cloned());
                        ratings.len()
                    };
                    debug!("profile rating list: {} cards so far", total);
                    if !pluck_bool(&json, path!["data", "nextPage"], true) {
                        let _ = ratings_tx.send(true);
                    }
                }
                // An unreadable payload on a list endpoint means further
                // scrolling is pointless — mark that list finished.
                (Endpoint::Items, None) => {
                    let _ = items_tx.send(true);
                }
                (Endpoint::Ratings, None) => {
                    let _ = ratings_tx.send(true);
                }
                (Endpoint::Head, None) => {}
            }
        }
    }))
}

#[derive(Clone, Copy)]
enum Endpoint {
    Head,
    Items,
    Ratings,
}

async fn drive_profile_page(
    page: &Page,
    user_id: &str,
    collected: &Collected,
    head_rx: &mut watch::Receiver<bool>,
    mut items_rx: watch::Receiver<bool>,
    mut ratings_rx: watch::Receiver<bool>,
) -> Result<SellerProfile> {
    let profile_url = format!("https://www.goofish.com/personal?userId={}", user_id);
    tokio::time::timeout(Duration::from_secs(20), page.goto(profile_url.as_str()))
        .await
        .map_err(|_| crate::core::ScoutError::CorrelationTimeout {
            pattern: "profile navigation".into(),
            timeout_secs: 20,
        })??;

    // ── Head summary: single awaited capture, first match wins ──────────────
    let head_ready = *head_rx.borrow()
        || tokio::time::timeout(HEAD_CAPTURE_WINDOW, head_rx.changed())
            .await
            .is_ok();
    if !head_ready {
        return Err(crate::core::ScoutError::CorrelationTimeout {
            pattern: PROFILE_HEAD_PATTERN.into(),
            timeout_secs: HEAD_CAPTURE_WINDOW.as_secs(),
        });
    }
    let mut profile = {
        let head = collected.head.lock().expect("head lock");
        match head.as_ref() {
            Some(json) => parse::parse_profile_head(json),
            None => return Ok(SellerProfile::default()),
        }
    };

    // ── Item list: default tab, scroll until exhausted ──────────────────────
    info!("Collecting published items for seller {}", user_id);
    random_pause(2.0, 4.0).await; // let the first list page land
    scroll_until_exhausted(page, &mut items_rx, "item list").await;
    profile.seller_published_items = {
        let items = collected.items.lock().expect("items lock");
        parse::parse_published_items(&items)
    };

    // ── Rating list: behind a tab; absence skips rating collection ──────────
    if click_rating_tab(page).await.unwrap_or(false) {
        info!("Collecting ratings for seller {}", user_id);
        random_pause(3.0, 5.0).await;
        scroll_until_exhausted(page, &mut ratings_rx, "rating list").await;

        let ratings = collected.ratings.lock().expect("ratings lock");
        profile.seller_received_ratings = parse::parse_ratings(&ratings);
        profile.reputation = parse::reputation_from_ratings(&ratings);
    } else {
        warn!("rating tab not found for seller {}, skipping rating collection", user_id);
    }

    Ok(profile)
}

/// Scroll-to-bottom until the collector reports the list finished, or a
/// round passes with no signal (assumed fully loaded — see module docs).
async fn scroll_until_exhausted(page: &Page, done_rx: &mut watch::Receiver<bool>, label: &str) {
    loop {
        if *done_rx.borrow() {
            break;
        }
        if let Err(e) = scroll_to_bottom(page).await {
            warn!("{}: scroll failed: {}", label, e);
            break;
        }
        match tokio::time::timeout(SCROLL_ROUND_WINDOW, done_rx.changed()).await {
            Ok(Ok(())) => continue,
            Ok(Err(_)) => break, // collector gone
            Err(_) => {
                debug!("{}: no more-pages signal within {:?}, assuming fully loaded", label, SCROLL_ROUND_WINDOW);
                break;
            }
        }
    }
}

/// The rating list hides behind a tab; the clickable surface is the tab's
/// `li`, found from its label text.
async fn click_rating_tab(page: &Page) -> Result<bool> {
    let js = r#"(() => {
        const xpath = "//div[text()='信用及评价' or text()='Credit & Reviews']/ancestor::li";
        const node = document
            .evaluate(xpath, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null)
            .singleNodeValue;
        if (!node) return false;
        node.click();
        return true;
    })()"#;
    Ok(page
        .evaluate(js)
        .await?
        .into_value::<bool>()
        .unwrap_or(false))
}
