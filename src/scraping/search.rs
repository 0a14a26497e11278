//! Listing paginator: drives the keyword search UI and captures the search
//! API response each interaction fires.
//!
//! Sequence per task: navigate (capturing the initial response) → apply the
//! filter chain (each application its own correlation) → advance pages via
//! the next-page arrow. A missing/disabled arrow or an empty parse ends
//! pagination early — normal end-of-results, not an error. A filter
//! correlation timeout abandons that filter and keeps the previous
//! response.

use std::time::Duration;

use chromiumoxide::Page;
use tracing::{info, warn};
use url::Url;

use crate::core::types::TaskConfig;
use crate::core::Result;
use crate::scraping::browser;
use crate::scraping::correlate::{await_response, CapturedResponse, Correlation};
use crate::scraping::pacing::random_pause;

/// URL substring of the search API.
pub const SEARCH_API_PATTERN: &str = "h5api.m.goofish.com/h5/mtop.taobao.idlemtopsearch.pc.search";

/// Sort / filter controls, located by their visible text.
const FILTER_BAR_PROBE: &str = "新发布";
const SORT_NEWEST: &str = "最新";
const PERSONAL_ONLY: &str = "个人闲置";
const PRICE_CONTAINER: &str = "div[class*=\"search-price-input-container\"]";
const AD_CLOSE: &str = "div[class*='closeIconBg']";
const NEXT_PAGE_ARROW: &str = "[class*='search-pagination-arrow-right']:not([disabled])";

/// Outcome of a page advance.
#[derive(Debug)]
pub enum PageAdvance {
    Advanced,
    /// No enabled next-page control — end of results.
    NoMorePages,
    /// The click fired but no search response arrived in time.
    TimedOut,
}

/// One task's search tab: the page plus the most recent search response.
pub struct SearchSession<'p> {
    page: &'p Page,
    keyword: String,
    current: Option<CapturedResponse>,
}

impl<'p> SearchSession<'p> {
    /// Navigate to the keyword search URL, capturing the search API response
    /// the navigation fires, and wait for the filter bar to render.
    pub async fn open(page: &'p Page, keyword: &str) -> Result<SearchSession<'p>> {
        let mut search_url = Url::parse("https://www.goofish.com/search").expect("static url");
        search_url.query_pairs_mut().append_pair("q", keyword);
        info!("Step 1 — navigating to search: {}", search_url);

        let correlation = await_response(
            page,
            SEARCH_API_PATTERN,
            Duration::from_secs(30),
            || async {
                page.goto(search_url.as_str()).await?;
                Ok(())
            },
        )
        .await?;

        let current = match correlation {
            Correlation::Captured(resp) => Some(resp),
            Correlation::TimedOut => {
                warn!("initial search response never arrived for '{}'", keyword);
                None
            }
        };

        if !browser::wait_for_text(page, FILTER_BAR_PROBE, Duration::from_secs(15)).await {
            warn!("filter bar did not render; page layout may have changed");
        }

        // Promo popup shows up for some accounts; dismiss best-effort.
        match browser::click_selector(page, AD_CLOSE).await {
            Ok(true) => info!("closed ad popup"),
            _ => {}
        }

        Ok(SearchSession {
            page,
            keyword: keyword.to_string(),
            current,
        })
    }

    /// The most recent usable search response.
    pub fn current(&self) -> Option<&CapturedResponse> {
        self.current.as_ref()
    }

    /// Apply the task's filter chain: sort-by-recency always, then the
    /// optional personal-seller and price filters. Each application that
    /// captures a response replaces `current`; a timeout keeps the previous
    /// one and moves on.
    pub async fn apply_filters(&mut self, task: &TaskConfig) -> Result<()> {
        info!("Step 2 — applying filters");

        // Open the sort dropdown, then pick "newest first".
        browser::click_text(self.page, FILTER_BAR_PROBE).await?;
        random_pause(2.0, 4.0).await;
        self.correlated_click_text(SORT_NEWEST, 4.0, 7.0).await?;

        if task.personal_only {
            self.correlated_click_text(PERSONAL_ONLY, 4.0, 6.0).await?;
        }

        if task.min_price.is_some() || task.max_price.is_some() {
            self.apply_price_filter(task).await?;
        }

        info!("All filters applied for '{}'", self.keyword);
        Ok(())
    }

    async fn apply_price_filter(&mut self, task: &TaskConfig) -> Result<()> {
        let mut touched = false;
        if let Some(min) = &task.min_price {
            if browser::fill_nth_input(self.page, PRICE_CONTAINER, 0, min).await? {
                touched = true;
                random_pause(1.0, 2.5).await;
            }
        }
        if let Some(max) = &task.max_price {
            if browser::fill_nth_input(self.page, PRICE_CONTAINER, 1, max).await? {
                touched = true;
                random_pause(1.0, 2.5).await;
            }
        }

        if !touched {
            warn!("price input container not found, skipping price filter");
            return Ok(());
        }

        // Commit by blurring the inputs — the page refreshes results on blur.
        let page = self.page;
        let correlation = await_response(
            page,
            SEARCH_API_PATTERN,
            Duration::from_secs(20),
            || async {
                page.evaluate(
                    "document.querySelectorAll('div[class*=\"search-price-input-container\"] input')\
                     .forEach(i => i.blur())",
                )
                .await?;
                random_pause(4.0, 7.0).await;
                Ok(())
            },
        )
        .await?;
        self.absorb(correlation, "price filter");
        Ok(())
    }

    /// Advance to the next result page. Call only from page 2 onward.
    pub async fn advance(&mut self) -> Result<PageAdvance> {
        let has_next = self
            .page
            .evaluate(format!(
                "document.querySelector({}) !== null",
                serde_json::Value::String(NEXT_PAGE_ARROW.to_string())
            ))
            .await?
            .into_value::<bool>()
            .unwrap_or(false);

        if !has_next {
            info!("no enabled next-page control, stopping pagination");
            return Ok(PageAdvance::NoMorePages);
        }

        let page = self.page;
        let correlation = await_response(
            page,
            SEARCH_API_PATTERN,
            Duration::from_secs(20),
            || async {
                browser::click_selector(page, NEXT_PAGE_ARROW).await?;
                random_pause(5.0, 8.0).await;
                Ok(())
            },
        )
        .await?;

        match correlation {
            Correlation::Captured(resp) => {
                self.current = Some(resp);
                Ok(PageAdvance::Advanced)
            }
            Correlation::TimedOut => Ok(PageAdvance::TimedOut),
        }
    }

    /// Click a text control under correlation; the trailing pause keeps the
    /// interaction cadence human.
    async fn correlated_click_text(&mut self, text: &str, min_s: f64, max_s: f64) -> Result<()> {
        let page = self.page;
        let correlation = await_response(
            page,
            SEARCH_API_PATTERN,
            Duration::from_secs(20),
            || async {
                if !browser::click_text(page, text).await? {
                    warn!("filter control '{}' not found", text);
                }
                random_pause(min_s, max_s).await;
                Ok(())
            },
        )
        .await?;
        self.absorb(correlation, text);
        Ok(())
    }

    fn absorb(&mut self, correlation: Correlation, step: &str) {
        match correlation {
            Correlation::Captured(resp) => self.current = Some(resp),
            Correlation::TimedOut => {
                warn!("'{}' produced no search response, keeping previous page data", step)
            }
        }
    }
}
