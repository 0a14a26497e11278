//! The core executor: one monitoring task end-to-end, plus the orchestrator
//! that runs all enabled tasks concurrently.
//!
//! Per task: rebuild the dedup set from history → launch a browser with the
//! persisted session → drive the search UI (paginator) → for each new item:
//! correlate the detail response, enrich the seller profile, assemble the
//! record, run the AI decision, notify on a recommendation, persist. The
//! circuit breaker is consulted at the page level (challenge overlay) and at
//! every detail payload (validation code); either one ends this task and
//! only this task.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chromiumoxide::Browser;
use serde_json::json;
use tracing::{error, info, warn};

use crate::core::config::ScoutConfig;
use crate::core::retry::{retry, RetryPolicy};
use crate::core::types::{
    ItemDetail, ListingItem, TaskConfig, TaskEnd, TaskReport, UnifiedRecord,
};
use crate::core::{BlockSignal, Result, ScoutError};
use crate::features::history::HistoryStore;
use crate::features::notify::Notifier;
use crate::nlp::prefilter::Prefilter;
use crate::scraping::correlate::{await_response, Correlation};
use crate::scraping::pacing::RequestDelay;
use crate::scraping::parse::{self, dedup_key};
use crate::scraping::profile::scrape_seller_profile;
use crate::scraping::search::{PageAdvance, SearchSession};
use crate::scraping::{browser, defense};
use crate::tools::analyze::AnalysisClient;
use crate::tools::images::ImageCache;

/// URL substring of the item detail API.
pub const DETAIL_API_PATTERN: &str = "h5api.m.goofish.com/h5/mtop.taobao.idle.pc.detail";

// ─────────────────────────────────────────────────────────────────────────────
// Shared services
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a task borrows from the process: clients, sinks, directories,
/// the session cookie jar. Built once in `main`, passed explicitly — no
/// hidden globals.
pub struct TaskContext {
    pub analysis: AnalysisClient,
    pub notifier: Notifier,
    pub prefilter: Prefilter,
    pub image_cache: ImageCache,
    pub results_dir: PathBuf,
    pub session_cookies: Vec<serde_json::Value>,
    pub headless: bool,
    /// Debug: cap on newly discovered items per task (0 = unlimited).
    pub debug_limit: usize,
}

impl TaskContext {
    pub fn new(
        http: reqwest::Client,
        cfg: &ScoutConfig,
        prefilter: Prefilter,
        session_cookies: Vec<serde_json::Value>,
        debug_limit: usize,
    ) -> Self {
        Self {
            analysis: AnalysisClient::from_config(http.clone(), &cfg.analysis),
            notifier: Notifier::from_config(http.clone(), &cfg.notify),
            prefilter,
            image_cache: ImageCache::new(http, cfg.resolve_image_dir()),
            results_dir: cfg.resolve_results_dir(),
            session_cookies,
            headless: cfg.browser.resolve_headless(),
            debug_limit,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestrator
// ─────────────────────────────────────────────────────────────────────────────

/// Run every enabled task concurrently, each with its own browser and
/// history store. One task's failure never cancels its siblings; the
/// returned list enumerates every outcome.
pub async fn run_all_tasks(
    ctx: Arc<TaskContext>,
    tasks: Vec<TaskConfig>,
) -> Vec<(String, anyhow::Result<TaskReport>)> {
    let mut handles = Vec::with_capacity(tasks.len());
    for task in tasks {
        let name = task.task_name.clone();
        let ctx = Arc::clone(&ctx);
        info!("Task '{}' queued", name);
        handles.push((name, tokio::spawn(run_task(ctx, task))));
    }

    let mut outcomes = Vec::with_capacity(handles.len());
    for (name, handle) in handles {
        let outcome = match handle.await {
            Ok(result) => result,
            Err(join_err) => Err(anyhow::anyhow!("task panicked: {}", join_err)),
        };
        outcomes.push((name, outcome));
    }
    outcomes
}

/// Execute one monitoring task. Owns a browser for its whole lifetime;
/// the browser is closed on every exit path.
pub async fn run_task(ctx: Arc<TaskContext>, task: TaskConfig) -> anyhow::Result<TaskReport> {
    let mut history = HistoryStore::open(&ctx.results_dir, &task.keyword)
        .await
        .context("loading history")?;

    let (mut browser_handle, event_drain) = browser::launch(ctx.headless).await?;

    let report = run_task_inner(&ctx, &task, &mut history, &browser_handle).await;

    info!("Task '{}' finished, closing browser", task.task_name);
    browser_handle.close().await.ok();
    event_drain.abort();

    report
}

async fn run_task_inner(
    ctx: &TaskContext,
    task: &TaskConfig,
    history: &mut HistoryStore,
    browser_handle: &Browser,
) -> anyhow::Result<TaskReport> {
    let page = browser_handle
        .new_page("about:blank")
        .await
        .context("opening search tab")?;
    browser::inject_session(&page, &ctx.session_cookies).await;

    let mut session = SearchSession::open(&page, &task.keyword).await?;

    // The overlay comes up right after the results render, when it comes.
    if defense::probe_challenge_overlay(&page).await.is_some() {
        error!(
            "Task '{}' aborted: challenge overlay on the search page. \
             Pausing this keyword and retrying later (headed mode can help).",
            task.task_name
        );
        return Ok(TaskReport {
            task_name: task.task_name.clone(),
            processed: 0,
            end: TaskEnd::Blocked,
        });
    }

    session.apply_filters(task).await?;

    let mut processed = 0usize;
    let mut end = TaskEnd::Completed;

    'pages: for page_num in 1..=task.max_pages {
        info!("--- '{}' page {}/{} ---", task.task_name, page_num, task.max_pages);

        if page_num > 1 {
            match session.advance().await? {
                PageAdvance::Advanced => {}
                PageAdvance::NoMorePages => break,
                PageAdvance::TimedOut => {
                    warn!("page {} never loaded, stopping pagination", page_num);
                    break;
                }
            }
        }

        let Some(resp) = session.current() else {
            warn!("no usable response for page {}, skipping", page_num);
            continue;
        };
        if !resp.ok() {
            warn!("page {} response status {}, skipping", page_num, resp.status);
            continue;
        }
        let payload = match resp.json() {
            Ok(p) => p,
            Err(e) => {
                warn!("page {} payload unparseable, skipping: {}", page_num, e);
                continue;
            }
        };

        let listings = parse::parse_search_payload(&payload, &format!("page {}", page_num));
        if listings.is_empty() {
            info!("page {} parsed empty, end of results", page_num);
            break;
        }

        let page_total = listings.len();
        for (i, listing) in listings.into_iter().enumerate() {
            if ctx.debug_limit > 0 && processed >= ctx.debug_limit {
                info!("debug limit ({}) reached, stopping discovery", ctx.debug_limit);
                end = TaskEnd::DebugLimit;
                break 'pages;
            }

            let key = dedup_key(&listing.item_link).to_string();
            if history.contains(&key) {
                info!(
                    "[{}/{}] '{}' already processed, skipping",
                    i + 1,
                    page_total,
                    short_title(&listing.item_title)
                );
                continue;
            }

            if !ctx
                .prefilter
                .passes(&listing.item_title, &task.reference_titles)
                .await
            {
                info!(
                    "[{}/{}] '{}' dropped by pre-filter",
                    i + 1,
                    page_total,
                    short_title(&listing.item_title)
                );
                continue;
            }

            info!(
                "[{}/{}] new item, fetching detail: {}",
                i + 1,
                page_total,
                short_title(&listing.item_title)
            );
            RequestDelay::between_items().pause().await;

            match process_new_item(ctx, task, history, browser_handle, listing).await {
                ItemOutcome::Processed => {
                    processed += 1;
                    info!("item done, {} new item(s) this run", processed);
                    // The long post-item delay simulates a user reading the page.
                    RequestDelay::after_item().pause().await;
                }
                ItemOutcome::Abandoned => {}
                ItemOutcome::Blocked(signal) => {
                    if signal == BlockSignal::AccountValidate {
                        defense::cooldown().await;
                    }
                    end = TaskEnd::Blocked;
                    break 'pages;
                }
            }
        }

        if page_num < task.max_pages {
            info!("page {} complete, long delay before next page", page_num);
            RequestDelay::between_pages().pause().await;
        }
    }

    Ok(TaskReport {
        task_name: task.task_name.clone(),
        processed,
        end,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-item processing
// ─────────────────────────────────────────────────────────────────────────────

enum ItemOutcome {
    /// Record assembled, analyzed and persisted.
    Processed,
    /// This item failed somewhere non-terminal; the run continues.
    Abandoned,
    /// A block signature surfaced — the task must end.
    Blocked(BlockSignal),
}

/// Fetch the detail payload on a fresh tab, enrich with the seller profile,
/// then hand over to [`finish_item`]. The detail tab is closed on every
/// exit path.
async fn process_new_item(
    ctx: &TaskContext,
    task: &TaskConfig,
    history: &mut HistoryStore,
    browser_handle: &Browser,
    listing: ListingItem,
) -> ItemOutcome {
    let detail_page = match browser_handle.new_page("about:blank").await {
        Ok(p) => p,
        Err(e) => {
            warn!("detail tab failed to open for {}: {}", listing.item_id, e);
            return ItemOutcome::Abandoned;
        }
    };

    let outcome = fetch_and_finish(ctx, task, history, browser_handle, &detail_page, listing).await;

    detail_page.close().await.ok();
    RequestDelay::after_detail_close().pause().await;
    outcome
}

async fn fetch_and_finish(
    ctx: &TaskContext,
    task: &TaskConfig,
    history: &mut HistoryStore,
    browser_handle: &Browser,
    detail_page: &chromiumoxide::Page,
    listing: ListingItem,
) -> ItemOutcome {
    let item_id = listing.item_id.clone();
    let item_link = listing.item_link.clone();

    let correlation = await_response(
        detail_page,
        DETAIL_API_PATTERN,
        Duration::from_secs(25),
        || async {
            tokio::time::timeout(Duration::from_secs(25), detail_page.goto(item_link.as_str()))
                .await
                .map_err(|_| ScoutError::CorrelationTimeout {
                    pattern: "detail navigation".into(),
                    timeout_secs: 25,
                })??;
            Ok(())
        },
    )
    .await;

    let resp = match correlation {
        Ok(Correlation::Captured(resp)) => resp,
        Ok(Correlation::TimedOut) => {
            warn!("item {}: detail response never arrived", item_id);
            return ItemOutcome::Abandoned;
        }
        Err(e) => {
            warn!("item {}: detail navigation failed: {}", item_id, e);
            return ItemOutcome::Abandoned;
        }
    };

    if !resp.ok() {
        warn!("item {}: detail API status {}", item_id, resp.status);
        return ItemOutcome::Abandoned;
    }

    // Account-level block code rides inside an otherwise well-formed payload.
    if let Some(signal) = defense::scan_payload(&resp.body) {
        return ItemOutcome::Blocked(signal);
    }

    let detail_json = match resp.json() {
        Ok(v) => v,
        Err(e) => {
            warn!("item {}: detail payload unparseable: {}", item_id, e);
            return ItemOutcome::Abandoned;
        }
    };
    let enrichment = parse::parse_detail_payload(&detail_json);

    let mut item = ItemDetail {
        item_main_image_link: enrichment.image_urls.first().cloned().unwrap_or_default(),
        item_image_list: enrichment.image_urls.clone(),
        views_count: enrichment.views_count.clone().unwrap_or_else(|| "-".into()),
        seller_id: enrichment.seller_id.clone().unwrap_or_default(),
        listing,
    };
    if let Some(wants) = &enrichment.wants_count {
        item.listing.wants_count = wants.clone();
    }

    // Seller enrichment is supplementary: a failed profile degrades the
    // record, it never drops the item.
    let mut seller = if item.seller_id.is_empty() {
        warn!("item {}: no seller id in detail payload", item_id);
        Default::default()
    } else {
        scrape_seller_profile(browser_handle, &item.seller_id).await
    };
    seller.seller_zhima_credit = enrichment.zhima_credit.clone();
    seller.seller_registration_duration =
        parse::format_registration_days(enrichment.registration_days);

    let pipeline = ItemPipeline {
        task,
        analysis: &ctx.analysis,
        notifier: &ctx.notifier,
        image_cache: &ctx.image_cache,
        analysis_policy: RetryPolicy::analysis(),
    };
    match pipeline.finish_item(history, item, seller).await {
        Ok(_) => ItemOutcome::Processed,
        Err(e) => {
            warn!("item {}: pipeline failed: {}", item_id, e);
            ItemOutcome::Abandoned
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Assemble → analyze → notify → persist
// ─────────────────────────────────────────────────────────────────────────────

/// The browser-free tail of the pipeline, split out so it can be driven
/// directly with parsed payloads.
pub struct ItemPipeline<'a> {
    pub task: &'a TaskConfig,
    pub analysis: &'a AnalysisClient,
    pub notifier: &'a Notifier,
    pub image_cache: &'a ImageCache,
    pub analysis_policy: RetryPolicy,
}

impl ItemPipeline<'_> {
    /// Assemble the unified record, run the AI decision, fire notifications
    /// for a recommendation, and persist. Every item is persisted —
    /// recommended or not, analysis-failed or not.
    pub async fn finish_item(
        &self,
        history: &mut HistoryStore,
        item: ItemDetail,
        seller: crate::core::types::SellerProfile,
    ) -> Result<UnifiedRecord> {
        let item_id = item.listing.item_id.clone();
        let mut record = UnifiedRecord {
            crawl_time: chrono::Local::now().to_rfc3339(),
            search_keyword: self.task.keyword.clone(),
            task_name: self.task.task_name.clone(),
            item_info: item,
            seller_info: seller,
            ai_analysis: None,
        };

        let image_paths = self
            .image_cache
            .download_all(&item_id, &record.item_info.item_image_list)
            .await;

        if self.task.ai_prompt_text.is_empty() {
            info!("item {}: no AI prompt configured, skipping analysis", item_id);
        } else {
            let label = format!("ai-analysis:{}", item_id);
            let verdict = retry(self.analysis_policy, &label, || {
                self.analysis
                    .analyze(&record, &image_paths, &self.task.ai_prompt_text)
            })
            .await;

            record.ai_analysis = Some(match verdict {
                Ok(v) => {
                    info!(
                        "item {}: analysis complete, recommended = {}",
                        item_id,
                        v.get("is_recommended").and_then(|b| b.as_bool()).unwrap_or(false)
                    );
                    v
                }
                Err(e) => {
                    error!("item {}: analysis failed definitively: {}", item_id, e);
                    json!({"error": e.to_string()})
                }
            });
        }

        if record.is_recommended() {
            let reason = record
                .recommend_reason()
                .unwrap_or("No reason provided")
                .to_string();
            info!("item {}: recommended, sending notifications", item_id);
            self.notifier.dispatch(&record.item_info, &reason).await;
        }

        history.append(&record).await?;
        Ok(record)
    }
}

fn short_title(title: &str) -> String {
    title.chars().take(30).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{AnalysisConfig, NotifyConfig};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn task_with_prompt(keyword: &str) -> TaskConfig {
        TaskConfig {
            task_name: "watch".into(),
            keyword: keyword.into(),
            enabled: true,
            max_pages: 1,
            personal_only: false,
            min_price: None,
            max_price: None,
            ai_prompt_text: "judge this listing".into(),
            reference_titles: vec![],
        }
    }

    fn listing(id: &str) -> ListingItem {
        ListingItem {
            item_title: format!("item {}", id),
            current_price: "¥100".into(),
            item_link: format!("https://www.goofish.com/item?id={}&spm=track", id),
            item_id: id.into(),
            ..Default::default()
        }
    }

    fn analysis_client(base: String) -> AnalysisClient {
        AnalysisClient::from_config(
            reqwest::Client::new(),
            &AnalysisConfig {
                llm_base_url: Some(base),
                llm_api_key: Some(String::new()),
                llm_model: Some("test".into()),
            },
        )
    }

    /// End-to-end over the parsed-payload seam: two listings, one already in
    /// history; AI verdict is a non-recommendation. Expect exactly one new
    /// history line, zero notifications, processed count 1.
    #[tokio::test]
    async fn test_pipeline_scenario_one_new_item_no_notification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"is_recommended\": false, \"reason\": \"test\"}"}}]
            })))
            .expect(1) // only the new item is analyzed
            .mount(&server)
            .await;
        // Notification sink that must never be hit.
        Mock::given(method("POST"))
            .and(path("/ntfy"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let results_dir = dir.path().join("jsonl");
        let task = task_with_prompt("ssd");
        let notifier = Notifier::from_config(
            reqwest::Client::new(),
            &NotifyConfig {
                ntfy_topic_url: Some(format!("{}/ntfy", server.uri())),
                webhook_bot_url: None,
                mobile_links: Some(false),
            },
        );
        let image_cache = ImageCache::new(reqwest::Client::new(), dir.path().join("images"));
        let analysis = analysis_client(server.uri());
        let pipeline = ItemPipeline {
            task: &task,
            analysis: &analysis,
            notifier: &notifier,
            image_cache: &image_cache,
            analysis_policy: RetryPolicy::new(1, std::time::Duration::ZERO),
        };

        // Seed history with the first listing, as a previous run would have.
        let mut history = HistoryStore::open(&results_dir, &task.keyword).await.unwrap();
        let seen = listing("1");
        history
            .append(&UnifiedRecord {
                crawl_time: "2025-11-01T09:00:00".into(),
                search_keyword: task.keyword.clone(),
                task_name: task.task_name.clone(),
                item_info: ItemDetail {
                    listing: seen.clone(),
                    ..Default::default()
                },
                seller_info: Default::default(),
                ai_analysis: None,
            })
            .await
            .unwrap();
        let lines_before = std::fs::read_to_string(
            results_dir.join(HistoryStore::filename_for(&task.keyword)),
        )
        .unwrap()
        .lines()
        .count();

        // The run: page of two items, one already known.
        let mut processed = 0usize;
        for item in [seen, listing("2")] {
            let key = dedup_key(&item.item_link).to_string();
            if history.contains(&key) {
                continue;
            }
            pipeline
                .finish_item(
                    &mut history,
                    ItemDetail {
                        listing: item,
                        ..Default::default()
                    },
                    Default::default(),
                )
                .await
                .unwrap();
            processed += 1;
        }

        assert_eq!(processed, 1);
        let contents = std::fs::read_to_string(
            results_dir.join(HistoryStore::filename_for(&task.keyword)),
        )
        .unwrap();
        assert_eq!(contents.lines().count(), lines_before + 1);
        // The persisted verdict survives round-trip.
        let last: serde_json::Value =
            serde_json::from_str(contents.lines().last().unwrap()).unwrap();
        assert_eq!(last["ai_analysis"]["is_recommended"], false);
        assert_eq!(last["ai_analysis"]["reason"], "test");
    }

    /// A recommendation fires the notification fan-out.
    #[tokio::test]
    async fn test_pipeline_recommended_item_notifies() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "{\"is_recommended\": true, \"reason\": \"steal\"}"}}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/ntfy"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let task = task_with_prompt("drone");
        let notifier = Notifier::from_config(
            reqwest::Client::new(),
            &NotifyConfig {
                ntfy_topic_url: Some(format!("{}/ntfy", server.uri())),
                webhook_bot_url: None,
                mobile_links: Some(false),
            },
        );
        let image_cache = ImageCache::new(reqwest::Client::new(), dir.path().join("images"));
        let analysis = analysis_client(server.uri());
        let pipeline = ItemPipeline {
            task: &task,
            analysis: &analysis,
            notifier: &notifier,
            image_cache: &image_cache,
            analysis_policy: RetryPolicy::new(1, std::time::Duration::ZERO),
        };

        let mut history = HistoryStore::open(dir.path(), &task.keyword).await.unwrap();
        let record = pipeline
            .finish_item(
                &mut history,
                ItemDetail {
                    listing: listing("9"),
                    ..Default::default()
                },
                Default::default(),
            )
            .await
            .unwrap();
        assert!(record.is_recommended());
        assert!(history.contains("https://www.goofish.com/item?id=9"));
    }

    /// Analysis failing after retries records an error marker; the item is
    /// still persisted and never notified.
    #[tokio::test]
    async fn test_pipeline_analysis_failure_persists_error_marker() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "no json from me"}}]
            })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let task = task_with_prompt("gpu");
        let notifier =
            Notifier::from_config(reqwest::Client::new(), &NotifyConfig::default());
        let image_cache = ImageCache::new(reqwest::Client::new(), dir.path().join("images"));
        // Single-attempt policy keeps the test fast; the production budget
        // is exercised in core::retry tests.
        let analysis = analysis_client(server.uri());
        let pipeline = ItemPipeline {
            task: &task,
            analysis: &analysis,
            notifier: &notifier,
            image_cache: &image_cache,
            analysis_policy: RetryPolicy::new(1, std::time::Duration::ZERO),
        };

        let mut history = HistoryStore::open(dir.path(), &task.keyword).await.unwrap();
        let record = pipeline
            .finish_item(
                &mut history,
                ItemDetail {
                    listing: listing("5"),
                    ..Default::default()
                },
                Default::default(),
            )
            .await
            .unwrap();

        let marker = record.ai_analysis.as_ref().expect("error marker present");
        assert!(marker.get("error").is_some());
        assert!(!record.is_recommended());
        assert_eq!(history.len(), 1);
    }
}
