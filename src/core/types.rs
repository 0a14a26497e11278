use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Task configuration
// ─────────────────────────────────────────────────────────────────────────────

/// One monitoring task as loaded from the tasks file.
///
/// Immutable for the duration of a run. The prompt text arrives fully
/// assembled — template expansion happens in the external prompt tooling,
/// never here.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TaskConfig {
    pub task_name: String,
    pub keyword: String,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_max_pages")]
    pub max_pages: u32,
    #[serde(default)]
    pub personal_only: bool,
    #[serde(default)]
    pub min_price: Option<String>,
    #[serde(default)]
    pub max_price: Option<String>,
    /// Fully assembled analysis instruction. Empty string = skip AI analysis.
    #[serde(default)]
    pub ai_prompt_text: String,
    /// Optional reference titles for the semantic pre-filter.
    #[serde(default)]
    pub reference_titles: Vec<String>,
}

fn default_max_pages() -> u32 {
    1
}

// ─────────────────────────────────────────────────────────────────────────────
// Listing data
// ─────────────────────────────────────────────────────────────────────────────

/// Basic search-result projection of one listing, parsed from a single
/// search-API page. Ordering follows the site's result order.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ListingItem {
    pub item_title: String,
    pub current_price: String,
    #[serde(default)]
    pub original_price: String,
    #[serde(default)]
    pub wants_count: String,
    #[serde(default)]
    pub item_tags: Vec<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub seller_nickname: String,
    /// Canonical https link; the dedup key is everything before the first `&`.
    pub item_link: String,
    #[serde(default)]
    pub publish_time: String,
    pub item_id: String,
}

/// Listing enriched from the detail endpoint. Created once per new item and
/// never re-fetched after it has been persisted.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ItemDetail {
    #[serde(flatten)]
    pub listing: ListingItem,
    #[serde(default)]
    pub item_image_list: Vec<String>,
    #[serde(default)]
    pub item_main_image_link: String,
    #[serde(default)]
    pub views_count: String,
    #[serde(default)]
    pub seller_id: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Seller profile
// ─────────────────────────────────────────────────────────────────────────────

/// Sale status of an item on a seller's shelf.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    ForSale,
    Sold,
    Unknown(i64),
}

impl Default for ItemStatus {
    fn default() -> Self {
        ItemStatus::Unknown(-1)
    }
}

/// One entry from the seller's published-items list.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PublishedItem {
    pub item_id: String,
    pub item_title: String,
    #[serde(default)]
    pub item_price: String,
    #[serde(default)]
    pub item_main_image: String,
    pub item_status: ItemStatus,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RatingKind {
    Positive,
    Neutral,
    Negative,
    Unknown,
}

impl Default for RatingKind {
    fn default() -> Self {
        RatingKind::Unknown
    }
}

/// One rating card from the seller's rating list.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Rating {
    pub rating_id: String,
    #[serde(default)]
    pub rating_content: String,
    pub rating_type: RatingKind,
    /// Raw role tag from the card, e.g. "卖家" / "Seller".
    #[serde(default)]
    pub rater_role: String,
    #[serde(default)]
    pub rater_nickname: String,
    #[serde(default)]
    pub rating_time: String,
    #[serde(default)]
    pub rating_images: Vec<String>,
}

/// Positive-rating tallies split by the role the profile owner played.
///
/// Rates are pre-formatted ("97.50%" / "N/A") so the persisted record matches
/// what the analysis prompt and notifications consume directly.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct ReputationStats {
    pub positive_reviews_as_seller: String,
    pub positive_rate_as_seller: String,
    pub positive_reviews_as_buyer: String,
    pub positive_rate_as_buyer: String,
}

/// Consolidated seller profile: head summary, full shelf, full rating list,
/// and derived reputation aggregates.
///
/// Every field is optional in spirit — a failed sub-resource fetch degrades
/// the profile instead of aborting the item (missing pieces keep defaults).
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct SellerProfile {
    #[serde(default)]
    pub seller_nickname: String,
    #[serde(default)]
    pub seller_avatar_link: String,
    #[serde(default)]
    pub seller_bio: String,
    #[serde(default)]
    pub seller_items_count: String,
    #[serde(default)]
    pub seller_ratings_count: String,
    #[serde(default)]
    pub seller_credit_level: String,
    #[serde(default)]
    pub buyer_credit_level: String,
    #[serde(default)]
    pub seller_zhima_credit: String,
    #[serde(default)]
    pub seller_registration_duration: String,
    #[serde(default)]
    pub seller_published_items: Vec<PublishedItem>,
    #[serde(default)]
    pub seller_received_ratings: Vec<Rating>,
    #[serde(flatten)]
    pub reputation: ReputationStats,
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence unit
// ─────────────────────────────────────────────────────────────────────────────

/// The unit of persistence: one line per record in the per-keyword JSONL file.
///
/// `ai_analysis` holds either the verdict object returned by the analysis
/// service (guaranteed to carry `is_recommended` + `reason` when it counts as
/// a verdict) or an `{"error": ...}` marker when analysis failed after
/// retries. Previously persisted lines are never mutated.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UnifiedRecord {
    pub crawl_time: String,
    pub search_keyword: String,
    pub task_name: String,
    pub item_info: ItemDetail,
    pub seller_info: SellerProfile,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_analysis: Option<serde_json::Value>,
}

impl UnifiedRecord {
    /// Whether the stored analysis is a verdict recommending this item.
    pub fn is_recommended(&self) -> bool {
        self.ai_analysis
            .as_ref()
            .and_then(|v| v.get("is_recommended"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Verdict reason text, when present.
    pub fn recommend_reason(&self) -> Option<&str> {
        self.ai_analysis
            .as_ref()
            .and_then(|v| v.get("reason"))
            .and_then(|v| v.as_str())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Orchestration results
// ─────────────────────────────────────────────────────────────────────────────

/// Why a task ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEnd {
    /// Ran to the configured page limit or end-of-results.
    Completed,
    /// The configured debug item-limit stopped discovery early.
    DebugLimit,
    /// A block signature terminated the task (siblings unaffected).
    Blocked,
}

/// Per-task outcome reported by the orchestrator's final summary.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_name: String,
    pub processed: usize,
    pub end: TaskEnd,
}
