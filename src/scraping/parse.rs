//! Pure parsers for the marketplace API payloads.
//!
//! Everything here is side-effect free: JSON in, typed model out. Payloads
//! are navigated through `json_path::pluck*` so a missing or re-shaped field
//! degrades to a default instead of failing the item. Field paths follow the
//! site's `mtop` payload layout.

use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde_json::Value;
use tracing::{debug, warn};

use crate::core::json_path::{pluck, pluck_array, pluck_i64, pluck_str, pluck_string};
use crate::core::types::{
    ItemStatus, ListingItem, PublishedItem, Rating, RatingKind, ReputationStats, SellerProfile,
};
use crate::path;

// ─────────────────────────────────────────────────────────────────────────────
// Link identity
// ─────────────────────────────────────────────────────────────────────────────

/// The dedup key: everything before the first `&`. Tracking parameters after
/// that separator vary per impression; the prefix is stable per listing.
pub fn dedup_key(link: &str) -> &str {
    link.split('&').next().unwrap_or(link)
}

/// Rewrite the app-scheme target URL from the search payload to a regular
/// web link.
pub fn canonical_item_link(raw: &str) -> String {
    raw.replace("fleamarket://", "https://www.goofish.com/")
}

/// Convert a PC item link to the mobile share format carrying only the item
/// id. Returns the original link when no id can be extracted.
pub fn to_mobile_link(url: &str) -> String {
    static ID_RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ID_RE.get_or_init(|| regex::Regex::new(r"item\?id=(\d+)").expect("valid regex"));

    match re.captures(url).and_then(|c| c.get(1)) {
        Some(id) => {
            let bfp_json = format!("{{\"id\":{}}}", id.as_str());
            let encoded = utf8_percent_encode(&bfp_json, NON_ALPHANUMERIC);
            format!(
                "https://pages.goofish.com/sharexy?loadingVisible=false&bft=item&bfs=idlepc.item&spm=a21ybx.item.0.0&bfp={}",
                encoded
            )
        }
        None => url.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Search results
// ─────────────────────────────────────────────────────────────────────────────

/// Parse one page of the search API into basic listing projections, in the
/// site's result order. An empty vec means end-of-results (or a re-shaped
/// payload — both end the listing phase, neither is an error).
pub fn parse_search_payload(payload: &Value, source: &str) -> Vec<ListingItem> {
    let items = pluck_array(payload, path!["data", "resultList"]);
    if items.is_empty() {
        debug!("({}) no resultList in search payload", source);
        return Vec::new();
    }

    let mut page_items = Vec::with_capacity(items.len());
    for item in items {
        let main = match pluck(item, path!["data", "item", "main", "exContent"]) {
            Some(v) => v,
            None => continue,
        };
        let click_args = pluck(item, path!["data", "item", "main", "clickParam", "args"]);

        let raw_link = pluck_str(item, path!["data", "item", "main", "targetUrl"], "");
        let publish_ts = click_args
            .map(|a| pluck_string(a, path!["publishTime"], ""))
            .unwrap_or_default();

        let mut tags = Vec::new();
        if let Some(args) = click_args {
            if pluck_str(args, path!["tag"], "") == "freeship" {
                tags.push("Free Shipping".to_string());
            }
        }
        for tag_item in pluck_array(main, path!["fishTags", "r1", "tagList"]) {
            let content = pluck_str(tag_item, path!["data", "content"], "");
            if content.contains("验货宝") || content.contains("Inspection") {
                tags.push("Inspection Service".to_string());
            }
        }

        page_items.push(ListingItem {
            item_title: pluck_string(main, path!["title"], "Unknown Title"),
            current_price: normalize_price(pluck(main, path!["price"])),
            original_price: pluck_string(main, path!["oriPrice"], ""),
            wants_count: click_args
                .map(|a| pluck_string(a, path!["wantNum"], "NaN"))
                .unwrap_or_else(|| "NaN".to_string()),
            item_tags: tags,
            location: pluck_string(main, path!["area"], "Unknown Area"),
            seller_nickname: pluck_string(main, path!["userNickName"], "Anonymous Seller"),
            item_link: canonical_item_link(raw_link),
            publish_time: format_publish_time(&publish_ts),
            item_id: pluck_string(main, path!["itemId"], "Unknown ID"),
        });
    }

    debug!("({}) parsed {} listings", source, page_items.len());
    page_items
}

/// The search payload renders the price as a list of text fragments
/// (currency sign, amount, a "当前价" label, sometimes a 万 multiplier).
fn normalize_price(parts: Option<&Value>) -> String {
    let Some(Value::Array(parts)) = parts else {
        return "Abnormal Price".to_string();
    };

    let mut price: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("");
    price = price.replace("当前价", "").trim().to_string();

    // "1.2万" → "¥12000"
    if price.contains('万') {
        let numeric = price.replace('¥', "").replace('万', "");
        if let Ok(n) = numeric.trim().parse::<f64>() {
            price = format!("¥{:.0}", n * 10_000.0);
        }
    }
    price
}

/// Millisecond-epoch string → "YYYY-MM-DD HH:MM"; anything else → "Unknown Time".
fn format_publish_time(ts: &str) -> String {
    if !ts.is_empty() && ts.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(ms) = ts.parse::<i64>() {
            if let Some(dt) = chrono::DateTime::from_timestamp_millis(ms) {
                return dt
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string();
            }
        }
    }
    "Unknown Time".to_string()
}

// ─────────────────────────────────────────────────────────────────────────────
// Detail endpoint
// ─────────────────────────────────────────────────────────────────────────────

/// Fields lifted off the detail-API payload.
#[derive(Debug, Default, Clone)]
pub struct DetailEnrichment {
    pub image_urls: Vec<String>,
    pub wants_count: Option<String>,
    pub views_count: Option<String>,
    pub seller_id: Option<String>,
    pub registration_days: i64,
    pub zhima_credit: String,
}

pub fn parse_detail_payload(payload: &Value) -> DetailEnrichment {
    let item_do = pluck(payload, path!["data", "itemDO"]);
    let seller_do = pluck(payload, path!["data", "sellerDO"]);

    let image_urls = item_do
        .map(|d| {
            pluck_array(d, path!["imageInfos"])
                .iter()
                .filter_map(|img| img.get("url").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    DetailEnrichment {
        image_urls,
        wants_count: item_do
            .and_then(|d| pluck(d, path!["wantCnt"]))
            .map(|v| value_to_count(v)),
        views_count: item_do
            .and_then(|d| pluck(d, path!["browseCnt"]))
            .map(|v| value_to_count(v)),
        seller_id: seller_do
            .and_then(|d| pluck(d, path!["sellerId"]))
            .map(|v| value_to_count(v)),
        registration_days: seller_do
            .map(|d| pluck_i64(d, path!["userRegDay"], 0))
            .unwrap_or(0),
        zhima_credit: seller_do
            .map(|d| pluck_string(d, path!["zhimaLevelInfo", "levelName"], ""))
            .unwrap_or_default(),
    }
}

fn value_to_count(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Format a registration-age day count as a human phrase.
///
/// Uses 365.25-day years (and the derived 30.44-day month); a 12-month
/// remainder carries into the year count.
pub fn format_registration_days(total_days: i64) -> String {
    if total_days <= 0 {
        return "Unknown".to_string();
    }

    const DAYS_IN_YEAR: f64 = 365.25;
    const DAYS_IN_MONTH: f64 = DAYS_IN_YEAR / 12.0;

    let years = (total_days as f64 / DAYS_IN_YEAR).floor() as i64;
    let remaining = total_days as f64 - years as f64 * DAYS_IN_YEAR;
    let mut months = (remaining / DAYS_IN_MONTH).round() as i64;
    let mut years = years;
    if months == 12 {
        years += 1;
        months = 0;
    }

    let year_word = if years == 1 { "year" } else { "years" };
    let month_word = if months == 1 { "month" } else { "months" };

    match (years > 0, months > 0) {
        (true, true) => format!("On Goofish for {years} {year_word} and {months} {month_word}"),
        (true, false) => format!("On Goofish for {years} {year_word}"),
        (false, true) => format!("On Goofish for {months} {month_word}"),
        (false, false) => "On Goofish for less than a month".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Profile payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Parse the user head API payload into the profile's summary fields.
/// List fields and reputation are filled by the callers from the
/// lazy-loaded endpoints.
pub fn parse_profile_head(payload: &Value) -> SellerProfile {
    let mut seller_credit = String::from("Not available");
    let mut buyer_credit = String::from("Not available");
    for tag in pluck_array(payload, path!["data", "module", "base", "ylzTags"]) {
        let role = pluck_str(tag, path!["attributes", "role"], "");
        let text = pluck_str(tag, path!["text"], "");
        match role {
            "seller" if !text.is_empty() => seller_credit = text.to_string(),
            "buyer" if !text.is_empty() => buyer_credit = text.to_string(),
            _ => {}
        }
    }

    SellerProfile {
        seller_nickname: pluck_string(
            payload,
            path!["data", "module", "base", "displayName"],
            "Not available",
        ),
        seller_avatar_link: pluck_string(
            payload,
            path!["data", "module", "base", "avatar", "avatar"],
            "",
        ),
        seller_bio: pluck_string(payload, path!["data", "module", "base", "introduction"], ""),
        seller_items_count: pluck_string(
            payload,
            path!["data", "module", "tabs", "item", "number"],
            "Not available",
        ),
        seller_ratings_count: pluck_string(
            payload,
            path!["data", "module", "tabs", "rate", "number"],
            "Not available",
        ),
        seller_credit_level: seller_credit,
        buyer_credit_level: buyer_credit,
        ..Default::default()
    }
}

/// Parse accumulated item-list cards from the profile's shelf endpoint.
pub fn parse_published_items(cards: &[Value]) -> Vec<PublishedItem> {
    cards
        .iter()
        .map(|card| {
            let data = pluck(card, path!["cardData"]);
            let status = match data.map(|d| pluck_i64(d, path!["itemStatus"], -1)) {
                Some(0) => ItemStatus::ForSale,
                Some(1) => ItemStatus::Sold,
                Some(code) => ItemStatus::Unknown(code),
                None => ItemStatus::Unknown(-1),
            };
            let data = data.unwrap_or(&Value::Null);
            PublishedItem {
                item_id: pluck_string(data, path!["id"], ""),
                item_title: pluck_string(data, path!["title"], ""),
                item_price: pluck_string(data, path!["priceInfo", "price"], ""),
                item_main_image: pluck_string(data, path!["picInfo", "picUrl"], ""),
                item_status: status,
            }
        })
        .collect()
}

/// Parse accumulated rating cards from the profile's rating endpoint.
pub fn parse_ratings(cards: &[Value]) -> Vec<Rating> {
    cards
        .iter()
        .map(|card| {
            let data = pluck(card, path!["cardData"]).unwrap_or(&Value::Null);
            let kind = match pluck(data, path!["rate"]).and_then(Value::as_i64) {
                Some(1) => RatingKind::Positive,
                Some(0) => RatingKind::Neutral,
                Some(-1) => RatingKind::Negative,
                _ => RatingKind::Unknown,
            };
            Rating {
                rating_id: pluck_string(data, path!["rateId"], ""),
                rating_content: pluck_string(data, path!["feedback"], ""),
                rating_type: kind,
                rater_role: pluck_string(data, path!["rateTagList", 0usize, "text"], "Unknown Role"),
                rater_nickname: pluck_string(data, path!["raterUserNick"], ""),
                rating_time: pluck_string(data, path!["gmtCreate"], ""),
                rating_images: pluck_array(data, path!["pictCdnUrlList"])
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
            }
        })
        .collect()
}

/// Derive positive-rating tallies from raw rating cards.
///
/// Each card contributes to exactly one of the seller/buyer tallies — or to
/// neither when its role tag is unrecognized. Rates are formatted with two
/// decimals; a zero denominator renders "N/A".
pub fn reputation_from_ratings(cards: &[Value]) -> ReputationStats {
    let mut seller_total = 0u32;
    let mut seller_positive = 0u32;
    let mut buyer_total = 0u32;
    let mut buyer_positive = 0u32;

    for card in cards {
        let data = pluck(card, path!["cardData"]).unwrap_or(&Value::Null);
        let role_tag = pluck_str(data, path!["rateTagList", 0usize, "text"], "");
        let rate = pluck(data, path!["rate"]).and_then(Value::as_i64);

        if role_tag.contains("卖家") || role_tag.contains("Seller") {
            seller_total += 1;
            if rate == Some(1) {
                seller_positive += 1;
            }
        } else if role_tag.contains("买家") || role_tag.contains("Buyer") {
            buyer_total += 1;
            if rate == Some(1) {
                buyer_positive += 1;
            }
        } else if !role_tag.is_empty() {
            warn!("unrecognized rater role tag '{}', card not counted", role_tag);
        }
    }

    let rate_of = |positive: u32, total: u32| -> String {
        if total > 0 {
            format!("{:.2}%", positive as f64 / total as f64 * 100.0)
        } else {
            "N/A".to_string()
        }
    };

    ReputationStats {
        positive_reviews_as_seller: format!("{}/{}", seller_positive, seller_total),
        positive_rate_as_seller: rate_of(seller_positive, seller_total),
        positive_reviews_as_buyer: format!("{}/{}", buyer_positive, buyer_total),
        positive_rate_as_buyer: rate_of(buyer_positive, buyer_total),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Link identity ────────────────────────────────────────────────────────

    #[test]
    fn test_dedup_key_strips_tracking_params() {
        let a = "https://www.goofish.com/item?id=123&spm=a21ybx.search.1";
        let b = "https://www.goofish.com/item?id=123&spm=other.tracking&ad=1";
        assert_eq!(dedup_key(a), dedup_key(b));
        assert_eq!(dedup_key(a), "https://www.goofish.com/item?id=123");
    }

    #[test]
    fn test_dedup_key_without_separator_is_identity() {
        let link = "https://www.goofish.com/item?id=9";
        assert_eq!(dedup_key(link), link);
    }

    #[test]
    fn test_canonical_item_link_rewrites_scheme() {
        assert_eq!(
            canonical_item_link("fleamarket://item?id=5&x=1"),
            "https://www.goofish.com/item?id=5&x=1"
        );
    }

    #[test]
    fn test_mobile_link_conversion() {
        let link = to_mobile_link("https://www.goofish.com/item?id=778899&spm=x");
        assert!(link.starts_with("https://pages.goofish.com/sharexy?"));
        assert!(link.contains("bfp=%7B%22id%22%3A778899%7D"));
        // No extractable id → unchanged.
        assert_eq!(to_mobile_link("https://www.goofish.com/search?q=x"), "https://www.goofish.com/search?q=x");
    }

    // ── Search payload ───────────────────────────────────────────────────────

    fn search_result(title: &str, id: &str, link: &str) -> serde_json::Value {
        json!({
            "data": {"item": {"main": {
                "exContent": {
                    "title": title,
                    "price": [{"text": "¥"}, {"text": "120"}],
                    "oriPrice": "¥200",
                    "area": "Shanghai",
                    "userNickName": "seller_a",
                    "picUrl": "https://img.example/x.jpg",
                    "itemId": id,
                    "fishTags": {"r1": {"tagList": [{"data": {"content": "验货宝服务"}}]}}
                },
                "clickParam": {"args": {"publishTime": "1751846400000", "wantNum": "12", "tag": "freeship"}},
                "targetUrl": link,
            }}}
        })
    }

    #[test]
    fn test_parse_search_payload_full_item() {
        let payload = json!({"data": {"resultList": [
            search_result("3080 graphics card", "101", "fleamarket://item?id=101&track=a")
        ]}});
        let items = parse_search_payload(&payload, "test");
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.item_title, "3080 graphics card");
        assert_eq!(item.current_price, "¥120");
        assert_eq!(item.item_link, "https://www.goofish.com/item?id=101&track=a");
        assert_eq!(item.item_id, "101");
        assert_eq!(item.wants_count, "12");
        assert!(item.item_tags.contains(&"Free Shipping".to_string()));
        assert!(item.item_tags.contains(&"Inspection Service".to_string()));
        assert!(item.publish_time.starts_with("2025-07-"));
    }

    #[test]
    fn test_parse_search_payload_empty_or_malformed() {
        assert!(parse_search_payload(&json!({"data": {}}), "t").is_empty());
        assert!(parse_search_payload(&json!({"ret": ["FAIL"]}), "t").is_empty());
        // resultList entries with no exContent are skipped, not fatal.
        let payload = json!({"data": {"resultList": [{"data": {}}]}});
        assert!(parse_search_payload(&payload, "t").is_empty());
    }

    #[test]
    fn test_normalize_price_wan_expansion() {
        let parts = json!([{"text": "当前价"}, {"text": "¥"}, {"text": "1.2万"}]);
        assert_eq!(normalize_price(Some(&parts)), "¥12000");
        assert_eq!(normalize_price(None), "Abnormal Price");
    }

    // ── Detail payload ───────────────────────────────────────────────────────

    #[test]
    fn test_parse_detail_payload() {
        let payload = json!({"data": {
            "itemDO": {
                "imageInfos": [{"url": "https://img/1.jpg"}, {"url": "https://img/2.jpg"}, {}],
                "wantCnt": 33,
                "browseCnt": "412",
            },
            "sellerDO": {
                "sellerId": 424242,
                "userRegDay": 400,
                "zhimaLevelInfo": {"levelName": "芝麻信用极好"},
            }
        }});
        let d = parse_detail_payload(&payload);
        assert_eq!(d.image_urls.len(), 2);
        assert_eq!(d.wants_count.as_deref(), Some("33"));
        assert_eq!(d.views_count.as_deref(), Some("412"));
        assert_eq!(d.seller_id.as_deref(), Some("424242"));
        assert_eq!(d.registration_days, 400);
        assert_eq!(d.zhima_credit, "芝麻信用极好");
    }

    // ── Registration duration ────────────────────────────────────────────────

    #[test]
    fn test_registration_days_unknown() {
        assert_eq!(format_registration_days(0), "Unknown");
        assert_eq!(format_registration_days(-5), "Unknown");
    }

    #[test]
    fn test_registration_days_400_is_year_plus_month() {
        // 400 = 1 full 365.25-day year + 34.75 days ≈ 1 month remainder.
        assert_eq!(format_registration_days(400), "On Goofish for 1 year and 1 month");
    }

    #[test]
    fn test_registration_days_exact_years() {
        // 1096 days: 3 years (1095.75) + 0.25 days → months rounds to 0.
        assert_eq!(format_registration_days(1096), "On Goofish for 3 years");
    }

    #[test]
    fn test_registration_days_under_a_month() {
        assert_eq!(format_registration_days(10), "On Goofish for less than a month");
    }

    #[test]
    fn test_registration_days_month_carry() {
        // 351 days: 0 years, ~11.53 months → rounds to 12 → carries to 1 year.
        assert_eq!(format_registration_days(351), "On Goofish for 1 year");
    }

    // ── Profile payloads ─────────────────────────────────────────────────────

    #[test]
    fn test_parse_profile_head() {
        let payload = json!({"data": {"module": {
            "base": {
                "displayName": "老王二手",
                "avatar": {"avatar": "https://img/avatar.jpg"},
                "introduction": "只卖自用闲置",
                "ylzTags": [
                    {"text": "卖家信用极好", "attributes": {"role": "seller", "level": 5}},
                    {"text": "买家信用优秀", "attributes": {"role": "buyer", "level": 4}},
                ],
            },
            "tabs": {"item": {"number": 58}, "rate": {"number": 120}},
        }}});
        let p = parse_profile_head(&payload);
        assert_eq!(p.seller_nickname, "老王二手");
        assert_eq!(p.seller_items_count, "58");
        assert_eq!(p.seller_ratings_count, "120");
        assert_eq!(p.seller_credit_level, "卖家信用极好");
        assert_eq!(p.buyer_credit_level, "买家信用优秀");
        assert!(p.seller_published_items.is_empty());
    }

    #[test]
    fn test_parse_published_items_status_mapping() {
        let cards = vec![
            json!({"cardData": {"id": 1, "title": "a", "itemStatus": 0, "priceInfo": {"price": "10"}}}),
            json!({"cardData": {"id": 2, "title": "b", "itemStatus": 1}}),
            json!({"cardData": {"id": 3, "title": "c", "itemStatus": 7}}),
        ];
        let items = parse_published_items(&cards);
        assert_eq!(items[0].item_status, ItemStatus::ForSale);
        assert_eq!(items[1].item_status, ItemStatus::Sold);
        assert_eq!(items[2].item_status, ItemStatus::Unknown(7));
        assert_eq!(items[0].item_price, "10");
    }

    // ── Reputation ───────────────────────────────────────────────────────────

    fn rating_card(role: &str, rate: i64) -> serde_json::Value {
        json!({"cardData": {
            "rateId": "r",
            "feedback": "好评",
            "rate": rate,
            "rateTagList": [{"text": role}],
            "raterUserNick": "u",
            "gmtCreate": "2025-06-01",
        }})
    }

    #[test]
    fn test_reputation_rates_and_tallies() {
        let cards = vec![
            rating_card("来自卖家", 1),
            rating_card("来自卖家", 1),
            rating_card("来自卖家", 0),
            rating_card("来自买家", 1),
            rating_card("neither role", 1), // counted in no tally
        ];
        let rep = reputation_from_ratings(&cards);
        assert_eq!(rep.positive_reviews_as_seller, "2/3");
        assert_eq!(rep.positive_rate_as_seller, "66.67%");
        assert_eq!(rep.positive_reviews_as_buyer, "1/1");
        assert_eq!(rep.positive_rate_as_buyer, "100.00%");
    }

    #[test]
    fn test_reputation_zero_denominator_is_na() {
        let rep = reputation_from_ratings(&[]);
        assert_eq!(rep.positive_rate_as_seller, "N/A");
        assert_eq!(rep.positive_rate_as_buyer, "N/A");
        assert_eq!(rep.positive_reviews_as_seller, "0/0");
    }

    #[test]
    fn test_reputation_english_role_markers() {
        let cards = vec![rating_card("from Seller", 1), rating_card("from Buyer", -1)];
        let rep = reputation_from_ratings(&cards);
        assert_eq!(rep.positive_rate_as_seller, "100.00%");
        assert_eq!(rep.positive_rate_as_buyer, "0.00%");
    }

    #[test]
    fn test_parse_ratings_kind_mapping() {
        let cards = vec![
            rating_card("卖家", 1),
            rating_card("卖家", 0),
            rating_card("卖家", -1),
            json!({"cardData": {"rateId": "x"}}),
        ];
        let ratings = parse_ratings(&cards);
        assert_eq!(ratings[0].rating_type, RatingKind::Positive);
        assert_eq!(ratings[1].rating_type, RatingKind::Neutral);
        assert_eq!(ratings[2].rating_type, RatingKind::Negative);
        assert_eq!(ratings[3].rating_type, RatingKind::Unknown);
        assert_eq!(ratings[3].rater_role, "Unknown Role");
    }
}
