//! Notification fan-out for recommended items.
//!
//! Zero or more channels, each skip-if-unconfigured. Delivery is
//! best-effort per channel: one channel failing (after its retry budget)
//! never blocks another and never fails the caller — a missed push is a
//! logging event, not a pipeline error.

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::core::config::NotifyConfig;
use crate::core::retry::{retry, RetryPolicy};
use crate::core::types::ItemDetail;
use crate::scraping::parse::to_mobile_link;

/// What a channel receives for one recommended item.
#[derive(Debug, Clone)]
pub struct Notification {
    pub title: String,
    pub price: String,
    pub reason: String,
    pub pc_link: String,
    pub mobile_link: Option<String>,
}

impl Notification {
    pub fn for_item(item: &ItemDetail, reason: &str, mobile_links: bool) -> Self {
        let link = item.listing.item_link.clone();
        Notification {
            title: item.listing.item_title.clone(),
            price: item.listing.current_price.clone(),
            reason: reason.to_string(),
            mobile_link: mobile_links.then(|| to_mobile_link(&link)),
            pc_link: link,
        }
    }

    /// Headline, truncated so push banners stay readable.
    fn headline(&self) -> String {
        let short: String = self.title.chars().take(30).collect();
        format!("🚨 New Recommendation! {}...", short)
    }

    /// Plain-text body shared by all channels.
    fn body(&self) -> String {
        match &self.mobile_link {
            Some(mobile) => format!(
                "Price: {}\nReason: {}\nMobile Link: {}\nPC Link: {}",
                self.price, self.reason, mobile, self.pc_link
            ),
            None => format!(
                "Price: {}\nReason: {}\nLink: {}",
                self.price, self.reason, self.pc_link
            ),
        }
    }
}

#[async_trait]
pub trait NotifyChannel: Send + Sync {
    fn name(&self) -> &'static str;
    async fn deliver(&self, note: &Notification) -> anyhow::Result<()>;
}

// ── ntfy push topic ──────────────────────────────────────────────────────────

/// ntfy.sh-style push: plain-text POST with metadata headers.
pub struct NtfyChannel {
    client: reqwest::Client,
    topic_url: String,
}

#[async_trait]
impl NotifyChannel for NtfyChannel {
    fn name(&self) -> &'static str {
        "ntfy"
    }

    async fn deliver(&self, note: &Notification) -> anyhow::Result<()> {
        // Header values may carry UTF-8 bytes; fall back to ASCII if a
        // proxy in between rejects them.
        let title_header = reqwest::header::HeaderValue::from_bytes(note.headline().as_bytes())
            .unwrap_or_else(|_| reqwest::header::HeaderValue::from_static("New Recommendation"));

        let resp = self
            .client
            .post(&self.topic_url)
            .header("Title", title_header)
            .header("Priority", "urgent")
            .header("Tags", "bell,vibration")
            .body(note.body())
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }
}

// ── Webhook bot ──────────────────────────────────────────────────────────────

/// Webhook bot POST with the fixed text envelope.
pub struct WebhookBotChannel {
    client: reqwest::Client,
    url: String,
}

#[async_trait]
impl NotifyChannel for WebhookBotChannel {
    fn name(&self) -> &'static str {
        "webhook-bot"
    }

    async fn deliver(&self, note: &Notification) -> anyhow::Result<()> {
        let payload = json!({
            "msgtype": "text",
            "text": { "content": format!("{}\n{}", note.headline(), note.body()) }
        });
        let resp = self
            .client
            .post(&self.url)
            .json(&payload)
            .timeout(std::time::Duration::from_secs(10))
            .send()
            .await?;
        resp.error_for_status()?;
        Ok(())
    }
}

// ── Fan-out ──────────────────────────────────────────────────────────────────

pub struct Notifier {
    channels: Vec<Box<dyn NotifyChannel>>,
    mobile_links: bool,
    policy: RetryPolicy,
}

impl Notifier {
    /// Build the channel set from config; absent channels are simply skipped.
    pub fn from_config(client: reqwest::Client, cfg: &NotifyConfig) -> Self {
        let mut channels: Vec<Box<dyn NotifyChannel>> = Vec::new();
        if let Some(topic_url) = cfg.resolve_ntfy_url() {
            channels.push(Box::new(NtfyChannel {
                client: client.clone(),
                topic_url,
            }));
        }
        if let Some(url) = cfg.resolve_webhook_url() {
            channels.push(Box::new(WebhookBotChannel { client, url }));
        }
        Self {
            channels,
            mobile_links: cfg.resolve_mobile_links(),
            policy: RetryPolicy::notify(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Push `item` to every configured channel. Per-channel failures are
    /// logged and swallowed; the caller's pipeline continues regardless.
    pub async fn dispatch(&self, item: &ItemDetail, reason: &str) {
        if self.channels.is_empty() {
            warn!("no notification channel configured, skipping notification");
            return;
        }
        let note = Notification::for_item(item, reason, self.mobile_links);

        for channel in &self.channels {
            let label = format!("notify:{}", channel.name());
            match retry(self.policy, &label, || channel.deliver(&note)).await {
                Ok(()) => info!("{} delivered for item {}", label, item.listing.item_id),
                Err(e) => warn!(
                    "{} failed definitively for item {}: {}",
                    label, item.listing.item_id, e
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::ListingItem;
    use std::time::Duration;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn item() -> ItemDetail {
        ItemDetail {
            listing: ListingItem {
                item_title: "大疆 mini 3 pro 无人机".into(),
                current_price: "¥2600".into(),
                item_link: "https://www.goofish.com/item?id=42&spm=x".into(),
                item_id: "42".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn test_cfg(ntfy: Option<String>, webhook: Option<String>) -> NotifyConfig {
        NotifyConfig {
            ntfy_topic_url: ntfy,
            webhook_bot_url: webhook,
            mobile_links: Some(false),
        }
    }

    #[tokio::test]
    async fn test_fan_out_hits_both_channels() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/topic"))
            .and(header("Priority", "urgent"))
            .and(body_string_contains("Price: ¥2600"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot"))
            .and(body_string_contains("msgtype"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::from_config(
            reqwest::Client::new(),
            &test_cfg(
                Some(format!("{}/topic", server.uri())),
                Some(format!("{}/bot", server.uri())),
            ),
        );
        assert_eq!(notifier.channel_count(), 2);
        notifier.dispatch(&item(), "below market price").await;
    }

    #[tokio::test]
    async fn test_one_channel_failing_does_not_block_the_other() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/topic"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bot"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::from_config(
            reqwest::Client::new(),
            &test_cfg(
                Some(format!("{}/topic", server.uri())),
                Some(format!("{}/bot", server.uri())),
            ),
        )
        .with_policy(RetryPolicy::new(2, Duration::from_millis(1)));

        // Must not panic or bail early; the webhook mock's `expect(1)`
        // verifies delivery despite the ntfy failure.
        notifier.dispatch(&item(), "reason").await;
    }

    #[tokio::test]
    async fn test_unconfigured_is_skip_not_error() {
        let notifier = Notifier::from_config(reqwest::Client::new(), &test_cfg(None, None));
        assert_eq!(notifier.channel_count(), 0);
        notifier.dispatch(&item(), "reason").await;
    }

    #[test]
    fn test_message_includes_mobile_link_when_enabled() {
        let note = Notification::for_item(&item(), "cheap", true);
        let body = note.body();
        assert!(body.contains("Mobile Link: https://pages.goofish.com/sharexy?"));
        assert!(body.contains("PC Link: https://www.goofish.com/item?id=42&spm=x"));
    }
}
