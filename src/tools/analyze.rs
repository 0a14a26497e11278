//! AI decision call: ships the full record JSON plus inline images to an
//! OpenAI-compatible chat endpoint and parses the structured verdict out of
//! the completion.
//!
//! The model is asked for a JSON object, but real completions routinely
//! arrive wrapped in prose or markdown fencing — extraction takes the first
//! balanced `{...}` span before decoding. A decode failure *after*
//! extraction is a hard failure for the attempt: it propagates to the retry
//! wrapper, and only the caller decides to record it as an error marker.

use std::path::PathBuf;

use serde_json::{json, Value};
use tracing::{debug, info};

use crate::core::config::AnalysisConfig;
use crate::core::types::UnifiedRecord;
use crate::core::{Result, ScoutError};
use crate::tools::images;

pub struct AnalysisClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl AnalysisClient {
    pub fn from_config(client: reqwest::Client, cfg: &AnalysisConfig) -> Self {
        Self {
            client,
            base_url: cfg.resolve_base_url(),
            api_key: cfg.resolve_api_key(),
            model: cfg.resolve_model(),
        }
    }

    /// One analysis attempt. The caller wraps this in the retry policy —
    /// transient HTTP failures and malformed completions are both expected
    /// here.
    pub async fn analyze(
        &self,
        record: &UnifiedRecord,
        image_paths: &[PathBuf],
        prompt_text: &str,
    ) -> Result<Value> {
        let item_id = &record.item_info.listing.item_id;
        info!(
            "AI analysis for item {} ({} images): {}",
            item_id,
            image_paths.len(),
            record.item_info.listing.item_title
        );

        let record_json = serde_json::to_string_pretty(record)
            .map_err(|e| ScoutError::parse("serializing record for analysis", e))?;
        let combined_prompt = format!(
            "{}\n\nPlease analyze the following complete product JSON data based on your \
             expertise and my requirements:\n\n```json\n{}\n```",
            prompt_text, record_json
        );

        let mut content_parts = vec![json!({"type": "text", "text": combined_prompt})];
        for b64 in images::encode_base64(image_paths).await {
            content_parts.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/jpeg;base64,{}", b64)}
            }));
        }

        let body = json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content_parts}],
            "response_format": {"type": "json_object"},
        });

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let mut builder = self.client.post(url).json(&body);
        // Key-less local endpoints (Ollama / LM Studio) work without auth.
        if let Some(key) = self.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ScoutError::parse(
                "chat completions",
                format!("status={} body={}", status, truncate(&text, 300)),
            ));
        }

        let completion: Value = response.json().await?;
        let content = completion
            .get("choices")
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ScoutError::parse("chat completions", "no message content"))?;

        debug!("raw completion for item {}: {}", item_id, truncate(content, 500));
        extract_json_object(content)
    }
}

/// Pull the first balanced `{...}` span out of `text` and decode it.
///
/// Tolerates leading/trailing prose and markdown fencing. No braces at all,
/// or an undecodable span, is a parse failure.
pub fn extract_json_object(text: &str) -> Result<Value> {
    let start = text.find('{');
    let end = text.rfind('}');
    let span = match (start, end) {
        (Some(s), Some(e)) if e >= s => &text[s..=e],
        _ => {
            return Err(ScoutError::parse(
                "AI response",
                "no JSON object markers in completion",
            ))
        }
    };
    serde_json::from_str(span).map_err(|e| ScoutError::parse("AI response", e))
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}
