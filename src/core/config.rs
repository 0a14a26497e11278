use std::path::{Path, PathBuf};

use crate::core::types::TaskConfig;

// ---------------------------------------------------------------------------
// ScoutConfig — file-based config loader (flea-scout.json) with env-var fallback
// ---------------------------------------------------------------------------

/// Analysis sub-config (mirrors the `analysis` key in flea-scout.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct AnalysisConfig {
    /// LLM endpoint — e.g. `https://api.openai.com/v1` or `http://localhost:11434/v1` (Ollama).
    pub llm_base_url: Option<String>,
    /// API key. Never logged. Leave blank for key-less local endpoints.
    pub llm_api_key: Option<String>,
    /// Model name — must be multimodal when image analysis matters.
    pub llm_model: Option<String>,
}

impl AnalysisConfig {
    /// API key: JSON field → `OPENAI_API_KEY` env var → `None`.
    ///
    /// An explicit empty string in the config file means "no key required"
    /// (Ollama / LM Studio) — the request is sent without auth.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(k) = &self.llm_api_key {
            return Some(k.trim().to_string());
        }
        std::env::var("OPENAI_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
    }

    /// LLM base URL: JSON field → `OPENAI_BASE_URL` env var → OpenAI default.
    pub fn resolve_base_url(&self) -> String {
        if let Some(u) = &self.llm_base_url {
            if !u.trim().is_empty() {
                return u.clone();
            }
        }
        std::env::var("OPENAI_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
    }

    /// Model name: JSON field → `OPENAI_MODEL_NAME` env var → `gpt-4o-mini`.
    pub fn resolve_model(&self) -> String {
        if let Some(m) = &self.llm_model {
            if !m.trim().is_empty() {
                return m.clone();
            }
        }
        std::env::var("OPENAI_MODEL_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "gpt-4o-mini".to_string())
    }
}

/// Notification sub-config. Every channel is skip-if-unconfigured.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct NotifyConfig {
    /// ntfy.sh topic URL for push notifications.
    pub ntfy_topic_url: Option<String>,
    /// Webhook bot URL (fixed JSON text envelope).
    pub webhook_bot_url: Option<String>,
    /// Also include a mobile share link in notification messages.
    pub mobile_links: Option<bool>,
}

impl NotifyConfig {
    pub fn resolve_ntfy_url(&self) -> Option<String> {
        non_empty(self.ntfy_topic_url.clone())
            .or_else(|| std::env::var("NTFY_TOPIC_URL").ok())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn resolve_webhook_url(&self) -> Option<String> {
        non_empty(self.webhook_bot_url.clone())
            .or_else(|| std::env::var("WEBHOOK_BOT_URL").ok())
            .filter(|v| !v.trim().is_empty())
    }

    /// Mobile link conversion: JSON field → `PCURL_TO_MOBILE` env var → off.
    pub fn resolve_mobile_links(&self) -> bool {
        if let Some(b) = self.mobile_links {
            return b;
        }
        std::env::var("PCURL_TO_MOBILE")
            .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

/// Browser sub-config.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct BrowserSettings {
    pub headless: Option<bool>,
    /// Path to the persisted login session state (Playwright-style JSON).
    pub session_state_file: Option<String>,
}

impl BrowserSettings {
    /// Headless mode: JSON field → `RUN_HEADLESS` env var → on.
    pub fn resolve_headless(&self) -> bool {
        if let Some(b) = self.headless {
            return b;
        }
        std::env::var("RUN_HEADLESS")
            .map(|v| v.trim().to_ascii_lowercase() != "false")
            .unwrap_or(true)
    }

    /// Session state path: JSON field → `SESSION_STATE_FILE` env var →
    /// `goofish_state.json` in the working directory.
    pub fn resolve_state_file(&self) -> PathBuf {
        if let Some(p) = non_empty(self.session_state_file.clone()) {
            return PathBuf::from(p);
        }
        std::env::var("SESSION_STATE_FILE")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("goofish_state.json"))
    }
}

/// Semantic pre-filter sub-config. The filter is an optional collaborator:
/// when no model path resolves, every item passes.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct PrefilterSettings {
    pub model_path: Option<String>,
    pub threshold: Option<f32>,
}

impl PrefilterSettings {
    pub fn resolve_model_path(&self) -> Option<String> {
        non_empty(self.model_path.clone())
            .or_else(|| std::env::var("PREFILTER_MODEL_PATH").ok())
            .filter(|v| !v.trim().is_empty())
    }

    pub fn resolve_threshold(&self) -> f32 {
        if let Some(t) = self.threshold {
            return t;
        }
        std::env::var("PREFILTER_THRESHOLD")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.30)
    }
}

/// Top-level config loaded from `flea-scout.json`.
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct ScoutConfig {
    #[serde(default)]
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub browser: BrowserSettings,
    #[serde(default)]
    pub prefilter: PrefilterSettings,
    /// Directory for the per-keyword JSONL result files.
    pub results_dir: Option<String>,
    /// Directory for the downloaded-image cache.
    pub image_dir: Option<String>,
}

impl ScoutConfig {
    pub fn resolve_results_dir(&self) -> PathBuf {
        PathBuf::from(non_empty(self.results_dir.clone()).unwrap_or_else(|| "jsonl".to_string()))
    }

    pub fn resolve_image_dir(&self) -> PathBuf {
        PathBuf::from(non_empty(self.image_dir.clone()).unwrap_or_else(|| "images".to_string()))
    }
}

fn non_empty(v: Option<String>) -> Option<String> {
    v.filter(|s| !s.trim().is_empty())
}

/// Load `flea-scout.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `FLEA_SCOUT_CONFIG` env var path
/// 2. `./flea-scout.json` (process cwd)
/// 3. `../flea-scout.json` (one level up)
///
/// Missing file → `ScoutConfig::default()` (silent, all env-var fallbacks
/// apply). Parse error → log a warning, return defaults.
pub fn load_scout_config() -> ScoutConfig {
    let candidates: Vec<PathBuf> = {
        let mut v = vec![
            PathBuf::from("flea-scout.json"),
            PathBuf::from("../flea-scout.json"),
        ];
        if let Ok(env_path) = std::env::var("FLEA_SCOUT_CONFIG") {
            v.insert(0, PathBuf::from(env_path));
        }
        v
    };

    for path in &candidates {
        match std::fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<ScoutConfig>(&contents) {
                Ok(cfg) => {
                    tracing::info!("flea-scout.json loaded from {}", path.display());
                    return cfg;
                }
                Err(e) => {
                    tracing::warn!(
                        "flea-scout.json parse error at {}: {} — using defaults",
                        path.display(),
                        e
                    );
                    return ScoutConfig::default();
                }
            },
            Err(_) => continue, // file not found at this path — try next
        }
    }

    ScoutConfig::default()
}

/// Load the tasks file: a JSON array of [`TaskConfig`].
///
/// `ai_prompt_text` may be given inline; a sibling `ai_prompt_file` key is
/// resolved here so the core only ever sees the final assembled string.
pub fn load_tasks(path: &Path) -> anyhow::Result<Vec<TaskConfig>> {
    use anyhow::Context;

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading tasks file {}", path.display()))?;
    let raw: Vec<serde_json::Value> =
        serde_json::from_str(&contents).context("tasks file is not a JSON array")?;

    let mut tasks = Vec::with_capacity(raw.len());
    for mut entry in raw {
        // Prompt indirection: ai_prompt_file → ai_prompt_text.
        if entry.get("ai_prompt_text").is_none() {
            if let Some(prompt_path) = entry.get("ai_prompt_file").and_then(|v| v.as_str()) {
                match std::fs::read_to_string(prompt_path) {
                    Ok(text) => {
                        entry["ai_prompt_text"] = serde_json::Value::String(text);
                    }
                    Err(e) => {
                        tracing::warn!(
                            "prompt file '{}' unreadable ({}); AI analysis disabled for this task",
                            prompt_path,
                            e
                        );
                    }
                }
            }
        }
        let task: TaskConfig =
            serde_json::from_value(entry).context("malformed task entry in tasks file")?;
        tasks.push(task);
    }
    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_defaults() {
        let cfg = ScoutConfig::default();
        assert_eq!(cfg.resolve_results_dir(), PathBuf::from("jsonl"));
        assert_eq!(cfg.resolve_image_dir(), PathBuf::from("images"));
        assert!(cfg.browser.resolve_headless());
        assert_eq!(
            cfg.browser.resolve_state_file(),
            PathBuf::from("goofish_state.json")
        );
    }

    #[test]
    fn test_explicit_empty_api_key_means_keyless() {
        let cfg = AnalysisConfig {
            llm_api_key: Some(String::new()),
            ..Default::default()
        };
        // Present-but-empty = key-less local endpoint, not "unset".
        assert_eq!(cfg.resolve_api_key(), Some(String::new()));
    }

    #[test]
    fn test_load_tasks_with_prompt_file() {
        let dir = tempfile::tempdir().unwrap();
        let prompt_path = dir.path().join("prompt.txt");
        std::fs::write(&prompt_path, "judge this listing").unwrap();

        let tasks_path = dir.path().join("tasks.json");
        std::fs::write(
            &tasks_path,
            serde_json::json!([{
                "task_name": "ssd watch",
                "keyword": "ssd 1tb",
                "enabled": true,
                "ai_prompt_file": prompt_path.to_str().unwrap(),
            }])
            .to_string(),
        )
        .unwrap();

        let tasks = load_tasks(&tasks_path).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].ai_prompt_text, "judge this listing");
    }

    #[test]
    fn test_load_tasks_missing_prompt_file_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let tasks_path = dir.path().join("tasks.json");
        std::fs::write(
            &tasks_path,
            serde_json::json!([{
                "task_name": "t",
                "keyword": "k",
                "ai_prompt_file": "/nonexistent/prompt.txt",
            }])
            .to_string(),
        )
        .unwrap();

        let tasks = load_tasks(&tasks_path).unwrap();
        assert!(tasks[0].ai_prompt_text.is_empty());
    }
}
