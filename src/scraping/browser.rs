//! Native browser management using `chromiumoxide`.
//!
//! This module is the **single source of truth** for:
//! * Finding a usable browser executable (Chrome → Chromium → Edge, cross-platform).
//! * Launching a headless (or headed) browser session with stealth defaults.
//! * Injecting the persisted login session state before first navigation.
//! * Small JS-driven interaction helpers (text click, visibility probe,
//!   input fill) used by the search and profile flows.
//!
//! Stealth model: process-level defaults live here (user-agent rotation,
//! browser flags); traffic shaping lives in `pacing.rs`; block-signature
//! recognition lives in `defense.rs`.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::core::Result as CdpResult;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use rand::seq::IndexedRandom;
use tokio::task::JoinHandle;
use tracing::{info, warn};

// ── Realistic User-Agent pool ────────────────────────────────────────────────

const DESKTOP_USER_AGENTS: &[&str] = &[
    // Chrome 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 132 – macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36",
    // Chrome 131 – Linux
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    // Edge 132 – Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/132.0.0.0 Safari/537.36 Edg/132.0.0.0",
];

/// Returns a randomly-chosen realistic desktop User-Agent string.
pub fn random_user_agent() -> &'static str {
    let mut rng = rand::rng();
    DESKTOP_USER_AGENTS
        .choose(&mut rng)
        .copied()
        .unwrap_or(DESKTOP_USER_AGENTS[0])
}

// ── Browser executable discovery ─────────────────────────────────────────────

/// Find a usable Chromium-family browser executable.
///
/// Resolution order:
/// 1. `CHROME_EXECUTABLE` env var (explicit override)
/// 2. PATH scan – finds package-manager installs on all platforms.
/// 3. OS-specific well-known install paths.
pub fn find_chrome_executable() -> Option<String> {
    // 1. Explicit env override
    if let Ok(p) = std::env::var("CHROME_EXECUTABLE") {
        if Path::new(&p).exists() {
            return Some(p);
        }
    }

    // 2. PATH scan (Linux / macOS / Windows package managers)
    if let Ok(path_var) = std::env::var("PATH") {
        let candidates = [
            "google-chrome",
            "chromium",
            "chromium-browser",
            "chrome",
            "msedge",
        ];
        for dir in std::env::split_paths(&path_var) {
            for exe in candidates {
                let full = dir.join(exe);
                if full.exists() {
                    return Some(full.to_string_lossy().to_string());
                }
            }
        }
    }

    // 3. Platform-specific well-known paths
    #[cfg(target_os = "macos")]
    {
        let candidates = [
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/bin/google-chrome",
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/local/bin/chromium",
            "/usr/bin/microsoft-edge",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    #[cfg(target_os = "windows")]
    {
        let candidates = [
            r"C:\Program Files\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
            r"C:\Program Files (x86)\Microsoft\Edge\Application\msedge.exe",
        ];
        for c in candidates {
            if Path::new(c).exists() {
                return Some(c.to_string());
            }
        }
    }

    None
}

// ── Browser config + launch ──────────────────────────────────────────────────

/// Build a `BrowserConfig` with stealth defaults.
///
/// Flags chosen for:
/// * Compatibility with CI / restricted environments (`--no-sandbox`, `--disable-dev-shm-usage`).
/// * Stealth — `--disable-blink-features=AutomationControlled` hides the
///   `navigator.webdriver` flag; UA is randomly drawn from `DESKTOP_USER_AGENTS`.
pub fn build_browser_config(exe: &str, headless: bool, width: u32, height: u32) -> Result<BrowserConfig> {
    let ua = random_user_agent();

    let mut builder = BrowserConfig::builder()
        .chrome_executable(exe)
        .viewport(Viewport {
            width,
            height,
            device_scale_factor: Some(1.0),
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        })
        .window_size(width, height)
        .arg("--disable-gpu")
        .arg("--no-sandbox") // often required in CI / restricted environments
        .arg("--disable-setuid-sandbox")
        .arg("--disable-dev-shm-usage") // avoids /dev/shm OOM in constrained environments
        .arg("--disable-extensions")
        .arg("--disable-background-networking")
        .arg("--disable-sync")
        .arg("--disable-translate")
        .arg("--no-first-run")
        .arg("--no-default-browser-check")
        .arg("--mute-audio")
        // Stealth: suppress CDP automation fingerprint
        .arg("--disable-blink-features=AutomationControlled")
        .arg(format!("--user-agent={}", ua));

    if !headless {
        // Headed mode can help against fingerprinting on stubborn accounts.
        builder = builder.with_head();
    }

    builder
        .build()
        .map_err(|e| anyhow!("Failed to build browser config: {}", e))
}

/// Launch a browser and spawn the CDP handler drain task.
///
/// The returned `JoinHandle` must be aborted after `browser.close()` —
/// callers use the pattern:
/// `let result = async { ... }.await; browser.close().await.ok(); handle.abort();`
pub async fn launch(headless: bool) -> Result<(Browser, JoinHandle<()>)> {
    let exe = find_chrome_executable().ok_or_else(|| {
        anyhow!("No browser found. Install Chrome or Chromium, or set CHROME_EXECUTABLE.")
    })?;

    info!("🚀 Launching browser ({}, headless={})", exe, headless);
    let config = build_browser_config(&exe, headless, 1920, 1080)?;
    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| anyhow!("Failed to launch browser ({}): {}", exe, e))?;

    let handle = tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                warn!("CDP handler error: {}", e);
            }
        }
    });

    Ok((browser, handle))
}

// ── Session state ────────────────────────────────────────────────────────────

/// Load the persisted login session state written by the interactive login
/// collaborator.
///
/// Accepts either the Playwright-style wrapper `{"cookies": [...]}` or a
/// bare cookie array. Returns the raw cookie values; individual malformed
/// entries are tolerated at injection time.
pub fn load_session_state(path: &Path) -> Result<Vec<serde_json::Value>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("session state file {} unreadable: {}", path.display(), e))?;
    let parsed: serde_json::Value = serde_json::from_str(&content)
        .map_err(|e| anyhow!("session state file {} is not JSON: {}", path.display(), e))?;

    let cookies = match &parsed {
        serde_json::Value::Array(arr) => arr.clone(),
        obj => obj
            .get("cookies")
            .and_then(|c| c.as_array())
            .cloned()
            .unwrap_or_default(),
    };

    if cookies.is_empty() {
        return Err(anyhow!(
            "session state file {} contains no cookies — run the login flow first",
            path.display()
        ));
    }
    info!("🍪 Loaded {} session cookies from {}", cookies.len(), path.display());
    Ok(cookies)
}

/// Inject stored session cookies into a live CDP page **before** navigation.
///
/// Cookies are deserialized from raw JSON into chromiumoxide [`CookieParam`]s
/// and set via the `Network.setCookies` CDP command. Any individual cookie
/// that fails to deserialize is silently skipped so a partially-malformed
/// session file never blocks a run.
pub async fn inject_session(page: &Page, raw_cookies: &[serde_json::Value]) {
    use chromiumoxide::cdp::browser_protocol::network::{CookieParam, SetCookiesParams};

    let cookie_params: Vec<CookieParam> = raw_cookies
        .iter()
        .filter_map(|v| serde_json::from_value::<CookieParam>(v.clone()).ok())
        .collect();

    if cookie_params.is_empty() {
        warn!("session state contained no valid CookieParams — skipping injection");
        return;
    }

    let count = cookie_params.len();
    match page.execute(SetCookiesParams::new(cookie_params)).await {
        Ok(_) => info!("💉 Injected {} session cookies into CDP page", count),
        Err(e) => warn!("Failed to inject session cookies: {}", e),
    }
}

// ── JS interaction helpers ───────────────────────────────────────────────────

/// Click the first element whose exact visible text equals `text`.
/// Returns `false` when no such element exists (not an error — several
/// controls are optional).
pub async fn click_text(page: &Page, text: &str) -> CdpResult<bool> {
    let js = format!(
        r#"(() => {{
            const xpath = `//*[text()={}]`;
            const node = document
                .evaluate(xpath, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null)
                .singleNodeValue;
            if (!node) return false;
            node.click();
            return true;
        }})()"#,
        js_string_literal(text)
    );
    let clicked = page
        .evaluate(js)
        .await?
        .into_value::<bool>()
        .unwrap_or(false);
    Ok(clicked)
}

/// Click the first element matching the CSS `selector`. Returns `false`
/// when absent.
pub async fn click_selector(page: &Page, selector: &str) -> CdpResult<bool> {
    let js = format!(
        r#"(() => {{
            const node = document.querySelector({});
            if (!node) return false;
            node.click();
            return true;
        }})()"#,
        js_string_literal(selector)
    );
    let clicked = page
        .evaluate(js)
        .await?
        .into_value::<bool>()
        .unwrap_or(false);
    Ok(clicked)
}

/// Poll until an element with exact visible text `text` exists, up to
/// `timeout`. Returns `false` on timeout.
pub async fn wait_for_text(page: &Page, text: &str, timeout: Duration) -> bool {
    let js = format!(
        r#"(() => {{
            const xpath = `//*[text()={}]`;
            return document
                .evaluate(xpath, document, null, XPathResult.FIRST_ORDERED_NODE_TYPE, null)
                .singleNodeValue !== null;
        }})()"#,
        js_string_literal(text)
    );
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let present = page
            .evaluate(js.clone())
            .await
            .ok()
            .and_then(|v| v.into_value::<bool>().ok())
            .unwrap_or(false);
        if present {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }
}

/// Poll until an element matching `selector` is visible (non-zero box),
/// up to `timeout`. Returns `false` on timeout — absence is a normal
/// outcome for optional overlays.
pub async fn wait_for_visible(page: &Page, selector: &str, timeout: Duration) -> bool {
    let js = format!(
        r#"(() => {{
            const node = document.querySelector({});
            if (!node) return false;
            const rect = node.getBoundingClientRect();
            return rect.width > 0 && rect.height > 0;
        }})()"#,
        js_string_literal(selector)
    );
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let visible = page
            .evaluate(js.clone())
            .await
            .ok()
            .and_then(|v| v.into_value::<bool>().ok())
            .unwrap_or(false);
        if visible {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Fill the `index`-th input inside the container matched by
/// `container_selector` and dispatch input events so the page framework
/// picks the value up. Returns `false` when the input is absent.
pub async fn fill_nth_input(
    page: &Page,
    container_selector: &str,
    index: usize,
    value: &str,
) -> CdpResult<bool> {
    let js = format!(
        r#"(() => {{
            const container = document.querySelector({sel});
            if (!container) return false;
            const inputs = container.querySelectorAll('input');
            if (inputs.length <= {index}) return false;
            const input = inputs[{index}];
            const setter = Object.getOwnPropertyDescriptor(
                window.HTMLInputElement.prototype, 'value').set;
            setter.call(input, {value});
            input.dispatchEvent(new Event('input', {{ bubbles: true }}));
            input.dispatchEvent(new Event('change', {{ bubbles: true }}));
            return true;
        }})()"#,
        sel = js_string_literal(container_selector),
        index = index,
        value = js_string_literal(value),
    );
    let filled = page
        .evaluate(js)
        .await?
        .into_value::<bool>()
        .unwrap_or(false);
    Ok(filled)
}

/// Scroll the page to the bottom — the trigger for the site's lazy-loading
/// list endpoints.
pub async fn scroll_to_bottom(page: &Page) -> CdpResult<()> {
    page.evaluate("window.scrollTo(0, document.body.scrollHeight)")
        .await?;
    Ok(())
}

/// Quote `s` as a JS string literal (JSON string syntax is valid JS).
fn js_string_literal(s: &str) -> String {
    serde_json::Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_js_string_literal_escapes() {
        assert_eq!(js_string_literal("最新"), "\"最新\"");
        assert_eq!(js_string_literal("a\"b"), "\"a\\\"b\"");
    }

    #[test]
    fn test_random_user_agent_is_desktop() {
        let ua = random_user_agent();
        assert!(ua.contains("Mozilla/5.0"));
        assert!(!ua.contains("iPhone"));
    }

    #[test]
    fn test_load_session_state_accepts_both_shapes() {
        let dir = tempfile::tempdir().unwrap();

        let wrapped = dir.path().join("wrapped.json");
        std::fs::write(
            &wrapped,
            r#"{"cookies": [{"name": "t", "value": "v", "domain": ".goofish.com", "path": "/"}], "origins": []}"#,
        )
        .unwrap();
        assert_eq!(load_session_state(&wrapped).unwrap().len(), 1);

        let bare = dir.path().join("bare.json");
        std::fs::write(&bare, r#"[{"name": "t", "value": "v"}]"#).unwrap();
        assert_eq!(load_session_state(&bare).unwrap().len(), 1);
    }

    #[test]
    fn test_load_session_state_empty_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let empty = dir.path().join("empty.json");
        std::fs::write(&empty, r#"{"cookies": []}"#).unwrap();
        assert!(load_session_state(&empty).is_err());
    }
}
