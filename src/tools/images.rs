//! Local image cache for analysis requests.
//!
//! Images are addressed by item id + position index; a file that already
//! exists is never re-downloaded, so re-runs and AI retries stay cheap.
//! A single image failing its retry budget is dropped from the set — the
//! item is analyzed with whatever images made it.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use tracing::{info, warn};

use crate::core::retry::{retry, RetryPolicy};

/// Browser-like headers so the CDN serves us the same bytes it serves users.
const IMAGE_ACCEPT: &str = "image/avif,image/webp,image/apng,image/svg+xml,image/*,*/*;q=0.8";

pub struct ImageCache {
    client: reqwest::Client,
    dir: PathBuf,
    policy: RetryPolicy,
}

impl ImageCache {
    pub fn new(client: reqwest::Client, dir: PathBuf) -> Self {
        Self {
            client,
            dir,
            policy: RetryPolicy::image(),
        }
    }

    /// Download all images for one item, returning the paths that exist
    /// afterwards (cached + freshly fetched). Order follows `urls`.
    pub async fn download_all(&self, item_id: &str, urls: &[String]) -> Vec<PathBuf> {
        let urls: Vec<&String> = urls
            .iter()
            .filter(|u| u.trim().starts_with("http"))
            .collect();
        if urls.is_empty() {
            return Vec::new();
        }
        if let Err(e) = tokio::fs::create_dir_all(&self.dir).await {
            warn!("image dir {} not creatable: {}", self.dir.display(), e);
            return Vec::new();
        }

        let total = urls.len();
        let mut saved = Vec::new();
        for (i, url) in urls.into_iter().enumerate() {
            let path = self.dir.join(cache_file_name(item_id, i, url));

            if path.exists() {
                info!("image {}/{} already cached: {}", i + 1, total, path.display());
                saved.push(path);
                continue;
            }

            let label = format!("image {}/{} for item {}", i + 1, total, item_id);
            let fetched = retry(self.policy, &label, || self.fetch_one(url, &path)).await;
            match fetched {
                Ok(()) => {
                    info!("{} downloaded to {}", label, path.display());
                    saved.push(path);
                }
                Err(e) => warn!("{} dropped after retries: {}", label, e),
            }
        }
        saved
    }

    async fn fetch_one(&self, url: &str, path: &Path) -> anyhow::Result<()> {
        let resp = self
            .client
            .get(url)
            .header("Accept", IMAGE_ACCEPT)
            .timeout(std::time::Duration::from_secs(20))
            .send()
            .await?
            .error_for_status()?;
        let bytes = resp.bytes().await?;
        tokio::fs::write(path, &bytes).await?;
        Ok(())
    }
}

/// `product_<item_id>_<index+1>_<basename>` with filesystem-hostile
/// characters stripped; `.heic` tails cut; `.jpg` appended when no
/// extension survives.
fn cache_file_name(item_id: &str, index: usize, url: &str) -> String {
    let clean_url = url.split(".heic").next().unwrap_or(url);
    let base = clean_url
        .rsplit('/')
        .next()
        .unwrap_or("image")
        .split('?')
        .next()
        .unwrap_or("image");

    let mut name = format!("product_{}_{}_{}", item_id, index + 1, base);
    name.retain(|c| !matches!(c, '\\' | '/' | '*' | '?' | ':' | '"' | '<' | '>' | '|'));
    if Path::new(&name).extension().is_none() {
        name.push_str(".jpg");
    }
    name
}

/// Base64-encode image files for inline transport. Unreadable files are
/// skipped. Encoding is offloaded — a dozen photos is real CPU work.
pub async fn encode_base64(paths: &[PathBuf]) -> Vec<String> {
    let paths = paths.to_vec();
    let encoded = tokio::task::spawn_blocking(move || {
        paths
            .iter()
            .filter_map(|p| match std::fs::read(p) {
                Ok(bytes) => Some(base64::engine::general_purpose::STANDARD.encode(bytes)),
                Err(e) => {
                    warn!("image {} unreadable for encoding: {}", p.display(), e);
                    None
                }
            })
            .collect::<Vec<_>>()
    })
    .await;
    encoded.unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path as url_path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_cache_file_name_sanitizes() {
        let name = cache_file_name("42", 0, "https://cdn.example.com/ab/cd/photo.jpg?x-oss=1");
        assert_eq!(name, "product_42_1_photo.jpg");

        let heic = cache_file_name("42", 1, "https://cdn.example.com/raw.heic?sign=a*b");
        assert_eq!(heic, "product_42_2_raw.jpg");

        let bare = cache_file_name("9", 2, "https://cdn.example.com/noext");
        assert_eq!(bare, "product_9_3_noext.jpg");
    }

    #[tokio::test]
    async fn test_download_skips_existing_and_fetches_new() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(url_path("/new.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"jpegbytes".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(reqwest::Client::new(), dir.path().to_path_buf());

        // Pre-seed the cache entry for index 0.
        let cached_url = format!("{}/cached.jpg", server.uri());
        let new_url = format!("{}/new.jpg", server.uri());
        std::fs::write(dir.path().join(cache_file_name("7", 0, &cached_url)), b"old").unwrap();

        let saved = cache
            .download_all("7", &[cached_url, new_url, "not-a-url".into()])
            .await;
        assert_eq!(saved.len(), 2);
        assert!(saved[1].exists());
    }

    #[tokio::test]
    async fn test_failed_image_is_dropped_not_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let mut cache = ImageCache::new(reqwest::Client::new(), dir.path().to_path_buf());
        cache.policy = RetryPolicy::new(1, std::time::Duration::ZERO);

        let saved = cache
            .download_all("7", &[format!("{}/gone.jpg", server.uri())])
            .await;
        assert!(saved.is_empty());
    }

    #[tokio::test]
    async fn test_encode_base64_skips_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("a.jpg");
        std::fs::write(&good, b"abc").unwrap();
        let out = encode_base64(&[good, dir.path().join("missing.jpg")]).await;
        assert_eq!(out, vec!["YWJj".to_string()]);
    }
}
