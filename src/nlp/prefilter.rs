//! Semantic pre-filter — cheap relevance gate ahead of the expensive
//! detail-fetch + analysis pipeline.
//!
//! Uses a Model2Vec static embedding model to score a listing title against
//! the task's reference titles (cosine similarity, best-match wins). The
//! filter is an optional collaborator: when no model is configured or it
//! fails to load, **every item passes** — a broken filter must never cost
//! discoveries.

use std::sync::Arc;

use anyhow::{Context, Result};
use model2vec_rs::model::StaticModel;
use tracing::{debug, info, warn};

use crate::core::config::PrefilterSettings;

pub struct Prefilter {
    model: Option<Arc<StaticModel>>,
    threshold: f32,
}

impl Prefilter {
    /// Pass-all filter (no model).
    pub fn disabled() -> Self {
        Self {
            model: None,
            threshold: 0.0,
        }
    }

    /// Load the filter per settings. Any load failure degrades to pass-all.
    pub async fn from_settings(settings: &PrefilterSettings) -> Self {
        let Some(model_path) = settings.resolve_model_path() else {
            info!("no pre-filter model configured; all items will pass");
            return Self::disabled();
        };
        let threshold = settings.resolve_threshold();

        match load_model(model_path.clone()).await {
            Ok(model) => {
                info!(
                    "pre-filter model '{}' loaded (threshold {:.2})",
                    model_path, threshold
                );
                Self {
                    model: Some(model),
                    threshold,
                }
            }
            Err(e) => {
                warn!(
                    "pre-filter model '{}' unavailable ({}); all items will pass",
                    model_path, e
                );
                Self::disabled()
            }
        }
    }

    /// Should this title proceed to the expensive pipeline?
    ///
    /// `true` when the best cosine similarity against `references` meets the
    /// threshold — or unconditionally when the model is absent or the
    /// reference list is empty.
    pub async fn passes(&self, title: &str, references: &[String]) -> bool {
        let Some(model) = &self.model else {
            return true;
        };
        if references.is_empty() || title.trim().is_empty() {
            return true;
        }

        let model = Arc::clone(model);
        let title_owned = title.to_string();
        let refs_owned = references.to_vec();

        // Embedding encode is CPU-bound — keep it off the cooperative scheduler.
        let scored = tokio::task::spawn_blocking(move || {
            let title_vec = model.encode_single(&title_owned);
            refs_owned
                .iter()
                .map(|r| cosine_similarity(&title_vec, &model.encode_single(r)))
                .fold(f32::MIN, f32::max)
        })
        .await;

        match scored {
            Ok(best) => {
                let pass = best >= self.threshold;
                debug!(
                    "pre-filter: '{}' best similarity {:.3} (threshold {:.2}) → {}",
                    title,
                    best,
                    self.threshold,
                    if pass { "pass" } else { "drop" }
                );
                pass
            }
            Err(e) => {
                warn!("pre-filter scoring panicked ({}), passing item", e);
                true
            }
        }
    }
}

async fn load_model(model_path: String) -> Result<Arc<StaticModel>> {
    tokio::task::spawn_blocking(move || {
        StaticModel::from_pretrained(&model_path, None, None, None)
            .with_context(|| format!("loading Model2Vec model from '{}'", model_path))
            .map(Arc::new)
    })
    .await
    .context("model load task failed")?
}

/// Cosine similarity between two f32 vectors.
/// Returns 0.0 if either vector has zero magnitude.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }

    (dot / (mag_a * mag_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
        // Length mismatch is defined, not a panic.
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn test_disabled_filter_passes_everything() {
        let filter = Prefilter::disabled();
        assert!(filter.passes("anything at all", &["reference".into()]).await);
        assert!(filter.passes("", &[]).await);
    }

    #[tokio::test]
    async fn test_unloadable_model_degrades_to_pass_all() {
        let settings = PrefilterSettings {
            model_path: Some("/definitely/not/a/model".into()),
            threshold: Some(0.9),
        };
        let filter = Prefilter::from_settings(&settings).await;
        assert!(filter.passes("whatever", &["ref".into()]).await);
    }
}
