//! Traffic shaping: every site-facing step sits behind a randomized wait so
//! the request cadence never settles into a machine-regular pattern.

use std::time::Duration;

use tracing::debug;

/// Request delay bounds in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct RequestDelay {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl RequestDelay {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    /// Between two items on the same page.
    pub const fn between_items() -> Self {
        Self::new(3_000, 6_000)
    }

    /// After an item has been fully processed — the long "user is reading"
    /// interval that dominates the run's pacing.
    pub const fn after_item() -> Self {
        Self::new(15_000, 30_000)
    }

    /// Between result pages.
    pub const fn between_pages() -> Self {
        Self::new(25_000, 50_000)
    }

    /// After closing a detail page.
    pub const fn after_detail_close() -> Self {
        Self::new(2_000, 4_000)
    }

    /// Draw a delay from the configured range.
    pub fn sample(&self) -> Duration {
        use rand::RngExt;
        let mut rng = rand::rng();
        let ms = if self.max_ms > self.min_ms {
            rng.random_range(self.min_ms..=self.max_ms)
        } else {
            self.min_ms
        };
        Duration::from_millis(ms)
    }

    /// Sleep for a freshly drawn delay.
    pub async fn pause(&self) {
        let d = self.sample();
        debug!(
            "pacing: waiting {:.2}s (range {:.1}-{:.1}s)",
            d.as_secs_f64(),
            self.min_ms as f64 / 1000.0,
            self.max_ms as f64 / 1000.0
        );
        tokio::time::sleep(d).await;
    }
}

/// One-off randomized pause in whole seconds.
pub async fn random_pause(min_secs: f64, max_secs: f64) {
    RequestDelay::new((min_secs * 1000.0) as u64, (max_secs * 1000.0) as u64)
        .pause()
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_stays_in_range() {
        let delay = RequestDelay::new(50, 120);
        for _ in 0..200 {
            let d = delay.sample().as_millis() as u64;
            assert!((50..=120).contains(&d), "sampled {} out of range", d);
        }
    }

    #[test]
    fn test_degenerate_range() {
        let delay = RequestDelay::new(80, 80);
        assert_eq!(delay.sample().as_millis(), 80);
    }

    #[tokio::test]
    async fn test_pause_actually_waits() {
        let start = std::time::Instant::now();
        RequestDelay::new(30, 40).pause().await;
        assert!(start.elapsed().as_millis() >= 30);
    }
}
