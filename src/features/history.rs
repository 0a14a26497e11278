//! Append-only record history + cross-run deduplication.
//!
//! One JSONL file per keyword under the results directory, one
//! [`UnifiedRecord`] per line. On open, the file is stream-read and each
//! line's dedup key goes into an in-memory set — individually malformed
//! lines are logged and skipped, never fatal.
//!
//! Commit ordering is the dedup invariant: a key enters the set only after
//! its record has been durably appended. A crash mid-item therefore leaves
//! that item reprocessable on the next run (at-least-once, never
//! silently-dropped).

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{info, warn};

use crate::core::types::UnifiedRecord;
use crate::core::Result;
use crate::scraping::parse::dedup_key;

pub struct HistoryStore {
    path: PathBuf,
    seen: HashSet<String>,
}

impl HistoryStore {
    /// Per-keyword history filename.
    pub fn filename_for(keyword: &str) -> String {
        format!("{}_full_data.jsonl", keyword.replace(' ', "_"))
    }

    /// Open the store for `keyword`, rebuilding the dedup set from any
    /// existing history.
    pub async fn open(results_dir: &Path, keyword: &str) -> Result<Self> {
        tokio::fs::create_dir_all(results_dir).await?;
        let path = results_dir.join(Self::filename_for(keyword));

        let mut seen = HashSet::new();
        match tokio::fs::File::open(&path).await {
            Ok(file) => {
                let mut lines = tokio::io::BufReader::new(file).lines();
                let mut line_no = 0usize;
                while let Some(line) = lines.next_line().await? {
                    line_no += 1;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<serde_json::Value>(&line) {
                        Ok(record) => {
                            let link = record
                                .get("item_info")
                                .and_then(|i| i.get("item_link"))
                                .and_then(|l| l.as_str())
                                .unwrap_or("");
                            if !link.is_empty() {
                                seen.insert(dedup_key(link).to_string());
                            }
                        }
                        Err(e) => {
                            warn!(
                                "{}:{}: unparseable history line skipped ({})",
                                path.display(),
                                line_no,
                                e
                            );
                        }
                    }
                }
                info!(
                    "History loaded from {}: {} processed items",
                    path.display(),
                    seen.len()
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No history at {}, starting fresh", path.display());
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { path, seen })
    }

    /// Has this dedup key already been processed (this run or any prior)?
    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Durably append `record`, then commit its dedup key. The key is only
    /// inserted once the line has been flushed to disk.
    pub async fn append(&mut self, record: &UnifiedRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| crate::core::ScoutError::parse("serializing record", e))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;

        self.seen
            .insert(dedup_key(&record.item_info.listing.item_link).to_string());
        Ok(())
    }
}
