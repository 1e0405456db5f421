//! Bounded refresh history, persisted as newline-delimited JSON

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use crate::models::RefreshRecord;
use crate::services::output::write_atomic;

pub struct RefreshHistory {
    path: PathBuf,
    limit: usize,
    records: Mutex<VecDeque<RefreshRecord>>,
}

impl RefreshHistory {
    /// Load existing records from `path`, keeping the newest `limit`.
    ///
    /// Unreadable lines are skipped; a missing file starts empty.
    pub async fn load(path: impl Into<PathBuf>, limit: usize) -> Self {
        let path = path.into();
        let limit = limit.max(1);
        let mut records = VecDeque::with_capacity(limit);

        match tokio::fs::read_to_string(&path).await {
            Ok(text) => {
                let mut skipped = 0usize;
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<RefreshRecord>(line) {
                        Ok(record) => {
                            if records.len() == limit {
                                records.pop_front();
                            }
                            records.push_back(record);
                        }
                        Err(_) => skipped += 1,
                    }
                }
                if skipped > 0 {
                    tracing::warn!(path = %path.display(), skipped, "Unreadable history lines skipped");
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to read refresh history");
            }
        }

        Self {
            path,
            limit,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record and rewrite the file
    pub async fn push(&self, record: RefreshRecord) {
        let snapshot = {
            let mut records = self.records.lock().await;
            if records.len() == self.limit {
                records.pop_front();
            }
            records.push_back(record);

            let mut buf = Vec::with_capacity(records.len() * 512);
            for r in records.iter() {
                match serde_json::to_vec(r) {
                    Ok(line) => {
                        buf.extend_from_slice(&line);
                        buf.push(b'\n');
                    }
                    Err(e) => tracing::warn!(id = %r.id, error = %e, "History record not serializable"),
                }
            }
            buf
        };

        if let Err(e) = write_atomic(&self.path, &snapshot).await {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to persist refresh history");
        }
    }

    /// Newest first
    pub async fn recent(&self, limit: usize) -> Vec<RefreshRecord> {
        let records = self.records.lock().await;
        records.iter().rev().take(limit).cloned().collect()
    }

    pub async fn last(&self) -> Option<RefreshRecord> {
        self.records.lock().await.back().cloned()
    }

    /// Most recent record with a non-failed outcome
    pub async fn last_success(&self) -> Option<RefreshRecord> {
        let records = self.records.lock().await;
        records
            .iter()
            .rev()
            .find(|r| r.outcome != crate::models::RefreshOutcome::Failed)
            .cloned()
    }
}
