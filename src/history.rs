use std::sync::{Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::AnalysisResult;
use crate::error::PipelineError;
use crate::store::{AppendLog, MemoryLog};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: u64,
    pub filename: String,
    pub file_hash: String,
    pub analysis: AnalysisResult,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl HistoryQuery {
    pub fn for_filename(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }
}

pub type HistoryLog = Box<dyn AppendLog<HistoryEntry>>;

/// Append-only log of analysis results, queryable by filename.
pub struct HistoryStore {
    writer: Mutex<HistoryLog>,
    entries: RwLock<Vec<HistoryEntry>>,
}

impl HistoryStore {
    pub fn open(mut log: HistoryLog) -> Result<Self, PipelineError> {
        let entries = log.load()?;
        tracing::debug!(entries = entries.len(), "history opened");
        Ok(Self {
            writer: Mutex::new(log),
            entries: RwLock::new(entries),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            writer: Mutex::new(Box::new(MemoryLog::new())),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn close(self) -> Result<(), PipelineError> {
        let mut log = self
            .writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        log.flush()
    }

    /// Appends and publishes an entry. During ingestion this runs while the
    /// ledger block is staged but not yet committed, so a concurrent reader
    /// may see the entry a moment before the block.
    pub fn record(
        &self,
        filename: &str,
        file_hash: &str,
        analysis: AnalysisResult,
        timestamp: DateTime<Utc>,
    ) -> Result<HistoryEntry, PipelineError> {
        let mut log = self
            .writer
            .lock()
            .map_err(|_| PipelineError::storage("history writer lock poisoned"))?;

        let id = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .map_or(1, |entry| entry.id + 1);
        let entry = HistoryEntry {
            id,
            filename: filename.to_string(),
            file_hash: file_hash.to_string(),
            analysis,
            timestamp,
        };
        log.append(&entry)?;

        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.clone());
        Ok(entry)
    }

    /// Whether an entry was recorded for exactly this ingestion.
    pub fn contains(&self, filename: &str, file_hash: &str, timestamp: DateTime<Utc>) -> bool {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .any(|entry| {
                entry.timestamp == timestamp
                    && entry.filename == filename
                    && entry.file_hash == file_hash
            })
    }

    /// Most recent first; `limit` of `None` or `0` returns every match.
    pub fn query(&self, query: &HistoryQuery) -> Vec<HistoryEntry> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut matches: Vec<HistoryEntry> = entries
            .iter()
            .filter(|entry| {
                query
                    .filename
                    .as_deref()
                    .is_none_or(|name| entry.filename == name)
            })
            .cloned()
            .collect();
        drop(entries);

        matches.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then(b.id.cmp(&a.id)));
        if let Some(limit) = query.limit.filter(|limit| *limit > 0) {
            matches.truncate(limit);
        }
        matches
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use chrono::TimeZone;

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn result(length: u64) -> AnalysisResult {
        AnalysisResult {
            length,
            gc_percent: 50.0,
            sequence_preview: "ACGT".to_string(),
        }
    }

    #[test]
    fn filters_by_filename_newest_first() {
        let history = HistoryStore::in_memory();
        history.record("a.fasta", "h1", result(1), at(0)).unwrap();
        history.record("b.fasta", "h2", result(2), at(1)).unwrap();
        history.record("a.fasta", "h3", result(3), at(2)).unwrap();

        let found = history.query(&HistoryQuery::for_filename("a.fasta"));
        let hashes: Vec<_> = found.iter().map(|e| e.file_hash.as_str()).collect();
        assert_eq!(hashes, vec!["h3", "h1"]);
    }

    #[test]
    fn limit_caps_results() {
        let history = HistoryStore::in_memory();
        for n in 0..5 {
            history.record("a.fasta", "h", result(n), at(n as i64)).unwrap();
        }
        let capped = history.query(&HistoryQuery::default().with_limit(Some(2)));
        assert_eq!(capped.len(), 2);
        assert_eq!(capped[0].analysis.length, 4);
        let uncapped = history.query(&HistoryQuery::default().with_limit(Some(0)));
        assert_eq!(uncapped.len(), 5);
    }

    #[test]
    fn unknown_filename_is_empty() {
        let history = HistoryStore::in_memory();
        history.record("a.fasta", "h", result(1), at(0)).unwrap();
        assert!(history.query(&HistoryQuery::for_filename("zzz.fasta")).is_empty());
    }

    #[test]
    fn same_timestamp_orders_by_id() {
        let history = HistoryStore::in_memory();
        let first = history.record("a.fasta", "h1", result(1), at(0)).unwrap();
        let second = history.record("a.fasta", "h2", result(2), at(0)).unwrap();
        assert!(second.id > first.id);
        let found = history.query(&HistoryQuery::default());
        assert_eq!(found[0].id, second.id);
    }

    #[test]
    fn contains_matches_the_exact_ingestion() {
        let history = HistoryStore::in_memory();
        history.record("a.fasta", "h1", result(1), at(5)).unwrap();
        assert!(history.contains("a.fasta", "h1", at(5)));
        assert!(!history.contains("a.fasta", "h1", at(6)));
        assert!(!history.contains("a.fasta", "h2", at(5)));
        assert!(!history.contains("b.fasta", "h1", at(5)));
    }

    #[test]
    fn concurrent_records_are_all_kept() {
        let history = Arc::new(HistoryStore::in_memory());
        let handles: Vec<_> = (0..16)
            .map(|n| {
                let history = Arc::clone(&history);
                thread::spawn(move || {
                    history
                        .record(&format!("f{n}.fasta"), "h", result(n), at(n as i64))
                        .unwrap()
                        .id
                })
            })
            .collect();
        let mut ids: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ids.sort_unstable();
        assert_eq!(ids, (1..=16).collect::<Vec<_>>());
        assert_eq!(history.len(), 16);
    }
}
