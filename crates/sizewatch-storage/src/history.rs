//! Append-only size history, partitioned by subject and sorted by timestamp.
//!
//! A secondary `(subject, size_bytes, ts)` ordering answers "largest snapshot"
//! queries without scanning the partition.
use async_trait::async_trait;
use parking_lot::Mutex;
use sizewatch_common::HistoryRecord;
use std::collections::{BTreeMap, BTreeSet};

use crate::Result;

#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Append a snapshot. If the subject already has a record at `record.ts`
    /// the new one moves to the next free millisecond; the stored record is
    /// returned.
    async fn append(&self, record: HistoryRecord) -> Result<HistoryRecord>;

    /// Records with `from_ts <= ts <= to_ts`, ascending by ts.
    async fn range(&self, subject: &str, from_ts: u64, to_ts: u64) -> Result<Vec<HistoryRecord>>;

    /// Record with the largest size; ties resolve to the newest.
    async fn largest(&self, subject: &str) -> Result<Option<HistoryRecord>>;

    async fn latest(&self, subject: &str) -> Result<Option<HistoryRecord>>;

    fn backend_name(&self) -> &'static str;

    fn is_durable(&self) -> bool {
        false
    }
}

/// In-memory index shared by every history backend.
#[derive(Debug, Default)]
pub(crate) struct HistoryIndex {
    by_ts: BTreeMap<(String, u64), HistoryRecord>,
    by_size: BTreeSet<(String, u64, u64)>,
}

impl HistoryIndex {
    /// First timestamp at or after `ts` not yet used by `subject`.
    pub(crate) fn next_free_ts(&self, subject: &str, ts: u64) -> u64 {
        let mut candidate = ts;
        // Keys are contiguous only when collisions pile up, so this stays short.
        for ((_, used), _) in self
            .by_ts
            .range((subject.to_string(), ts)..=(subject.to_string(), u64::MAX))
        {
            if *used != candidate {
                break;
            }
            candidate = candidate.saturating_add(1);
        }
        candidate
    }

    /// Insert as-is; callers place the record with `next_free_ts` first.
    pub(crate) fn insert(&mut self, record: HistoryRecord) {
        self.by_size
            .insert((record.subject.clone(), record.size_bytes, record.ts));
        self.by_ts
            .insert((record.subject.clone(), record.ts), record);
    }

    pub(crate) fn range(&self, subject: &str, from_ts: u64, to_ts: u64) -> Vec<HistoryRecord> {
        if from_ts > to_ts {
            return Vec::new();
        }
        self.by_ts
            .range((subject.to_string(), from_ts)..=(subject.to_string(), to_ts))
            .map(|(_, record)| record.clone())
            .collect()
    }

    pub(crate) fn largest(&self, subject: &str) -> Option<HistoryRecord> {
        let (_, _, ts) = self
            .by_size
            .range((subject.to_string(), 0, 0)..=(subject.to_string(), u64::MAX, u64::MAX))
            .next_back()?;
        self.by_ts.get(&(subject.to_string(), *ts)).cloned()
    }

    pub(crate) fn latest(&self, subject: &str) -> Option<HistoryRecord> {
        self.by_ts
            .range((subject.to_string(), 0)..=(subject.to_string(), u64::MAX))
            .next_back()
            .map(|(_, record)| record.clone())
    }

    pub(crate) fn len(&self) -> usize {
        self.by_ts.len()
    }
}

#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    index: Mutex<HistoryIndex>,
}

impl MemoryHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl HistoryStore for MemoryHistoryStore {
    async fn append(&self, mut record: HistoryRecord) -> Result<HistoryRecord> {
        let mut index = self.index.lock();
        record.ts = index.next_free_ts(&record.subject, record.ts);
        index.insert(record.clone());
        Ok(record)
    }

    async fn range(&self, subject: &str, from_ts: u64, to_ts: u64) -> Result<Vec<HistoryRecord>> {
        Ok(self.index.lock().range(subject, from_ts, to_ts))
    }

    async fn largest(&self, subject: &str) -> Result<Option<HistoryRecord>> {
        Ok(self.index.lock().largest(subject))
    }

    async fn latest(&self, subject: &str) -> Result<Option<HistoryRecord>> {
        Ok(self.index.lock().latest(subject))
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
