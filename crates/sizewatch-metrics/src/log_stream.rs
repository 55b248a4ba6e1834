use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::{MetricsError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub seq: u64,
    pub timestamp_ms: u64,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogBatch {
    pub lines: Vec<LogLine>,
    /// Cursor to pass to the next `read_from`.
    pub next_cursor: u64,
    /// Lines evicted before this reader got to them.
    pub skipped: u64,
}

#[derive(Debug)]
struct Inner {
    lines: VecDeque<LogLine>,
    next_seq: u64,
}

/// Append-only, bounded stream of log lines addressed by sequence number.
///
/// Readers keep their own cursor; the stream never tracks consumers. Once
/// full, the oldest line is evicted for every append.
#[derive(Debug)]
pub struct LogStream {
    name: String,
    capacity: usize,
    inner: Mutex<Inner>,
}

impl LogStream {
    pub fn new(name: impl Into<String>, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(MetricsError::InvalidCapacity);
        }
        Ok(Self {
            name: name.into(),
            capacity,
            inner: Mutex::new(Inner {
                lines: VecDeque::new(),
                next_seq: 0,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a line and return its sequence number.
    pub fn append(&self, timestamp_ms: u64, message: impl Into<String>) -> u64 {
        let mut inner = self.inner.lock();
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.lines.push_back(LogLine {
            seq,
            timestamp_ms,
            message: message.into(),
        });
        if inner.lines.len() > self.capacity {
            inner.lines.pop_front();
            metrics::counter!("sizewatch_log_stream_evicted_total", "stream" => self.name.clone())
                .increment(1);
        }
        seq
    }

    /// Read up to `max` lines starting at `cursor`.
    pub fn read_from(&self, cursor: u64, max: usize) -> LogBatch {
        let inner = self.inner.lock();
        let first_seq = inner.lines.front().map_or(inner.next_seq, |line| line.seq);
        let start = cursor.max(first_seq);
        let skipped = start - cursor.min(start);
        let offset = (start - first_seq) as usize;
        let lines: Vec<LogLine> = inner.lines.iter().skip(offset).take(max).cloned().collect();
        let next_cursor = lines.last().map_or(start, |line| line.seq + 1);
        LogBatch {
            lines,
            next_cursor,
            skipped,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number the next append will receive.
    pub fn next_seq(&self) -> u64 {
        self.inner.lock().next_seq
    }
}
