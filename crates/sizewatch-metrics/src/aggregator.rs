//! Tumbling-window sum aggregation.
//!
//! Windows are `[k * period, (k + 1) * period)` in epoch milliseconds. Each
//! window closes once, when `close_through` passes its end; a value whose
//! window has already closed is late and only counted. A window that saw no
//! values produces no [`Metric`], which the alarm reads as missing data.
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};

use crate::{MetricsError, Result};

/// One closed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    pub name: String,
    pub window_start_ms: u64,
    pub window_end_ms: u64,
    pub value: f64,
    pub sample_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Accepted,
    Late,
}

#[derive(Debug, Clone, Copy, Default)]
struct OpenWindow {
    sum: f64,
    count: u64,
}

#[derive(Debug)]
pub struct WindowedAggregator {
    name: String,
    period_ms: u64,
    lookback: usize,
    open: BTreeMap<u64, OpenWindow>,
    closed: VecDeque<Metric>,
    // Start of the oldest window that may still accept values.
    watermark_ms: u64,
    late_records: u64,
}

impl WindowedAggregator {
    pub fn new(name: impl Into<String>, period_ms: u64, lookback: usize) -> Result<Self> {
        if period_ms == 0 {
            return Err(MetricsError::InvalidPeriod);
        }
        if lookback == 0 {
            return Err(MetricsError::InvalidLookback);
        }
        Ok(Self {
            name: name.into(),
            period_ms,
            lookback,
            open: BTreeMap::new(),
            closed: VecDeque::new(),
            watermark_ms: 0,
            late_records: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    pub fn lookback(&self) -> usize {
        self.lookback
    }

    pub fn window_start(&self, time_ms: u64) -> u64 {
        time_ms - time_ms % self.period_ms
    }

    pub fn record(&mut self, value: f64, time_ms: u64) -> RecordOutcome {
        let start = self.window_start(time_ms);
        if start < self.watermark_ms {
            self.late_records += 1;
            metrics::counter!("sizewatch_metric_late_records_total", "metric" => self.name.clone())
                .increment(1);
            tracing::debug!(metric = %self.name, time_ms, "dropping late metric value");
            return RecordOutcome::Late;
        }
        let window = self.open.entry(start).or_default();
        window.sum += value;
        window.count += 1;
        RecordOutcome::Accepted
    }

    /// Sum of the newest window that is still open; 0 when it has no values.
    pub fn current_window_sum(&self) -> f64 {
        self.open
            .last_key_value()
            .filter(|(start, _)| **start >= self.watermark_ms)
            .map_or(0.0, |(_, window)| window.sum)
    }

    /// Close every window whose end is at or before `now_ms` and return the
    /// newly produced samples in window order.
    pub fn close_through(&mut self, now_ms: u64) -> Vec<Metric> {
        let watermark = self.window_start(now_ms);
        if watermark <= self.watermark_ms {
            return Vec::new();
        }
        self.watermark_ms = watermark;
        let still_open = self.open.split_off(&watermark);
        let finished = std::mem::replace(&mut self.open, still_open);

        let mut produced = Vec::with_capacity(finished.len());
        for (start, window) in finished {
            let metric = Metric {
                name: self.name.clone(),
                window_start_ms: start,
                window_end_ms: start + self.period_ms,
                value: window.sum,
                sample_count: window.count,
            };
            self.closed.push_back(metric.clone());
            produced.push(metric);
        }
        while self.closed.len() > self.lookback {
            self.closed.pop_front();
        }
        produced
    }

    pub fn latest_closed(&self) -> Option<&Metric> {
        self.closed.back()
    }

    /// Sample of the closed window starting at `window_start_ms`, if it had data.
    pub fn sample_for(&self, window_start_ms: u64) -> Option<&Metric> {
        self.closed
            .iter()
            .rev()
            .find(|metric| metric.window_start_ms == window_start_ms)
    }

    pub fn samples(&self) -> Vec<Metric> {
        self.closed.iter().cloned().collect()
    }

    pub fn late_records(&self) -> u64 {
        self.late_records
    }
}
