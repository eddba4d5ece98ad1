//! Throttled progress reporting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Byte counters of one or more transfers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteProgress {
    /// Bytes transferred so far.
    pub current: u64,
    /// Total bytes expected, zero if unknown.
    pub total: u64,
}

impl ByteProgress {
    /// Creates byte counters.
    pub fn new(current: u64, total: u64) -> Self {
        Self { current, total }
    }

    /// Counters that are at least as far as both `self` and `other`.
    pub fn merge(self, other: Self) -> Self {
        Self {
            current: self.current.max(other.current),
            total: self.total.max(other.total),
        }
    }
}

/// Progress of a sync run as delivered to the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncProgress {
    /// Completed fraction, between 0 and 1.
    pub fraction: f64,
    /// Aggregated file bytes.
    pub bytes: ByteProgress,
    /// Label of the object currently being processed.
    pub label: Option<String>,
}

/// Callback receiving run progress.
pub type ProgressHandler = Arc<dyn Fn(&SyncProgress) + Send + Sync>;

/// Callback receiving byte progress of a single transfer.
pub type TransferProgress = Arc<dyn Fn(ByteProgress) + Send + Sync>;

struct ReporterState {
    last_report: Option<Instant>,
    current: SyncProgress,
}

/// Delivers progress to a handler at most once per interval.
///
/// Updates in between are merged; [`flush`](Self::flush) always delivers the
/// latest state.
pub struct ProgressReporter {
    handler: Option<ProgressHandler>,
    interval: Duration,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    /// Creates a reporter.
    pub fn new(handler: Option<ProgressHandler>, interval: Duration) -> Self {
        Self {
            handler,
            interval,
            state: Mutex::new(ReporterState {
                last_report: None,
                current: SyncProgress::default(),
            }),
        }
    }

    /// A reporter that drops every update.
    pub fn disabled() -> Self {
        Self::new(None, Duration::ZERO)
    }

    /// Updates the completed fraction and the current label.
    ///
    /// The fraction never decreases over the life of the reporter; a lower
    /// estimate keeps the previous value.
    pub fn set_fraction(&self, fraction: f64, label: Option<String>) {
        self.update(|progress| {
            progress.fraction = fraction.clamp(0.0, 1.0).max(progress.fraction);
            if label.is_some() {
                progress.label = label;
            }
        });
    }

    /// Updates the aggregated byte counters.
    ///
    /// Totals computed on different threads may arrive out of order, so the
    /// counters never go back.
    pub fn set_bytes(&self, bytes: ByteProgress) {
        self.update(|progress| progress.bytes = progress.bytes.merge(bytes));
    }

    /// Applies `f` to the current state and reports it unless throttled.
    pub fn update(&self, f: impl FnOnce(&mut SyncProgress)) {
        let snapshot = {
            let mut state = self.state.lock();
            f(&mut state.current);
            if self.handler.is_none() {
                return;
            }
            let now = Instant::now();
            let due = state
                .last_report
                .map_or(true, |last| now.duration_since(last) >= self.interval);
            if !due {
                return;
            }
            state.last_report = Some(now);
            state.current.clone()
        };
        if let Some(handler) = &self.handler {
            handler(&snapshot);
        }
    }

    /// Reports the current state regardless of the interval.
    pub fn flush(&self) {
        let Some(handler) = &self.handler else {
            return;
        };
        let snapshot = {
            let mut state = self.state.lock();
            state.last_report = Some(Instant::now());
            state.current.clone()
        };
        handler(&snapshot);
    }

    /// Latest state, reported or not.
    pub fn current(&self) -> SyncProgress {
        self.state.lock().current.clone()
    }
}

/// Sums the byte progress of concurrent transfers.
///
/// Each transfer's counters only ever grow, so the sum never decreases even
/// when a transfer reports out of order.
#[derive(Debug)]
pub struct ByteAggregator<K> {
    entries: Mutex<HashMap<K, ByteProgress>>,
}

impl<K: Eq + Hash> ByteAggregator<K> {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Records the progress of one transfer and returns the new total.
    pub fn update(&self, key: K, progress: ByteProgress) -> ByteProgress {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_default();
        entry.current = entry.current.max(progress.current);
        entry.total = entry.total.max(progress.total);
        Self::sum(&entries)
    }

    /// Marks a transfer as complete.
    pub fn complete(&self, key: K) -> ByteProgress {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key).or_default();
        entry.current = entry.current.max(entry.total);
        entry.total = entry.current;
        Self::sum(&entries)
    }

    /// Current sum.
    pub fn total(&self) -> ByteProgress {
        Self::sum(&self.entries.lock())
    }

    fn sum(entries: &HashMap<K, ByteProgress>) -> ByteProgress {
        entries.values().fold(ByteProgress::default(), |acc, p| {
            ByteProgress::new(acc.current + p.current, acc.total + p.total)
        })
    }
}

impl<K: Eq + Hash> Default for ByteAggregator<K> {
    fn default() -> Self {
        Self::new()
    }
}
