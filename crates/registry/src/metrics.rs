//! Registry metrics.
//!
//! [`RegistryMetrics`] counts registry operations and their failure modes and keeps a sliding
//! window of read and write latencies for percentile reporting. It is cheap to clone; clones
//! share the same counters.
//!
//! # Memory Ordering
//!
//! All atomics use `Ordering::Relaxed`. Each counter is independent and monotonically
//! increasing, so a snapshot may show counters from slightly different instants relative to
//! each other. Dashboards aggregate over time and do not depend on cross-counter consistency.
//!
//! # Usage
//!
//! ```
//! use std::time::Duration;
//!
//! use tessera_registry::RegistryMetrics;
//!
//! let metrics = RegistryMetrics::new();
//! metrics.record_read(Duration::from_micros(120), true);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.reads, 1);
//! assert_eq!(snapshot.read_percentiles.p50, 120);
//! ```

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use parking_lot::Mutex;

/// Number of latency samples retained per histogram.
const HISTOGRAM_WINDOW_SIZE: usize = 1024;

/// Latency percentiles in microseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyPercentiles {
    /// Median.
    pub p50: u64,
    /// 95th percentile.
    pub p95: u64,
    /// 99th percentile.
    pub p99: u64,
}

/// Bounded circular buffer of latency samples.
struct LatencyHistogram {
    inner: Mutex<HistogramInner>,
}

struct HistogramInner {
    buf: Vec<u64>,
    pos: usize,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self { inner: Mutex::new(HistogramInner { buf: Vec::with_capacity(HISTOGRAM_WINDOW_SIZE), pos: 0 }) }
    }

    fn record(&self, value_us: u64) {
        let mut inner = self.inner.lock();
        let pos = inner.pos;
        if inner.buf.len() < HISTOGRAM_WINDOW_SIZE {
            inner.buf.push(value_us);
        } else {
            inner.buf[pos] = value_us;
        }
        inner.pos = (pos + 1) % HISTOGRAM_WINDOW_SIZE;
    }

    fn percentiles(&self) -> LatencyPercentiles {
        let mut sorted = self.inner.lock().buf.clone();
        if sorted.is_empty() {
            return LatencyPercentiles::default();
        }
        sorted.sort_unstable();
        let len = sorted.len();
        LatencyPercentiles {
            p50: sorted[percentile_index(len, 50)],
            p95: sorted[percentile_index(len, 95)],
            p99: sorted[percentile_index(len, 99)],
        }
    }
}

/// Nearest-rank index: `ceil(percentile/100 * len) - 1`, clamped.
fn percentile_index(len: usize, percentile: u32) -> usize {
    let rank = (u64::from(percentile) * len as u64).div_ceil(100) as usize;
    rank.saturating_sub(1).min(len.saturating_sub(1))
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Ticket lookups.
    pub reads: u64,
    /// Lookups that returned a ticket.
    pub read_hits: u64,
    /// Tickets added.
    pub adds: u64,
    /// Tickets updated.
    pub updates: u64,
    /// Deletions requested.
    pub deletes: u64,
    /// Tickets physically removed, descendants included.
    pub tickets_removed: u64,
    /// Deletions that left descendants behind.
    pub partial_deletions: u64,
    /// Adds rejected because the id existed.
    pub duplicates: u64,
    /// Stored records that failed to decode.
    pub decode_failures: u64,
    /// Tickets found expired when read.
    pub expired_on_read: u64,
    /// Operations that surfaced as unavailable.
    pub unavailable: u64,
    /// Backend calls cut by the operation timeout.
    pub timeouts: u64,
    /// Retries after transient errors.
    pub retries: u64,
    /// Operations that failed after exhausting retries.
    pub retries_exhausted: u64,
    /// Completed cleaner passes.
    pub cleaner_runs: u64,
    /// Tickets removed by the cleaner.
    pub cleaner_removed: u64,
    /// Replication events published.
    pub events_published: u64,
    /// Replication events applied from other nodes.
    pub events_applied: u64,
    /// Replication events ignored as our own echoes.
    pub events_ignored: u64,
    /// Read latency percentiles.
    pub read_percentiles: LatencyPercentiles,
    /// Write latency percentiles.
    pub write_percentiles: LatencyPercentiles,
}

impl MetricsSnapshot {
    /// Fraction of reads that returned a ticket.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        if self.reads == 0 { 0.0 } else { self.read_hits as f64 / self.reads as f64 }
    }
}

/// Shared registry counters.
#[derive(Clone)]
pub struct RegistryMetrics {
    inner: Arc<MetricsInner>,
}

#[derive(Default)]
struct Counters {
    reads: AtomicU64,
    read_hits: AtomicU64,
    adds: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    tickets_removed: AtomicU64,
    partial_deletions: AtomicU64,
    duplicates: AtomicU64,
    decode_failures: AtomicU64,
    expired_on_read: AtomicU64,
    unavailable: AtomicU64,
    timeouts: AtomicU64,
    retries: AtomicU64,
    retries_exhausted: AtomicU64,
    cleaner_runs: AtomicU64,
    cleaner_removed: AtomicU64,
    events_published: AtomicU64,
    events_applied: AtomicU64,
    events_ignored: AtomicU64,
}

struct MetricsInner {
    counters: Counters,
    read_histogram: LatencyHistogram,
    write_histogram: LatencyHistogram,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl RegistryMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                counters: Counters::default(),
                read_histogram: LatencyHistogram::new(),
                write_histogram: LatencyHistogram::new(),
            }),
        }
    }

    /// Records a lookup and whether it found a ticket.
    pub fn record_read(&self, duration: Duration, hit: bool) {
        bump(&self.inner.counters.reads);
        if hit {
            bump(&self.inner.counters.read_hits);
        }
        self.inner.read_histogram.record(duration.as_micros() as u64);
    }

    /// Records an add.
    pub fn record_add(&self, duration: Duration) {
        bump(&self.inner.counters.adds);
        self.inner.write_histogram.record(duration.as_micros() as u64);
    }

    /// Records an update.
    pub fn record_update(&self, duration: Duration) {
        bump(&self.inner.counters.updates);
        self.inner.write_histogram.record(duration.as_micros() as u64);
    }

    /// Records a deletion that physically removed `removed` tickets.
    pub fn record_delete(&self, duration: Duration, removed: u64) {
        bump(&self.inner.counters.deletes);
        self.inner.counters.tickets_removed.fetch_add(removed, Ordering::Relaxed);
        self.inner.write_histogram.record(duration.as_micros() as u64);
    }

    /// Records a deletion that left descendants behind.
    pub fn record_partial_deletion(&self) {
        bump(&self.inner.counters.partial_deletions);
    }

    /// Records an id collision on add.
    pub fn record_duplicate(&self) {
        bump(&self.inner.counters.duplicates);
    }

    /// Records a record that failed to decode.
    pub fn record_decode_failure(&self) {
        bump(&self.inner.counters.decode_failures);
    }

    /// Records a ticket found expired on read.
    pub fn record_expired_on_read(&self) {
        bump(&self.inner.counters.expired_on_read);
    }

    /// Records an operation that surfaced as unavailable.
    pub fn record_unavailable(&self) {
        bump(&self.inner.counters.unavailable);
    }

    /// Records a backend call cut by the operation timeout.
    pub fn record_timeout(&self) {
        bump(&self.inner.counters.timeouts);
    }

    /// Records a retry after a transient error.
    pub fn record_retry(&self) {
        bump(&self.inner.counters.retries);
    }

    /// Records an operation that failed after exhausting its retries.
    pub fn record_retry_exhausted(&self) {
        bump(&self.inner.counters.retries_exhausted);
    }

    /// Records a completed cleaner pass that removed `removed` tickets.
    pub fn record_cleaner_run(&self, removed: u64) {
        bump(&self.inner.counters.cleaner_runs);
        self.inner.counters.cleaner_removed.fetch_add(removed, Ordering::Relaxed);
    }

    /// Records a published replication event.
    pub fn record_event_published(&self) {
        bump(&self.inner.counters.events_published);
    }

    /// Records an applied replication event.
    pub fn record_event_applied(&self) {
        bump(&self.inner.counters.events_applied);
    }

    /// Records a replication event dropped as our own echo.
    pub fn record_event_ignored(&self) {
        bump(&self.inner.counters.events_ignored);
    }

    /// Copies every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let c = &self.inner.counters;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            reads: load(&c.reads),
            read_hits: load(&c.read_hits),
            adds: load(&c.adds),
            updates: load(&c.updates),
            deletes: load(&c.deletes),
            tickets_removed: load(&c.tickets_removed),
            partial_deletions: load(&c.partial_deletions),
            duplicates: load(&c.duplicates),
            decode_failures: load(&c.decode_failures),
            expired_on_read: load(&c.expired_on_read),
            unavailable: load(&c.unavailable),
            timeouts: load(&c.timeouts),
            retries: load(&c.retries),
            retries_exhausted: load(&c.retries_exhausted),
            cleaner_runs: load(&c.cleaner_runs),
            cleaner_removed: load(&c.cleaner_removed),
            events_published: load(&c.events_published),
            events_applied: load(&c.events_applied),
            events_ignored: load(&c.events_ignored),
            read_percentiles: self.inner.read_histogram.percentiles(),
            write_percentiles: self.inner.write_histogram.percentiles(),
        }
    }

    /// Logs the current snapshot at INFO, and a warning when decode failures or unavailability
    /// were observed.
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        tracing::info!(
            reads = s.reads,
            hit_rate = s.hit_rate(),
            adds = s.adds,
            updates = s.updates,
            deletes = s.deletes,
            tickets_removed = s.tickets_removed,
            read_p99_us = s.read_percentiles.p99,
            write_p99_us = s.write_percentiles.p99,
            retries = s.retries,
            cleaner_removed = s.cleaner_removed,
            "ticket registry metrics"
        );
        if s.decode_failures > 0 || s.unavailable > 0 {
            tracing::warn!(
                decode_failures = s.decode_failures,
                unavailable = s.unavailable,
                timeouts = s.timeouts,
                "ticket registry degraded"
            );
        }
    }
}

impl Default for RegistryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RegistryMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryMetrics").finish_non_exhaustive()
    }
}
