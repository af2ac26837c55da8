//! Prometheus counters for the config server
//!
//! One [`Metrics`] registry is shared by every component of a cluster and
//! rendered as text by `GET /metrics`, next to gauges read from the metadata
//! store at scrape time.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Upper bounds, in milliseconds, of the critical-section histogram buckets
const CRITICAL_SECTION_BUCKETS_MS: [u64; 8] = [1, 5, 10, 50, 100, 500, 1_000, 5_000];

#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Fixed-bucket histogram of millisecond durations
#[derive(Debug)]
pub struct Histogram {
    bounds: &'static [u64],
    /// One slot per bound plus the overflow slot
    slots: Vec<AtomicU64>,
    sum_ms: AtomicU64,
}

impl Histogram {
    fn new(bounds: &'static [u64]) -> Self {
        Self {
            bounds,
            slots: (0..=bounds.len()).map(|_| AtomicU64::new(0)).collect(),
            sum_ms: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let ms = crate::common::duration_millis(elapsed);
        let slot = self
            .bounds
            .iter()
            .position(|&b| ms <= b)
            .unwrap_or(self.bounds.len());
        self.slots[slot].fetch_add(1, Ordering::Relaxed);
        self.sum_ms.fetch_add(ms, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.slots.iter().map(|s| s.load(Ordering::Relaxed)).sum()
    }

    /// `(le, cumulative count)` pairs; `None` is the `+Inf` bucket.
    pub fn cumulative(&self) -> Vec<(Option<u64>, u64)> {
        let mut total = 0;
        let mut out = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            total += slot.load(Ordering::Relaxed);
            out.push((self.bounds.get(i).copied(), total));
        }
        out
    }
}

#[derive(Debug)]
pub struct Metrics {
    pub migrations_started: Counter,
    pub migrations_committed: Counter,
    pub migrations_aborted: Counter,
    pub critical_section: Histogram,
    pub range_deletions: Counter,
    pub orphans_deleted: Counter,
    pub routing_refreshes: Counter,
    pub stale_version_signals: Counter,
    pub consistency_checks: Counter,
    pub fatal_inconsistencies: Counter,
    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            migrations_started: Counter::default(),
            migrations_committed: Counter::default(),
            migrations_aborted: Counter::default(),
            critical_section: Histogram::new(&CRITICAL_SECTION_BUCKETS_MS),
            range_deletions: Counter::default(),
            orphans_deleted: Counter::default(),
            routing_refreshes: Counter::default(),
            stale_version_signals: Counter::default(),
            consistency_checks: Counter::default(),
            fatal_inconsistencies: Counter::default(),
            started: Instant::now(),
        }
    }

    /// Counters and the histogram in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();
        let counters = [
            ("migrations_started_total", "Chunk migrations started", &self.migrations_started),
            ("migrations_committed_total", "Chunk migrations that transferred ownership", &self.migrations_committed),
            ("migrations_aborted_total", "Chunk migrations aborted before commit", &self.migrations_aborted),
            ("range_deletions_total", "Orphan range deletion tasks executed", &self.range_deletions),
            ("orphan_documents_deleted_total", "Orphaned documents removed from donors", &self.orphans_deleted),
            ("routing_refreshes_total", "Routing cache reads of the metadata store", &self.routing_refreshes),
            ("stale_version_signals_total", "Stale shard version reports received by routers", &self.stale_version_signals),
            ("consistency_checks_total", "Consistency checks run", &self.consistency_checks),
            ("fatal_inconsistencies_total", "Confirmed fatal inconsistencies", &self.fatal_inconsistencies),
        ];
        for (name, help, counter) in counters {
            write_sample(&mut out, name, help, "counter", counter.get());
        }

        let name = "shardmeta_critical_section_ms";
        let _ = writeln!(out, "# HELP {} Time client writes were paused at commit", name);
        let _ = writeln!(out, "# TYPE {} histogram", name);
        for (le, count) in self.critical_section.cumulative() {
            match le {
                Some(le) => {
                    let _ = writeln!(out, "{}_bucket{{le=\"{}\"}} {}", name, le, count);
                }
                None => {
                    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, count);
                }
            }
        }
        let _ = writeln!(
            out,
            "{}_sum {}",
            name,
            self.critical_section.sum_ms.load(Ordering::Relaxed)
        );
        let _ = writeln!(out, "{}_count {}", name, self.critical_section.count());

        write_sample(
            &mut out,
            "uptime_seconds",
            "Seconds since this registry was created",
            "gauge",
            self.started.elapsed().as_secs(),
        );
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Append one `shardmeta_`-prefixed sample with its HELP and TYPE lines.
pub fn write_sample(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP shardmeta_{} {}", name, help);
    let _ = writeln!(out, "# TYPE shardmeta_{} {}", name, kind);
    let _ = writeln!(out, "shardmeta_{} {}", name, value);
}
