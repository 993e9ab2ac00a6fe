//! Process-global timing instrumentation for the scan pipeline.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

pub static METRICS: Metrics = Metrics::new();

/// Cheap latency accumulator: count, total, and worst case.
#[derive(Debug, Default)]
pub struct Histogram {
    count: AtomicU64,
    sum_us: AtomicU64,
    max_us: AtomicU64,
}

impl Histogram {
    pub const fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
        }
    }

    pub fn record(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_us.fetch_add(us, Ordering::Relaxed);
        self.max_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn stats(&self) -> HistogramStats {
        let count = self.count.load(Ordering::Relaxed);
        let sum_us = self.sum_us.load(Ordering::Relaxed);
        HistogramStats {
            count,
            sum_us,
            max_us: self.max_us.load(Ordering::Relaxed),
            avg_us: if count > 0 { sum_us / count } else { 0 },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistogramStats {
    pub count: u64,
    pub sum_us: u64,
    pub max_us: u64,
    pub avg_us: u64,
}

#[derive(Debug)]
pub struct Metrics {
    /// One full scan: fetch, classify, captures, commit.
    pub scan_cycle: Histogram,
    /// Tag fetch from the multiplexer.
    pub tag_fetch: Histogram,
    /// A single pane-tail capture.
    pub pane_capture: Histogram,
    /// Any external command invocation.
    pub command: Histogram,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            scan_cycle: Histogram::new(),
            tag_fetch: Histogram::new(),
            pane_capture: Histogram::new(),
            command: Histogram::new(),
        }
    }
}

/// Guard that records elapsed time into a histogram on drop.
pub struct Timer<'a> {
    histogram: &'a Histogram,
    started: Instant,
}

impl<'a> Timer<'a> {
    pub fn new(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            started: Instant::now(),
        }
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.histogram.record(self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_count_sum_and_max() {
        let histogram = Histogram::new();
        histogram.record(Duration::from_micros(100));
        histogram.record(Duration::from_micros(300));
        let stats = histogram.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.sum_us, 400);
        assert_eq!(stats.max_us, 300);
        assert_eq!(stats.avg_us, 200);
    }

    #[test]
    fn empty_histogram_has_zero_average() {
        let stats = Histogram::new().stats();
        assert_eq!(stats, HistogramStats::default());
    }

    #[test]
    fn timer_records_on_drop() {
        let histogram = Histogram::new();
        {
            let _timer = Timer::new(&histogram);
        }
        assert_eq!(histogram.stats().count, 1);
    }
}
