//! Prometheus metrics
//!
//! Lock-free counters, gauges and histograms rendered in the Prometheus text
//! format and served from each participant's `/metrics` route.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// Counter metric (monotonically increasing)
pub struct Counter {
    value: AtomicU64,
    name: String,
    help: String,
}

impl Counter {
    /// Create a new counter
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment by delta
    pub fn inc_by(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} counter\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Gauge metric (can go up or down)
pub struct Gauge {
    value: AtomicI64,
    name: String,
    help: String,
}

impl Gauge {
    /// Create a new gauge
    pub fn new(name: &str, help: &str) -> Self {
        Self {
            value: AtomicI64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Set value
    pub fn set(&self, val: i64) {
        self.value.store(val, Ordering::Relaxed);
    }

    /// Increment by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement by 1
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get current value
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        format!(
            "# HELP {} {}\n# TYPE {} gauge\n{} {}\n",
            self.name, self.help, self.name, self.name, self.get()
        )
    }
}

/// Histogram for latency measurements
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>,
    sum: AtomicU64,
    count: AtomicU64,
    name: String,
    help: String,
}

impl Histogram {
    /// Create with default buckets
    pub fn new(name: &str, help: &str) -> Self {
        Self::with_buckets(
            name,
            help,
            vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0],
        )
    }

    /// Create with custom buckets
    pub fn with_buckets(name: &str, help: &str, bounds: Vec<f64>) -> Self {
        let buckets = bounds
            .into_iter()
            .map(|b| (b, AtomicU64::new(0)))
            .collect();

        Self {
            buckets,
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
            name: name.into(),
            help: help.into(),
        }
    }

    /// Observe a value
    pub fn observe(&self, value: f64) {
        // Increment count
        self.count.fetch_add(1, Ordering::Relaxed);

        // Add to sum (as u64 micros for precision)
        let micros = (value * 1_000_000.0) as u64;
        self.sum.fetch_add(micros, Ordering::Relaxed);

        // Increment appropriate buckets
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Start a timer that records into this histogram when dropped
    pub fn start_timer(&self) -> HistogramTimer<'_> {
        HistogramTimer {
            histogram: self,
            start: Instant::now(),
        }
    }

    /// Number of observations so far
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Format as Prometheus metric
    pub fn to_prometheus(&self) -> String {
        let mut output = format!(
            "# HELP {} {}\n# TYPE {} histogram\n",
            self.name, self.help, self.name
        );

        for (bound, count) in &self.buckets {
            output.push_str(&format!(
                "{}_bucket{{le=\"{}\"}} {}\n",
                self.name, bound, count.load(Ordering::Relaxed)
            ));
        }

        let sum_secs = self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("{}_sum {}\n", self.name, sum_secs));
        output.push_str(&format!(
            "{}_count {}\n",
            self.name,
            self.count.load(Ordering::Relaxed)
        ));

        output
    }
}

/// Records elapsed time on drop, so early returns are measured too
pub struct HistogramTimer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl Drop for HistogramTimer<'_> {
    fn drop(&mut self) {
        self.histogram.observe(self.start.elapsed().as_secs_f64());
    }
}

/// Standard Keel metrics
pub mod standard {
    use super::*;
    use std::sync::LazyLock;

    pub static REBALANCES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("keel_rebalances_total", "Rebalances that produced a new decision")
    });

    pub static DECISIONS_PUSHED: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("keel_decisions_pushed_total", "Decision pushes accepted by participants")
    });

    pub static PUSH_FAILURES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("keel_push_failures_total", "Decision pushes that failed in transport")
    });

    pub static STALE_EPOCH_REJECTIONS: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new(
            "keel_stale_epoch_rejections_total",
            "Pushes rejected because they carried an older leader epoch",
        )
    });

    pub static RENOUNCED_RESOURCES: LazyLock<Counter> = LazyLock::new(|| {
        Counter::new("keel_renounced_resources_total", "Resources handed back by participants")
    });

    pub static LIVE_PARTICIPANTS: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("keel_live_participants", "Participants seen by the last rebalance")
    });

    pub static ORPHAN_RESOURCES: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("keel_orphan_resources", "Registered resources without an owner")
    });

    pub static LEADER_EPOCH: LazyLock<Gauge> = LazyLock::new(|| {
        Gauge::new("keel_leader_epoch", "Leader epoch held by this process")
    });

    pub static REBALANCE_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
        Histogram::new("keel_rebalance_duration_seconds", "Rebalance latency")
    });
}

/// Render all standard metrics in Prometheus text format
pub fn gather_system_metrics() -> String {
    let mut output = String::new();

    // Counters
    output.push_str(&standard::REBALANCES.to_prometheus());
    output.push_str(&standard::DECISIONS_PUSHED.to_prometheus());
    output.push_str(&standard::PUSH_FAILURES.to_prometheus());
    output.push_str(&standard::STALE_EPOCH_REJECTIONS.to_prometheus());
    output.push_str(&standard::RENOUNCED_RESOURCES.to_prometheus());

    // Gauges
    output.push_str(&standard::LIVE_PARTICIPANTS.to_prometheus());
    output.push_str(&standard::ORPHAN_RESOURCES.to_prometheus());
    output.push_str(&standard::LEADER_EPOCH.to_prometheus());

    // Histograms
    output.push_str(&standard::REBALANCE_DURATION.to_prometheus());

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let counter = Counter::new("test_counter", "Test counter");
        assert_eq!(counter.get(), 0);

        counter.inc();
        assert_eq!(counter.get(), 1);

        counter.inc_by(5);
        assert_eq!(counter.get(), 6);
    }

    #[test]
    fn test_gauge() {
        let gauge = Gauge::new("test_gauge", "Test gauge");
        assert_eq!(gauge.get(), 0);

        gauge.set(10);
        assert_eq!(gauge.get(), 10);

        gauge.dec();
        assert_eq!(gauge.get(), 9);
    }

    #[test]
    fn test_histogram() {
        let histogram = Histogram::new("test_histogram", "Test histogram");

        histogram.observe(0.001);
        histogram.observe(0.01);
        histogram.observe(0.1);

        let prometheus = histogram.to_prometheus();
        assert!(prometheus.contains("test_histogram_count 3"));
        assert!(prometheus.contains("test_histogram_bucket{le=\"0.01\"} 2"));
    }

    #[test]
    fn test_timer_records_on_drop() {
        let histogram = Histogram::new("test_timer", "Test timer");
        {
            let _timer = histogram.start_timer();
        }
        assert_eq!(histogram.count(), 1);
    }

    #[test]
    fn test_gather_lists_standard_metrics() {
        standard::REBALANCES.inc();
        let text = gather_system_metrics();
        assert!(text.contains("# TYPE keel_rebalances_total counter"));
        assert!(text.contains("# TYPE keel_orphan_resources gauge"));
        assert!(text.contains("keel_rebalance_duration_seconds_count"));
    }
}
