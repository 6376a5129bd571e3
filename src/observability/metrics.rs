// Metrics for supervisor and host health.
//
// Invariant: job outcomes, host restarts and side-channel traffic are measurable
// without a metrics backend; `export_prometheus` renders the text exposition format.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::message::JobStatus;

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero.
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct HistogramBucket {
    le: f64,
    count: AtomicU64,
}

/// Cumulative-bucket histogram for durations
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<HistogramBucket>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl Histogram {
    /// Buckets sized for job wall time: tens of milliseconds up to the timeout.
    pub fn new_job_duration() -> Self {
        let buckets = [0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
            .into_iter()
            .map(|le| HistogramBucket {
                le,
                count: AtomicU64::new(0),
            })
            .collect();
        Self {
            buckets,
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, value: Duration) {
        let seconds = value.as_secs_f64();
        self.sum_micros
            .fetch_add(value.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
        for bucket in &self.buckets {
            if seconds <= bucket.le {
                bucket.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn observations(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Prometheus histogram lines: cumulative buckets, `+Inf`, sum and count.
    fn render(&self, name: &str, help: &str, output: &mut String) {
        output.push_str(&format!("# HELP codebox_{} {}\n", name, help));
        output.push_str(&format!("# TYPE codebox_{} histogram\n", name));
        for bucket in &self.buckets {
            output.push_str(&format!(
                "codebox_{}_bucket{{le=\"{}\"}} {}\n",
                name,
                bucket.le,
                bucket.count.load(Ordering::Relaxed)
            ));
        }
        let count = self.observations();
        let sum = self.sum_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        output.push_str(&format!("codebox_{}_bucket{{le=\"+Inf\"}} {}\n", name, count));
        output.push_str(&format!("codebox_{}_sum {}\n", name, sum));
        output.push_str(&format!("codebox_{}_count {}\n", name, count));
    }
}

#[derive(Debug)]
pub struct MetricsRegistry {
    pub jobs_submitted: Counter,
    pub jobs_completed: Counter,
    pub jobs_failed: Counter,
    pub jobs_timed_out: Counter,
    pub active_jobs: Gauge,

    pub host_spawns: Counter,
    pub host_crashes: Counter,
    pub units_started: Counter,

    pub side_channel_writes: Counter,
    pub side_channel_reads: Counter,
    pub side_channel_failures: Counter,

    pub frames_decoded: Counter,
    pub frames_dropped: Counter,

    pub job_duration: Histogram,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            jobs_submitted: Counter::new(),
            jobs_completed: Counter::new(),
            jobs_failed: Counter::new(),
            jobs_timed_out: Counter::new(),
            active_jobs: Gauge::new(),
            host_spawns: Counter::new(),
            host_crashes: Counter::new(),
            units_started: Counter::new(),
            side_channel_writes: Counter::new(),
            side_channel_reads: Counter::new(),
            side_channel_failures: Counter::new(),
            frames_decoded: Counter::new(),
            frames_dropped: Counter::new(),
            job_duration: Histogram::new_job_duration(),
        }
    }

    pub fn record_terminal(&self, status: JobStatus, elapsed: Duration) {
        match status {
            JobStatus::Completed => self.jobs_completed.inc(),
            JobStatus::Failed => self.jobs_failed.inc(),
            JobStatus::Timeout => self.jobs_timed_out.inc(),
            JobStatus::Pending | JobStatus::Running => return,
        }
        self.active_jobs.dec();
        self.job_duration.observe(elapsed);
    }

    pub fn export_prometheus(&self) -> String {
        let mut output = String::new();
        let mut line = |name: &str, help: &str, kind: &str, value: u64| {
            output.push_str(&format!("# HELP codebox_{} {}\n", name, help));
            output.push_str(&format!("# TYPE codebox_{} {}\n", name, kind));
            output.push_str(&format!("codebox_{} {}\n", name, value));
        };

        line("jobs_submitted_total", "Jobs submitted", "counter", self.jobs_submitted.get());
        line("jobs_completed_total", "Jobs completed", "counter", self.jobs_completed.get());
        line("jobs_failed_total", "Jobs failed", "counter", self.jobs_failed.get());
        line("jobs_timeout_total", "Jobs timed out", "counter", self.jobs_timed_out.get());
        line("jobs_active", "Jobs pending or running", "gauge", self.active_jobs.get());
        line("host_spawns_total", "Host processes spawned", "counter", self.host_spawns.get());
        line("host_crashes_total", "Host process exits", "counter", self.host_crashes.get());
        line("units_started_total", "Execution units started", "counter", self.units_started.get());
        line("side_channel_writes_total", "Side-channel files written", "counter", self.side_channel_writes.get());
        line("side_channel_reads_total", "Side-channel files read", "counter", self.side_channel_reads.get());
        line("side_channel_failures_total", "Side-channel I/O failures", "counter", self.side_channel_failures.get());
        line("frames_decoded_total", "Frames decoded", "counter", self.frames_decoded.get());
        line("frames_dropped_total", "Malformed frames dropped", "counter", self.frames_dropped.get());

        self.job_duration
            .render("job_duration_seconds", "Wall time of terminal jobs", &mut output);
        output
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry, used by the host binary.
static METRICS: once_cell::sync::Lazy<Arc<MetricsRegistry>> =
    once_cell::sync::Lazy::new(|| Arc::new(MetricsRegistry::new()));

pub fn get_metrics() -> Arc<MetricsRegistry> {
    Arc::clone(&METRICS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gauge_saturates_at_zero() {
        let gauge = Gauge::new();
        gauge.dec();
        assert_eq!(gauge.get(), 0);
        gauge.inc();
        gauge.inc();
        gauge.dec();
        assert_eq!(gauge.get(), 1);
    }

    #[test]
    fn histogram_buckets_are_cumulative() {
        let histogram = Histogram::new_job_duration();
        histogram.observe(Duration::from_millis(40));
        histogram.observe(Duration::from_millis(400));
        histogram.observe(Duration::from_secs(20));

        assert_eq!(histogram.observations(), 3);

        let mut output = String::new();
        histogram.render("job_duration_seconds", "test", &mut output);
        assert!(output.contains("codebox_job_duration_seconds_bucket{le=\"0.05\"} 1\n"));
        assert!(output.contains("codebox_job_duration_seconds_bucket{le=\"0.5\"} 2\n"));
        assert!(output.contains("codebox_job_duration_seconds_bucket{le=\"30\"} 3\n"));
        assert!(output.contains("codebox_job_duration_seconds_bucket{le=\"+Inf\"} 3\n"));
        assert!(output.contains("codebox_job_duration_seconds_count 3\n"));
    }

    #[test]
    fn terminal_outcomes_are_tallied() {
        let metrics = MetricsRegistry::new();
        for _ in 0..3 {
            metrics.active_jobs.inc();
        }
        metrics.record_terminal(JobStatus::Completed, Duration::from_millis(5));
        metrics.record_terminal(JobStatus::Timeout, Duration::from_secs(30));
        metrics.record_terminal(JobStatus::Running, Duration::ZERO);

        assert_eq!(metrics.jobs_completed.get(), 1);
        assert_eq!(metrics.jobs_timed_out.get(), 1);
        assert_eq!(metrics.active_jobs.get(), 1);
        assert_eq!(metrics.job_duration.observations(), 2);
    }

    #[test]
    fn prometheus_export_contains_counters() {
        let metrics = MetricsRegistry::new();
        metrics.jobs_submitted.inc();
        metrics.jobs_submitted.inc();
        metrics.host_crashes.inc();
        let output = metrics.export_prometheus();
        assert!(output.contains("codebox_jobs_submitted_total 2"));
        assert!(output.contains("codebox_host_crashes_total 1"));
        assert!(output.contains("# TYPE codebox_jobs_active gauge"));
        assert!(output.contains("# TYPE codebox_job_duration_seconds histogram"));
    }

    #[test]
    fn global_registry_is_shared() {
        assert!(Arc::ptr_eq(&get_metrics(), &get_metrics()));
    }
}
