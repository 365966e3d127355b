//! The aggregator's own metrics, served at `GET /metricz`.
//!
//! These don't go through [`crate::registry::Registry`]: there's no ingestion, no dynamic
//! label schema, and no kind conflicts to guard against, so a small hand-rolled set of atomics
//! plus count/sum summaries is enough. Rendering reuses [`crate::formatting`]'s line writers.

use std::sync::atomic::Ordering;
use std::time::Duration;

use indexmap::IndexMap;
use parking_lot::RwLock;
use quanta::Clock;

use crate::atomic_f64::AtomicF64;
use crate::formatting::{write_help_line, write_metric_line, write_type_line};

/// A count+sum summary, labelled by a single value (e.g. sample kind). Quantile estimation
/// is deliberately not implemented: self-metrics only need throughput and rough latency,
/// and a full quantile sketch is disproportionate machinery for an internal-only surface.
#[derive(Default)]
struct Summary {
    by_label: RwLock<IndexMap<String, AtomicU64Pair>>,
}

/// Count and sum packed together so a single lock covers both without torn reads mattering:
/// each field is independently atomic, and a summary line only needs eventual consistency
/// between its two numbers.
#[derive(Default)]
struct AtomicU64Pair {
    count: std::sync::atomic::AtomicU64,
    sum: AtomicF64,
}

impl Summary {
    fn observe(&self, label: &str, value_ns: f64) {
        {
            let by_label = self.by_label.read();
            if let Some(entry) = by_label.get(label) {
                entry.count.fetch_add(1, Ordering::Relaxed);
                entry.sum.add(value_ns, Ordering::AcqRel);
                return;
            }
        }
        let mut by_label = self.by_label.write();
        let entry = by_label.entry(label.to_string()).or_insert_with(AtomicU64Pair::default);
        entry.count.fetch_add(1, Ordering::Relaxed);
        entry.sum.add(value_ns, Ordering::AcqRel);
    }

    fn render(&self, buf: &mut String, name: &str, help: &str, label_name: Option<&str>) {
        write_help_line(buf, name, help);
        write_type_line(buf, name, "summary");
        for (label, entry) in self.by_label.read().iter() {
            let labels: Vec<(&str, &str)> = match label_name {
                Some(ln) => vec![(ln, label.as_str())],
                None => Vec::new(),
            };
            write_metric_line(buf, name, Some("_sum"), &labels, entry.sum.load(Ordering::Acquire));
            write_metric_line(buf, name, Some("_count"), &labels, entry.count.load(Ordering::Relaxed) as f64);
        }
    }
}

/// A counter keyed by a single label value, e.g. a rejection reason.
#[derive(Default)]
struct LabelledCounter {
    by_label: RwLock<IndexMap<String, std::sync::atomic::AtomicU64>>,
}

impl LabelledCounter {
    fn increment(&self, label: &str) {
        {
            let by_label = self.by_label.read();
            if let Some(counter) = by_label.get(label) {
                counter.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        let mut by_label = self.by_label.write();
        by_label.entry(label.to_string()).or_insert_with(Default::default).fetch_add(1, Ordering::Relaxed);
    }

    fn render(&self, buf: &mut String, name: &str, help: &str, label_name: &str) {
        write_help_line(buf, name, help);
        write_type_line(buf, name, "counter");
        for (label, count) in self.by_label.read().iter() {
            write_metric_line(buf, name, None, &[(label_name, label.as_str())], count.load(Ordering::Relaxed) as f64);
        }
    }
}

/// Reasons a sample or frame can be rejected before reaching a vector, mirrored onto
/// `app_collector_dropped_samples_total{reason}`.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    QueueFull,
    DecodeError,
    InvalidSample,
    KindConflict,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::QueueFull => "queue_full",
            DropReason::DecodeError => "decode_error",
            DropReason::InvalidSample => "invalid_sample",
            DropReason::KindConflict => "kind_conflict",
        }
    }
}

pub struct SelfMetrics {
    start_timestamp: AtomicF64,
    queue_length: AtomicF64,
    ingress_requests_total: std::sync::atomic::AtomicU64,
    ingress_samples_total: std::sync::atomic::AtomicU64,
    ingress_dropped_total: std::sync::atomic::AtomicU64,
    processing_duration: Summary,
    expiring_duration: Summary,
    ingress_request_handling_duration: Summary,
    dropped_samples_total: LabelledCounter,
}

impl SelfMetrics {
    pub fn new() -> SelfMetrics {
        SelfMetrics {
            start_timestamp: AtomicF64::new(0.0),
            queue_length: AtomicF64::new(0.0),
            ingress_requests_total: std::sync::atomic::AtomicU64::new(0),
            ingress_samples_total: std::sync::atomic::AtomicU64::new(0),
            ingress_dropped_total: std::sync::atomic::AtomicU64::new(0),
            processing_duration: Summary::default(),
            expiring_duration: Summary::default(),
            ingress_request_handling_duration: Summary::default(),
            dropped_samples_total: LabelledCounter::default(),
        }
    }

    /// Records the process start time, in seconds since the Unix epoch. Called once, from
    /// `Collector::start`.
    pub fn mark_started(&self, unix_seconds: f64) {
        self.start_timestamp.store(unix_seconds, Ordering::Release);
    }

    pub fn set_queue_length(&self, len: usize) {
        self.queue_length.store(len as f64, Ordering::Release);
    }

    pub fn record_processing(&self, kind: &str, duration: Duration) {
        self.processing_duration.observe(kind, duration.as_nanos() as f64);
    }

    pub fn record_expiring(&self, kind: &str, duration: Duration) {
        self.expiring_duration.observe(kind, duration.as_nanos() as f64);
    }

    pub fn record_ingress_request(&self, samples: u64, duration: Duration) {
        self.ingress_requests_total.fetch_add(1, Ordering::Relaxed);
        self.ingress_samples_total.fetch_add(samples, Ordering::Relaxed);
        self.ingress_request_handling_duration.observe("request", duration.as_nanos() as f64);
    }

    pub fn record_ingress_dropped(&self) {
        self.ingress_dropped_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.dropped_samples_total.increment(reason.as_str());
    }

    /// Renders the full self-metrics exposition text. `clock` and `start_unix_seconds` are
    /// used to compute `app_duration_seconds` fresh at scrape time.
    pub fn render(&self, clock: &Clock, uptime: Duration) -> String {
        let mut buf = String::new();

        write_help_line(&mut buf, "app_start_timestamp_seconds", "Unix time the process started.");
        write_type_line(&mut buf, "app_start_timestamp_seconds", "gauge");
        write_metric_line(&mut buf, "app_start_timestamp_seconds", None, &[], self.start_timestamp.load(Ordering::Acquire));

        write_help_line(&mut buf, "app_duration_seconds", "Seconds the process has been running.");
        write_type_line(&mut buf, "app_duration_seconds", "gauge");
        write_metric_line(&mut buf, "app_duration_seconds", None, &[], uptime.as_secs_f64());

        write_help_line(&mut buf, "app_collector_queue_length", "Current depth of the ingress queue.");
        write_type_line(&mut buf, "app_collector_queue_length", "gauge");
        write_metric_line(&mut buf, "app_collector_queue_length", None, &[], self.queue_length.load(Ordering::Acquire));

        self.processing_duration.render(
            &mut buf,
            "app_collector_processing_duration_ns",
            "Time spent folding one sample into its vector, in nanoseconds.",
            Some("kind"),
        );
        self.expiring_duration.render(
            &mut buf,
            "app_collector_expiring_duration_ns",
            "Time spent sweeping one registry for expired children, in nanoseconds.",
            Some("kind"),
        );

        write_help_line(&mut buf, "app_ingress_requests_total", "Total ingress connections accepted.");
        write_type_line(&mut buf, "app_ingress_requests_total", "counter");
        write_metric_line(&mut buf, "app_ingress_requests_total", None, &[], self.ingress_requests_total.load(Ordering::Relaxed) as f64);

        write_help_line(&mut buf, "app_ingress_samples_total", "Total samples decoded off the ingress wire.");
        write_type_line(&mut buf, "app_ingress_samples_total", "counter");
        write_metric_line(&mut buf, "app_ingress_samples_total", None, &[], self.ingress_samples_total.load(Ordering::Relaxed) as f64);

        write_help_line(&mut buf, "app_ingress_dropped_total", "Samples dropped because the ingress queue was full.");
        write_type_line(&mut buf, "app_ingress_dropped_total", "counter");
        write_metric_line(&mut buf, "app_ingress_dropped_total", None, &[], self.ingress_dropped_total.load(Ordering::Relaxed) as f64);

        self.ingress_request_handling_duration.render(
            &mut buf,
            "app_ingress_request_handling_duration_ns",
            "Time spent handling one ingress connection, in nanoseconds.",
            None,
        );

        self.dropped_samples_total.render(
            &mut buf,
            "app_collector_dropped_samples_total",
            "Samples rejected before reaching a vector, by reason.",
            "reason",
        );

        let _ = clock;
        buf
    }
}

impl Default for SelfMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_gauges_and_counters() {
        let (clock, _mock) = Clock::mock();
        let m = SelfMetrics::new();
        m.mark_started(1_700_000_000.0);
        m.set_queue_length(5);
        m.record_ingress_request(3, Duration::from_millis(2));
        m.record_drop(DropReason::QueueFull);

        let text = m.render(&clock, Duration::from_secs(10));
        assert!(text.contains("app_start_timestamp_seconds 1700000000"));
        assert!(text.contains("app_collector_queue_length 5"));
        assert!(text.contains("app_ingress_samples_total 3"));
        assert!(text.contains(r#"app_collector_dropped_samples_total{reason="queue_full"} 1"#));
    }
}
