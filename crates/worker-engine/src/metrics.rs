//! Metrics sink (§4.I). Process-scoped, initialized once at startup and passed by reference
//! into handlers; no hidden singleton. Names mirror `original_source/.../observability.py`'s
//! `Metrics` class one-for-one — only the exporter wire format is out of scope (§1).

use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
};

pub struct Metrics {
    registry: Registry,
    pub jobs_total: IntCounterVec,
    pub job_duration_seconds: Histogram,
    pub points_created: IntCounterVec,
    pub clusters_created: IntCounterVec,
    pub stage_duration_seconds: HistogramVec,
    pub s3_upload_duration_seconds: Histogram,
    pub job_failures_total: IntCounterVec,
    pub job_retries_total: IntCounter,
    pub messages_received_total: IntCounter,
    pub messages_acked_total: IntCounter,
    pub messages_nacked_total: IntCounter,
    pub active_jobs: IntGauge,
    pub worker_ready: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let jobs_total = IntCounterVec::new(
            Opts::new("visualization_transform_jobs_total", "Jobs processed by terminal status"),
            &["status"],
        )
        .expect("metric definition is valid");
        let job_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "visualization_transform_duration_seconds",
            "End-to-end job duration",
        ))
        .expect("metric definition is valid");
        let points_created = IntCounterVec::new(
            Opts::new("visualization_transform_points_created", "Points rendered per job"),
            &["status"],
        )
        .expect("metric definition is valid");
        let clusters_created = IntCounterVec::new(
            Opts::new("visualization_transform_clusters_created", "Clusters produced per job"),
            &["status"],
        )
        .expect("metric definition is valid");
        let stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new("visualization_processing_duration_seconds", "Per-stage duration"),
            &["stage"],
        )
        .expect("metric definition is valid");
        let s3_upload_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "visualization_s3_upload_duration_seconds",
            "Object-store upload duration",
        ))
        .expect("metric definition is valid");
        let job_failures_total = IntCounterVec::new(
            Opts::new("visualization_job_failures_total", "Job failures by error kind"),
            &["error_type"],
        )
        .expect("metric definition is valid");
        let job_retries_total = IntCounter::new(
            "visualization_job_retries_total",
            "LLM naming retries across all jobs",
        )
        .expect("metric definition is valid");
        let messages_received_total = IntCounter::new(
            "nats_messages_received_total",
            "Broker messages pulled",
        )
        .expect("metric definition is valid");
        let messages_acked_total =
            IntCounter::new("nats_messages_acked_total", "Broker messages positively acked")
                .expect("metric definition is valid");
        let messages_nacked_total =
            IntCounter::new("nats_messages_nacked_total", "Broker messages negatively acked")
                .expect("metric definition is valid");
        let active_jobs = IntGauge::new("visualization_active_jobs", "Currently in-flight jobs")
            .expect("metric definition is valid");
        let worker_ready = IntGauge::new(
            "visualization_worker_ready",
            "1 once startup has completed, 0 otherwise",
        )
        .expect("metric definition is valid");

        for collector in [
            Box::new(jobs_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(job_duration_seconds.clone()),
            Box::new(points_created.clone()),
            Box::new(clusters_created.clone()),
            Box::new(stage_duration_seconds.clone()),
            Box::new(s3_upload_duration_seconds.clone()),
            Box::new(job_failures_total.clone()),
            Box::new(job_retries_total.clone()),
            Box::new(messages_received_total.clone()),
            Box::new(messages_acked_total.clone()),
            Box::new(messages_nacked_total.clone()),
            Box::new(active_jobs.clone()),
            Box::new(worker_ready.clone()),
        ] {
            registry.register(collector).expect("collector name is unique");
        }

        Self {
            registry,
            jobs_total,
            job_duration_seconds,
            points_created,
            clusters_created,
            stage_duration_seconds,
            s3_upload_duration_seconds,
            job_failures_total,
            job_retries_total,
            messages_received_total,
            messages_acked_total,
            messages_nacked_total,
            active_jobs,
            worker_ready,
        }
    }

    pub fn record_terminal(&self, status: &str, point_count: Option<u64>, cluster_count: Option<u64>) {
        self.jobs_total.with_label_values(&[status]).inc();
        if let Some(points) = point_count {
            self.points_created.with_label_values(&[status]).inc_by(points);
        }
        if let Some(clusters) = cluster_count {
            self.clusters_created.with_label_values(&[status]).inc_by(clusters);
        }
    }

    pub fn record_failure(&self, error_kind: &str) {
        self.job_failures_total.with_label_values(&[error_kind]).inc();
    }

    /// Render the registry in Prometheus text exposition format, for ad-hoc inspection; wiring
    /// this behind an HTTP endpoint is the exporter's job and out of scope here (§1).
    pub fn snapshot_text(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("text encoding cannot fail for valid families");
        String::from_utf8(buf).expect("prometheus text encoder emits valid utf-8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Increments `active_jobs` on construction, decrements on drop. Keeps the gauge correct across
/// every early-return path in the per-message handler.
pub struct ActiveJobGuard<'a> {
    gauge: &'a IntGauge,
}

impl<'a> ActiveJobGuard<'a> {
    pub fn enter(metrics: &'a Metrics) -> Self {
        metrics.active_jobs.inc();
        Self { gauge: &metrics.active_jobs }
    }
}

impl Drop for ActiveJobGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_terminal_status_and_counts() {
        let metrics = Metrics::new();
        metrics.record_terminal("success", Some(500), Some(3));
        assert_eq!(metrics.jobs_total.with_label_values(&["success"]).get(), 1);
        assert_eq!(metrics.points_created.with_label_values(&["success"]).get(), 500);
        assert_eq!(metrics.clusters_created.with_label_values(&["success"]).get(), 3);
    }

    #[test]
    fn records_failure_by_kind() {
        let metrics = Metrics::new();
        metrics.record_failure("timeout");
        assert_eq!(metrics.job_failures_total.with_label_values(&["timeout"]).get(), 1);
    }

    #[test]
    fn snapshot_contains_metric_names() {
        let metrics = Metrics::new();
        metrics.active_jobs.set(2);
        let text = metrics.snapshot_text();
        assert!(text.contains("visualization_active_jobs"));
    }
}
