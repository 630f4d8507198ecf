//! Public entry point for the worker engine: wires configuration into a running
//! fetch/dispatch loop and returns a handle the binary can hold onto for health reporting
//! and graceful shutdown.

use std::sync::Arc;

use crate::broker::BrokerClient;
use crate::config::WorkerConfig;
use crate::metrics::Metrics;
use crate::stages::{GridClusterer, RandomProjector, SvgRenderer};
use crate::storage::ObjectStoreClient;
use crate::worker_loop::{LoopTuning, TaskDeps};

pub use crate::worker_loop::ReadinessState;

/// Cloneable, read-only view onto the process-scoped metrics registry (§4.I). Kept separate from
/// `WorkerHandle` so the health router can hold its own copy without borrowing the handle that
/// `main` uses for shutdown.
#[derive(Clone)]
pub struct MetricsHandle(Arc<Metrics>);

impl MetricsHandle {
    /// Render the registry in Prometheus text exposition format.
    pub fn snapshot_text(&self) -> String {
        self.0.snapshot_text()
    }
}

/// Handle to a running worker loop.
pub struct WorkerHandle {
    /// Readiness flag for the `/health/ready` endpoint.
    pub readiness: Arc<ReadinessState>,
    metrics: Arc<Metrics>,
    join: tokio::task::JoinHandle<anyhow::Result<()>>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
}

impl WorkerHandle {
    /// Current number of jobs being processed concurrently.
    pub fn active_job_count(&self) -> i64 {
        self.metrics.active_jobs.get()
    }

    /// Cloneable handle onto the metrics registry, for wiring a `/metrics` endpoint.
    pub fn metrics_handle(&self) -> MetricsHandle {
        MetricsHandle(self.metrics.clone())
    }

    /// Ask the loop to stop fetching new messages and drain in-flight jobs.
    pub fn request_stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for the loop to finish (after a `request_stop` or a fatal broker error).
    pub async fn wait(self) -> anyhow::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(err) => Err(anyhow::anyhow!("worker loop task join error: {err}")),
        }
    }
}

/// Connect every external dependency (§4.H startup order: object store, broker, consumer)
/// and spawn the fetch/dispatch loop in the background.
pub async fn start_worker(config: WorkerConfig) -> anyhow::Result<WorkerHandle> {
    let object_store = ObjectStoreClient::connect(
        &config.object_store_bucket,
        &config.object_store_region,
        Some(config.object_store_endpoint.as_str()).filter(|s| !s.is_empty()),
    )
    .await;

    let broker = BrokerClient::connect(&config.broker_url, &config.stream_name, &config.consumer_name).await?;
    let status = broker.publish_handle();

    let metrics = Arc::new(Metrics::new());
    let readiness = ReadinessState::new();

    let tuning = LoopTuning {
        fetch_batch_size: config.fetch_batch_size,
        fetch_timeout: config.fetch_timeout(),
        max_in_flight: config.max_in_flight as usize,
        processing_timeout: config.processing_timeout(),
        drain_timeout: config.drain_timeout(),
    };

    let task_deps = TaskDeps {
        object_store: Arc::new(object_store),
        metrics: metrics.clone(),
        status,
        llm_http: reqwest::Client::new(),
        llm_inference_api_url: Arc::from(config.llm_inference_api_url.as_str()),
        projector: Arc::new(RandomProjector),
        clusterer: Arc::new(GridClusterer),
        renderer: Arc::new(SvgRenderer),
        embedded_fonts: Arc::new(Vec::new()),
        processing_timeout: config.processing_timeout(),
    };

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let readiness_for_loop = readiness.clone();
    let join = tokio::spawn(crate::worker_loop::run(broker, tuning, task_deps, readiness_for_loop, shutdown_rx));

    Ok(WorkerHandle {
        readiness,
        metrics,
        join,
        shutdown_tx,
    })
}
