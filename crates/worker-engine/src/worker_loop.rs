//! Bounded-concurrency fetch/dispatch/drain loop (§4.G, §5). Generalized from this codebase's
//! `engine.rs` master loop (`JoinSet` of worker tasks, `AtomicBool` stop flag, `Notify`-driven
//! cancellation) from a proof-lease backend onto a job-message broker.

use crate::assets::EmbeddedFont;
use crate::broker::{BrokerClient, BrokerMessage, PublishHandle};
use crate::error::{Disposition, JobError};
use crate::metrics::{ActiveJobGuard, Metrics};
use crate::model::{VisualizationTransformJob, VisualizationTransformResult};
use crate::pipeline::{self, PipelineDeps};
use crate::stages::{Clusterer, Projector, Renderer};
use crate::status::{self, BrokerStatusPublisher};
use crate::storage::ObjectStoreClient;
use crate::vectorstore::VectorStoreClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::Instrument;

/// Process-scoped readiness flag (§4.I, §9 "global state"). Initialized once at startup, read
/// by the health endpoint, flipped once by the worker loop after its own setup completes.
pub struct ReadinessState {
    ready: AtomicBool,
}

impl ReadinessState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { ready: AtomicBool::new(false) })
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

impl Default for ReadinessState {
    fn default() -> Self {
        Self { ready: AtomicBool::new(false) }
    }
}

/// Tunables the loop needs from `WorkerConfig`, decoupled so this module doesn't depend on
/// `clap`.
#[derive(Debug, Clone, Copy)]
pub struct LoopTuning {
    pub fetch_batch_size: u32,
    pub fetch_timeout: Duration,
    pub max_in_flight: usize,
    pub processing_timeout: Duration,
    pub drain_timeout: Duration,
}

/// Shared, cloneable dependencies handed to every spawned job task.
#[derive(Clone)]
pub struct TaskDeps {
    pub object_store: Arc<ObjectStoreClient>,
    pub metrics: Arc<Metrics>,
    pub status: PublishHandle,
    pub llm_http: reqwest::Client,
    pub llm_inference_api_url: Arc<str>,
    pub projector: Arc<dyn Projector>,
    pub clusterer: Arc<dyn Clusterer>,
    pub renderer: Arc<dyn Renderer>,
    pub embedded_fonts: Arc<Vec<EmbeddedFont>>,
    pub processing_timeout: Duration,
}

/// Run the fetch/dispatch loop until `shutdown` fires, then drain in-flight handlers up to
/// `tuning.drain_timeout` before returning.
pub async fn run(
    mut broker: BrokerClient,
    tuning: LoopTuning,
    deps: TaskDeps,
    readiness: Arc<ReadinessState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut tasks: JoinSet<()> = JoinSet::new();
    readiness.set_ready();
    tracing::info!("worker loop ready, beginning fetch");

    'dispatch: loop {
        if *shutdown.borrow() {
            break;
        }

        while tasks.len() >= tuning.max_in_flight {
            tokio::select! {
                _ = tasks.join_next() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break 'dispatch;
                    }
                }
            }
        }

        let messages = tokio::select! {
            res = broker.fetch(tuning.fetch_batch_size, tuning.fetch_timeout) => res,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break 'dispatch;
                }
                continue;
            }
        };

        let messages = match messages {
            Ok(messages) => messages,
            Err(err) => {
                tracing::error!(error = %err, "broker fetch failed permanently");
                return Err(anyhow::anyhow!(err));
            }
        };

        for message in messages {
            deps.metrics.messages_received_total.inc();
            let task_deps = deps.clone();
            tasks.spawn(async move {
                handle_message(message, task_deps).await;
            });
        }
    }

    tracing::info!(drain_timeout_secs = tuning.drain_timeout.as_secs(), pending = tasks.len(), "draining in-flight jobs");
    let drained = tokio::time::timeout(tuning.drain_timeout, async {
        while tasks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::warn!(pending = tasks.len(), "drain deadline exceeded, abandoning remaining jobs");
    }
    Ok(())
}

/// Per-message flow (§4.G): decode/validate, run the pipeline, publish the terminal status,
/// ack/nak per the job error's disposition.
async fn handle_message(message: BrokerMessage, deps: TaskDeps) {
    let traceparent = message.traceparent();
    let tracestate = message.tracestate();
    let job: VisualizationTransformJob = match serde_json::from_slice(&message.payload) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(error = %e, traceparent = ?traceparent, "poison pill: could not decode job envelope");
            deps.metrics.record_failure(JobError::JsonDecode(e).kind().as_str());
            ack_or_log(&message, &deps.metrics).await;
            return;
        }
    };

    if let Err(reason) = job.validate() {
        tracing::warn!(job_id = %job.job_id, reason, "poison pill: job envelope failed validation");
        deps.metrics.record_failure(JobError::Validation(reason).kind().as_str());
        ack_or_log(&message, &deps.metrics).await;
        return;
    }

    let _active = ActiveJobGuard::enter(&deps.metrics);
    let start = std::time::Instant::now();

    let mut interim_publisher = BrokerStatusPublisher::new(deps.status.clone());
    let vector_store = VectorStoreClient::new(&job.qdrant_config);
    let pipeline_deps = PipelineDeps {
        vector_store: &vector_store,
        llm_http: &deps.llm_http,
        llm_inference_api_url: deps.llm_inference_api_url.as_ref(),
        projector: deps.projector.clone(),
        clusterer: deps.clusterer.clone(),
        renderer: deps.renderer.clone(),
        embedded_fonts: deps.embedded_fonts.as_slice(),
    };

    // Consumer span parented on the inbound W3C trace-context headers (§4.G step 1, §6.3).
    let span = tracing::info_span!(
        "process_visualization_job",
        job_id = %job.job_id,
        transform_id = job.visualization_transform_id,
        visualization_id = job.visualization_id,
        traceparent = traceparent.as_deref().unwrap_or_default(),
        tracestate = tracestate.as_deref().unwrap_or_default(),
    );

    let outcome: Result<pipeline::PipelineOutcome, JobError> = async {
        match tokio::time::timeout(deps.processing_timeout, pipeline::run(&job, &pipeline_deps, &mut interim_publisher)).await {
            Ok(result) => result,
            Err(_) => Err(JobError::Timeout),
        }
    }
    .instrument(span.clone())
    .await;

    if let Err(ref err) = outcome {
        span.in_scope(|| tracing::error!(error = %err, "pipeline stage failed"));
    }

    let outcome = match outcome {
        Ok(result) => {
            match deps
                .object_store
                .upload_visualization(job.visualization_transform_id, job.visualization_id, &job.owner_id, result.html)
                .await
            {
                Ok(key) => Ok((key, result.point_count, result.cluster_count)),
                Err(e) => Err(JobError::from(e)),
            }
        }
        Err(e) => Err(e),
    };

    let duration_ms = start.elapsed().as_millis() as u64;

    match outcome {
        Ok((key, point_count, cluster_count)) => {
            let envelope = VisualizationTransformResult::success(&job, key, point_count, cluster_count, duration_ms);
            let payload = serde_json::to_value(&envelope).expect("success envelope always serializes");
            deps.metrics.record_terminal("success", Some(point_count), Some(cluster_count));
            match status::publish_terminal(&deps.status, &job, &payload).await {
                Ok(()) => ack_or_log(&message, &deps.metrics).await,
                Err(err) => {
                    tracing::warn!(job_id = %job.job_id, error = %err, "terminal success publish failed, nak-ing for redelivery");
                    nak_or_log(&message, &deps.metrics).await;
                }
            }
        }
        Err(err) => {
            deps.metrics.record_failure(err.kind().as_str());
            match err.disposition() {
                Disposition::AckSilently => {
                    tracing::warn!(job_id = %job.job_id, error = %err, "job acked silently, no terminal status");
                    ack_or_log(&message, &deps.metrics).await;
                }
                Disposition::AckWithFailure => {
                    let error_message = format!("{}: {}", err.kind().as_str(), err);
                    let envelope = VisualizationTransformResult::failed(&job, error_message);
                    let payload = serde_json::to_value(&envelope).expect("failed envelope always serializes");
                    match status::publish_terminal(&deps.status, &job, &payload).await {
                        Ok(()) => ack_or_log(&message, &deps.metrics).await,
                        Err(publish_err) => {
                            tracing::warn!(job_id = %job.job_id, error = %publish_err, "terminal failure publish failed, nak-ing for redelivery");
                            nak_or_log(&message, &deps.metrics).await;
                        }
                    }
                }
                Disposition::Nak => {
                    tracing::error!(job_id = %job.job_id, error = %err, "unexpected error, nak-ing for redelivery");
                    nak_or_log(&message, &deps.metrics).await;
                }
            }
        }
    }
}

async fn ack_or_log(message: &BrokerMessage, metrics: &Metrics) {
    match message.ack().await {
        Ok(()) => metrics.messages_acked_total.inc(),
        Err(e) => tracing::error!(error = %e, "ack failed"),
    }
}

async fn nak_or_log(message: &BrokerMessage, metrics: &Metrics) {
    match message.nak().await {
        Ok(()) => metrics.messages_nacked_total.inc(),
        Err(e) => tracing::error!(error = %e, "nak failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readiness_starts_false_and_flips_once() {
        let state = ReadinessState::new();
        assert!(!state.is_ready());
        state.set_ready();
        assert!(state.is_ready());
    }
}
