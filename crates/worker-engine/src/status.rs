//! Status publisher (§4.B). Subject construction, JSON serialization, fire-and-forget publish
//! with log-dedup on repeated failures (the same `should_log` idiom this codebase uses for
//! retry logging elsewhere).

use crate::broker::{BrokerError, PublishHandle};
use crate::model::VisualizationTransformJob;
use std::time::{Duration, Instant};

const LOG_DEDUP_WINDOW: Duration = Duration::from_secs(30);

pub fn status_subject(job: &VisualizationTransformJob) -> String {
    format!(
        "transforms.visualization.status.{}.{}.{}",
        job.owner_id, job.embedded_dataset_id, job.visualization_transform_id
    )
}

/// Interface the orchestrator publishes interim/terminal envelopes through (§9 "Progress
/// callback"). Production wires this to the broker; tests inject a recording implementation.
#[async_trait::async_trait]
pub trait StatusPublisher: Send + Sync {
    async fn publish(&mut self, job: &VisualizationTransformJob, envelope: &serde_json::Value);
}

pub struct BrokerStatusPublisher {
    broker: PublishHandle,
    last_failure: Option<String>,
    last_logged_at: Option<Instant>,
}

impl BrokerStatusPublisher {
    pub fn new(broker: PublishHandle) -> Self {
        Self {
            broker,
            last_failure: None,
            last_logged_at: None,
        }
    }
}

#[async_trait::async_trait]
impl StatusPublisher for BrokerStatusPublisher {
    async fn publish(&mut self, job: &VisualizationTransformJob, envelope: &serde_json::Value) {
        let subject = status_subject(job);
        let payload = match serde_json::to_vec(envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize status envelope");
                return;
            }
        };

        if let Err(err) = self.broker.publish(subject, payload).await {
            let message = err.to_string();
            let should_log = self.last_failure.as_deref() != Some(message.as_str())
                || self
                    .last_logged_at
                    .map(|t| t.elapsed() >= LOG_DEDUP_WINDOW)
                    .unwrap_or(true);
            if should_log {
                tracing::warn!(error = %message, job_id = %job.job_id, "status publish failed");
                self.last_failure = Some(message);
                self.last_logged_at = Some(Instant::now());
            }
        }
    }
}

/// Publish a terminal (`success`/`failed`) envelope and report whether it landed. Unlike
/// `StatusPublisher::publish`, the worker loop needs this result to decide ack vs. nak
/// (§7: `publish_error` negative-acks to allow redelivery).
pub async fn publish_terminal(
    broker: &PublishHandle,
    job: &VisualizationTransformJob,
    envelope: &serde_json::Value,
) -> Result<(), BrokerError> {
    let subject = status_subject(job);
    let payload = serde_json::to_vec(envelope)
        .map_err(|e| BrokerError::Publish(format!("failed to serialize terminal envelope: {e}")))?;
    broker.publish(subject, payload).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VectorStoreConfig, VisualizationConfig};
    use uuid::Uuid;

    fn sample_job() -> VisualizationTransformJob {
        VisualizationTransformJob {
            job_id: Uuid::nil(),
            visualization_transform_id: 42,
            visualization_id: 100,
            owner_id: "u1".to_string(),
            embedded_dataset_id: 7,
            qdrant_collection_name: "coll".to_string(),
            visualization_config: VisualizationConfig::default(),
            qdrant_config: VectorStoreConfig {
                url: "http://localhost:6333".to_string(),
                api_key: None,
            },
            llm_config: None,
        }
    }

    #[test]
    fn subject_matches_hierarchical_scheme() {
        let job = sample_job();
        assert_eq!(status_subject(&job), "transforms.visualization.status.u1.7.42");
    }
}
