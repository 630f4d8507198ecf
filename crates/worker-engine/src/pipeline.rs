//! Five-stage orchestrator (§4.E, §4.G). Owns one job's transient state: fetched vectors,
//! projection, cluster labels, rendered HTML. Nothing here survives past a single call.

use crate::assets::EmbeddedFont;
use crate::error::{JobError, NamingError, RenderError, VectorStoreError};
use crate::llm;
use crate::model::{ClusterLabelMap, VectorPoint, VisualizationTransformJob, VisualizationTransformResult};
use crate::stages::{finalize_html, Clusterer, Projector, Renderer};
use crate::status::StatusPublisher;
use crate::vectorstore::VectorStoreClient;
use futures::stream::{self, StreamExt};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

const RETRIEVE_BATCH_SIZE: usize = 500;

/// `projector`/`clusterer`/`renderer` are held as `Arc` (not borrowed) so the CPU-bound stages
/// can be moved into `spawn_blocking`, which requires `'static` closures (§9).
pub struct PipelineDeps<'a> {
    pub vector_store: &'a VectorStoreClient,
    pub llm_http: &'a reqwest::Client,
    pub llm_inference_api_url: &'a str,
    pub projector: Arc<dyn Projector>,
    pub clusterer: Arc<dyn Clusterer>,
    pub renderer: Arc<dyn Renderer>,
    pub embedded_fonts: &'a [EmbeddedFont],
}

pub struct PipelineOutcome {
    pub html: Vec<u8>,
    pub point_count: u64,
    pub cluster_count: u64,
}

/// Run the full fetch/project/cluster/name/render pipeline for one job, publishing interim
/// progress envelopes along the way. The caller wraps this in the overall processing-budget
/// timeout (§5, §4.E).
pub async fn run(
    job: &VisualizationTransformJob,
    deps: &PipelineDeps<'_>,
    status: &mut dyn StatusPublisher,
) -> Result<PipelineOutcome, JobError> {
    status.publish(job, &starting_json(job)).await;

    status.publish(job, &interim_json(job, "fetching_vectors", 5)).await;
    let points = fetch_vectors(job, deps).await?;
    status.publish(job, &interim_json(job, "fetching_vectors", 20)).await;

    status.publish(job, &interim_json(job, "applying_umap", 25)).await;
    let projected = project_points(&points, job, deps).await?;
    status.publish(job, &interim_json(job, "applying_umap", 50)).await;

    status.publish(job, &interim_json(job, "clustering", 55)).await;
    let labels = cluster_points(&projected, job, deps).await?;
    status.publish(job, &interim_json(job, "clustering", 70)).await;

    status.publish(job, &interim_json(job, "naming_clusters", 72)).await;
    let label_map = name_clusters(job, &points, &labels, deps).await;
    status.publish(job, &interim_json(job, "naming_clusters", 85)).await;

    status.publish(job, &interim_json(job, "generating_html", 88)).await;
    let html = render_html(&projected, &points, &labels, &label_map, job, deps).await?;
    status.publish(job, &interim_json(job, "generating_html", 100)).await;

    let cluster_count = labels.iter().filter(|&&l| l >= 0).collect::<std::collections::HashSet<_>>().len() as u64;
    Ok(PipelineOutcome {
        html,
        point_count: points.len() as u64,
        cluster_count,
    })
}

fn starting_json(job: &VisualizationTransformJob) -> serde_json::Value {
    serde_json::to_value(VisualizationTransformResult::starting(job))
        .expect("starting envelope always serializes")
}

fn interim_json(job: &VisualizationTransformJob, stage: &str, progress: u32) -> serde_json::Value {
    serde_json::to_value(VisualizationTransformResult::interim(job, stage, progress))
        .expect("interim envelope always serializes")
}

/// Vector-fetch protocol (§4.E): below the sampling cap, scroll everything; above it, scroll
/// ids, sample down, and retrieve payloads in batches.
async fn fetch_vectors(
    job: &VisualizationTransformJob,
    deps: &PipelineDeps<'_>,
) -> Result<Vec<VectorPoint>, VectorStoreError> {
    let cap = job.visualization_config.max_visualization_points;
    let collection = &job.qdrant_collection_name;
    let total = deps.vector_store.collection_points_count(collection).await?;

    if total <= cap {
        return deps.vector_store.scroll_all(collection).await;
    }

    let ids = deps.vector_store.scroll_ids(collection).await?;
    let mut rng = rand::thread_rng();
    let sampled: Vec<Value> = ids
        .choose_multiple(&mut rng, cap as usize)
        .cloned()
        .collect();
    drop(ids);

    let mut points = Vec::with_capacity(sampled.len());
    for chunk in sampled.chunks(RETRIEVE_BATCH_SIZE) {
        let batch = deps.vector_store.retrieve_by_ids(collection, chunk).await?;
        points.extend(batch);
    }
    Ok(points)
}

async fn project_points(
    points: &[VectorPoint],
    job: &VisualizationTransformJob,
    deps: &PipelineDeps<'_>,
) -> Result<Vec<[f64; 2]>, JobError> {
    let vectors: Vec<Vec<f32>> = points.iter().map(|p| p.vector.clone()).collect();
    let config = job.visualization_config.clone();
    let seed = job.job_id.as_u128() as u64;
    let projector = deps.projector.clone();

    let n_neighbors = config.n_neighbors;
    let min_dist = config.min_dist;
    let metric = config.metric.clone();
    Ok(tokio::task::spawn_blocking(move || {
        projector.project(&vectors, n_neighbors, min_dist, &metric, seed)
    })
    .await
    .map_err(|e| JobError::Unexpected(format!("projection task panicked: {e}")))?)
}

async fn cluster_points(
    projected: &[[f64; 2]],
    job: &VisualizationTransformJob,
    deps: &PipelineDeps<'_>,
) -> Result<Vec<i64>, JobError> {
    let points = projected.to_vec();
    let min_cluster_size = job.visualization_config.min_cluster_size;
    let min_samples = job.visualization_config.min_samples.unwrap_or(min_cluster_size);
    let clusterer = deps.clusterer.clone();
    Ok(tokio::task::spawn_blocking(move || {
        clusterer.cluster(&points, min_cluster_size, min_samples)
    })
    .await
    .map_err(|e| JobError::Unexpected(format!("clustering task panicked: {e}")))?)
}

/// Cluster-label protocol (§4.E, §4.F): LLM-gated naming with per-cluster fallback on error.
/// Never fails the job — a `naming_error` is local to this function.
async fn name_clusters(
    job: &VisualizationTransformJob,
    points: &[VectorPoint],
    labels: &[i64],
    deps: &PipelineDeps<'_>,
) -> ClusterLabelMap {
    let mut cluster_ids: Vec<i64> = labels.iter().copied().filter(|&l| l >= 0).collect();
    cluster_ids.sort_unstable();
    cluster_ids.dedup();

    let use_llm = job
        .llm_config
        .as_ref()
        .map(|cfg| cfg.is_usable())
        .unwrap_or(false);

    if !use_llm {
        return cluster_ids.into_iter().map(|id| (id, format!("Cluster {id}"))).collect();
    }

    let llm_config = job.llm_config.as_ref().expect("checked above");
    let batch_size = (job.visualization_config.llm_batch_size.clamp(1, 100)) as usize;

    let texts_by_cluster: HashMap<i64, Vec<String>> = {
        let mut map: HashMap<i64, Vec<String>> = HashMap::new();
        for (point, &label) in points.iter().zip(labels.iter()) {
            if label >= 0 {
                map.entry(label).or_default().push(point.hover_text.clone());
            }
        }
        map
    };

    let results = stream::iter(cluster_ids.clone())
        .map(|id| {
            let texts = texts_by_cluster.get(&id).cloned().unwrap_or_default();
            async move {
                let name = llm::generate_topic_name(
                    deps.llm_http,
                    deps.llm_inference_api_url,
                    llm_config,
                    &texts,
                )
                .await;
                (id, name)
            }
        })
        .buffer_unordered(batch_size.max(1))
        .collect::<Vec<(i64, Result<String, NamingError>)>>()
        .await;

    results
        .into_iter()
        .map(|(id, outcome)| match outcome {
            Ok(label) => (id, label),
            Err(err) => {
                tracing::warn!(cluster = id, error = %err, "llm naming failed for cluster, using numeric fallback");
                (id, format!("Cluster {id}"))
            }
        })
        .collect()
}

fn label_for(id: i64, config_noise_label: &str, labels: &ClusterLabelMap) -> String {
    if id < 0 {
        if !config_noise_label.is_empty() {
            config_noise_label.to_string()
        } else {
            "Cluster -1".to_string()
        }
    } else {
        labels.get(&id).cloned().unwrap_or_else(|| format!("Cluster {id}"))
    }
}

async fn render_html(
    projected: &[[f64; 2]],
    points: &[VectorPoint],
    labels: &[i64],
    label_map: &ClusterLabelMap,
    job: &VisualizationTransformJob,
    deps: &PipelineDeps<'_>,
) -> Result<Vec<u8>, RenderError> {
    let label_names: Vec<String> = labels
        .iter()
        .map(|&id| label_for(id, &job.visualization_config.noise_label, label_map))
        .collect();
    let hover_texts: Vec<String> = points.iter().map(|p| p.hover_text.clone()).collect();

    let renderer = deps.renderer.clone();
    let projected = projected.to_vec();
    let config = job.visualization_config.clone();
    let html = tokio::task::spawn_blocking(move || renderer.render(&projected, &label_names, &hover_texts, &config))
        .await
        .map_err(|e| RenderError::Failed(format!("render task panicked: {e}")))??;

    finalize_html(html, deps.embedded_fonts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{VectorStoreConfig, VisualizationConfig};
    use crate::stages::{GridClusterer, RandomProjector, SvgRenderer};
    use uuid::Uuid;

    struct RecordingPublisher {
        stages: Vec<String>,
    }

    #[async_trait::async_trait]
    impl StatusPublisher for RecordingPublisher {
        async fn publish(&mut self, _job: &VisualizationTransformJob, envelope: &serde_json::Value) {
            if let Some(stage) = envelope.get("statsJson").and_then(|s| s.get("stage")).and_then(|s| s.as_str()) {
                self.stages.push(stage.to_string());
            }
        }
    }

    fn sample_job() -> VisualizationTransformJob {
        VisualizationTransformJob {
            job_id: Uuid::nil(),
            visualization_transform_id: 42,
            visualization_id: 100,
            owner_id: "u1".to_string(),
            embedded_dataset_id: 7,
            qdrant_collection_name: "coll".to_string(),
            visualization_config: VisualizationConfig::default(),
            qdrant_config: VectorStoreConfig { url: "http://localhost:6333".to_string(), api_key: None },
            llm_config: None,
        }
    }

    #[test]
    fn label_for_noise_falls_back_to_cluster_minus_one() {
        let map = ClusterLabelMap::new();
        assert_eq!(label_for(-1, "", &map), "Cluster -1");
        assert_eq!(label_for(-1, "Noise", &map), "Noise");
    }

    #[test]
    fn label_for_known_cluster_uses_map() {
        let mut map = ClusterLabelMap::new();
        map.insert(0, "Widgets".to_string());
        assert_eq!(label_for(0, "", &map), "Widgets");
        assert_eq!(label_for(1, "", &map), "Cluster 1");
    }

    /// §4.B / §8: the very first envelope published for any job is `starting`/0, before the
    /// fetch stage even begins. Points the client at an unroutable port so `fetch_vectors` fails
    /// fast instead of waiting on a real vector store; the `starting` envelope is published
    /// before that call is made either way.
    #[tokio::test]
    async fn run_emits_starting_envelope_before_any_stage() {
        let job = sample_job();
        let http = reqwest::Client::new();
        let vs_config = VectorStoreConfig { url: "http://127.0.0.1:1".into(), api_key: None };
        let vector_store = VectorStoreClient::new(&vs_config);
        let deps = PipelineDeps {
            vector_store: &vector_store,
            llm_http: &http,
            llm_inference_api_url: "http://localhost:8091",
            projector: Arc::new(RandomProjector),
            clusterer: Arc::new(GridClusterer),
            renderer: Arc::new(SvgRenderer),
            embedded_fonts: &[],
        };
        let mut publisher = RecordingPublisher { stages: Vec::new() };
        let _ = run(&job, &deps, &mut publisher).await;
        assert_eq!(publisher.stages.first().map(String::as_str), Some("starting"));
    }

    /// Drives project → cluster → name → render against the deterministic default stage
    /// implementations and a recording status publisher, without the network-bound fetch stage
    /// (covered separately by `vectorstore.rs`'s own unit tests).
    #[tokio::test]
    async fn pipeline_tail_runs_project_cluster_name_render() {
        let job = sample_job();
        let points = vec![
            VectorPoint { id: "a".into(), vector: vec![1.0, 0.0, 0.0], hover_text: "alpha".into() },
            VectorPoint { id: "b".into(), vector: vec![0.9, 0.1, 0.0], hover_text: "beta".into() },
            VectorPoint { id: "c".into(), vector: vec![0.0, 1.0, 0.0], hover_text: "gamma".into() },
        ];
        let http = reqwest::Client::new();
        let vs_config = VectorStoreConfig { url: "http://localhost:6333".into(), api_key: None };
        let vector_store = VectorStoreClient::new(&vs_config);
        let deps = PipelineDeps {
            vector_store: &vector_store,
            llm_http: &http,
            llm_inference_api_url: "http://localhost:8091",
            projector: Arc::new(RandomProjector),
            clusterer: Arc::new(GridClusterer),
            renderer: Arc::new(SvgRenderer),
            embedded_fonts: &[],
        };

        let projected = project_points(&points, &job, &deps).await.expect("projection succeeds");
        assert_eq!(projected.len(), points.len());

        let labels = cluster_points(&projected, &job, &deps).await.expect("clustering succeeds");
        assert_eq!(labels.len(), points.len());

        let label_map = name_clusters(&job, &points, &labels, &deps).await;
        let html = render_html(&projected, &points, &labels, &label_map, &job, &deps)
            .await
            .expect("render succeeds");
        assert!(!html.is_empty());
    }

    #[tokio::test]
    async fn name_clusters_falls_back_without_llm_config() {
        let job = sample_job();
        let points = vec![
            VectorPoint { id: "a".into(), vector: vec![1.0, 0.0], hover_text: "x".into() },
            VectorPoint { id: "b".into(), vector: vec![0.0, 1.0], hover_text: "y".into() },
        ];
        let labels = vec![0i64, 1i64];
        let http = reqwest::Client::new();
        let vs_config = VectorStoreConfig { url: "http://localhost:6333".into(), api_key: None };
        let vector_store = VectorStoreClient::new(&vs_config);
        let deps = PipelineDeps {
            vector_store: &vector_store,
            llm_http: &http,
            llm_inference_api_url: "http://localhost:8091",
            projector: Arc::new(RandomProjector),
            clusterer: Arc::new(GridClusterer),
            renderer: Arc::new(SvgRenderer),
            embedded_fonts: &[],
        };
        let map = name_clusters(&job, &points, &labels, &deps).await;
        assert_eq!(map.get(&0), Some(&"Cluster 0".to_string()));
        assert_eq!(map.get(&1), Some(&"Cluster 1".to_string()));
    }
}
