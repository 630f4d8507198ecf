//! Wire-level data model: inbound job envelope, outbound status envelope.
//!
//! Field names and defaults follow the authoritative envelope version (hierarchical
//! status subject, `owner_id`, `visualization_id`, terminal `success`).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Connection details for the vector store backing a job's collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorStoreConfig {
    pub url: String,
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_n_neighbors() -> u32 {
    15
}
fn default_min_dist() -> f64 {
    0.1
}
fn default_metric() -> String {
    "cosine".to_string()
}
fn default_min_cluster_size() -> u32 {
    15
}
fn default_min_samples() -> Option<u32> {
    Some(5)
}
fn default_llm_batch_size() -> u32 {
    10
}
fn default_samples_per_cluster() -> u32 {
    5
}
fn default_true() -> bool {
    true
}
fn default_noise_color() -> String {
    "#999999".to_string()
}
fn default_label_wrap_width() -> u32 {
    16
}
fn default_width() -> String {
    "100%".to_string()
}
fn default_height() -> u32 {
    800
}
fn default_palette_hue_radius_dependence() -> f64 {
    1.0
}
fn default_palette_theta_range() -> f64 {
    0.196_349_540_849_362_07
}
fn default_polygon_alpha() -> f64 {
    0.1
}
fn default_title_font_size() -> u32 {
    36
}
fn default_sub_title_font_size() -> u32 {
    18
}
fn default_text_collision_size_scale() -> f64 {
    3.0
}
fn default_text_min_pixel_size() -> f64 {
    12.0
}
fn default_text_max_pixel_size() -> f64 {
    36.0
}
fn default_font_family() -> String {
    "Playfair Display SC".to_string()
}
fn default_font_weight() -> u32 {
    600
}
fn default_tooltip_font_weight() -> u32 {
    400
}
fn default_logo_width() -> u32 {
    256
}
fn default_line_spacing() -> f64 {
    0.95
}
fn default_min_fontsize() -> f64 {
    12.0
}
fn default_max_fontsize() -> f64 {
    24.0
}
fn default_text_outline_width() -> f64 {
    8.0
}
fn default_text_outline_color() -> String {
    "#eeeeeedd".to_string()
}
fn default_point_hover_color() -> String {
    "#aa0000bb".to_string()
}
fn default_point_radius_min_pixels() -> f64 {
    0.01
}
fn default_point_radius_max_pixels() -> f64 {
    24.0
}
fn default_point_line_width_min_pixels() -> f64 {
    0.001
}
fn default_point_line_width_max_pixels() -> f64 {
    3.0
}
fn default_point_line_width() -> f64 {
    0.001
}
fn default_cluster_boundary_line_width() -> f64 {
    1.0
}
fn default_initial_zoom_fraction() -> f64 {
    1.0
}
fn default_max_visualization_points() -> u64 {
    100_000
}

/// Rendering, projection and clustering knobs for a single job.
///
/// Unknown fields in the wire payload are ignored (`#[serde(default)]` on every field means
/// a partially-specified config round-trips to the documented defaults).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationConfig {
    #[serde(default = "default_n_neighbors")]
    pub n_neighbors: u32,
    #[serde(default = "default_min_dist")]
    pub min_dist: f64,
    #[serde(default = "default_metric")]
    pub metric: String,

    #[serde(default = "default_min_cluster_size")]
    pub min_cluster_size: u32,
    #[serde(default = "default_min_samples")]
    pub min_samples: Option<u32>,

    #[serde(default = "default_llm_batch_size")]
    pub llm_batch_size: u32,
    #[serde(default = "default_samples_per_cluster")]
    pub samples_per_cluster: u32,

    /// Sampling cap on the number of points fetched from the vector store. Required operator
    /// tunable (spec §9 open-question resolution): no unbounded default.
    #[serde(default = "default_max_visualization_points")]
    pub max_visualization_points: u64,

    #[serde(default = "default_true")]
    pub inline_data: bool,
    #[serde(default)]
    pub noise_label: String,
    #[serde(default = "default_noise_color")]
    pub noise_color: String,
    #[serde(default = "default_true")]
    pub color_label_text: bool,
    #[serde(default = "default_label_wrap_width")]
    pub label_wrap_width: u32,
    #[serde(default = "default_width")]
    pub width: String,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default)]
    pub darkmode: bool,
    #[serde(default)]
    pub palette_hue_shift: f64,
    #[serde(default = "default_palette_hue_radius_dependence")]
    pub palette_hue_radius_dependence: f64,
    #[serde(default = "default_palette_theta_range")]
    pub palette_theta_range: f64,
    #[serde(default)]
    pub use_medoids: bool,
    #[serde(default)]
    pub cluster_boundary_polygons: bool,
    #[serde(default = "default_polygon_alpha")]
    pub polygon_alpha: f64,
    #[serde(default)]
    pub cvd_safer: bool,
    #[serde(default)]
    pub enable_topic_tree: bool,

    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub sub_title: Option<String>,
    #[serde(default = "default_title_font_size")]
    pub title_font_size: u32,
    #[serde(default = "default_sub_title_font_size")]
    pub sub_title_font_size: u32,
    #[serde(default = "default_text_collision_size_scale")]
    pub text_collision_size_scale: f64,
    #[serde(default = "default_text_min_pixel_size")]
    pub text_min_pixel_size: f64,
    #[serde(default = "default_text_max_pixel_size")]
    pub text_max_pixel_size: f64,
    #[serde(default = "default_font_family")]
    pub font_family: String,
    #[serde(default = "default_font_weight")]
    pub font_weight: u32,
    #[serde(default = "default_font_family")]
    pub tooltip_font_family: String,
    #[serde(default = "default_tooltip_font_weight")]
    pub tooltip_font_weight: u32,
    #[serde(default)]
    pub logo: Option<String>,
    #[serde(default = "default_logo_width")]
    pub logo_width: u32,
    #[serde(default = "default_line_spacing")]
    pub line_spacing: f64,
    #[serde(default = "default_min_fontsize")]
    pub min_fontsize: f64,
    #[serde(default = "default_max_fontsize")]
    pub max_fontsize: f64,
    #[serde(default = "default_text_outline_width")]
    pub text_outline_width: f64,
    #[serde(default = "default_text_outline_color")]
    pub text_outline_color: String,
    #[serde(default)]
    pub point_size_scale: Option<f64>,
    #[serde(default = "default_point_hover_color")]
    pub point_hover_color: String,
    #[serde(default = "default_point_radius_min_pixels")]
    pub point_radius_min_pixels: f64,
    #[serde(default = "default_point_radius_max_pixels")]
    pub point_radius_max_pixels: f64,
    #[serde(default = "default_point_line_width_min_pixels")]
    pub point_line_width_min_pixels: f64,
    #[serde(default = "default_point_line_width_max_pixels")]
    pub point_line_width_max_pixels: f64,
    #[serde(default = "default_point_line_width")]
    pub point_line_width: f64,
    #[serde(default = "default_cluster_boundary_line_width")]
    pub cluster_boundary_line_width: f64,
    #[serde(default = "default_initial_zoom_fraction")]
    pub initial_zoom_fraction: f64,
    #[serde(default)]
    pub background_color: Option<String>,
    #[serde(default)]
    pub background_image: Option<String>,
}

impl Default for VisualizationConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("all fields have serde defaults")
    }
}

/// Closed set of supported LLM providers (spec §9: tagged variant, no reflection dispatch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProvider {
    Cohere,
    Openai,
    Internal,
}

impl std::str::FromStr for LlmProvider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cohere" => Ok(Self::Cohere),
            "openai" => Ok(Self::Openai),
            "internal" => Ok(Self::Internal),
            other => Err(format!("unknown LLM provider: {other}")),
        }
    }
}

/// Known naming knobs extracted from the LLM config's free-form `config` bag, with a
/// pass-through map for anything this worker doesn't interpret.
#[derive(Debug, Clone, Default)]
pub struct LlmNamingKnobs {
    pub max_tokens: u32,
    pub temperature: f64,
    pub samples_per_cluster: u32,
    pub extra: HashMap<String, serde_json::Value>,
}

impl LlmNamingKnobs {
    pub fn from_config_bag(bag: &HashMap<String, serde_json::Value>) -> Self {
        let mut extra = bag.clone();
        let max_tokens = extra
            .remove("max_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(50) as u32;
        let temperature = extra
            .remove("temperature")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.3);
        let samples_per_cluster = extra
            .remove("samples_per_cluster")
            .and_then(|v| v.as_u64())
            .unwrap_or(5) as u32;
        Self {
            max_tokens,
            temperature,
            samples_per_cluster,
            extra,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub llm_id: i64,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

impl LlmConfig {
    pub fn provider_tag(&self) -> Result<LlmProvider, String> {
        self.provider.parse()
    }

    /// Whether §4.E's naming gate is satisfied: `internal` never needs a key, external
    /// providers need a non-empty one.
    pub fn is_usable(&self) -> bool {
        match self.provider_tag() {
            Ok(LlmProvider::Internal) => true,
            Ok(_) => !self.api_key.trim().is_empty(),
            Err(_) => false,
        }
    }

    pub fn naming_knobs(&self) -> LlmNamingKnobs {
        LlmNamingKnobs::from_config_bag(&self.config)
    }
}

/// Inbound job envelope (§3, §6.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualizationTransformJob {
    pub job_id: Uuid,
    pub visualization_transform_id: i64,
    pub visualization_id: i64,
    pub owner_id: String,
    pub embedded_dataset_id: i64,
    pub qdrant_collection_name: String,
    #[serde(default)]
    pub visualization_config: VisualizationConfig,
    pub qdrant_config: VectorStoreConfig,
    #[serde(default)]
    pub llm_config: Option<LlmConfig>,
}

impl VisualizationTransformJob {
    /// §3 invariants: positive integer identifiers, non-empty collection name.
    pub fn validate(&self) -> Result<(), String> {
        if self.visualization_transform_id <= 0 {
            return Err("visualization_transform_id must be positive".to_string());
        }
        if self.visualization_id <= 0 {
            return Err("visualization_id must be positive".to_string());
        }
        if self.embedded_dataset_id <= 0 {
            return Err("embedded_dataset_id must be positive".to_string());
        }
        if self.owner_id.trim().is_empty() {
            return Err("owner_id must not be empty".to_string());
        }
        if self.qdrant_collection_name.trim().is_empty() {
            return Err("qdrant_collection_name must not be empty".to_string());
        }
        Ok(())
    }
}

/// Status tag, closed set per §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Processing,
    Success,
    Failed,
}

/// Outbound status envelope (§3, §6.2). camelCase on the wire, nulls omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizationTransformResult {
    pub job_id: String,
    pub visualization_transform_id: i64,
    pub visualization_id: i64,
    pub owner_id: String,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub html_s3_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processing_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub stats_json: serde_json::Map<String, serde_json::Value>,
}

impl VisualizationTransformResult {
    pub fn job_id_hex(job_id: Uuid) -> String {
        job_id.simple().to_string()
    }

    pub fn starting(job: &VisualizationTransformJob) -> Self {
        let mut stats = serde_json::Map::new();
        stats.insert("stage".to_string(), "starting".into());
        stats.insert("progress_percent".to_string(), 0.into());
        Self {
            job_id: Self::job_id_hex(job.job_id),
            visualization_transform_id: job.visualization_transform_id,
            visualization_id: job.visualization_id,
            owner_id: job.owner_id.clone(),
            status: JobStatus::Processing,
            html_s3_key: None,
            point_count: None,
            cluster_count: None,
            processing_duration_ms: None,
            error_message: None,
            stats_json: stats,
        }
    }

    pub fn interim(job: &VisualizationTransformJob, stage: &str, progress_percent: u32) -> Self {
        let mut stats = serde_json::Map::new();
        stats.insert("stage".to_string(), stage.into());
        stats.insert("progress_percent".to_string(), progress_percent.into());
        Self {
            job_id: Self::job_id_hex(job.job_id),
            visualization_transform_id: job.visualization_transform_id,
            visualization_id: job.visualization_id,
            owner_id: job.owner_id.clone(),
            status: JobStatus::Processing,
            html_s3_key: None,
            point_count: None,
            cluster_count: None,
            processing_duration_ms: None,
            error_message: None,
            stats_json: stats,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn success(
        job: &VisualizationTransformJob,
        html_s3_key: String,
        point_count: u64,
        cluster_count: u64,
        processing_duration_ms: u64,
    ) -> Self {
        Self {
            job_id: Self::job_id_hex(job.job_id),
            visualization_transform_id: job.visualization_transform_id,
            visualization_id: job.visualization_id,
            owner_id: job.owner_id.clone(),
            status: JobStatus::Success,
            html_s3_key: Some(html_s3_key),
            point_count: Some(point_count),
            cluster_count: Some(cluster_count),
            processing_duration_ms: Some(processing_duration_ms),
            error_message: None,
            stats_json: serde_json::Map::new(),
        }
    }

    pub fn failed(job: &VisualizationTransformJob, error_message: String) -> Self {
        Self {
            job_id: Self::job_id_hex(job.job_id),
            visualization_transform_id: job.visualization_transform_id,
            visualization_id: job.visualization_id,
            owner_id: job.owner_id.clone(),
            status: JobStatus::Failed,
            html_s3_key: None,
            point_count: None,
            cluster_count: None,
            processing_duration_ms: None,
            error_message: Some(error_message),
            stats_json: serde_json::Map::new(),
        }
    }
}

/// A point pulled from the vector store: embedding, identifier and derived hover text.
#[derive(Debug, Clone)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub hover_text: String,
}

/// Cluster identifier → short human label. The noise cluster (`-1`) is never a key here.
pub type ClusterLabelMap = HashMap<i64, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visualization_config_defaults_match_source() {
        let cfg = VisualizationConfig::default();
        assert_eq!(cfg.n_neighbors, 15);
        assert_eq!(cfg.min_dist, 0.1);
        assert_eq!(cfg.metric, "cosine");
        assert_eq!(cfg.min_cluster_size, 15);
        assert_eq!(cfg.min_samples, Some(5));
        assert_eq!(cfg.llm_batch_size, 10);
        assert_eq!(cfg.samples_per_cluster, 5);
        assert_eq!(cfg.font_family, "Playfair Display SC");
        assert!((cfg.palette_theta_range - 0.196_349_540_849_362_07).abs() < 1e-12);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let raw = r#"{"n_neighbors": 30, "something_new": "ignored"}"#;
        let cfg: VisualizationConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.n_neighbors, 30);
        assert_eq!(cfg.min_dist, 0.1);
    }

    #[test]
    fn job_validate_rejects_non_positive_ids() {
        let mut job = sample_job();
        job.visualization_transform_id = 0;
        assert!(job.validate().is_err());
    }

    #[test]
    fn job_validate_rejects_empty_owner() {
        let mut job = sample_job();
        job.owner_id = "  ".to_string();
        assert!(job.validate().is_err());
    }

    #[test]
    fn llm_config_internal_usable_without_key() {
        let cfg = LlmConfig {
            llm_id: 1,
            provider: "internal".to_string(),
            model: "mistral".to_string(),
            api_key: String::new(),
            config: HashMap::new(),
        };
        assert!(cfg.is_usable());
    }

    #[test]
    fn llm_config_external_requires_key() {
        let cfg = LlmConfig {
            llm_id: 1,
            provider: "openai".to_string(),
            model: "gpt-4".to_string(),
            api_key: String::new(),
            config: HashMap::new(),
        };
        assert!(!cfg.is_usable());
    }

    #[test]
    fn success_envelope_omits_error_message() {
        let job = sample_job();
        let result = VisualizationTransformResult::success(&job, "visualizations/42/x.html".into(), 500, 3, 1200);
        let json = serde_json::to_value(&result).unwrap();
        assert!(json.get("errorMessage").is_none());
        assert_eq!(json["pointCount"], 500);
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
            qdrant_config: VectorStoreConfig {
                url: "http://localhost:6333".to_string(),
                api_key: None,
            },
            llm_config: None,
        }
    }
}
