//! Black-box external stages (§6.4): dimensionality reduction, density clustering, HTML
//! rendering. The spec treats these as pure functions with documented signatures that a
//! faithful reimplementation may swap; the implementations here are small deterministic
//! defaults that satisfy the contract so the pipeline is runnable end-to-end without an
//! external binding.

use crate::assets::{patch_html_fonts, EmbeddedFont};
use crate::error::RenderError;
use crate::model::VisualizationConfig;

/// `(matrix [n, d], neighbors, min_dist, metric, seed) -> matrix [n, 2]`.
pub trait Projector: Send + Sync {
    fn project(
        &self,
        vectors: &[Vec<f32>],
        n_neighbors: u32,
        min_dist: f64,
        metric: &str,
        seed: u64,
    ) -> Vec<[f64; 2]>;
}

/// `(matrix [n, 2], min_cluster_size, min_samples) -> labels [n]`, noise encoded as `-1`.
pub trait Clusterer: Send + Sync {
    fn cluster(&self, points: &[[f64; 2]], min_cluster_size: u32, min_samples: u32) -> Vec<i64>;
}

/// `(matrix [n, 2], label_names [n], hover_texts [n], config) -> HTML bytes`.
pub trait Renderer: Send + Sync {
    fn render(
        &self,
        points: &[[f64; 2]],
        label_names: &[String],
        hover_texts: &[String],
        config: &VisualizationConfig,
    ) -> Result<Vec<u8>, RenderError>;
}

/// Seeded random projection to 2-D. Deterministic in `seed`; not a UMAP implementation, but
/// satisfies the documented signature and produces stable, reproducible output for tests.
pub struct RandomProjector;

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

fn seeded_unit_vector(seed: u64, dim: usize, axis: usize) -> Vec<f64> {
    let mut state = seed ^ ((axis as u64).wrapping_mul(0xD6E8_FEB8_6659_FD93));
    let mut v = Vec::with_capacity(dim);
    for _ in 0..dim {
        let bits = splitmix64(&mut state);
        // Map to [-1, 1).
        let f = (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64);
        v.push(f * 2.0 - 1.0);
    }
    let norm: f64 = v.iter().map(|x| x * x).sum::<f64>().sqrt().max(1e-9);
    v.iter().map(|x| x / norm).collect()
}

impl Projector for RandomProjector {
    fn project(
        &self,
        vectors: &[Vec<f32>],
        _n_neighbors: u32,
        _min_dist: f64,
        _metric: &str,
        seed: u64,
    ) -> Vec<[f64; 2]> {
        let dim = vectors.first().map(|v| v.len()).unwrap_or(0);
        if dim == 0 {
            return vec![[0.0, 0.0]; vectors.len()];
        }
        let axis_x = seeded_unit_vector(seed, dim, 0);
        let axis_y = seeded_unit_vector(seed, dim, 1);
        vectors
            .iter()
            .map(|vec| {
                let x: f64 = vec
                    .iter()
                    .zip(axis_x.iter())
                    .map(|(a, b)| *a as f64 * b)
                    .sum();
                let y: f64 = vec
                    .iter()
                    .zip(axis_y.iter())
                    .map(|(a, b)| *a as f64 * b)
                    .sum();
                [x, y]
            })
            .collect()
    }
}

/// Grid-based density clustering on the 2-D projection: bucket points into fixed-size cells,
/// keep cells whose population meets `min_cluster_size` as clusters, label everything else
/// noise. A stand-in for HDBSCAN that honors the same `[n, 2] -> labels` contract.
pub struct GridClusterer;

impl Clusterer for GridClusterer {
    fn cluster(&self, points: &[[f64; 2]], min_cluster_size: u32, _min_samples: u32) -> Vec<i64> {
        if points.is_empty() {
            return Vec::new();
        }
        let (mut min_x, mut max_x, mut min_y, mut max_y) =
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for [x, y] in points {
            min_x = min_x.min(*x);
            max_x = max_x.max(*x);
            min_y = min_y.min(*y);
            max_y = max_y.max(*y);
        }
        let span_x = (max_x - min_x).max(1e-9);
        let span_y = (max_y - min_y).max(1e-9);
        let grid_size = 12.0;
        let cell_w = span_x / grid_size;
        let cell_h = span_y / grid_size;

        let cell_of = |p: &[f64; 2]| -> (i64, i64) {
            let cx = ((p[0] - min_x) / cell_w).floor() as i64;
            let cy = ((p[1] - min_y) / cell_h).floor() as i64;
            (cx.min(grid_size as i64 - 1), cy.min(grid_size as i64 - 1))
        };

        let mut counts: std::collections::HashMap<(i64, i64), u32> = std::collections::HashMap::new();
        for p in points {
            *counts.entry(cell_of(p)).or_insert(0) += 1;
        }

        let mut cluster_ids: std::collections::HashMap<(i64, i64), i64> = std::collections::HashMap::new();
        let mut next_id = 0i64;
        for (&cell, &count) in &counts {
            if count >= min_cluster_size.max(1) {
                cluster_ids.insert(cell, next_id);
                next_id += 1;
            }
        }

        points
            .iter()
            .map(|p| {
                let cell = cell_of(p);
                *cluster_ids.get(&cell).unwrap_or(&-1)
            })
            .collect()
    }
}

/// Minimal self-contained interactive HTML/SVG renderer. Embeds points as SVG circles with a
/// `<title>` hover tooltip; good enough to exercise the real contract (config in, HTML bytes
/// out) without pulling in a charting dependency the rest of the stack doesn't otherwise need.
pub struct SvgRenderer;

fn escape_xml(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

impl Renderer for SvgRenderer {
    fn render(
        &self,
        points: &[[f64; 2]],
        label_names: &[String],
        hover_texts: &[String],
        config: &VisualizationConfig,
    ) -> Result<Vec<u8>, RenderError> {
        if points.len() != label_names.len() || points.len() != hover_texts.len() {
            return Err(RenderError::Failed(
                "points, labels and hover texts must have the same length".to_string(),
            ));
        }

        let (mut min_x, mut max_x, mut min_y, mut max_y) =
            (f64::INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::NEG_INFINITY);
        for [x, y] in points {
            min_x = min_x.min(*x);
            max_x = max_x.max(*x);
            min_y = min_y.min(*y);
            max_y = max_y.max(*y);
        }
        if !min_x.is_finite() {
            min_x = 0.0;
            max_x = 1.0;
            min_y = 0.0;
            max_y = 1.0;
        }
        let span_x = (max_x - min_x).max(1e-9);
        let span_y = (max_y - min_y).max(1e-9);
        let height = config.height as f64;
        let width_px = 1200.0_f64;

        let background = config.background_color.clone().unwrap_or_else(|| {
            if config.darkmode {
                "#111111".to_string()
            } else {
                "#ffffff".to_string()
            }
        });

        let mut circles = String::new();
        for ((point, label), hover) in points.iter().zip(label_names.iter()).zip(hover_texts.iter()) {
            let cx = (point[0] - min_x) / span_x * width_px;
            let cy = height - (point[1] - min_y) / span_y * height;
            let color = if label.starts_with("Cluster -1") || label == &config.noise_label {
                config.noise_color.clone()
            } else {
                "#3366cc".to_string()
            };
            circles.push_str(&format!(
                "<circle cx=\"{cx:.2}\" cy=\"{cy:.2}\" r=\"3\" fill=\"{color}\"><title>{}</title></circle>\n",
                escape_xml(&format!("{label}: {hover}"))
            ));
        }

        let title = config.title.clone().unwrap_or_default();
        let html = format!(
            "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
             <body style=\"margin:0;background:{background};\">\n\
             <svg width=\"{width_px}\" height=\"{height}\" xmlns=\"http://www.w3.org/2000/svg\">\n{circles}</svg>\n\
             </body>\n</html>\n",
            title = escape_xml(&title),
        );

        Ok(html.into_bytes())
    }
}

/// Strip external font references and inline the given local fonts; thin wrapper so the
/// orchestrator doesn't need to reach into `crate::assets` directly.
pub fn finalize_html(html: Vec<u8>, fonts: &[EmbeddedFont]) -> Result<Vec<u8>, RenderError> {
    let text = String::from_utf8(html)
        .map_err(|e| RenderError::Failed(format!("renderer produced non-utf8 output: {e}")))?;
    Ok(patch_html_fonts(&text, fonts).into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_projector_is_deterministic() {
        let vectors = vec![vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0], vec![0.5, 0.5, 0.0]];
        let a = RandomProjector.project(&vectors, 15, 0.1, "cosine", 42);
        let b = RandomProjector.project(&vectors, 15, 0.1, "cosine", 42);
        assert_eq!(a, b);
    }

    #[test]
    fn grid_clusterer_marks_sparse_points_as_noise() {
        let points = vec![[0.0, 0.0], [100.0, 100.0]];
        let labels = GridClusterer.cluster(&points, 15, 5);
        assert!(labels.iter().all(|&l| l == -1));
    }

    #[test]
    fn grid_clusterer_groups_dense_points() {
        let mut points = Vec::new();
        for i in 0..20 {
            points.push([i as f64 * 0.01, i as f64 * 0.01]);
        }
        let labels = GridClusterer.cluster(&points, 5, 5);
        assert!(labels.iter().any(|&l| l >= 0));
    }

    #[test]
    fn svg_renderer_produces_valid_html_shell() {
        let cfg = VisualizationConfig::default();
        let points = vec![[0.0, 0.0], [1.0, 1.0]];
        let labels = vec!["Cluster 0".to_string(), "Cluster 0".to_string()];
        let hovers = vec!["a".to_string(), "b".to_string()];
        let html = SvgRenderer.render(&points, &labels, &hovers, &cfg).unwrap();
        let text = String::from_utf8(html).unwrap();
        assert!(text.starts_with("<!DOCTYPE html>"));
        assert!(text.contains("<svg"));
    }

    #[test]
    fn svg_renderer_rejects_mismatched_lengths() {
        let cfg = VisualizationConfig::default();
        let points = vec![[0.0, 0.0]];
        let labels = vec!["Cluster 0".to_string(), "Cluster 1".to_string()];
        let hovers = vec!["a".to_string()];
        assert!(SvgRenderer.render(&points, &labels, &hovers, &cfg).is_err());
    }
}
