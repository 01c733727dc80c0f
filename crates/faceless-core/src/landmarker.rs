//! Dense 68-point landmark estimation and 5→68 expansion.

use crate::frame::{self, ChannelOrder};
use crate::models::{
    extract_f32, LazySession, ModelError, ModelRegistry, LANDMARKER_68_FILE, LANDMARKER_68_FROM_5_FILE,
};
use crate::types::{Landmark5, Point, LANDMARK_68_COUNT};
use image::RgbImage;
use ndarray::Array3;
use ort::value::TensorRef;

pub const LANDMARKER_INPUT_SIZE: u32 = 256;

const HEATMAP_SIZE: usize = 64;
const DARK_CROP_LUMA: f32 = 30.0;
const CLAHE_TILES: u32 = 8;
const CLAHE_CLIP_LIMIT: f32 = 2.0;

pub trait FaceLandmarker: Send + Sync {
    /// 68 points in crop coordinates plus the model's confidence.
    fn detect_68(&self, crop: &RgbImage) -> Result<(Vec<Point>, f32), ModelError>;

    /// Expand five points given in the unit `ffhq_512` frame to 68 points in
    /// the same frame.
    fn expand_68_from_5(&self, points: &Landmark5) -> Result<Vec<Point>, ModelError>;
}

/// 2DFAN4 heatmap landmarker plus the 68-from-5 regression model.
pub struct OnnxLandmarker {
    dense: LazySession,
    expander: LazySession,
}

impl OnnxLandmarker {
    pub fn new(registry: &ModelRegistry) -> Self {
        Self {
            dense: registry.session("2dfan4", LANDMARKER_68_FILE),
            expander: registry.session("face_landmarker_68_5", LANDMARKER_68_FROM_5_FILE),
        }
    }
}

impl FaceLandmarker for OnnxLandmarker {
    fn detect_68(&self, crop: &RgbImage) -> Result<(Vec<Point>, f32), ModelError> {
        let mut crop = crop.clone();
        if frame::avg_brightness(&crop) < DARK_CROP_LUMA {
            frame::clahe_enhance(&mut crop, CLAHE_TILES, CLAHE_CLIP_LIMIT);
        }
        let input = frame::to_nchw(&crop, ChannelOrder::Bgr, |_, v| v / 255.0);

        let ((_, coords), (_, heatmaps)) = self.dense.run_with(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            Ok((
                extract_f32!(outputs, 0, "landmark coordinates"),
                extract_f32!(outputs, 1, "landmark heatmaps"),
            ))
        })?;

        let points = decode_heatmap_coords(&coords)?;
        let score = heatmap_confidence(&heatmaps)?;
        Ok((points, score))
    }

    fn expand_68_from_5(&self, points: &Landmark5) -> Result<Vec<Point>, ModelError> {
        let flat: Vec<f32> = points.iter().flat_map(|&(x, y)| [x, y]).collect();
        let input = Array3::from_shape_vec((1, 5, 2), flat)
            .map_err(|e| ModelError::InferenceFailed(format!("landmark input: {e}")))?;

        let (_, expanded) = self.expander.run_with(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            Ok(extract_f32!(outputs, 0, "expanded landmarks"))
        })?;

        if expanded.len() != LANDMARK_68_COUNT * 2 {
            return Err(ModelError::InferenceFailed(format!(
                "expected {} landmark values, got {}",
                LANDMARK_68_COUNT * 2,
                expanded.len()
            )));
        }
        Ok(expanded.chunks_exact(2).map(|p| (p[0], p[1])).collect())
    }
}

/// `68 × 3` heatmap-space `(x, y, _)` rows → crop pixel coordinates.
fn decode_heatmap_coords(coords: &[f32]) -> Result<Vec<Point>, ModelError> {
    if coords.len() != LANDMARK_68_COUNT * 3 {
        return Err(ModelError::InferenceFailed(format!(
            "expected {} landmark values, got {}",
            LANDMARK_68_COUNT * 3,
            coords.len()
        )));
    }
    let scale = LANDMARKER_INPUT_SIZE as f32 / HEATMAP_SIZE as f32;
    Ok(coords.chunks_exact(3).map(|p| (p[0] * scale, p[1] * scale)).collect())
}

/// Mean over landmarks of each heatmap's peak value.
fn heatmap_confidence(heatmaps: &[f32]) -> Result<f32, ModelError> {
    if heatmaps.is_empty() || heatmaps.len() % LANDMARK_68_COUNT != 0 {
        return Err(ModelError::InferenceFailed(format!(
            "heatmap size {} not divisible into {LANDMARK_68_COUNT} maps",
            heatmaps.len()
        )));
    }
    let per_map = heatmaps.len() / LANDMARK_68_COUNT;
    let total: f32 = heatmaps
        .chunks_exact(per_map)
        .map(|map| map.iter().copied().fold(f32::NEG_INFINITY, f32::max))
        .sum();
    Ok(total / LANDMARK_68_COUNT as f32)
}
