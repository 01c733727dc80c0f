//! Per-crop alpha masks: padded/blurred box, learned occlusion and learned
//! semantic regions.

use crate::frame::{self, ChannelOrder};
use crate::models::{extract_f32, LazySession, ModelError, ModelRegistry, OCCLUDER_FILE, PARSER_FILE};
use crate::types::named_enum;
use image::RgbImage;
use ndarray::Array2;
use ort::value::TensorRef;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

const OCCLUDER_INPUT_SIZE: u32 = 256;
const PARSER_INPUT_SIZE: u32 = 512;
const PARSER_CLASSES: usize = 19;
const LEARNED_MASK_SIGMA: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum MaskKind {
    Box,
    Occlusion,
    Region,
}

named_enum!(MaskKind, [
    MaskKind::Box => "box",
    MaskKind::Occlusion => "occlusion",
    MaskKind::Region => "region",
]);

/// Semantic classes of the face parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum FaceMaskRegion {
    Skin,
    LeftEyebrow,
    RightEyebrow,
    LeftEye,
    RightEye,
    Glasses,
    Nose,
    Mouth,
    UpperLip,
    LowerLip,
}

named_enum!(FaceMaskRegion, [
    FaceMaskRegion::Skin => "skin",
    FaceMaskRegion::LeftEyebrow => "left-eyebrow",
    FaceMaskRegion::RightEyebrow => "right-eyebrow",
    FaceMaskRegion::LeftEye => "left-eye",
    FaceMaskRegion::RightEye => "right-eye",
    FaceMaskRegion::Glasses => "glasses",
    FaceMaskRegion::Nose => "nose",
    FaceMaskRegion::Mouth => "mouth",
    FaceMaskRegion::UpperLip => "upper-lip",
    FaceMaskRegion::LowerLip => "lower-lip",
]);

impl FaceMaskRegion {
    /// Parser class id.
    pub fn id(&self) -> u8 {
        match self {
            FaceMaskRegion::Skin => 1,
            FaceMaskRegion::LeftEyebrow => 2,
            FaceMaskRegion::RightEyebrow => 3,
            FaceMaskRegion::LeftEye => 4,
            FaceMaskRegion::RightEye => 5,
            FaceMaskRegion::Glasses => 6,
            FaceMaskRegion::Nose => 10,
            FaceMaskRegion::Mouth => 11,
            FaceMaskRegion::UpperLip => 12,
            FaceMaskRegion::LowerLip => 13,
        }
    }
}

/// Box-mask border padding in percent of the crop edge.
#[derive(Debug, Clone, Copy, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct Padding {
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
    pub left: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MaskOptions {
    pub kinds: Vec<MaskKind>,
    pub blur: f32,
    pub padding: Padding,
    pub regions: Vec<FaceMaskRegion>,
}

impl Default for MaskOptions {
    fn default() -> Self {
        Self {
            kinds: vec![MaskKind::Box],
            blur: 0.3,
            padding: Padding::default(),
            regions: FaceMaskRegion::ALL.to_vec(),
        }
    }
}

impl MaskOptions {
    pub fn wants(&self, kind: MaskKind) -> bool {
        self.kinds.contains(&kind)
    }
}

/// Occlusion segmentation: 1 where the face is visible, 0 over occluders,
/// at the model's own resolution.
pub trait FaceOccluder: Send + Sync {
    fn occlusion(&self, crop: &RgbImage) -> Result<Array2<f32>, ModelError>;
}

/// Per-pixel semantic class map at the model's own resolution.
pub trait FaceParser: Send + Sync {
    fn parse(&self, crop: &RgbImage) -> Result<Array2<u8>, ModelError>;
}

pub struct OnnxOccluder {
    session: LazySession,
}

impl OnnxOccluder {
    pub fn new(registry: &ModelRegistry) -> Self {
        Self {
            session: registry.session("face_occluder", OCCLUDER_FILE),
        }
    }
}

impl FaceOccluder for OnnxOccluder {
    fn occlusion(&self, crop: &RgbImage) -> Result<Array2<f32>, ModelError> {
        let size = OCCLUDER_INPUT_SIZE as usize;
        let resized = frame::resize_exact(crop, (OCCLUDER_INPUT_SIZE, OCCLUDER_INPUT_SIZE));
        let input = frame::to_nhwc(&resized, ChannelOrder::Bgr, |v| v / 255.0);

        let (_, data) = self.session.run_with(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            Ok(extract_f32!(outputs, 0, "occlusion mask"))
        })?;

        Array2::from_shape_vec((size, size), data)
            .map(|mask| mask.mapv(|v| v.clamp(0.0, 1.0)))
            .map_err(|e| ModelError::InferenceFailed(format!("occlusion mask shape: {e}")))
    }
}

pub struct OnnxParser {
    session: LazySession,
}

impl OnnxParser {
    pub fn new(registry: &ModelRegistry) -> Self {
        Self {
            session: registry.session("face_parser", PARSER_FILE),
        }
    }
}

impl FaceParser for OnnxParser {
    fn parse(&self, crop: &RgbImage) -> Result<Array2<u8>, ModelError> {
        let size = PARSER_INPUT_SIZE as usize;
        let resized = frame::resize_exact(crop, (PARSER_INPUT_SIZE, PARSER_INPUT_SIZE));
        let input = frame::to_nchw(&resized, ChannelOrder::Rgb, |_, v| v / 127.5 - 1.0);

        let (_, logits) = self.session.run_with(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            Ok(extract_f32!(outputs, 0, "region logits"))
        })?;
        if logits.len() != PARSER_CLASSES * size * size {
            return Err(ModelError::InferenceFailed(format!(
                "expected {PARSER_CLASSES}x{size}x{size} logits, got {}",
                logits.len()
            )));
        }

        let plane = size * size;
        Ok(Array2::from_shape_fn((size, size), |(y, x)| {
            let offset = y * size + x;
            let mut best = 0usize;
            for class in 1..PARSER_CLASSES {
                if logits[class * plane + offset] > logits[best * plane + offset] {
                    best = class;
                }
            }
            best as u8
        }))
    }
}

type BoxMaskKey = (u32, u32, u32, [u32; 4]);

/// Builds mask stacks for face crops. Box masks are memoised.
pub struct FaceMasker {
    occluder: Box<dyn FaceOccluder>,
    parser: Box<dyn FaceParser>,
    box_cache: Mutex<HashMap<BoxMaskKey, Arc<Array2<f32>>>>,
}

impl FaceMasker {
    pub fn new(registry: &ModelRegistry) -> Self {
        Self::with_backends(
            Box::new(OnnxOccluder::new(registry)),
            Box::new(OnnxParser::new(registry)),
        )
    }

    pub fn with_backends(occluder: Box<dyn FaceOccluder>, parser: Box<dyn FaceParser>) -> Self {
        Self {
            occluder,
            parser,
            box_cache: Mutex::new(HashMap::new()),
        }
    }

    /// All-ones mask with zeroed, blurred borders.
    pub fn box_mask(&self, size: (u32, u32), blur: f32, padding: Padding) -> Arc<Array2<f32>> {
        let key = (
            size.0,
            size.1,
            blur.to_bits(),
            [padding.top, padding.right, padding.bottom, padding.left].map(f32::to_bits),
        );
        if let Ok(cache) = self.box_cache.lock() {
            if let Some(mask) = cache.get(&key) {
                return Arc::clone(mask);
            }
        }

        let mask = Arc::new(create_box_mask(size, blur, padding));
        if let Ok(mut cache) = self.box_cache.lock() {
            cache.insert(key, Arc::clone(&mask));
        }
        mask
    }

    pub fn occlusion_mask(&self, crop: &RgbImage) -> Result<Array2<f32>, ModelError> {
        let raw = self.occluder.occlusion(crop)?;
        let resized = frame::resize_plane(&raw, (crop.width() as usize, crop.height() as usize));
        Ok(soften_learned_mask(&resized))
    }

    pub fn region_mask(
        &self,
        crop: &RgbImage,
        regions: &[FaceMaskRegion],
    ) -> Result<Array2<f32>, ModelError> {
        let ids: Vec<u8> = regions.iter().map(FaceMaskRegion::id).collect();
        let classes = self.parser.parse(crop)?;
        let binary = classes.mapv(|c| if ids.contains(&c) { 1.0 } else { 0.0 });
        let resized = frame::resize_plane(&binary, (crop.width() as usize, crop.height() as usize));
        Ok(soften_learned_mask(&resized))
    }
}

fn create_box_mask(size: (u32, u32), blur: f32, padding: Padding) -> Array2<f32> {
    let (w, h) = (size.0 as usize, size.1 as usize);
    let blur_amount = (w as f32 * 0.5 * blur) as usize;
    let blur_area = (blur_amount / 2).max(1);
    let border = |edge: usize, percent: f32| blur_area.max((edge as f32 * percent / 100.0) as usize);

    let top = border(h, padding.top).min(h);
    let bottom = border(h, padding.bottom).min(h);
    let left = border(w, padding.left).min(w);
    let right = border(w, padding.right).min(w);

    let mask = Array2::from_shape_fn((h, w), |(y, x)| {
        let inside = y >= top && y + bottom < h && x >= left && x + right < w;
        if inside { 1.0 } else { 0.0 }
    });

    if blur_amount > 0 {
        frame::blur_plane(&mask, blur_amount as f32 * 0.25)
    } else {
        mask
    }
}

/// Blur, then remap `[0.5, 1]` onto `[0, 1]`.
fn soften_learned_mask(mask: &Array2<f32>) -> Array2<f32> {
    let clipped = mask.mapv(|v| v.clamp(0.0, 1.0));
    frame::blur_plane(&clipped, LEARNED_MASK_SIGMA).mapv(|v| (v.clamp(0.5, 1.0) - 0.5) * 2.0)
}

/// Element-wise minimum of the stack, clipped to `[0, 1]`. An empty stack
/// yields all ones.
pub fn combine_masks(masks: &[&Array2<f32>], size: (usize, usize)) -> Array2<f32> {
    let (w, h) = size;
    let mut combined = Array2::from_elem((h, w), 1.0f32);
    for mask in masks {
        combined.zip_mut_with(mask, |acc, &v| *acc = acc.min(v));
    }
    combined.mapv_inplace(|v| v.clamp(0.0, 1.0));
    combined
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct ConstOccluder(f32);

    impl FaceOccluder for ConstOccluder {
        fn occlusion(&self, _crop: &RgbImage) -> Result<Array2<f32>, ModelError> {
            Ok(Array2::from_elem((64, 64), self.0))
        }
    }

    /// Left half class 1 (skin), right half class 17 (hair).
    struct SplitParser;

    impl FaceParser for SplitParser {
        fn parse(&self, _crop: &RgbImage) -> Result<Array2<u8>, ModelError> {
            Ok(Array2::from_shape_fn((64, 64), |(_, x)| if x < 32 { 1 } else { 17 }))
        }
    }

    fn masker(occlusion: f32) -> FaceMasker {
        FaceMasker::with_backends(Box::new(ConstOccluder(occlusion)), Box::new(SplitParser))
    }

    fn in_unit_range(mask: &Array2<f32>) -> bool {
        mask.iter().all(|&v| (0.0..=1.0).contains(&v))
    }

    #[test]
    fn test_box_mask_shape_and_range() {
        let mask = masker(1.0).box_mask((128, 128), 0.3, Padding::default());
        assert_eq!(mask.dim(), (128, 128));
        assert!(in_unit_range(&mask));
        assert!(mask[[64, 64]] > 0.99, "centre should be opaque: {}", mask[[64, 64]]);
        assert!(mask[[0, 0]] < 0.05, "corner should be transparent: {}", mask[[0, 0]]);
    }

    #[test]
    fn test_box_mask_padding_without_blur() {
        let padding = Padding {
            top: 50.0,
            ..Padding::default()
        };
        let mask = masker(1.0).box_mask((100, 100), 0.0, padding);
        assert_eq!(mask[[49, 50]], 0.0);
        assert_eq!(mask[[50, 50]], 1.0);
        // Minimum one-pixel border on the other sides.
        assert_eq!(mask[[99, 50]], 0.0);
        assert_eq!(mask[[60, 0]], 0.0);
        assert_eq!(mask[[60, 99]], 0.0);
        assert_eq!(mask[[98, 98]], 1.0);
    }

    #[test]
    fn test_box_mask_is_memoised() {
        let masker = masker(1.0);
        let a = masker.box_mask((64, 64), 0.3, Padding::default());
        let b = masker.box_mask((64, 64), 0.3, Padding::default());
        assert!(Arc::ptr_eq(&a, &b));
        let c = masker.box_mask((64, 64), 0.5, Padding::default());
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_occlusion_mask_remap() {
        let crop = RgbImage::from_pixel(32, 32, Rgb([128, 128, 128]));
        let visible = masker(1.0).occlusion_mask(&crop).unwrap();
        assert_eq!(visible.dim(), (32, 32));
        assert!(visible.iter().all(|&v| (v - 1.0).abs() < 1e-4));

        let occluded = masker(0.4).occlusion_mask(&crop).unwrap();
        assert!(occluded.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_region_mask_selects_classes() {
        let crop = RgbImage::from_pixel(64, 64, Rgb([10, 20, 30]));
        let mask = masker(1.0).region_mask(&crop, &[FaceMaskRegion::Skin]).unwrap();
        assert!(in_unit_range(&mask));
        assert!(mask[[32, 2]] > 0.99);
        assert!(mask[[32, 61]] < 0.01);

        let none = masker(1.0).region_mask(&crop, &[FaceMaskRegion::Nose]).unwrap();
        assert!(none.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_combine_masks_min_commutative_idempotent() {
        let a = Array2::from_shape_fn((8, 8), |(y, x)| (x as f32 / 7.0) * (y as f32 / 7.0));
        let b = Array2::from_shape_fn((8, 8), |(y, _)| 1.0 - y as f32 / 7.0);
        let ab = combine_masks(&[&a, &b], (8, 8));
        let ba = combine_masks(&[&b, &a], (8, 8));
        assert_eq!(ab, ba);
        assert_eq!(combine_masks(&[&a, &a], (8, 8)), combine_masks(&[&a], (8, 8)));
        assert!(in_unit_range(&ab));
        assert!(combine_masks(&[], (4, 3)).iter().all(|&v| v == 1.0));
    }
}
