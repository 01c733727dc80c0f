//! Face analysis: multi-backend detection, NMS fusion, landmark refinement,
//! identity embedding, demographics and a per-frame result cache.

use crate::detector::{self, Detections, FaceDetector};
use crate::frame::FrameKey;
use crate::geometry::{self, GeometryError, WarpTemplate};
use crate::landmarker::{FaceLandmarker, OnnxLandmarker, LANDMARKER_INPUT_SIZE};
use crate::models::{DetectorSelection, ModelError, ModelRegistry, RecognizerModel};
use crate::recognizer::{
    FaceRecognizer, GenderAgeEstimator, OnnxGenderAge, OnnxRecognizer, GENDER_AGE_INPUT_SIZE,
    RECOGNIZER_INPUT_SIZE,
};
use crate::types::{
    AgeCategory, BoundingBox, Embedding, Face, FaceLandmarks, FaceOrder, FaceScores, Gender,
    Landmark5, Landmark68, Point,
};
use image::RgbImage;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

const LANDMARKER_FACE_EXTENT: f32 = 195.0;
const GENDER_AGE_FACE_EXTENT: f32 = 64.0;

#[derive(Error, Debug)]
pub enum AnalyseError {
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("geometry error: {0}")]
    Geometry(#[from] GeometryError),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyserOptions {
    pub detector: DetectorSelection,
    /// Detector input resolution (width, height).
    pub detector_size: (u32, u32),
    /// Minimum detector confidence; 0 disables face creation entirely.
    pub detector_score: f32,
    /// Minimum landmarker confidence for 68-point refinement; 0 skips the
    /// 68-point model.
    pub landmarker_score: f32,
    pub recognizer: RecognizerModel,
    pub order: FaceOrder,
    pub age: Option<AgeCategory>,
    pub gender: Option<Gender>,
    /// NMS IoU threshold with a single detector backend.
    pub nms_threshold: f32,
    /// NMS IoU threshold when several backends are fused.
    pub multi_nms_threshold: f32,
}

impl Default for AnalyserOptions {
    fn default() -> Self {
        Self {
            detector: DetectorSelection::default(),
            detector_size: (640, 640),
            detector_score: 0.5,
            landmarker_score: 0.5,
            recognizer: RecognizerModel::default(),
            order: FaceOrder::default(),
            age: None,
            gender: None,
            nms_threshold: 0.4,
            multi_nms_threshold: 0.1,
        }
    }
}

/// Shared face analysis service.
///
/// Results are cached per frame content and the cache is unbounded; frame
/// directory jobs clear it when they finish.
pub struct FaceAnalyser {
    options: AnalyserOptions,
    detectors: Vec<Box<dyn FaceDetector>>,
    recognizer: Box<dyn FaceRecognizer>,
    landmarker: Box<dyn FaceLandmarker>,
    gender_age: Box<dyn GenderAgeEstimator>,
    /// Serialises detector inference across workers.
    gate: Mutex<()>,
    cache: Mutex<HashMap<FrameKey, Vec<Face>>>,
}

impl FaceAnalyser {
    /// ONNX-backed analyser; no model is opened until first use.
    pub fn new(options: AnalyserOptions, registry: &ModelRegistry) -> Self {
        let detectors = options
            .detector
            .backends()
            .into_iter()
            .map(|model| detector::create_detector(model, registry, options.detector_size))
            .collect();
        let recognizer = Box::new(OnnxRecognizer::new(options.recognizer, registry));
        Self::with_backends(
            options,
            detectors,
            recognizer,
            Box::new(OnnxLandmarker::new(registry)),
            Box::new(OnnxGenderAge::new(registry)),
        )
    }

    pub fn with_backends(
        options: AnalyserOptions,
        detectors: Vec<Box<dyn FaceDetector>>,
        recognizer: Box<dyn FaceRecognizer>,
        landmarker: Box<dyn FaceLandmarker>,
        gender_age: Box<dyn GenderAgeEstimator>,
    ) -> Self {
        Self {
            options,
            detectors,
            recognizer,
            landmarker,
            gender_age,
            gate: Mutex::new(()),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &AnalyserOptions {
        &self.options
    }

    /// Run every enabled backend and concatenate their frame-space output.
    pub fn detect(&self, frame: &RgbImage) -> Result<Detections, AnalyseError> {
        let _gate = self
            .gate
            .lock()
            .map_err(|_| ModelError::LockPoisoned("analysis gate"))?;
        let mut all = Detections::default();
        for detector in &self.detectors {
            let found = detector.detect(frame, self.options.detector_score)?;
            tracing::debug!(detector = detector.name(), count = found.len(), "backend detections");
            all.extend(found);
        }
        Ok(all)
    }

    /// NMS-fuse candidates and build a [`Face`] for each survivor. Faces
    /// whose alignment degenerates are skipped.
    pub fn create_faces(&self, frame: &RgbImage, detections: &Detections) -> Result<Vec<Face>, AnalyseError> {
        if self.options.detector_score <= 0.0 {
            return Ok(Vec::new());
        }
        let threshold = if self.detectors.len() > 1 {
            self.options.multi_nms_threshold
        } else {
            self.options.nms_threshold
        };
        let keep = geometry::non_max_suppression(&detections.boxes, &detections.scores, threshold);

        let mut faces = Vec::with_capacity(keep.len());
        for index in keep {
            match self.build_face(
                frame,
                detections.boxes[index],
                detections.landmarks[index],
                detections.scores[index],
            ) {
                Ok(face) => faces.push(face),
                Err(AnalyseError::Geometry(e)) => {
                    tracing::warn!(index, error = %e, "skipping face with degenerate geometry");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(faces)
    }

    fn build_face(
        &self,
        frame: &RgbImage,
        bounding_box: BoundingBox,
        five: Landmark5,
        detector_score: f32,
    ) -> Result<Face, AnalyseError> {
        let sixty_eight_from_5 = self.expand_landmark_68_from_5(&five)?;

        let mut sixty_eight = sixty_eight_from_5.clone();
        let mut five_from_68 = five;
        let mut landmarker_score = 0.0;
        if self.options.landmarker_score > 0.0 {
            let (dense, score) = self.detect_landmark_68(frame, &bounding_box)?;
            sixty_eight = dense;
            landmarker_score = score;
            if score > self.options.landmarker_score {
                five_from_68 = geometry::convert_landmark_68_to_5(&sixty_eight);
            }
        }

        let (embedding, normed_embedding) = self.calc_embedding(frame, &five_from_68)?;
        let (gender, age) = self.detect_gender_age(frame, &bounding_box)?;

        Ok(Face {
            bounding_box,
            landmarks: FaceLandmarks {
                five,
                five_from_68,
                sixty_eight,
                sixty_eight_from_5,
            },
            scores: FaceScores {
                detector: detector_score,
                landmarker: landmarker_score,
            },
            embedding,
            normed_embedding,
            gender,
            age,
        })
    }

    fn expand_landmark_68_from_5(&self, five: &Landmark5) -> Result<Landmark68, AnalyseError> {
        let unit = geometry::estimate_affine(five, WarpTemplate::Ffhq512, (1.0, 1.0))?;
        let normalized = five.map(|p| unit.transform_point(p));
        let expanded = self.landmarker.expand_68_from_5(&normalized)?;
        let points: Vec<Point> = expanded.into_iter().map(|p| unit.invert_point(p)).collect();
        landmark_68(&points)
    }

    fn detect_landmark_68(
        &self,
        frame: &RgbImage,
        bounding_box: &BoundingBox,
    ) -> Result<(Landmark68, f32), AnalyseError> {
        let size = LANDMARKER_INPUT_SIZE as f32;
        let (translation, scale) = box_centred_transform(bounding_box, LANDMARKER_FACE_EXTENT, size)?;
        let (crop, affine) =
            geometry::warp_by_translation(frame, translation, scale, (LANDMARKER_INPUT_SIZE, LANDMARKER_INPUT_SIZE))?;
        let (points, score) = self.landmarker.detect_68(&crop)?;
        let points: Vec<Point> = points.into_iter().map(|p| affine.invert_point(p)).collect();
        Ok((landmark_68(&points)?, score))
    }

    fn calc_embedding(&self, frame: &RgbImage, five: &Landmark5) -> Result<(Embedding, Embedding), AnalyseError> {
        let (crop, _) = geometry::warp_face_by_landmark5(
            frame,
            five,
            WarpTemplate::Arcface112V2,
            (RECOGNIZER_INPUT_SIZE, RECOGNIZER_INPUT_SIZE),
        )?;
        let embedding = self.recognizer.embed(&crop)?;
        let normed = embedding.l2_normalized();
        Ok((embedding, normed))
    }

    fn detect_gender_age(&self, frame: &RgbImage, bounding_box: &BoundingBox) -> Result<(Gender, u8), AnalyseError> {
        let size = GENDER_AGE_INPUT_SIZE as f32;
        let (translation, scale) = box_centred_transform(bounding_box, GENDER_AGE_FACE_EXTENT, size)?;
        let (crop, _) =
            geometry::warp_by_translation(frame, translation, scale, (GENDER_AGE_INPUT_SIZE, GENDER_AGE_INPUT_SIZE))?;
        Ok(self.gender_age.estimate(&crop)?)
    }

    /// All faces of `frame`, ordered and filtered per the options. Results
    /// are cached by frame content; empty results are not.
    pub fn get_many_faces(&self, frame: &RgbImage) -> Result<Vec<Face>, AnalyseError> {
        let key = FrameKey::of(frame);
        let cached = self
            .cache
            .lock()
            .map_err(|_| ModelError::LockPoisoned("face cache"))?
            .get(&key)
            .cloned();

        let mut faces = match cached {
            Some(faces) => faces,
            None => {
                let detections = self.detect(frame)?;
                let faces = if detections.is_empty() {
                    Vec::new()
                } else {
                    self.create_faces(frame, &detections)?
                };
                if !faces.is_empty() {
                    self.cache
                        .lock()
                        .map_err(|_| ModelError::LockPoisoned("face cache"))?
                        .insert(key, faces.clone());
                }
                faces
            }
        };

        sort_by_order(&mut faces, self.options.order);
        if let Some(age) = self.options.age {
            faces = filter_by_age(faces, age);
        }
        if let Some(gender) = self.options.gender {
            faces = filter_by_gender(faces, gender);
        }
        Ok(faces)
    }

    /// Face at `position`, clamped to the last face; `None` without faces.
    pub fn get_one_face(&self, frame: &RgbImage, position: usize) -> Result<Option<Face>, AnalyseError> {
        let mut faces = self.get_many_faces(frame)?;
        if faces.is_empty() {
            return Ok(None);
        }
        let index = position.min(faces.len() - 1);
        Ok(Some(faces.swap_remove(index)))
    }

    /// One face per frame, merged: geometry from the first hit, `embedding`
    /// the mean of raw embeddings, `normed_embedding` the renormalised mean
    /// of normalised ones.
    pub fn get_average_face(&self, frames: &[RgbImage], position: usize) -> Result<Option<Face>, AnalyseError> {
        let mut faces = Vec::new();
        for frame in frames {
            if let Some(face) = self.get_one_face(frame, position)? {
                faces.push(face);
            }
        }

        let raw: Vec<Embedding> = faces.iter().map(|f| f.embedding.clone()).collect();
        let normed: Vec<Embedding> = faces.iter().map(|f| f.normed_embedding.clone()).collect();
        let (Some(embedding), Some(normed_mean)) = (Embedding::mean(&raw), Embedding::mean(&normed)) else {
            return Ok(None);
        };

        let mut average = faces.swap_remove(0);
        average.embedding = embedding;
        average.normed_embedding = normed_mean.l2_normalized();
        Ok(Some(average))
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

fn landmark_68(points: &[Point]) -> Result<Landmark68, AnalyseError> {
    Landmark68::from_points(points).ok_or_else(|| {
        AnalyseError::Model(ModelError::InferenceFailed(format!(
            "expected 68 landmarks, got {}",
            points.len()
        )))
    })
}

/// Scale + translation centring `bounding_box` in a square crop of `size`,
/// with its longer side spanning `extent` pixels.
fn box_centred_transform(bounding_box: &BoundingBox, extent: f32, size: f32) -> Result<(Point, f32), GeometryError> {
    let side = bounding_box.width().max(bounding_box.height());
    if side <= 0.0 || !side.is_finite() {
        return Err(GeometryError::Degenerate);
    }
    let scale = extent / side;
    let translation = (
        (size - (bounding_box.x1 + bounding_box.x2) * scale) * 0.5,
        (size - (bounding_box.y1 + bounding_box.y2) * scale) * 0.5,
    );
    Ok((translation, scale))
}

/// Stable sort; ties keep their detection order.
pub fn sort_by_order(faces: &mut [Face], order: FaceOrder) {
    let area = |f: &Face| f.bounding_box.area();
    match order {
        FaceOrder::LeftRight => faces.sort_by(|a, b| a.bounding_box.x1.total_cmp(&b.bounding_box.x1)),
        FaceOrder::RightLeft => faces.sort_by(|a, b| b.bounding_box.x1.total_cmp(&a.bounding_box.x1)),
        FaceOrder::TopBottom => faces.sort_by(|a, b| a.bounding_box.y1.total_cmp(&b.bounding_box.y1)),
        FaceOrder::BottomTop => faces.sort_by(|a, b| b.bounding_box.y1.total_cmp(&a.bounding_box.y1)),
        FaceOrder::SmallLarge => faces.sort_by(|a, b| area(a).total_cmp(&area(b))),
        FaceOrder::LargeSmall => faces.sort_by(|a, b| area(b).total_cmp(&area(a))),
        FaceOrder::BestWorst => faces.sort_by(|a, b| b.scores.detector.total_cmp(&a.scores.detector)),
        FaceOrder::WorstBest => faces.sort_by(|a, b| a.scores.detector.total_cmp(&b.scores.detector)),
    }
}

pub fn filter_by_age(faces: Vec<Face>, category: AgeCategory) -> Vec<Face> {
    faces.into_iter().filter(|f| AgeCategory::of(f.age) == category).collect()
}

pub fn filter_by_gender(faces: Vec<Face>, gender: Gender) -> Vec<Face> {
    faces.into_iter().filter(|f| f.gender == gender).collect()
}

/// Faces whose identity distance to `reference` is below `max_distance`.
pub fn find_similar_faces(faces: Vec<Face>, reference: &Face, max_distance: f32) -> Vec<Face> {
    faces
        .into_iter()
        .filter(|f| f.normed_embedding.distance(&reference.normed_embedding) < max_distance)
        .collect()
}
