//! Deterministic stand-ins for every inference seam, so the engines can run
//! end to end without weight files.

#![allow(dead_code)]

use faceless_core::analyser::{AnalyserOptions, FaceAnalyser};
use faceless_core::detector::{Detections, FaceDetector};
use faceless_core::geometry::WarpTemplate;
use faceless_core::landmarker::FaceLandmarker;
use faceless_core::mask::{FaceMasker, FaceOccluder, FaceParser};
use faceless_core::models::ModelError;
use faceless_core::process::ProcessError;
use faceless_core::recognizer::{FaceRecognizer, GenderAgeEstimator};
use faceless_core::restorer::RestoreInference;
use faceless_core::swapper::{SwapInference, SwapSource};
use faceless_core::types::{BoundingBox, Embedding, Gender, Landmark5, Point};
use image::{Rgb, RgbImage};
use ndarray::{Array2, Array3, Array4};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const FRAME_SIZE: u32 = 200;
pub const FACE_BOX: BoundingBox = BoundingBox {
    x1: 60.0,
    y1: 60.0,
    x2: 140.0,
    y2: 140.0,
};
pub const EMPTY: Rgb<u8> = Rgb([0, 0, 0]);
pub const BACKGROUND: Rgb<u8> = Rgb([90, 90, 90]);

/// Reports `FACE_BOX` unless the pixel at its centre is black.
pub struct MarkerDetector {
    pub calls: Arc<AtomicUsize>,
}

impl FaceDetector for MarkerDetector {
    fn name(&self) -> &'static str {
        "marker"
    }

    fn detect(&self, frame: &RgbImage, _score_threshold: f32) -> Result<Detections, ModelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut detections = Detections::default();
        let (cx, cy) = FACE_BOX.center();
        if *frame.get_pixel(cx as u32, cy as u32) != EMPTY {
            detections.push(FACE_BOX, landmarks_in(&FACE_BOX), 0.9);
        }
        Ok(detections)
    }
}

pub fn landmarks_in(b: &BoundingBox) -> Landmark5 {
    WarpTemplate::Arcface112V2
        .points()
        .map(|(x, y)| (b.x1 + x * b.width(), b.y1 + y * b.height()))
}

/// Mean crop colour shifted by one, so no embedding is zero.
pub struct ColourRecognizer;

impl FaceRecognizer for ColourRecognizer {
    fn embed(&self, crop: &RgbImage) -> Result<Embedding, ModelError> {
        let n = (crop.width() * crop.height()) as f32;
        let mut sum = [0.0f32; 3];
        for p in crop.pixels() {
            for (acc, &v) in sum.iter_mut().zip(p.0.iter()) {
                *acc += v as f32;
            }
        }
        Ok(Embedding::new(sum.iter().map(|s| s / n + 1.0).collect()))
    }
}

pub struct RepeatLandmarker;

impl FaceLandmarker for RepeatLandmarker {
    fn detect_68(&self, crop: &RgbImage) -> Result<(Vec<Point>, f32), ModelError> {
        let centre = (crop.width() as f32 / 2.0, crop.height() as f32 / 2.0);
        Ok((vec![centre; 68], 0.0))
    }

    fn expand_68_from_5(&self, points: &Landmark5) -> Result<Vec<Point>, ModelError> {
        Ok((0..68).map(|i| points[i % 5]).collect())
    }
}

pub struct AdultFemale;

impl GenderAgeEstimator for AdultFemale {
    fn estimate(&self, _crop: &RgbImage) -> Result<(Gender, u8), ModelError> {
        Ok((Gender::Female, 30))
    }
}

pub struct ClearOccluder;

impl FaceOccluder for ClearOccluder {
    fn occlusion(&self, _crop: &RgbImage) -> Result<Array2<f32>, ModelError> {
        Ok(Array2::ones((32, 32)))
    }
}

pub struct SkinParser;

impl FaceParser for SkinParser {
    fn parse(&self, _crop: &RgbImage) -> Result<Array2<u8>, ModelError> {
        Ok(Array2::from_elem((32, 32), 1))
    }
}

/// Paints the whole crop white and remembers the identity it was given.
pub struct WhiteSwapper {
    pub size: usize,
    pub seen: Arc<Mutex<Vec<SwapSource>>>,
}

impl SwapInference for WhiteSwapper {
    fn swap(&self, source: &SwapSource, _target: &Array4<f32>) -> Result<Array3<f32>, ProcessError> {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(source.clone());
        }
        Ok(Array3::ones((3, self.size, self.size)))
    }

    fn embedding_map(&self) -> Result<Arc<Array2<f32>>, ProcessError> {
        Ok(Arc::new(Array2::eye(3)))
    }
}

/// Restores every crop to pure white.
pub struct WhiteRestorer {
    pub size: usize,
}

impl RestoreInference for WhiteRestorer {
    fn restore(&self, _crop: &Array4<f32>) -> Result<Array3<f32>, ModelError> {
        Ok(Array3::ones((3, self.size, self.size)))
    }
}

/// Analyser over the fakes, with the 68-point model disabled.
pub fn analyser() -> (Arc<FaceAnalyser>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let options = AnalyserOptions {
        landmarker_score: 0.0,
        ..AnalyserOptions::default()
    };
    let analyser = FaceAnalyser::with_backends(
        options,
        vec![Box::new(MarkerDetector {
            calls: Arc::clone(&calls),
        })],
        Box::new(ColourRecognizer),
        Box::new(RepeatLandmarker),
        Box::new(AdultFemale),
    );
    (Arc::new(analyser), calls)
}

pub fn masker() -> Arc<FaceMasker> {
    Arc::new(FaceMasker::with_backends(Box::new(ClearOccluder), Box::new(SkinParser)))
}

/// Background frame with a solid face square, or an all-black frame.
pub fn face_frame(face: Option<Rgb<u8>>) -> RgbImage {
    match face {
        Some(colour) => RgbImage::from_fn(FRAME_SIZE, FRAME_SIZE, |x, y| {
            let inside = (FACE_BOX.x1 as u32..FACE_BOX.x2 as u32).contains(&x)
                && (FACE_BOX.y1 as u32..FACE_BOX.y2 as u32).contains(&y);
            if inside { colour } else { BACKGROUND }
        }),
        None => RgbImage::from_pixel(FRAME_SIZE, FRAME_SIZE, EMPTY),
    }
}

pub struct TempDir(PathBuf);

impl TempDir {
    pub fn new(name: &str) -> Self {
        let dir = std::env::temp_dir().join(format!("faceless-it-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        TempDir(dir)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }

    pub fn write(&self, name: &str, frame: &RgbImage) -> PathBuf {
        let path = self.0.join(name);
        frame.save(&path).unwrap();
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}
