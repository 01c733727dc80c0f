//! Face detector backends via ONNX Runtime.
//!
//! Four interchangeable networks share one contract: take a frame, return
//! boxes, five-point landmarks and scores in frame coordinates. RetinaFace and
//! SCRFD use 3-stride anchor decoding, YOLOFace a dense centre-size head and
//! YuNet a 3-stride anchor-free head with separate class/objectness scores.

use crate::frame::{self, ChannelOrder};
use crate::geometry::{self, GeometryError};
use crate::models::{extract_f32, DetectorModel, LazySession, ModelError, ModelRegistry};
use crate::types::{BoundingBox, Landmark5};
use image::RgbImage;
use ndarray::Array4;
use ort::value::TensorRef;

const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const FEATURE_STRIDES: [usize; 3] = [8, 16, 32];
const ANCHORS_PER_CELL: usize = 2;
const YOLO_CHANNELS: usize = 20;
const YUNET_NMS_THRESHOLD: f32 = 0.3;

/// Raw detections of one or more backends, in frame coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Detections {
    pub boxes: Vec<BoundingBox>,
    pub landmarks: Vec<Landmark5>,
    pub scores: Vec<f32>,
}

impl Detections {
    pub fn push(&mut self, bounding_box: BoundingBox, landmark: Landmark5, score: f32) {
        self.boxes.push(bounding_box);
        self.landmarks.push(landmark);
        self.scores.push(score);
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    pub fn extend(&mut self, other: Detections) {
        self.boxes.extend(other.boxes);
        self.landmarks.extend(other.landmarks);
        self.scores.extend(other.scores);
    }

    fn retain_indices(self, keep: &[usize]) -> Detections {
        let mut out = Detections::default();
        for &i in keep {
            out.push(self.boxes[i], self.landmarks[i], self.scores[i]);
        }
        out
    }

    /// Undo the detector resize and clip boxes to the frame.
    fn rescale(mut self, ratio: (f32, f32), frame_size: (u32, u32)) -> Detections {
        let (rw, rh) = ratio;
        for b in &mut self.boxes {
            *b = BoundingBox::new(b.x1 * rw, b.y1 * rh, b.x2 * rw, b.y2 * rh)
                .clip_to(frame_size.0, frame_size.1);
        }
        for landmark in &mut self.landmarks {
            for p in landmark.iter_mut() {
                *p = (p.0 * rw, p.1 * rh);
            }
        }
        self
    }
}

pub trait FaceDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detect faces scoring at or above `score_threshold`.
    fn detect(&self, frame: &RgbImage, score_threshold: f32) -> Result<Detections, ModelError>;
}

/// Build the ONNX backend for `model` at the given input resolution.
pub fn create_detector(
    model: DetectorModel,
    registry: &ModelRegistry,
    input_size: (u32, u32),
) -> Box<dyn FaceDetector> {
    let session = registry.session(model.name(), model.file());
    match model {
        DetectorModel::Retinaface | DetectorModel::Scrfd => Box::new(AnchorDetector {
            name: model.name(),
            session,
            input_size,
        }),
        DetectorModel::Yoloface => Box::new(YoloDetector { session, input_size }),
        DetectorModel::Yunet => Box::new(YunetDetector { session, input_size }),
    }
}

/// Shrink `frame` to fit, place it top-left on a zero canvas of `size` and
/// normalise. Returns the tensor and the frame/resized ratio.
fn prepare_input(
    frame: &RgbImage,
    size: (u32, u32),
    normalize: impl Fn(f32) -> f32,
) -> (Array4<f32>, (f32, f32)) {
    let resized = frame::resize_to_fit(frame, size);
    let ratio = (
        frame.width() as f32 / resized.width() as f32,
        frame.height() as f32 / resized.height() as f32,
    );

    let mut tensor = Array4::<f32>::from_elem((1, 3, size.1 as usize, size.0 as usize), normalize(0.0));
    let placed = frame::to_nchw(&resized, ChannelOrder::Bgr, |_, v| normalize(v));
    tensor
        .slice_mut(ndarray::s![.., .., ..resized.height() as usize, ..resized.width() as usize])
        .assign(&placed);
    (tensor, ratio)
}

fn geometry_failure(what: &str, e: GeometryError) -> ModelError {
    ModelError::InferenceFailed(format!("{what}: {e}"))
}

/// Map each `(prefix, stride)` output to its tensor index. Names such as
/// `score_8` / `bbox_16` are matched when every one is present; otherwise
/// the standard positional layout (prefix-major, then stride) is assumed.
/// Models with fewer outputs than the layout needs are rejected.
fn discover_output_indices(names: &[String], prefixes: &[&str]) -> Result<Vec<Vec<usize>>, ModelError> {
    let required = prefixes.len() * FEATURE_STRIDES.len();
    if names.len() < required {
        return Err(ModelError::InferenceFailed(format!(
            "detector requires {required} outputs ({} strides x {}), got {}",
            FEATURE_STRIDES.len(),
            prefixes.join("/"),
            names.len()
        )));
    }

    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named: Option<Vec<Vec<usize>>> = FEATURE_STRIDES
        .iter()
        .map(|&stride| prefixes.iter().map(|p| find(p, stride)).collect())
        .collect();

    match named {
        Some(indices) => Ok(indices),
        None => {
            tracing::debug!(?names, "output names not recognized, using positional mapping");
            Ok((0..FEATURE_STRIDES.len())
                .map(|s| (0..prefixes.len()).map(|p| p * FEATURE_STRIDES.len() + s).collect())
                .collect())
        }
    }
}

fn output_names(session: &ort::session::Session) -> Vec<String> {
    session.outputs().iter().map(|o| o.name().to_string()).collect()
}

/// Decode one RetinaFace/SCRFD stride level (detector-space coordinates).
fn decode_anchor_stride(
    scores: &[f32],
    bboxes: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: (u32, u32),
    threshold: f32,
) -> Result<Detections, ModelError> {
    let grid_h = input_size.1 as usize / stride;
    let grid_w = input_size.0 as usize / stride;
    let anchors = geometry::make_anchors(stride, ANCHORS_PER_CELL, grid_h, grid_w);

    let keep: Vec<usize> = (0..anchors.len().min(scores.len()))
        .filter(|&i| scores[i] >= threshold)
        .collect();
    if keep.is_empty() {
        return Ok(Detections::default());
    }

    let boxes = geometry::decode_boxes(&anchors, bboxes, stride)
        .map_err(|e| geometry_failure("bbox decode", e))?;
    let landmarks = geometry::decode_landmarks5(&anchors, kps, stride)
        .map_err(|e| geometry_failure("landmark decode", e))?;

    let mut out = Detections::default();
    for i in keep {
        out.push(boxes[i], landmarks[i], scores[i]);
    }
    Ok(out)
}

/// Decode a transposed YOLOFace head: `20 × count`, channels
/// `cx, cy, w, h, score` then five `(x, y, conf)` triples.
fn decode_yolo(data: &[f32], count: usize, threshold: f32) -> Result<Detections, ModelError> {
    if data.len() != YOLO_CHANNELS * count {
        return Err(ModelError::InferenceFailed(format!(
            "yoloface output has {} values, expected {YOLO_CHANNELS}x{count}",
            data.len()
        )));
    }
    let at = |channel: usize, j: usize| data[channel * count + j];

    let mut out = Detections::default();
    for j in 0..count {
        let score = at(4, j);
        if score <= threshold {
            continue;
        }
        let (cx, cy, w, h) = (at(0, j), at(1, j), at(2, j), at(3, j));
        let bounding_box = BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0);
        let landmark = std::array::from_fn(|k| (at(5 + k * 3, j), at(6 + k * 3, j)));
        out.push(bounding_box, landmark, score);
    }
    Ok(out)
}

/// Decode one YuNet stride level over a `ceil(h/s) × ceil(w/s)` grid.
#[allow(clippy::too_many_arguments)]
fn decode_yunet_stride(
    cls: &[f32],
    obj: &[f32],
    bbox: &[f32],
    kps: &[f32],
    stride: usize,
    input_size: (u32, u32),
    threshold: f32,
) -> Result<Detections, ModelError> {
    let rows = (input_size.1 as usize).div_ceil(stride);
    let cols = (input_size.0 as usize).div_ceil(stride);
    let cells = rows * cols;
    if cls.len() < cells || obj.len() < cells || bbox.len() < cells * 4 || kps.len() < cells * 10 {
        return Err(ModelError::InferenceFailed(format!(
            "yunet stride {stride}: outputs shorter than {cells} cells"
        )));
    }

    let s = stride as f32;
    let mut out = Detections::default();
    for idx in 0..cells {
        let score = (cls[idx].clamp(0.0, 1.0) * obj[idx].clamp(0.0, 1.0)).sqrt();
        if score < threshold {
            continue;
        }
        let (r, c) = ((idx / cols) as f32, (idx % cols) as f32);
        let b = &bbox[idx * 4..idx * 4 + 4];
        let cx = (c + b[0]) * s;
        let cy = (r + b[1]) * s;
        let w = b[2].exp() * s;
        let h = b[3].exp() * s;
        let k = &kps[idx * 10..idx * 10 + 10];
        let landmark = std::array::from_fn(|n| ((k[n * 2] + c) * s, (k[n * 2 + 1] + r) * s));
        out.push(
            BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0),
            landmark,
            score,
        );
    }
    Ok(out)
}

/// RetinaFace and SCRFD: identical input and output conventions.
pub struct AnchorDetector {
    name: &'static str,
    session: LazySession,
    input_size: (u32, u32),
}

impl FaceDetector for AnchorDetector {
    fn name(&self) -> &'static str {
        self.name
    }

    fn detect(&self, frame: &RgbImage, score_threshold: f32) -> Result<Detections, ModelError> {
        let (input, ratio) = prepare_input(frame, self.input_size, |v| (v - DETECTOR_MEAN) / DETECTOR_STD);

        let detections = self.session.run_with(|session| {
            let indices = discover_output_indices(&output_names(session), &["score", "bbox", "kps"])?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            let mut all = Detections::default();
            for (level, &stride) in FEATURE_STRIDES.iter().enumerate() {
                let slots = &indices[level];
                let (_, scores) = extract_f32!(outputs, slots[0], format!("scores stride {stride}"));
                let (_, bboxes) = extract_f32!(outputs, slots[1], format!("bboxes stride {stride}"));
                let (_, kps) = extract_f32!(outputs, slots[2], format!("kps stride {stride}"));
                all.extend(decode_anchor_stride(
                    &scores,
                    &bboxes,
                    &kps,
                    stride,
                    self.input_size,
                    score_threshold,
                )?);
            }
            Ok(all)
        })?;

        tracing::debug!(model = self.name, count = detections.len(), "detected");
        Ok(detections.rescale(ratio, frame.dimensions()))
    }
}

pub struct YoloDetector {
    session: LazySession,
    input_size: (u32, u32),
}

impl FaceDetector for YoloDetector {
    fn name(&self) -> &'static str {
        "yoloface"
    }

    fn detect(&self, frame: &RgbImage, score_threshold: f32) -> Result<Detections, ModelError> {
        let (input, ratio) = prepare_input(frame, self.input_size, |v| (v - DETECTOR_MEAN) / DETECTOR_STD);

        let detections = self.session.run_with(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            let (shape, data) = extract_f32!(outputs, 0, "yoloface head");
            let count = shape.last().copied().unwrap_or(0);
            decode_yolo(&data, count, score_threshold)
        })?;

        tracing::debug!(model = "yoloface", count = detections.len(), "detected");
        Ok(detections.rescale(ratio, frame.dimensions()))
    }
}

pub struct YunetDetector {
    session: LazySession,
    input_size: (u32, u32),
}

impl FaceDetector for YunetDetector {
    fn name(&self) -> &'static str {
        "yunet"
    }

    fn detect(&self, frame: &RgbImage, score_threshold: f32) -> Result<Detections, ModelError> {
        let (input, ratio) = prepare_input(frame, self.input_size, |v| v);

        let detections = self.session.run_with(|session| {
            let indices = discover_output_indices(&output_names(session), &["cls", "obj", "bbox", "kps"])?;
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

            let mut all = Detections::default();
            for (level, &stride) in FEATURE_STRIDES.iter().enumerate() {
                let slots = &indices[level];
                let (_, cls) = extract_f32!(outputs, slots[0], format!("cls stride {stride}"));
                let (_, obj) = extract_f32!(outputs, slots[1], format!("obj stride {stride}"));
                let (_, bbox) = extract_f32!(outputs, slots[2], format!("bbox stride {stride}"));
                let (_, kps) = extract_f32!(outputs, slots[3], format!("kps stride {stride}"));
                all.extend(decode_yunet_stride(
                    &cls,
                    &obj,
                    &bbox,
                    &kps,
                    stride,
                    self.input_size,
                    score_threshold,
                )?);
            }
            Ok(all)
        })?;

        let keep = geometry::non_max_suppression(&detections.boxes, &detections.scores, YUNET_NMS_THRESHOLD);
        let detections = detections.retain_indices(&keep);
        tracing::debug!(model = "yunet", count = detections.len(), "detected");
        Ok(detections.rescale(ratio, frame.dimensions()))
    }
}
