//! Face restoration: regenerate each detected face and blend it back at a
//! fixed strength.

use crate::analyser::FaceAnalyser;
use crate::frame::{self, ChannelOrder};
use crate::geometry;
use crate::mask::{self, FaceMasker, Padding};
use crate::models::{extract_f32, LazySession, ModelError, ModelRegistry, RestorerDescriptor, RestorerModel};
use crate::process::{self, check_crop_shape, JobSummary, ProcessError};
use crate::scheduler::SchedulerOptions;
use crate::types::Face;
use image::RgbImage;
use ndarray::{Array1, Array2, Array3, Array4};
use ort::value::TensorRef;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RestorerOptions {
    pub model: RestorerModel,
    /// Strength in percent: 0 keeps the original, 100 the restored face.
    pub blend: u8,
    pub mask_blur: f32,
    pub occlusion: bool,
}

impl Default for RestorerOptions {
    fn default() -> Self {
        Self {
            model: RestorerModel::default(),
            blend: 80,
            mask_blur: 0.3,
            occlusion: false,
        }
    }
}

pub trait RestoreInference: Send + Sync {
    /// `1×3×S×S` crop in `[-1, 1]` → `3×S×S` restored crop in `[-1, 1]`.
    fn restore(&self, crop: &Array4<f32>) -> Result<Array3<f32>, ModelError>;
}

pub struct OnnxRestorer {
    session: LazySession,
    size: (u32, u32),
    /// Whether the model declares a `weight` input; probed on first run.
    takes_weight: OnceLock<bool>,
}

impl OnnxRestorer {
    pub fn new(model: RestorerModel, registry: &ModelRegistry) -> Self {
        let descriptor = model.descriptor();
        Self {
            session: registry.session(model.name(), descriptor.file),
            size: descriptor.size,
            takes_weight: OnceLock::new(),
        }
    }

    fn takes_weight(&self) -> Result<bool, ModelError> {
        if let Some(&takes) = self.takes_weight.get() {
            return Ok(takes);
        }
        let takes = self.session.input_names()?.iter().any(|name| name == "weight");
        Ok(*self.takes_weight.get_or_init(|| takes))
    }
}

impl RestoreInference for OnnxRestorer {
    fn restore(&self, crop: &Array4<f32>) -> Result<Array3<f32>, ModelError> {
        let weight = self.takes_weight()?.then(|| Array1::from_elem(1, 1.0f64));

        let (_, data) = self.session.run_with(|session| {
            let input = TensorRef::from_array_view(crop.view())?;
            let outputs = match &weight {
                Some(weight) => {
                    let weight = TensorRef::from_array_view(weight.view())?;
                    session.run(ort::inputs!["input" => input, "weight" => weight])?
                }
                None => session.run(ort::inputs!["input" => input])?,
            };
            Ok(extract_f32!(outputs, 0, "face restoration"))
        })?;

        frame::chw_from_slice(&data, (3, self.size.1 as usize, self.size.0 as usize))
            .map_err(|e| ModelError::InferenceFailed(format!("restoration output: {e}")))
    }
}

pub struct FaceRestorer {
    options: RestorerOptions,
    descriptor: RestorerDescriptor,
    analyser: Arc<FaceAnalyser>,
    masker: Arc<FaceMasker>,
    model: Box<dyn RestoreInference>,
    scheduler: SchedulerOptions,
}

impl FaceRestorer {
    pub fn new(
        options: RestorerOptions,
        analyser: Arc<FaceAnalyser>,
        masker: Arc<FaceMasker>,
        registry: &ModelRegistry,
    ) -> Self {
        let model = Box::new(OnnxRestorer::new(options.model, registry));
        Self::with_model(options, analyser, masker, model)
    }

    pub fn with_model(
        options: RestorerOptions,
        analyser: Arc<FaceAnalyser>,
        masker: Arc<FaceMasker>,
        model: Box<dyn RestoreInference>,
    ) -> Self {
        Self {
            descriptor: options.model.descriptor(),
            options,
            analyser,
            masker,
            model,
            scheduler: SchedulerOptions::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerOptions) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn options(&self) -> &RestorerOptions {
        &self.options
    }

    pub fn restore_images(&self, images: &[PathBuf], output_dir: &Path) -> Result<Vec<PathBuf>, ProcessError> {
        process::write_batch(images, output_dir, |frame| self.process_frame(frame))
    }

    /// Restore every frame of `frames_dir` in place.
    pub fn restore_video(&self, frames_dir: &Path) -> Result<JobSummary, ProcessError> {
        let frames = frame::list_frames(frames_dir)?;
        let summary = process::rewrite_frames(self.scheduler, &frames, |frame| self.process_frame(frame));
        // Rewritten frames no longer match their cached analysis.
        self.analyser.clear_cache();
        summary
    }

    /// Restore every detected face of `frame` in turn; `None` without faces.
    pub fn process_frame(&self, frame: &RgbImage) -> Result<Option<RgbImage>, ProcessError> {
        let faces = self.analyser.get_many_faces(frame)?;
        let mut output: Option<RgbImage> = None;
        for face in &faces {
            let current = output.as_ref().unwrap_or(frame);
            match self.restore_face(face, current) {
                Ok(restored) => output = Some(restored),
                Err(ProcessError::Geometry(e)) => {
                    tracing::warn!(error = %e, bbox = ?face.bounding_box, "skipping face that cannot be aligned");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(output)
    }

    fn restore_face(&self, face: &Face, frame: &RgbImage) -> Result<RgbImage, ProcessError> {
        let d = &self.descriptor;
        let (crop, affine) =
            geometry::warp_face_by_landmark5(frame, &face.landmarks.five_from_68, d.template, d.size)?;

        let box_mask = self.masker.box_mask(d.size, self.options.mask_blur, Padding::default());
        let occlusion = if self.options.occlusion {
            Some(self.masker.occlusion_mask(&crop)?)
        } else {
            None
        };

        let input = frame::to_nchw(&crop, ChannelOrder::Rgb, |_, v| (v / 255.0 - 0.5) / 0.5);
        let output = self.model.restore(&input)?;
        check_crop_shape(&output, d.size)?;
        let restored = frame::from_chw(&output, ChannelOrder::Rgb, |v| (v.clamp(-1.0, 1.0) + 1.0) / 2.0 * 255.0);

        let stack: Vec<&Array2<f32>> = std::iter::once(box_mask.as_ref()).chain(occlusion.as_ref()).collect();
        let combined = mask::combine_masks(&stack, (d.size.0 as usize, d.size.1 as usize));
        let pasted = geometry::paste_back(frame, &restored, &combined, &affine);
        Ok(frame::blend_frames(frame, &pasted, self.blend_weight()))
    }

    fn blend_weight(&self) -> f32 {
        f32::from(self.options.blend.min(100)) / 100.0
    }
}
