//! Identity transfer: carry one averaged source identity onto the selected
//! faces of every target frame.

use crate::analyser::{self, FaceAnalyser};
use crate::frame::{self, ChannelOrder};
use crate::geometry::{self, WarpTemplate};
use crate::mask::{self, FaceMasker, MaskKind, MaskOptions};
use crate::models::{extract_f32, LazySession, ModelError, ModelRegistry, SwapperDescriptor, SwapperKind, SwapperModel};
use crate::process::{self, check_crop_shape, JobSummary, ProcessError};
use crate::scheduler::SchedulerOptions;
use crate::types::{Face, FaceSelectionMode};
use image::RgbImage;
use ndarray::{Array2, Array3, Array4};
use ort::value::TensorRef;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

const EMBEDDING_MAP_DIM: usize = 512;
const BLENDSWAP_SOURCE_SIZE: u32 = 112;
const UNIFACE_SOURCE_SIZE: u32 = 256;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SwapperOptions {
    pub model: SwapperModel,
    pub selection: FaceSelectionMode,
    /// Face index used to pick the reference face from the first target frame.
    pub reference_face_position: usize,
    /// Maximum identity distance for a target face to match the reference.
    pub reference_face_distance: f32,
    pub mask: MaskOptions,
}

impl Default for SwapperOptions {
    fn default() -> Self {
        Self {
            model: SwapperModel::default(),
            selection: FaceSelectionMode::default(),
            reference_face_position: 0,
            reference_face_distance: 0.6,
            mask: MaskOptions::default(),
        }
    }
}

/// Identity input of a transfer network.
#[derive(Debug, Clone)]
pub enum SwapSource {
    /// `1×D` identity vector.
    Embedding(Array2<f32>),
    /// `1×3×H×W` aligned source crop, RGB in `[0, 1]`.
    Frame(Array4<f32>),
}

pub trait SwapInference: Send + Sync {
    /// Normalised `1×3×S×S` target crop → `3×S×S` RGB output in `[0, 1]`.
    fn swap(&self, source: &SwapSource, target: &Array4<f32>) -> Result<Array3<f32>, ProcessError>;

    /// `512×512` projection applied to raw embeddings by inswapper models.
    fn embedding_map(&self) -> Result<Arc<Array2<f32>>, ProcessError>;
}

pub struct OnnxSwapper {
    session: LazySession,
    size: (u32, u32),
    map_path: PathBuf,
    map: OnceLock<Arc<Array2<f32>>>,
}

impl OnnxSwapper {
    pub fn new(model: SwapperModel, registry: &ModelRegistry) -> Self {
        let descriptor = model.descriptor();
        Self {
            session: registry.session(model.name(), descriptor.file),
            size: descriptor.size,
            map_path: registry.embedding_map_path(descriptor.file),
            map: OnceLock::new(),
        }
    }
}

impl SwapInference for OnnxSwapper {
    fn swap(&self, source: &SwapSource, target: &Array4<f32>) -> Result<Array3<f32>, ProcessError> {
        let (_, data) = self.session.run_with(|session| {
            let source = match source {
                SwapSource::Embedding(embedding) => TensorRef::from_array_view(embedding.view())?,
                SwapSource::Frame(crop) => TensorRef::from_array_view(crop.view())?,
            };
            let target = TensorRef::from_array_view(target.view())?;
            let outputs = session.run(ort::inputs!["source" => source, "target" => target])?;
            Ok(extract_f32!(outputs, 0, "identity transfer"))
        })?;
        let output = frame::chw_from_slice(&data, (3, self.size.1 as usize, self.size.0 as usize))
            .map_err(|e| ModelError::InferenceFailed(format!("transfer output: {e}")))?;
        Ok(output)
    }

    fn embedding_map(&self) -> Result<Arc<Array2<f32>>, ProcessError> {
        if let Some(map) = self.map.get() {
            return Ok(Arc::clone(map));
        }
        let map = Arc::new(load_embedding_map(&self.map_path)?);
        tracing::info!(path = %self.map_path.display(), "loaded embedding map");
        Ok(Arc::clone(self.map.get_or_init(|| map)))
    }
}

/// Read a raw little-endian `512×512` f32 matrix.
fn load_embedding_map(path: &Path) -> Result<Array2<f32>, ProcessError> {
    let bytes = std::fs::read(path).map_err(|_| ProcessError::MissingEmbeddingMap(path.to_path_buf()))?;
    let expected = EMBEDDING_MAP_DIM * EMBEDDING_MAP_DIM * 4;
    if bytes.len() != expected {
        return Err(ModelError::InferenceFailed(format!(
            "embedding map {} has {} bytes, expected {expected}",
            path.display(),
            bytes.len()
        ))
        .into());
    }
    let values = bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Array2::from_shape_vec((EMBEDDING_MAP_DIM, EMBEDDING_MAP_DIM), values)
        .map_err(|e| ModelError::InferenceFailed(format!("embedding map: {e}")).into())
}

fn embedding_row(values: &[f32]) -> Array2<f32> {
    Array2::from_shape_fn((1, values.len()), |(_, j)| values[j])
}

/// Averaged source face plus the frame its geometry came from.
#[derive(Debug, Clone)]
pub struct SourceIdentity {
    pub face: Face,
    pub frame: RgbImage,
}

pub struct FaceSwapper {
    options: SwapperOptions,
    descriptor: SwapperDescriptor,
    analyser: Arc<FaceAnalyser>,
    masker: Arc<FaceMasker>,
    model: Box<dyn SwapInference>,
    scheduler: SchedulerOptions,
    reference: Mutex<Option<Face>>,
}

impl FaceSwapper {
    pub fn new(
        options: SwapperOptions,
        analyser: Arc<FaceAnalyser>,
        masker: Arc<FaceMasker>,
        registry: &ModelRegistry,
    ) -> Self {
        let model = Box::new(OnnxSwapper::new(options.model, registry));
        Self::with_model(options, analyser, masker, model)
    }

    pub fn with_model(
        options: SwapperOptions,
        analyser: Arc<FaceAnalyser>,
        masker: Arc<FaceMasker>,
        model: Box<dyn SwapInference>,
    ) -> Self {
        let descriptor = options.model.descriptor();
        if analyser.options().recognizer != descriptor.recognizer {
            tracing::warn!(
                model = %options.model,
                expected = %descriptor.recognizer,
                configured = %analyser.options().recognizer,
                "recognizer does not match the transfer model"
            );
        }
        Self {
            options,
            descriptor,
            analyser,
            masker,
            model,
            scheduler: SchedulerOptions::default(),
            reference: Mutex::new(None),
        }
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerOptions) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn options(&self) -> &SwapperOptions {
        &self.options
    }

    /// Pin the face that reference mode matches targets against.
    pub fn set_reference_face(&self, face: Face) {
        if let Ok(mut reference) = self.reference.lock() {
            *reference = Some(face);
        }
    }

    pub fn reference_face(&self) -> Option<Face> {
        self.reference.lock().ok().and_then(|r| r.clone())
    }

    /// Swap the source identity onto every target image, writing
    /// `NNNN.png` files into `output_dir`.
    pub fn swap_images(
        &self,
        sources: &[PathBuf],
        targets: &[PathBuf],
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, ProcessError> {
        let source_frames = sources
            .iter()
            .map(|path| frame::read_frame(path))
            .collect::<Result<Vec<_>, _>>()?;
        let identity = self.source_identity(&source_frames)?;
        let source = self.prepare_source(&identity)?;

        if let Some(first) = targets.first() {
            self.init_reference(first)?;
        }
        process::write_batch(targets, output_dir, |target| self.process_frame(&source, target))
    }

    /// Swap the identity of `source` onto every frame of `frames_dir` in
    /// place. A source without a face aborts before any frame is read.
    pub fn swap_video(&self, source: &Path, frames_dir: &Path) -> Result<JobSummary, ProcessError> {
        let source_frame = frame::read_frame(source)?;
        let identity = self.source_identity(std::slice::from_ref(&source_frame))?;
        let source = self.prepare_source(&identity)?;

        let frames = frame::list_frames(frames_dir)?;
        if let Some(first) = frames.first() {
            self.init_reference(first)?;
        }
        let summary = process::rewrite_frames(self.scheduler, &frames, |target| self.process_frame(&source, target));
        // Rewritten frames no longer match their cached analysis.
        self.analyser.clear_cache();
        summary
    }

    /// Average the first face of every source frame into one identity.
    pub fn source_identity(&self, frames: &[RgbImage]) -> Result<SourceIdentity, ProcessError> {
        let face = self
            .analyser
            .get_average_face(frames, 0)?
            .ok_or(ProcessError::NoSourceFace)?;
        // Geometry of the average comes from the first frame with a face.
        for frame in frames {
            if self.analyser.get_one_face(frame, 0)?.is_some() {
                return Ok(SourceIdentity {
                    face,
                    frame: frame.clone(),
                });
            }
        }
        Err(ProcessError::NoSourceFace)
    }

    /// Build the model's identity input once per job.
    pub fn prepare_source(&self, identity: &SourceIdentity) -> Result<SwapSource, ProcessError> {
        let face = &identity.face;
        match self.descriptor.kind {
            SwapperKind::Inswapper => {
                let raw = &face.embedding;
                let norm = raw.norm();
                if norm == 0.0 {
                    return Err(ModelError::InferenceFailed("zero source embedding".to_string()).into());
                }
                let map = self.model.embedding_map()?;
                if raw.values.len() != map.nrows() {
                    return Err(ModelError::InferenceFailed(format!(
                        "embedding of length {} does not fit a {}×{} map",
                        raw.values.len(),
                        map.nrows(),
                        map.ncols()
                    ))
                    .into());
                }
                let projected: Vec<f32> = (0..map.ncols())
                    .map(|j| raw.values.iter().enumerate().map(|(i, v)| v * map[[i, j]]).sum::<f32>() / norm)
                    .collect();
                Ok(SwapSource::Embedding(embedding_row(&projected)))
            }
            SwapperKind::Simswap => Ok(SwapSource::Embedding(embedding_row(&face.normed_embedding.values))),
            SwapperKind::Blendswap => self.source_crop(identity, WarpTemplate::Arcface112V2, BLENDSWAP_SOURCE_SIZE),
            SwapperKind::Uniface => self.source_crop(identity, WarpTemplate::Ffhq512, UNIFACE_SOURCE_SIZE),
        }
    }

    fn source_crop(
        &self,
        identity: &SourceIdentity,
        template: WarpTemplate,
        size: u32,
    ) -> Result<SwapSource, ProcessError> {
        let (crop, _) = geometry::warp_face_by_landmark5(
            &identity.frame,
            &identity.face.landmarks.five_from_68,
            template,
            (size, size),
        )?;
        Ok(SwapSource::Frame(frame::to_nchw(&crop, ChannelOrder::Rgb, |_, v| v / 255.0)))
    }

    fn init_reference(&self, first_target: &Path) -> Result<(), ProcessError> {
        if self.options.selection != FaceSelectionMode::Reference || self.reference_face().is_some() {
            return Ok(());
        }
        let frame = frame::read_frame(first_target)?;
        match self
            .analyser
            .get_one_face(&frame, self.options.reference_face_position)?
        {
            Some(face) => self.set_reference_face(face),
            None => tracing::warn!(frame = %first_target.display(), "no reference face in first target frame"),
        }
        Ok(())
    }

    fn select_faces(&self, frame: &RgbImage) -> Result<Vec<Face>, ProcessError> {
        let faces = match self.options.selection {
            FaceSelectionMode::Many => self.analyser.get_many_faces(frame)?,
            FaceSelectionMode::One => self.analyser.get_one_face(frame, 0)?.into_iter().collect(),
            FaceSelectionMode::Reference => match self.reference_face() {
                Some(reference) => analyser::find_similar_faces(
                    self.analyser.get_many_faces(frame)?,
                    &reference,
                    self.options.reference_face_distance,
                ),
                None => Vec::new(),
            },
        };
        Ok(faces)
    }

    /// Swap every selected face of `frame`; `None` when nothing was swapped.
    pub fn process_frame(&self, source: &SwapSource, frame: &RgbImage) -> Result<Option<RgbImage>, ProcessError> {
        let faces = self.select_faces(frame)?;
        let mut output: Option<RgbImage> = None;
        for face in &faces {
            let current = output.as_ref().unwrap_or(frame);
            match self.swap_face(source, face, current) {
                Ok(swapped) => output = Some(swapped),
                Err(ProcessError::Geometry(e)) => {
                    tracing::warn!(error = %e, bbox = ?face.bounding_box, "skipping face that cannot be aligned");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(output)
    }

    fn swap_face(&self, source: &SwapSource, target: &Face, frame: &RgbImage) -> Result<RgbImage, ProcessError> {
        let d = &self.descriptor;
        let (crop, affine) =
            geometry::warp_face_by_landmark5(frame, &target.landmarks.five_from_68, d.template, d.size)?;

        let mask_options = &self.options.mask;
        let box_mask = mask_options
            .wants(MaskKind::Box)
            .then(|| self.masker.box_mask(d.size, mask_options.blur, mask_options.padding));
        let occlusion = if mask_options.wants(MaskKind::Occlusion) {
            Some(self.masker.occlusion_mask(&crop)?)
        } else {
            None
        };

        let input = frame::to_nchw(&crop, ChannelOrder::Rgb, |c, v| (v / 255.0 - d.mean[c]) / d.std[c]);
        let output = self.model.swap(source, &input)?;
        check_crop_shape(&output, d.size)?;
        let swapped = frame::from_chw(&output, ChannelOrder::Rgb, |v| v * 255.0);

        let region = if mask_options.wants(MaskKind::Region) {
            Some(self.masker.region_mask(&swapped, &mask_options.regions)?)
        } else {
            None
        };

        let stack: Vec<&Array2<f32>> = box_mask
            .as_deref()
            .into_iter()
            .chain(occlusion.as_ref())
            .chain(region.as_ref())
            .collect();
        let combined = mask::combine_masks(&stack, (d.size.0 as usize, d.size.1 as usize));
        Ok(geometry::paste_back(frame, &swapped, &combined, &affine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = SwapperOptions::default();
        assert_eq!(options.model, SwapperModel::Inswapper128);
        assert_eq!(options.selection, FaceSelectionMode::One);
        assert!((options.reference_face_distance - 0.6).abs() < 1e-6);
        assert_eq!(options.mask.kinds, vec![MaskKind::Box]);
    }

    #[test]
    fn test_options_from_json() {
        let options: SwapperOptions = serde_json::from_str(
            r#"{"model": "simswap_256", "selection": "many", "mask": {"kinds": ["box", "region"]}}"#,
        )
        .unwrap();
        assert_eq!(options.model, SwapperModel::Simswap256);
        assert_eq!(options.selection, FaceSelectionMode::Many);
        assert!(options.mask.wants(MaskKind::Region));
        assert!((options.mask.blur - 0.3).abs() < 1e-6);
    }

    #[test]
    fn test_missing_embedding_map() {
        let path = std::env::temp_dir().join(format!("faceless-missing-{}.emap", std::process::id()));
        assert!(matches!(
            load_embedding_map(&path),
            Err(ProcessError::MissingEmbeddingMap(p)) if p == path
        ));
    }

    #[test]
    fn test_embedding_map_is_little_endian_row_major() {
        let path = std::env::temp_dir().join(format!("faceless-map-{}.emap", std::process::id()));
        let mut bytes = Vec::with_capacity(EMBEDDING_MAP_DIM * EMBEDDING_MAP_DIM * 4);
        for i in 0..EMBEDDING_MAP_DIM * EMBEDDING_MAP_DIM {
            bytes.extend_from_slice(&(i as f32).to_le_bytes());
        }
        std::fs::write(&path, &bytes).unwrap();
        let map = load_embedding_map(&path).unwrap();
        assert_eq!(map[[0, 1]], 1.0);
        assert_eq!(map[[1, 0]], EMBEDDING_MAP_DIM as f32);

        std::fs::write(&path, &bytes[..16]).unwrap();
        assert!(matches!(load_embedding_map(&path), Err(ProcessError::Model(_))));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_onnx_swapper_resolves_sidecar_map() {
        let registry = ModelRegistry::new("/nonexistent/models");
        let swapper = OnnxSwapper::new(SwapperModel::Inswapper128, &registry);
        assert_eq!(swapper.map_path, PathBuf::from("/nonexistent/models/inswapper_128.emap"));
        assert!(matches!(swapper.embedding_map(), Err(ProcessError::MissingEmbeddingMap(_))));
        assert!(!swapper.session.is_loaded());
    }
}
