//! Model catalogue and lazily-loaded ONNX Runtime sessions.
//!
//! Every supported network is a closed enum variant with a static descriptor;
//! weight files are resolved against a [`ModelRegistry`] directory and opened
//! on first use.

use crate::geometry::WarpTemplate;
use crate::types::named_enum;
use ort::session::Session;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use thiserror::Error;

pub const LANDMARKER_68_FILE: &str = "2dfan4.onnx";
pub const LANDMARKER_68_FROM_5_FILE: &str = "face_landmarker_68_5.onnx";
pub const GENDER_AGE_FILE: &str = "gender_age.onnx";
pub const OCCLUDER_FILE: &str = "face_occluder.onnx";
pub const PARSER_FILE: &str = "face_parser.onnx";

const SESSION_INTRA_THREADS: usize = 2;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("model file not found: {0}")]
    ModelNotFound(PathBuf),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
    #[error("session lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

/// `$XDG_DATA_HOME/faceless/models`, falling back to `~/.local/share`.
pub fn default_model_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceless")
        .join("models")
}

/// Resolves model file names to paths inside one weight directory.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    model_dir: PathBuf,
}

impl ModelRegistry {
    pub fn new(model_dir: impl Into<PathBuf>) -> Self {
        Self {
            model_dir: model_dir.into(),
        }
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.model_dir.join(file)
    }

    /// A session handle for `file`; nothing is opened until first use.
    pub fn session(&self, label: &'static str, file: &str) -> LazySession {
        LazySession::new(label, self.path(file))
    }

    /// Sidecar embedding map for a transfer model (`<stem>.emap`).
    pub fn embedding_map_path(&self, model_file: &str) -> PathBuf {
        self.path(model_file).with_extension("emap")
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(default_model_dir())
    }
}

fn load_session(path: &Path, label: &str) -> Result<Session, ModelError> {
    if !path.exists() {
        return Err(ModelError::ModelNotFound(path.to_path_buf()));
    }

    let session = Session::builder()?
        .with_intra_threads(SESSION_INTRA_THREADS)?
        .commit_from_file(path)?;

    tracing::info!(
        model = label,
        path = %path.display(),
        inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
        outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
        "loaded model"
    );

    Ok(session)
}

/// An ONNX session opened on first use and shared afterwards.
///
/// Initialisation is double-checked under `init`; every inference call holds
/// the session's own mutex, so at most one call per model is in flight.
pub struct LazySession {
    label: &'static str,
    path: PathBuf,
    init: Mutex<()>,
    cell: OnceLock<Mutex<Session>>,
}

impl LazySession {
    pub fn new(label: &'static str, path: PathBuf) -> Self {
        Self {
            label,
            path,
            init: Mutex::new(()),
            cell: OnceLock::new(),
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    fn session(&self) -> Result<&Mutex<Session>, ModelError> {
        if let Some(session) = self.cell.get() {
            return Ok(session);
        }
        let _guard = self
            .init
            .lock()
            .map_err(|_| ModelError::LockPoisoned(self.label))?;
        if let Some(session) = self.cell.get() {
            return Ok(session);
        }
        let session = load_session(&self.path, self.label)?;
        Ok(self.cell.get_or_init(|| Mutex::new(session)))
    }

    /// Run `f` with exclusive access to the loaded session.
    pub fn run_with<T>(
        &self,
        f: impl FnOnce(&mut Session) -> Result<T, ModelError>,
    ) -> Result<T, ModelError> {
        let mutex = self.session()?;
        let mut session = mutex
            .lock()
            .map_err(|_| ModelError::LockPoisoned(self.label))?;
        f(&mut session)
    }

    pub fn input_names(&self) -> Result<Vec<String>, ModelError> {
        self.run_with(|session| {
            Ok(session
                .inputs()
                .iter()
                .map(|i| i.name().to_string())
                .collect())
        })
    }
}

/// Copy the `index`-th output tensor out of a session result as `f32`.
/// A missing output is an inference failure.
macro_rules! extract_f32 {
    ($outputs:expr, $index:expr, $what:expr) => {{
        let index: usize = $index;
        if index >= $outputs.len() {
            return Err($crate::models::ModelError::InferenceFailed(format!(
                "{}: model has {} outputs, wanted index {index}",
                $what,
                $outputs.len()
            )));
        }
        let (shape, data) = $outputs[index].try_extract_tensor::<f32>().map_err(|e| {
            $crate::models::ModelError::InferenceFailed(format!("{}: {e}", $what))
        })?;
        let shape: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
        (shape, data.to_vec())
    }};
}

pub(crate) use extract_f32;

/// Individual face detection networks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DetectorModel {
    Retinaface,
    Scrfd,
    Yoloface,
    Yunet,
}

named_enum!(DetectorModel, [
    DetectorModel::Retinaface => "retinaface",
    DetectorModel::Scrfd => "scrfd",
    DetectorModel::Yoloface => "yoloface",
    DetectorModel::Yunet => "yunet",
]);

impl DetectorModel {
    pub fn file(&self) -> &'static str {
        match self {
            DetectorModel::Retinaface => "retinaface_10g.onnx",
            DetectorModel::Scrfd => "scrfd_2.5g.onnx",
            DetectorModel::Yoloface => "yoloface_8n.onnx",
            DetectorModel::Yunet => "yunet_2023mar.onnx",
        }
    }
}

/// Configured detector backend set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum DetectorSelection {
    Retinaface,
    Scrfd,
    #[default]
    Yoloface,
    Yunet,
    Many,
}

named_enum!(DetectorSelection, [
    DetectorSelection::Retinaface => "retinaface",
    DetectorSelection::Scrfd => "scrfd",
    DetectorSelection::Yoloface => "yoloface",
    DetectorSelection::Yunet => "yunet",
    DetectorSelection::Many => "many",
]);

impl DetectorSelection {
    /// Backends run for this selection; `many` excludes yunet.
    pub fn backends(&self) -> Vec<DetectorModel> {
        match self {
            DetectorSelection::Retinaface => vec![DetectorModel::Retinaface],
            DetectorSelection::Scrfd => vec![DetectorModel::Scrfd],
            DetectorSelection::Yoloface => vec![DetectorModel::Yoloface],
            DetectorSelection::Yunet => vec![DetectorModel::Yunet],
            DetectorSelection::Many => vec![
                DetectorModel::Retinaface,
                DetectorModel::Scrfd,
                DetectorModel::Yoloface,
            ],
        }
    }
}

/// Identity embedding networks, one per transfer-model family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum RecognizerModel {
    ArcfaceBlendswap,
    #[default]
    ArcfaceInswapper,
    ArcfaceSimswap,
    ArcfaceUniface,
}

named_enum!(RecognizerModel, [
    RecognizerModel::ArcfaceBlendswap => "arcface_blendswap",
    RecognizerModel::ArcfaceInswapper => "arcface_inswapper",
    RecognizerModel::ArcfaceSimswap => "arcface_simswap",
    RecognizerModel::ArcfaceUniface => "arcface_uniface",
]);

impl RecognizerModel {
    pub fn file(&self) -> &'static str {
        match self {
            RecognizerModel::ArcfaceSimswap => "arcface_simswap.onnx",
            _ => "arcface_w600k_r50.onnx",
        }
    }
}

/// Input convention of an identity-transfer network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapperKind {
    /// Source given as an aligned face crop.
    Blendswap,
    /// Source given as an embedding projected through the model's map.
    Inswapper,
    /// Source given as the normalised embedding.
    Simswap,
    /// Source given as an aligned face crop.
    Uniface,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwapperDescriptor {
    pub kind: SwapperKind,
    pub file: &'static str,
    pub template: WarpTemplate,
    pub size: (u32, u32),
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub recognizer: RecognizerModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum SwapperModel {
    Blendswap256,
    #[default]
    Inswapper128,
    Inswapper128Fp16,
    Simswap256,
    Simswap512Unofficial,
    Uniface256,
}

named_enum!(SwapperModel, [
    SwapperModel::Blendswap256 => "blendswap_256",
    SwapperModel::Inswapper128 => "inswapper_128",
    SwapperModel::Inswapper128Fp16 => "inswapper_128_fp16",
    SwapperModel::Simswap256 => "simswap_256",
    SwapperModel::Simswap512Unofficial => "simswap_512_unofficial",
    SwapperModel::Uniface256 => "uniface_256",
]);

const UNIT_MEAN: [f32; 3] = [0.0, 0.0, 0.0];
const UNIT_STD: [f32; 3] = [1.0, 1.0, 1.0];
const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

impl SwapperModel {
    pub fn descriptor(&self) -> SwapperDescriptor {
        let base = |kind, file, template, size: u32, recognizer| SwapperDescriptor {
            kind,
            file,
            template,
            size: (size, size),
            mean: UNIT_MEAN,
            std: UNIT_STD,
            recognizer,
        };
        match self {
            SwapperModel::Blendswap256 => base(
                SwapperKind::Blendswap,
                "blendswap_256.onnx",
                WarpTemplate::Ffhq512,
                256,
                RecognizerModel::ArcfaceBlendswap,
            ),
            SwapperModel::Inswapper128 => base(
                SwapperKind::Inswapper,
                "inswapper_128.onnx",
                WarpTemplate::Arcface128V2,
                128,
                RecognizerModel::ArcfaceInswapper,
            ),
            SwapperModel::Inswapper128Fp16 => base(
                SwapperKind::Inswapper,
                "inswapper_128_fp16.onnx",
                WarpTemplate::Arcface128V2,
                128,
                RecognizerModel::ArcfaceInswapper,
            ),
            SwapperModel::Simswap256 => SwapperDescriptor {
                mean: IMAGENET_MEAN,
                std: IMAGENET_STD,
                ..base(
                    SwapperKind::Simswap,
                    "simswap_256.onnx",
                    WarpTemplate::Arcface112V1,
                    256,
                    RecognizerModel::ArcfaceSimswap,
                )
            },
            SwapperModel::Simswap512Unofficial => base(
                SwapperKind::Simswap,
                "simswap_512_unofficial.onnx",
                WarpTemplate::Arcface112V1,
                512,
                RecognizerModel::ArcfaceSimswap,
            ),
            SwapperModel::Uniface256 => base(
                SwapperKind::Uniface,
                "uniface_256.onnx",
                WarpTemplate::Ffhq512,
                256,
                RecognizerModel::ArcfaceUniface,
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestorerDescriptor {
    pub file: &'static str,
    pub template: WarpTemplate,
    pub size: (u32, u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(try_from = "String")]
pub enum RestorerModel {
    Codeformer,
    Gfpgan12,
    Gfpgan13,
    #[default]
    Gfpgan14,
    GpenBfr256,
    GpenBfr512,
    GpenBfr1024,
    GpenBfr2048,
    RestoreformerPlusPlus,
}

named_enum!(RestorerModel, [
    RestorerModel::Codeformer => "codeformer",
    RestorerModel::Gfpgan12 => "gfpgan_1.2",
    RestorerModel::Gfpgan13 => "gfpgan_1.3",
    RestorerModel::Gfpgan14 => "gfpgan_1.4",
    RestorerModel::GpenBfr256 => "gpen_bfr_256",
    RestorerModel::GpenBfr512 => "gpen_bfr_512",
    RestorerModel::GpenBfr1024 => "gpen_bfr_1024",
    RestorerModel::GpenBfr2048 => "gpen_bfr_2048",
    RestorerModel::RestoreformerPlusPlus => "restoreformer_plus_plus",
]);

impl RestorerModel {
    pub fn descriptor(&self) -> RestorerDescriptor {
        let (file, template, size) = match self {
            RestorerModel::Codeformer => ("codeformer.onnx", WarpTemplate::Ffhq512, 512),
            RestorerModel::Gfpgan12 => ("gfpgan_1.2.onnx", WarpTemplate::Ffhq512, 512),
            RestorerModel::Gfpgan13 => ("gfpgan_1.3.onnx", WarpTemplate::Ffhq512, 512),
            RestorerModel::Gfpgan14 => ("gfpgan_1.4.onnx", WarpTemplate::Ffhq512, 512),
            RestorerModel::GpenBfr256 => ("gpen_bfr_256.onnx", WarpTemplate::Arcface128V2, 256),
            RestorerModel::GpenBfr512 => ("gpen_bfr_512.onnx", WarpTemplate::Ffhq512, 512),
            RestorerModel::GpenBfr1024 => ("gpen_bfr_1024.onnx", WarpTemplate::Ffhq512, 1024),
            RestorerModel::GpenBfr2048 => ("gpen_bfr_2048.onnx", WarpTemplate::Ffhq512, 2048),
            RestorerModel::RestoreformerPlusPlus => {
                ("restoreformer_plus_plus.onnx", WarpTemplate::Ffhq512, 512)
            }
        };
        RestorerDescriptor {
            file,
            template,
            size: (size, size),
        }
    }
}
