//! faceless-core: face analysis, identity transfer and restoration.
//!
//! Faces are detected with one or more ONNX detectors, fused with NMS,
//! refined to 68 landmarks and embedded with ArcFace. The swap and restore
//! engines warp each face into a canonical crop, run their network, and
//! composite the result back through a mask stack.

pub mod analyser;
pub mod detector;
pub mod frame;
pub mod geometry;
pub mod landmarker;
pub mod mask;
pub mod models;
pub mod process;
pub mod recognizer;
pub mod restorer;
pub mod scheduler;
pub mod swapper;
pub mod types;

pub use analyser::{AnalyseError, AnalyserOptions, FaceAnalyser};
pub use mask::{FaceMasker, MaskOptions};
pub use models::{ModelError, ModelRegistry};
pub use process::{JobSummary, ProcessError};
pub use restorer::{FaceRestorer, RestorerOptions};
pub use scheduler::SchedulerOptions;
pub use swapper::{FaceSwapper, SwapperOptions};
pub use types::{BoundingBox, Embedding, Face, FaceSelectionMode};
