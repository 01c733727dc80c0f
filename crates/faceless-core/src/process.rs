//! Shared job plumbing for the swap and restore engines: the job error
//! type, batch image output and in-place frame rewriting.

use crate::analyser::AnalyseError;
use crate::frame::{self, FrameError};
use crate::geometry::GeometryError;
use crate::models::ModelError;
use crate::scheduler::{FrameScheduler, SchedulerError, SchedulerOptions};
use image::RgbImage;
use ndarray::Array3;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("no face found in the source frames")]
    NoSourceFace,
    #[error("invalid frame: {0}")]
    InvalidFrame(#[from] FrameError),
    #[error("analysis failed: {0}")]
    Analyse(#[from] AnalyseError),
    #[error("model error: {0}")]
    Model(#[from] ModelError),
    #[error("alignment failed: {0}")]
    Geometry(#[from] GeometryError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("embedding map not found: {0}")]
    MissingEmbeddingMap(PathBuf),
}

/// Outcome of a frame-directory job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct JobSummary {
    pub frames: usize,
    /// Frames that had at least one processed face and were rewritten.
    pub rewritten: usize,
}

/// Read each input, process it, and write `NNNN.png` into `output_dir`.
/// Frames without a selected face are written unchanged.
pub(crate) fn write_batch<F>(
    inputs: &[PathBuf],
    output_dir: &Path,
    process: F,
) -> Result<Vec<PathBuf>, ProcessError>
where
    F: Fn(&RgbImage) -> Result<Option<RgbImage>, ProcessError>,
{
    std::fs::create_dir_all(output_dir).map_err(|source| FrameError::Io {
        path: output_dir.to_path_buf(),
        source,
    })?;

    let total = inputs.len();
    let mut written = Vec::with_capacity(total);
    for (index, input) in inputs.iter().enumerate() {
        tracing::debug!(index = index + 1, total, frame = %input.display(), "processing image");
        let frame = frame::read_frame(input)?;
        let output = match process(&frame)? {
            Some(output) => output,
            None => {
                tracing::warn!(frame = %input.display(), "no face processed, copying frame unchanged");
                frame
            }
        };
        let path = output_dir.join(frame::output_name(index));
        frame::write_frame(&path, &output)?;
        written.push(path);
    }
    Ok(written)
}

/// Rewrite every frame of `frames_dir` in place on a worker pool. Frames
/// without a selected face are not touched.
pub(crate) fn rewrite_frames<F>(
    scheduler: SchedulerOptions,
    frames: &[PathBuf],
    process: F,
) -> Result<JobSummary, ProcessError>
where
    F: Fn(&RgbImage) -> Result<Option<RgbImage>, ProcessError> + Sync,
{
    let total = frames.len();
    let jobs: Vec<(usize, &PathBuf)> = frames.iter().enumerate().collect();
    let rewritten = AtomicUsize::new(0);

    let pool = FrameScheduler::new(scheduler)?;
    pool.run(&jobs, |&(index, path)| -> Result<(), ProcessError> {
        tracing::debug!(index = index + 1, total, frame = %path.display(), "processing frame");
        let frame = frame::read_frame(path)?;
        if let Some(output) = process(&frame)? {
            frame::write_frame(path, &output)?;
            rewritten.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    })?;

    let summary = JobSummary {
        frames: total,
        rewritten: rewritten.into_inner(),
    };
    tracing::info!(frames = summary.frames, rewritten = summary.rewritten, "frame job finished");
    Ok(summary)
}

/// A model output crop must match the warped crop it replaces.
pub(crate) fn check_crop_shape(output: &Array3<f32>, size: (u32, u32)) -> Result<(), ModelError> {
    let expected = (3, size.1 as usize, size.0 as usize);
    if output.dim() != expected {
        return Err(ModelError::InferenceFailed(format!(
            "output crop has shape {:?}, expected {expected:?}",
            output.dim()
        )));
    }
    Ok(())
}
