//! Frame I/O, content keys, tensor conversion and small pixel operations.

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Rgb, RgbImage};
use ndarray::{Array2, Array3, Array4};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("unreadable frame {path}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write frame {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("tensor shape {actual:?} does not match expected {expected:?}")]
    Shape { expected: Vec<usize>, actual: Vec<usize> },
}

/// Content-addressed identity of a decoded frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameKey([u8; 32]);

impl FrameKey {
    pub fn of(frame: &RgbImage) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(frame.width().to_le_bytes());
        hasher.update(frame.height().to_le_bytes());
        hasher.update(frame.as_raw());
        Self(hasher.finalize().into())
    }
}

/// Channel order a model expects its input planes in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrder {
    Rgb,
    Bgr,
}

impl ChannelOrder {
    fn source_channel(&self, plane: usize) -> usize {
        match self {
            ChannelOrder::Rgb => plane,
            ChannelOrder::Bgr => 2 - plane,
        }
    }
}

/// Decode an image file into an RGB frame.
pub fn read_frame(path: &Path) -> Result<RgbImage, FrameError> {
    image::open(path)
        .map(|img| img.into_rgb8())
        .map_err(|source| FrameError::Unreadable {
            path: path.to_path_buf(),
            source,
        })
}

/// Encode `frame` to `path`; the format follows the file extension.
pub fn write_frame(path: &Path, frame: &RgbImage) -> Result<(), FrameError> {
    frame.save(path).map_err(|source| FrameError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Regular files of a frame directory, sorted by file name.
pub fn list_frames(dir: &Path) -> Result<Vec<PathBuf>, FrameError> {
    let io_err = |source| FrameError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut frames = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        if entry.file_type().map_err(io_err)?.is_file() {
            frames.push(entry.path());
        }
    }
    frames.sort();
    Ok(frames)
}

/// Output file name for the `index`-th (0-based) image of a batch.
pub fn output_name(index: usize) -> String {
    format!("{:04}.png", index + 1)
}

/// Shrink `frame` to fit inside `max_size` keeping aspect ratio; frames that
/// already fit are returned as-is.
pub fn resize_to_fit(frame: &RgbImage, max_size: (u32, u32)) -> RgbImage {
    let (w, h) = frame.dimensions();
    if w <= max_size.0 && h <= max_size.1 {
        return frame.clone();
    }
    let scale = (max_size.0 as f32 / w as f32).min(max_size.1 as f32 / h as f32);
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);
    imageops::resize(frame, new_w, new_h, FilterType::Triangle)
}

/// Resize an RGB image to exactly `size` with bilinear filtering.
pub fn resize_exact(frame: &RgbImage, size: (u32, u32)) -> RgbImage {
    if frame.dimensions() == size {
        return frame.clone();
    }
    imageops::resize(frame, size.0, size.1, FilterType::Triangle)
}

/// Pack an RGB image into a `1×3×H×W` tensor, applying `normalize` to every
/// 0–255 sample.
pub fn to_nchw(frame: &RgbImage, order: ChannelOrder, normalize: impl Fn(usize, f32) -> f32) -> Array4<f32> {
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in frame.enumerate_pixels() {
        for plane in 0..3 {
            let value = pixel.0[order.source_channel(plane)] as f32;
            tensor[[0, plane, y as usize, x as usize]] = normalize(plane, value);
        }
    }
    tensor
}

/// Pack an RGB image into a `1×H×W×3` tensor.
pub fn to_nhwc(frame: &RgbImage, order: ChannelOrder, normalize: impl Fn(f32) -> f32) -> Array4<f32> {
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, h, w, 3));
    for (x, y, pixel) in frame.enumerate_pixels() {
        for plane in 0..3 {
            let value = pixel.0[order.source_channel(plane)] as f32;
            tensor[[0, y as usize, x as usize, plane]] = normalize(value);
        }
    }
    tensor
}

/// Unpack a `3×H×W` tensor into an RGB image, mapping each value to 0–255
/// with `denormalize`.
pub fn from_chw(tensor: &Array3<f32>, order: ChannelOrder, denormalize: impl Fn(f32) -> f32) -> RgbImage {
    let (_, h, w) = tensor.dim();
    RgbImage::from_fn(w as u32, h as u32, |x, y| {
        let mut px = [0u8; 3];
        for plane in 0..3 {
            let v = denormalize(tensor[[plane, y as usize, x as usize]]);
            px[order.source_channel(plane)] = v.round().clamp(0.0, 255.0) as u8;
        }
        Rgb(px)
    })
}

/// Reshape a flat model output into `C×H×W`, validating its length.
pub fn chw_from_slice(data: &[f32], shape: (usize, usize, usize)) -> Result<Array3<f32>, FrameError> {
    Array3::from_shape_vec(shape, data.to_vec()).map_err(|_| FrameError::Shape {
        expected: vec![shape.0, shape.1, shape.2],
        actual: vec![data.len()],
    })
}

/// Single-channel float image; values are kept in `[0, 1]`.
pub type MaskImage = ImageBuffer<Luma<f32>, Vec<f32>>;

pub fn plane_to_image(plane: &Array2<f32>) -> MaskImage {
    let (h, w) = plane.dim();
    MaskImage::from_fn(w as u32, h as u32, |x, y| Luma([plane[[y as usize, x as usize]]]))
}

pub fn image_to_plane(image: &MaskImage) -> Array2<f32> {
    Array2::from_shape_fn((image.height() as usize, image.width() as usize), |(y, x)| {
        image.get_pixel(x as u32, y as u32).0[0]
    })
}

/// Triangle-filtered resize of a mask plane to `size` (width, height).
pub fn resize_plane(plane: &Array2<f32>, size: (usize, usize)) -> Array2<f32> {
    let (h, w) = plane.dim();
    if (w, h) == size {
        return plane.clone();
    }
    let resized = imageops::resize(&plane_to_image(plane), size.0 as u32, size.1 as u32, FilterType::Triangle);
    image_to_plane(&resized)
}

/// Gaussian blur of a mask plane. A non-positive sigma is a no-op.
pub fn blur_plane(plane: &Array2<f32>, sigma: f32) -> Array2<f32> {
    if sigma <= 0.0 {
        return plane.clone();
    }
    image_to_plane(&imageops::blur(&plane_to_image(plane), sigma))
}

/// Rec. 601 luma of one pixel.
fn luma(p: &Rgb<u8>) -> f32 {
    0.299 * p.0[0] as f32 + 0.587 * p.0[1] as f32 + 0.114 * p.0[2] as f32
}

/// Average luma (0.0–255.0).
pub fn avg_brightness(frame: &RgbImage) -> f32 {
    let count = (frame.width() * frame.height()) as f32;
    if count == 0.0 {
        return 0.0;
    }
    frame.pixels().map(luma).sum::<f32>() / count
}

/// Contrast-limited adaptive histogram equalisation on the luma channel,
/// rescaling RGB so hue is preserved.
pub fn clahe_enhance(frame: &mut RgbImage, tiles: u32, clip_limit: f32) {
    let (w, h) = (frame.width() as usize, frame.height() as usize);
    let mut gray: Vec<u8> = frame.pixels().map(|p| luma(p).round().clamp(0.0, 255.0) as u8).collect();
    let before = gray.clone();
    clahe_gray(&mut gray, w, h, tiles as usize, clip_limit);

    for (i, pixel) in frame.pixels_mut().enumerate() {
        let old = before[i].max(1) as f32;
        let gain = gray[i] as f32 / old;
        pixel.0 = pixel.0.map(|c| (c as f32 * gain).round().clamp(0.0, 255.0) as u8);
    }
}

fn clahe_gray(gray: &mut [u8], w: usize, h: usize, tiles: usize, clip_limit: f32) {
    if w == 0 || h == 0 || tiles == 0 {
        return;
    }
    let tile_w = w / tiles;
    let tile_h = h / tiles;
    if tile_w == 0 || tile_h == 0 {
        return;
    }
    let tile_pixels = tile_w * tile_h;

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(tiles * tiles);
    for row in 0..tiles {
        for col in 0..tiles {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            let clip = ((clip_limit * tile_pixels as f32 / 256.0) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist + u32::from(i < leftover);
            }

            let mut cdf = [0f32; 256];
            let mut running = 0f32;
            for (i, &count) in hist.iter().enumerate() {
                running += count as f32;
                cdf[i] = running / tile_pixels as f32 * 255.0;
            }
            cdfs.push(cdf);
        }
    }

    for y in 0..h {
        for x in 0..w {
            let pixel = gray[y * w + x] as usize;
            let fy = ((y as f32 / tile_h as f32) - 0.5).clamp(0.0, (tiles - 1) as f32);
            let fx = ((x as f32 / tile_w as f32) - 0.5).clamp(0.0, (tiles - 1) as f32);
            let (r0, c0) = (fy as usize, fx as usize);
            let r1 = (r0 + 1).min(tiles - 1);
            let c1 = (c0 + 1).min(tiles - 1);
            let (dy, dx) = (fy - r0 as f32, fx - c0 as f32);

            let top = cdfs[r0 * tiles + c0][pixel] * (1.0 - dx) + cdfs[r0 * tiles + c1][pixel] * dx;
            let bot = cdfs[r1 * tiles + c0][pixel] * (1.0 - dx) + cdfs[r1 * tiles + c1][pixel] * dx;
            gray[y * w + x] = (top * (1.0 - dy) + bot * dy).round().clamp(0.0, 255.0) as u8;
        }
    }
}

/// `round(a·(1−weight) + b·weight)` per channel, saturating.
pub fn blend_frames(a: &RgbImage, b: &RgbImage, weight: f32) -> RgbImage {
    RgbImage::from_fn(a.width(), a.height(), |x, y| {
        let pa = a.get_pixel(x, y).0;
        let pb = b.get_pixel(x, y).0;
        Rgb(std::array::from_fn(|c| {
            (pa[c] as f32 * (1.0 - weight) + pb[c] as f32 * weight).round().clamp(0.0, 255.0) as u8
        }))
    })
}
