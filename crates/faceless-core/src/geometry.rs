//! Geometry toolkit: anchors, detector output decoding, similarity-transform
//! estimation against canonical templates, warping, paste-back and NMS.

use crate::types::{BoundingBox, Landmark5, Landmark68, Point};
use image::{Rgb, RgbImage};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GeometryError {
    #[error("need {expected} point correspondences, got {actual}")]
    InsufficientPoints { expected: usize, actual: usize },
    #[error("anchor/offset row mismatch: {anchors} anchors, {rows} offset rows")]
    MismatchedRows { anchors: usize, rows: usize },
    #[error("degenerate transform: landmarks are collinear or coincident")]
    Degenerate,
}

/// Canonical five-point layouts, normalised to a unit square.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarpTemplate {
    Arcface112V1,
    Arcface112V2,
    Arcface128V2,
    Ffhq512,
}

impl WarpTemplate {
    pub fn points(&self) -> &'static Landmark5 {
        match self {
            WarpTemplate::Arcface112V1 => &[
                (0.354_732_14, 0.456_589_29),
                (0.645_267_86, 0.456_589_29),
                (0.500_000_00, 0.611_544_64),
                (0.379_133_93, 0.776_875_00),
                (0.620_866_07, 0.776_875_00),
            ],
            WarpTemplate::Arcface112V2 => &[
                (0.341_916_07, 0.461_574_11),
                (0.656_533_93, 0.459_833_93),
                (0.500_225_00, 0.640_505_36),
                (0.370_975_89, 0.824_691_96),
                (0.631_516_96, 0.823_250_89),
            ],
            WarpTemplate::Arcface128V2 => &[
                (0.361_676_56, 0.403_877_34),
                (0.636_967_19, 0.402_354_69),
                (0.500_196_87, 0.560_442_19),
                (0.387_103_91, 0.721_605_47),
                (0.615_077_34, 0.720_344_53),
            ],
            WarpTemplate::Ffhq512 => &[
                (0.376_916_76, 0.468_646_64),
                (0.622_856_97, 0.469_128_13),
                (0.501_238_59, 0.613_319_04),
                (0.393_088_22, 0.725_411_00),
                (0.611_502_05, 0.724_904_65),
            ],
        }
    }

    /// Template points scaled to a `width × height` crop.
    pub fn scaled(&self, size: (f32, f32)) -> Landmark5 {
        let mut out = *self.points();
        for p in out.iter_mut() {
            p.0 *= size.0;
            p.1 *= size.1;
        }
        out
    }
}

/// A 2×3 affine transform from frame space to crop space, with its inverse.
///
/// Both matrices are row-major `[a, b, tx, c, d, ty]`:
/// ```text
/// | a  b  tx |
/// | c  d  ty |
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AffineMatrix {
    pub forward: [f32; 6],
    pub inverse: [f32; 6],
}

impl AffineMatrix {
    pub fn new(forward: [f32; 6]) -> Result<Self, GeometryError> {
        let inverse = invert_affine(&forward).ok_or(GeometryError::Degenerate)?;
        Ok(Self { forward, inverse })
    }

    /// Pure scale + translation (used for box-centred crops).
    pub fn from_translation(translation: Point, scale: f32) -> Result<Self, GeometryError> {
        Self::new([scale, 0.0, translation.0, 0.0, scale, translation.1])
    }

    /// Map a frame-space point into crop space.
    pub fn transform_point(&self, p: Point) -> Point {
        apply(&self.forward, p)
    }

    /// Map a crop-space point back into frame space.
    pub fn invert_point(&self, p: Point) -> Point {
        apply(&self.inverse, p)
    }
}

fn apply(m: &[f32; 6], (x, y): Point) -> Point {
    (m[0] * x + m[1] * y + m[2], m[3] * x + m[4] * y + m[5])
}

fn invert_affine(m: &[f32; 6]) -> Option<[f32; 6]> {
    let (a, b, tx, c, d, ty) = (
        m[0] as f64, m[1] as f64, m[2] as f64, m[3] as f64, m[4] as f64, m[5] as f64,
    );
    let det = a * d - b * c;
    if det.abs() < 1e-12 {
        return None;
    }
    let ia = d / det;
    let ib = -b / det;
    let ic = -c / det;
    let id = a / det;
    Some([
        ia as f32,
        ib as f32,
        (-(ia * tx + ib * ty)) as f32,
        ic as f32,
        id as f32,
        (-(ic * tx + id * ty)) as f32,
    ])
}

/// Anchor centres for one feature-map stride, `anchor_count` per grid cell,
/// row-major over a `grid_h × grid_w` grid.
pub fn make_anchors(stride: usize, anchor_count: usize, grid_h: usize, grid_w: usize) -> Vec<Point> {
    let mut anchors = Vec::with_capacity(grid_h * grid_w * anchor_count);
    for row in 0..grid_h {
        for col in 0..grid_w {
            let centre = ((col * stride) as f32, (row * stride) as f32);
            for _ in 0..anchor_count {
                anchors.push(centre);
            }
        }
    }
    anchors
}

/// Decode `[left, top, right, bottom]` distance regressions (in stride units)
/// into absolute boxes. `raw_offsets` holds 4 values per anchor.
pub fn decode_boxes(
    anchors: &[Point],
    raw_offsets: &[f32],
    stride: usize,
) -> Result<Vec<BoundingBox>, GeometryError> {
    check_rows(anchors, raw_offsets, 4)?;
    let s = stride as f32;
    Ok(anchors
        .iter()
        .zip(raw_offsets.chunks_exact(4))
        .map(|(&(cx, cy), d)| {
            BoundingBox::new(cx - d[0] * s, cy - d[1] * s, cx + d[2] * s, cy + d[3] * s)
        })
        .collect())
}

/// Decode five `(dx, dy)` landmark regressions (in stride units) per anchor.
pub fn decode_landmarks5(
    anchors: &[Point],
    raw_offsets: &[f32],
    stride: usize,
) -> Result<Vec<Landmark5>, GeometryError> {
    check_rows(anchors, raw_offsets, 10)?;
    let s = stride as f32;
    Ok(anchors
        .iter()
        .zip(raw_offsets.chunks_exact(10))
        .map(|(&(cx, cy), d)| {
            std::array::from_fn(|i| (cx + d[i * 2] * s, cy + d[i * 2 + 1] * s))
        })
        .collect())
}

fn check_rows(anchors: &[Point], raw: &[f32], width: usize) -> Result<(), GeometryError> {
    if raw.len() % width != 0 || raw.len() / width != anchors.len() {
        return Err(GeometryError::MismatchedRows {
            anchors: anchors.len(),
            rows: raw.len() / width,
        });
    }
    Ok(())
}

/// Estimate the similarity transform (scale, rotation, translation) that maps
/// `landmarks` onto `template` scaled to `crop_size`, by least squares.
pub fn estimate_affine(
    landmarks: &[Point],
    template: WarpTemplate,
    crop_size: (f32, f32),
) -> Result<AffineMatrix, GeometryError> {
    let dst = template.scaled(crop_size);
    if landmarks.len() < dst.len() {
        return Err(GeometryError::InsufficientPoints {
            expected: dst.len(),
            actual: landmarks.len(),
        });
    }
    let m = estimate_similarity_transform(&landmarks[..dst.len()], &dst)?;
    AffineMatrix::new(m)
}

/// Least-squares 4-DOF fit. Returns `[a, -b, tx, b, a, ty]`.
fn estimate_similarity_transform(src: &[Point], dst: &[Point]) -> Result<[f32; 6], GeometryError> {
    // Build overdetermined system A * [a, b, tx, ty]^T = B
    // For each point pair (sx, sy) -> (dx, dy):
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f64; 16];
    let mut atb = [0.0f64; 4];

    for (&(sx, sy), &(dx, dy)) in src.iter().zip(dst.iter()) {
        let (sx, sy, dx, dy) = (sx as f64, sy as f64, dx as f64, dy as f64);
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j * 4 + k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let x = solve_4x4(&ata, &atb).ok_or(GeometryError::Degenerate)?;
    let (a, b, tx, ty) = (x[0] as f32, x[1] as f32, x[2] as f32, x[3] as f32);

    Ok([a, -b, tx, b, a, ty])
}

/// Solve a 4×4 linear system via Gaussian elimination with partial pivoting.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: &[f64; 16], atb: &[f64; 4]) -> Option<[f64; 4]> {
    let mut m = [[0.0f64; 5]; 4];
    for i in 0..4 {
        for j in 0..4 {
            m[i][j] = ata[i * 4 + j];
        }
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let mut max_row = col;
        let mut max_val = m[col][col].abs();
        for row in (col + 1)..4 {
            if m[row][col].abs() > max_val {
                max_val = m[row][col].abs();
                max_row = row;
            }
        }
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-9 {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f64; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    Some(x)
}

/// Bilinear RGB sample with replicated borders.
fn sample_rgb(frame: &RgbImage, x: f32, y: f32) -> [f32; 3] {
    let (w, h) = (frame.width() as i64, frame.height() as i64);
    let x0 = x.floor();
    let y0 = y.floor();
    let fx = x - x0;
    let fy = y - y0;
    let clamp_x = |v: i64| v.clamp(0, w - 1) as u32;
    let clamp_y = |v: i64| v.clamp(0, h - 1) as u32;
    let (x0, y0) = (x0 as i64, y0 as i64);

    let tl = frame.get_pixel(clamp_x(x0), clamp_y(y0)).0;
    let tr = frame.get_pixel(clamp_x(x0 + 1), clamp_y(y0)).0;
    let bl = frame.get_pixel(clamp_x(x0), clamp_y(y0 + 1)).0;
    let br = frame.get_pixel(clamp_x(x0 + 1), clamp_y(y0 + 1)).0;

    std::array::from_fn(|c| {
        tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
            + tr[c] as f32 * fx * (1.0 - fy)
            + bl[c] as f32 * (1.0 - fx) * fy
            + br[c] as f32 * fx * fy
    })
}

/// Bilinear sample of a single-channel plane; out-of-bounds reads are 0.
fn sample_plane_zero(plane: &Array2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = plane.dim();
    let x0 = x.floor() as i64;
    let y0 = y.floor() as i64;
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    let at = |xx: i64, yy: i64| -> f32 {
        if xx >= 0 && yy >= 0 && (xx as usize) < w && (yy as usize) < h {
            plane[[yy as usize, xx as usize]]
        } else {
            0.0
        }
    };
    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1) * (1.0 - fx) * fy
        + at(x0 + 1, y0 + 1) * fx * fy
}

/// Warp `frame` into a `size` crop using `affine` (frame → crop).
pub fn warp(frame: &RgbImage, affine: &AffineMatrix, size: (u32, u32)) -> RgbImage {
    let mut out = RgbImage::new(size.0, size.1);
    for (ox, oy, pixel) in out.enumerate_pixels_mut() {
        let (sx, sy) = affine.invert_point((ox as f32, oy as f32));
        let v = sample_rgb(frame, sx, sy);
        *pixel = Rgb(v.map(|c| c.round().clamp(0.0, 255.0) as u8));
    }
    out
}

/// Warp a 5-point-aligned crop of `frame` for a given template and size.
pub fn warp_face_by_landmark5(
    frame: &RgbImage,
    landmarks: &Landmark5,
    template: WarpTemplate,
    size: (u32, u32),
) -> Result<(RgbImage, AffineMatrix), GeometryError> {
    let affine = estimate_affine(landmarks, template, (size.0 as f32, size.1 as f32))?;
    Ok((warp(frame, &affine, size), affine))
}

/// Warp a scale + translation crop of `frame`.
pub fn warp_by_translation(
    frame: &RgbImage,
    translation: Point,
    scale: f32,
    size: (u32, u32),
) -> Result<(RgbImage, AffineMatrix), GeometryError> {
    let affine = AffineMatrix::from_translation(translation, scale)?;
    Ok((warp(frame, &affine, size), affine))
}

/// Inverse-warp `crop` into a copy of `frame`, alpha-blending with `mask`
/// (1 = crop, 0 = original). Pixels outside the crop's footprint are copied
/// unchanged.
pub fn paste_back(
    frame: &RgbImage,
    crop: &RgbImage,
    mask: &Array2<f32>,
    affine: &AffineMatrix,
) -> RgbImage {
    let mut out = frame.clone();
    let (cw, ch) = (crop.width() as f32, crop.height() as f32);

    // Frame-space footprint of the crop rectangle.
    let corners = [(0.0, 0.0), (cw, 0.0), (0.0, ch), (cw, ch)].map(|p| affine.invert_point(p));
    let min_x = corners.iter().map(|p| p.0).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let min_y = corners.iter().map(|p| p.1).fold(f32::INFINITY, f32::min).floor().max(0.0) as u32;
    let max_x = (corners.iter().map(|p| p.0).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, frame.width() as i64) as u32;
    let max_y = (corners.iter().map(|p| p.1).fold(f32::NEG_INFINITY, f32::max).ceil() as i64)
        .clamp(0, frame.height() as i64) as u32;

    for y in min_y..max_y {
        for x in min_x..max_x {
            let (cx, cy) = affine.transform_point((x as f32, y as f32));
            let alpha = sample_plane_zero(mask, cx, cy).clamp(0.0, 1.0);
            if alpha <= 0.0 {
                continue;
            }
            let synth = sample_rgb(crop, cx, cy);
            let pixel = out.get_pixel_mut(x, y);
            for c in 0..3 {
                let blended = alpha * synth[c] + (1.0 - alpha) * pixel.0[c] as f32;
                pixel.0[c] = blended.round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

/// Greedy non-maximum suppression. Returns kept indices in descending score
/// order; equal scores keep their input order. A candidate is dropped when
/// its IoU with any kept box reaches `iou_threshold`.
pub fn non_max_suppression(boxes: &[BoundingBox], scores: &[f32], iou_threshold: f32) -> Vec<usize> {
    let mut order: Vec<usize> = (0..boxes.len().min(scores.len())).collect();
    order.sort_by(|&a, &b| {
        scores[b]
            .partial_cmp(&scores[a])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<usize> = Vec::new();
    for idx in order {
        if keep.iter().all(|&k| boxes[k].iou(&boxes[idx]) < iou_threshold) {
            keep.push(idx);
        }
    }
    keep
}

fn mean_point(points: &[Point]) -> Point {
    let n = points.len() as f32;
    let (sx, sy) = points.iter().fold((0.0, 0.0), |acc, p| (acc.0 + p.0, acc.1 + p.1));
    (sx / n, sy / n)
}

/// Reduce a 68-point set to the five alignment points.
pub fn convert_landmark_68_to_5(landmark: &Landmark68) -> Landmark5 {
    let p = landmark.points();
    [
        mean_point(&p[36..42]),
        mean_point(&p[42..48]),
        p[30],
        p[48],
        p[54],
    ]
}

/// Transform every point of a set through a 2×3 matrix.
pub fn transform_points(points: &[Point], m: &[f32; 6]) -> Vec<Point> {
    points.iter().map(|&p| apply(m, p)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const REFERENCE_112: Landmark5 = [
        (38.2946, 51.6963),
        (73.5318, 51.5014),
        (56.0252, 71.7366),
        (41.5493, 92.3655),
        (70.7299, 92.2041),
    ];

    #[test]
    fn test_identity_transform() {
        let m = estimate_affine(&REFERENCE_112, WarpTemplate::Arcface112V2, (112.0, 112.0)).unwrap();
        let f = m.forward;
        assert!((f[0] - 1.0).abs() < 1e-3, "a = {}", f[0]);
        assert!(f[1].abs() < 1e-3, "-b = {}", f[1]);
        assert!(f[2].abs() < 0.1, "tx = {}", f[2]);
        assert!(f[3].abs() < 1e-3, "b = {}", f[3]);
        assert!(f[5].abs() < 0.1, "ty = {}", f[5]);
    }

    #[test]
    fn test_scaled_transform() {
        let src: Landmark5 = REFERENCE_112.map(|(x, y)| (x * 2.0, y * 2.0));
        let m = estimate_affine(&src, WarpTemplate::Arcface112V2, (112.0, 112.0)).unwrap();
        assert!((m.forward[0] - 0.5).abs() < 0.01, "a = {}, expected ~0.5", m.forward[0]);
    }

    #[test]
    fn test_insufficient_points() {
        let err = estimate_affine(&REFERENCE_112[..3], WarpTemplate::Ffhq512, (512.0, 512.0));
        assert_eq!(err, Err(GeometryError::InsufficientPoints { expected: 5, actual: 3 }));
    }

    #[test]
    fn test_coincident_points_are_degenerate() {
        let src = [(10.0, 10.0); 5];
        let err = estimate_affine(&src, WarpTemplate::Ffhq512, (512.0, 512.0));
        assert_eq!(err, Err(GeometryError::Degenerate));
    }

    #[test]
    fn test_landmark_roundtrip_through_inverse() {
        let src: Landmark5 = [
            (180.0, 140.0),
            (240.0, 135.0),
            (212.0, 180.0),
            (188.0, 215.0),
            (236.0, 212.0),
        ];
        for template in [WarpTemplate::Arcface128V2, WarpTemplate::Ffhq512] {
            let m = estimate_affine(&src, template, (256.0, 256.0)).unwrap();
            for &p in &src {
                let back = m.invert_point(m.transform_point(p));
                assert!(
                    (back.0 - p.0).abs() < 1e-2 && (back.1 - p.1).abs() < 1e-2,
                    "{p:?} -> {back:?}"
                );
            }
        }
    }

    #[test]
    fn test_anchor_grid() {
        let anchors = make_anchors(8, 2, 2, 3);
        assert_eq!(anchors.len(), 12);
        assert_eq!(anchors[0], (0.0, 0.0));
        assert_eq!(anchors[1], (0.0, 0.0));
        assert_eq!(anchors[2], (8.0, 0.0));
        assert_eq!(anchors[6], (0.0, 8.0));
        assert_eq!(anchors[11], (16.0, 8.0));
    }

    #[test]
    fn test_decode_boxes_and_landmarks() {
        let anchors = vec![(16.0, 16.0)];
        let boxes = decode_boxes(&anchors, &[1.0, 1.0, 2.0, 2.0], 8).unwrap();
        assert_eq!(boxes[0], BoundingBox::new(8.0, 8.0, 32.0, 32.0));

        let kps = [0.0, 0.0, 1.0, 0.0, 0.5, 0.5, 0.0, 1.0, 1.0, 1.0];
        let lms = decode_landmarks5(&anchors, &kps, 8).unwrap();
        assert_eq!(lms[0][1], (24.0, 16.0));
        assert_eq!(lms[0][4], (24.0, 24.0));
    }

    #[test]
    fn test_decode_rejects_mismatched_rows() {
        let anchors = vec![(0.0, 0.0), (8.0, 0.0)];
        assert_eq!(
            decode_boxes(&anchors, &[0.0; 4], 8),
            Err(GeometryError::MismatchedRows { anchors: 2, rows: 1 })
        );
    }

    #[test]
    fn test_warp_output_size() {
        let frame = RgbImage::from_pixel(64, 48, Rgb([128, 64, 32]));
        let affine = AffineMatrix::new([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).unwrap();
        let out = warp(&frame, &affine, (32, 16));
        assert_eq!(out.dimensions(), (32, 16));
        assert!(out.pixels().all(|p| p.0 == [128, 64, 32]));
    }

    #[test]
    fn test_warp_moves_bright_patch_to_template_position() {
        let mut frame = RgbImage::new(200, 200);
        let src: Landmark5 = [
            (80.0, 60.0),
            (120.0, 60.0),
            (100.0, 85.0),
            (85.0, 110.0),
            (115.0, 110.0),
        ];
        for dy in 0..5 {
            for dx in 0..5 {
                frame.put_pixel(78 + dx, 58 + dy, Rgb([255, 255, 255]));
            }
        }
        let (crop, _) = warp_face_by_landmark5(&frame, &src, WarpTemplate::Arcface112V2, (112, 112)).unwrap();
        let (rx, ry) = (REFERENCE_112[0].0.round() as u32, REFERENCE_112[0].1.round() as u32);
        let mut max_val = 0u8;
        for y in ry - 1..=ry + 1 {
            for x in rx - 1..=rx + 1 {
                max_val = max_val.max(crop.get_pixel(x, y).0[0]);
            }
        }
        assert!(max_val > 100, "expected bright patch near ({rx}, {ry}), max={max_val}");
    }

    #[test]
    fn test_paste_back_zero_mask_is_identity() {
        let frame = RgbImage::from_fn(64, 64, |x, y| Rgb([x as u8, y as u8, 7]));
        let crop = RgbImage::from_pixel(32, 32, Rgb([255, 0, 0]));
        let affine = AffineMatrix::from_translation((-10.0, -10.0), 1.0).unwrap();
        let out = paste_back(&frame, &crop, &Array2::zeros((32, 32)), &affine);
        assert_eq!(out, frame);
    }

    #[test]
    fn test_warp_then_paste_back_preserves_face_region() {
        // Gradient frame, face rotated 15 degrees and scaled 1.5x around (120, 120).
        let frame = RgbImage::from_fn(240, 240, |x, y| Rgb([x as u8, y as u8, 255 - x as u8]));
        let (sin, cos) = 15f32.to_radians().sin_cos();
        let src: Landmark5 = WarpTemplate::Arcface112V2.scaled((112.0, 112.0)).map(|(x, y)| {
            let (dx, dy) = (x - 56.0, y - 56.0);
            (120.0 + 1.5 * (cos * dx - sin * dy), 120.0 + 1.5 * (sin * dx + cos * dy))
        });

        let (crop, affine) = warp_face_by_landmark5(&frame, &src, WarpTemplate::Arcface112V2, (112, 112)).unwrap();
        let out = paste_back(&frame, &crop, &Array2::ones((112, 112)), &affine);

        let (mut interior, mut outside) = (0, 0);
        for (x, y, pixel) in out.enumerate_pixels() {
            let original = frame.get_pixel(x, y).0;
            let (cx, cy) = affine.transform_point((x as f32, y as f32));
            let inside = |v: f32| (1.0..=110.0).contains(&v);
            if inside(cx) && inside(cy) {
                interior += 1;
                for c in 0..3 {
                    assert!(
                        pixel.0[c].abs_diff(original[c]) <= 2,
                        "({x}, {y}) drifted: {:?} vs {original:?}",
                        pixel.0
                    );
                }
            } else if !(-1.0..=113.0).contains(&cx) || !(-1.0..=113.0).contains(&cy) {
                outside += 1;
                assert_eq!(pixel.0, original, "({x}, {y}) outside the footprint changed");
            }
        }
        assert!(interior > 20_000, "interior sample too small: {interior}");
        assert!(outside > 5_000, "outside sample too small: {outside}");
    }

    #[test]
    fn test_paste_back_full_mask_touches_only_footprint() {
        let frame = RgbImage::from_pixel(64, 64, Rgb([10, 20, 30]));
        let crop = RgbImage::from_pixel(16, 16, Rgb([200, 100, 50]));
        // crop (0,0) sits at frame (20,20)
        let affine = AffineMatrix::from_translation((-20.0, -20.0), 1.0).unwrap();
        let out = paste_back(&frame, &crop, &Array2::ones((16, 16)), &affine);
        assert_eq!(out.get_pixel(25, 25).0, [200, 100, 50]);
        assert_eq!(out.get_pixel(5, 5).0, [10, 20, 30]);
        assert_eq!(out.get_pixel(50, 50).0, [10, 20, 30]);
    }

    #[test]
    fn test_nms_scenario_overlap_above_threshold() {
        // IoU = 0.5: [0,0,30,20] vs [10,0,40,20] → inter 400, union 800
        let boxes = [
            BoundingBox::new(10.0, 0.0, 40.0, 20.0),
            BoundingBox::new(0.0, 0.0, 30.0, 20.0),
        ];
        assert!((boxes[0].iou(&boxes[1]) - 0.5).abs() < 1e-6);
        let keep = non_max_suppression(&boxes, &[0.6, 0.9], 0.4);
        assert_eq!(keep, vec![1]);
    }

    #[test]
    fn test_nms_kept_set_pairwise_below_threshold() {
        let boxes: Vec<BoundingBox> = (0..12)
            .map(|i| {
                let o = (i * 7 % 40) as f32;
                BoundingBox::new(o, o * 0.5, o + 30.0, o * 0.5 + 30.0)
            })
            .collect();
        let scores: Vec<f32> = (0..12).map(|i| ((i * 37) % 11) as f32 / 10.0).collect();
        for threshold in [0.1, 0.4, 0.7] {
            let keep = non_max_suppression(&boxes, &scores, threshold);
            for (i, &a) in keep.iter().enumerate() {
                for &b in &keep[i + 1..] {
                    assert!(boxes[a].iou(&boxes[b]) < threshold);
                }
            }
            assert!(keep.windows(2).all(|w| scores[w[0]] >= scores[w[1]]));
        }
    }

    #[test]
    fn test_nms_ties_keep_input_order() {
        let boxes = [
            BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            BoundingBox::new(50.0, 50.0, 60.0, 60.0),
            BoundingBox::new(100.0, 100.0, 110.0, 110.0),
        ];
        assert_eq!(non_max_suppression(&boxes, &[0.5, 0.5, 0.5], 0.4), vec![0, 1, 2]);
        assert!(non_max_suppression(&[], &[], 0.4).is_empty());
    }

    #[test]
    fn test_convert_68_to_5() {
        let mut points = [(0.0f32, 0.0f32); 68];
        for (i, p) in points.iter_mut().enumerate() {
            *p = (i as f32, 2.0 * i as f32);
        }
        let five = convert_landmark_68_to_5(&Landmark68(points));
        assert_eq!(five[0], (38.5, 77.0));
        assert_eq!(five[1], (44.5, 89.0));
        assert_eq!(five[2], (30.0, 60.0));
        assert_eq!(five[3], (48.0, 96.0));
        assert_eq!(five[4], (54.0, 108.0));
    }
}
