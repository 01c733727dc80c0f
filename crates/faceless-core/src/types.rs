use serde::{Deserialize, Serialize, Serializer};

/// A 2-D point in image coordinates.
pub type Point = (f32, f32);

/// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
pub type Landmark5 = [Point; 5];

/// Number of points in a dense landmark set.
pub const LANDMARK_68_COUNT: usize = 68;

/// Axis-aligned face bounding box in frame coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    pub fn center(&self) -> Point {
        ((self.x1 + self.x2) * 0.5, (self.y1 + self.y2) * 0.5)
    }

    /// Clamp all edges into `[0, width] × [0, height]`.
    pub fn clip_to(&self, width: u32, height: u32) -> Self {
        let (w, h) = (width as f32, height as f32);
        Self {
            x1: self.x1.clamp(0.0, w),
            y1: self.y1.clamp(0.0, h),
            x2: self.x2.clamp(0.0, w),
            y2: self.y2.clamp(0.0, h),
        }
    }

    /// Intersection-over-Union with another box.
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let inter_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - inter_area;

        if union_area > 0.0 {
            inter_area / union_area
        } else {
            0.0
        }
    }
}

/// Dense 68-point landmark set (iBUG 300-W layout).
#[derive(Debug, Clone, PartialEq)]
pub struct Landmark68(pub [Point; LANDMARK_68_COUNT]);

impl Landmark68 {
    pub fn points(&self) -> &[Point; LANDMARK_68_COUNT] {
        &self.0
    }

    /// Build from a flat slice of 68 points; `None` if the count is wrong.
    pub fn from_points(points: &[Point]) -> Option<Self> {
        let array: [Point; LANDMARK_68_COUNT] = points.try_into().ok()?;
        Some(Self(array))
    }
}

impl Serialize for Landmark68 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.0.iter())
    }
}

/// All landmark kinds derived for one face.
#[derive(Debug, Clone, Serialize)]
pub struct FaceLandmarks {
    /// Raw detector output.
    pub five: Landmark5,
    /// Five points used for warping: refined from `sixty_eight` when the
    /// landmarker was confident, otherwise equal to `five`.
    pub five_from_68: Landmark5,
    pub sixty_eight: Landmark68,
    /// Synthetic 68 points expanded from `five`.
    pub sixty_eight_from_5: Landmark68,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FaceScores {
    pub detector: f32,
    pub landmarker: f32,
}

/// Face identity embedding (512-dimensional for the ArcFace family).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unit-L2 copy. A zero vector is returned unchanged.
    pub fn l2_normalized(&self) -> Embedding {
        let norm = self.norm();
        if norm > 0.0 {
            Embedding::new(self.values.iter().map(|v| v / norm).collect())
        } else {
            self.clone()
        }
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Face distance `1 - cos`, in [0, 2]. Lower = same identity.
    pub fn distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Element-wise arithmetic mean. `None` for an empty set.
    pub fn mean(embeddings: &[Embedding]) -> Option<Embedding> {
        let first = embeddings.first()?;
        let mut acc = vec![0.0f32; first.values.len()];
        for embedding in embeddings {
            for (sum, v) in acc.iter_mut().zip(embedding.values.iter()) {
                *sum += v;
            }
        }
        let count = embeddings.len() as f32;
        Some(Embedding::new(acc.into_iter().map(|v| v / count).collect()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

impl Gender {
    /// Map the demographic model's class index (0 = female).
    pub fn from_class(class: usize) -> Self {
        if class == 0 { Gender::Female } else { Gender::Male }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeCategory {
    Child,
    Teen,
    Adult,
    Senior,
}

impl AgeCategory {
    pub fn of(age: u8) -> Self {
        match age {
            0..=12 => AgeCategory::Child,
            13..=18 => AgeCategory::Teen,
            19..=59 => AgeCategory::Adult,
            _ => AgeCategory::Senior,
        }
    }
}

/// Everything the analyser knows about one detected face.
#[derive(Debug, Clone, Serialize)]
pub struct Face {
    pub bounding_box: BoundingBox,
    pub landmarks: FaceLandmarks,
    pub scores: FaceScores,
    pub embedding: Embedding,
    pub normed_embedding: Embedding,
    pub gender: Gender,
    pub age: u8,
}

/// How many faces per frame an engine processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FaceSelectionMode {
    Many,
    #[default]
    One,
    Reference,
}

/// Ordering applied to analysed faces before selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaceOrder {
    #[default]
    LeftRight,
    RightLeft,
    TopBottom,
    BottomTop,
    SmallLarge,
    LargeSmall,
    BestWorst,
    WorstBest,
}

/// Implement `Display`/`FromStr` over a fixed name table.
macro_rules! named_enum {
    ($ty:ty, [$($variant:path => $name:literal),+ $(,)?]) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($variant),+];

            pub fn name(&self) -> &'static str {
                match self {
                    $($variant => $name),+
                }
            }
        }

        impl ::std::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.write_str(self.name())
            }
        }

        impl ::std::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($name => Ok($variant),)+
                    other => Err(format!(
                        "unknown {} '{other}', expected one of: {}",
                        stringify!($ty),
                        [$($name),+].join(", ")
                    )),
                }
            }
        }

        impl TryFrom<String> for $ty {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

pub(crate) use named_enum;

named_enum!(FaceSelectionMode, [
    FaceSelectionMode::Many => "many",
    FaceSelectionMode::One => "one",
    FaceSelectionMode::Reference => "reference",
]);

named_enum!(FaceOrder, [
    FaceOrder::LeftRight => "left-right",
    FaceOrder::RightLeft => "right-left",
    FaceOrder::TopBottom => "top-bottom",
    FaceOrder::BottomTop => "bottom-top",
    FaceOrder::SmallLarge => "small-large",
    FaceOrder::LargeSmall => "large-small",
    FaceOrder::BestWorst => "best-worst",
    FaceOrder::WorstBest => "worst-best",
]);

named_enum!(Gender, [
    Gender::Female => "female",
    Gender::Male => "male",
]);

named_enum!(AgeCategory, [
    AgeCategory::Child => "child",
    AgeCategory::Teen => "teen",
    AgeCategory::Adult => "adult",
    AgeCategory::Senior => "senior",
]);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
        assert!(a.distance(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_l2_normalized_has_unit_norm() {
        for values in [vec![3.0, 4.0], vec![-0.2, 7.5, 1e-3, 12.0], vec![1e-4; 512]] {
            let normed = Embedding::new(values).l2_normalized();
            assert!((normed.norm() - 1.0).abs() < 1e-5, "norm = {}", normed.norm());
        }
    }

    #[test]
    fn test_l2_normalized_zero_vector_unchanged() {
        let zero = Embedding::new(vec![0.0; 4]);
        assert_eq!(zero.l2_normalized(), zero);
    }

    #[test]
    fn test_mean_embedding() {
        let mean = Embedding::mean(&[
            Embedding::new(vec![1.0, 2.0]),
            Embedding::new(vec![3.0, 6.0]),
        ])
        .unwrap();
        assert_eq!(mean.values, vec![2.0, 4.0]);
        assert!(Embedding::mean(&[]).is_none());
    }

    #[test]
    fn test_iou_partial() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(5.0, 0.0, 15.0, 10.0);
        // Overlap: 5x10 = 50, union: 100+100-50 = 150
        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert!((a.iou(&a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_iou_no_overlap() {
        let a = BoundingBox::new(0.0, 0.0, 10.0, 10.0);
        let b = BoundingBox::new(20.0, 20.0, 30.0, 30.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn test_clip_to_frame() {
        let b = BoundingBox::new(-5.0, 10.0, 120.0, 90.0).clip_to(100, 80);
        assert_eq!(b, BoundingBox::new(0.0, 10.0, 100.0, 80.0));
    }

    #[test]
    fn test_age_categories() {
        assert_eq!(AgeCategory::of(5), AgeCategory::Child);
        assert_eq!(AgeCategory::of(13), AgeCategory::Teen);
        assert_eq!(AgeCategory::of(18), AgeCategory::Teen);
        assert_eq!(AgeCategory::of(19), AgeCategory::Adult);
        assert_eq!(AgeCategory::of(60), AgeCategory::Senior);
    }

    #[test]
    fn test_named_enum_roundtrip() {
        for order in FaceOrder::ALL {
            assert_eq!(order.name().parse::<FaceOrder>().unwrap(), *order);
        }
        assert!("sideways".parse::<FaceOrder>().is_err());
    }

    #[test]
    fn test_landmark68_requires_exact_count() {
        assert!(Landmark68::from_points(&[(0.0, 0.0); 68]).is_some());
        assert!(Landmark68::from_points(&[(0.0, 0.0); 5]).is_none());
    }
}
