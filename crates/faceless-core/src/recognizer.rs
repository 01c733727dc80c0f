//! Identity embedding and demographic estimation via ONNX Runtime.
//!
//! Both networks consume aligned crops produced by the analyser: the
//! recognizer a 112×112 `arcface_112_v2` crop, the demographic model a
//! 96×96 box-centred crop.

use crate::frame::{self, ChannelOrder};
use crate::models::{extract_f32, LazySession, ModelError, ModelRegistry, RecognizerModel, GENDER_AGE_FILE};
use crate::types::{Embedding, Gender};
use image::RgbImage;
use ort::value::TensorRef;

pub const RECOGNIZER_INPUT_SIZE: u32 = 112;
pub const GENDER_AGE_INPUT_SIZE: u32 = 96;

const ARCFACE_MEAN: f32 = 127.5;
const ARCFACE_STD: f32 = 127.5;

pub trait FaceRecognizer: Send + Sync {
    /// Raw (unnormalised) identity embedding of an aligned crop.
    fn embed(&self, crop: &RgbImage) -> Result<Embedding, ModelError>;
}

pub trait GenderAgeEstimator: Send + Sync {
    fn estimate(&self, crop: &RgbImage) -> Result<(Gender, u8), ModelError>;
}

/// ArcFace recognizer for one transfer-model family.
pub struct OnnxRecognizer {
    session: LazySession,
}

impl OnnxRecognizer {
    pub fn new(model: RecognizerModel, registry: &ModelRegistry) -> Self {
        Self {
            session: registry.session(model.name(), model.file()),
        }
    }
}

impl FaceRecognizer for OnnxRecognizer {
    fn embed(&self, crop: &RgbImage) -> Result<Embedding, ModelError> {
        let input = frame::to_nchw(crop, ChannelOrder::Rgb, |_, v| (v - ARCFACE_MEAN) / ARCFACE_STD);

        let (_, raw) = self.session.run_with(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            Ok(extract_f32!(outputs, 0, "embedding extraction"))
        })?;

        if raw.is_empty() {
            return Err(ModelError::InferenceFailed("empty embedding".to_string()));
        }
        Ok(Embedding::new(raw))
    }
}

pub struct OnnxGenderAge {
    session: LazySession,
}

impl OnnxGenderAge {
    pub fn new(registry: &ModelRegistry) -> Self {
        Self {
            session: registry.session("gender_age", GENDER_AGE_FILE),
        }
    }
}

impl GenderAgeEstimator for OnnxGenderAge {
    fn estimate(&self, crop: &RgbImage) -> Result<(Gender, u8), ModelError> {
        let input = frame::to_nchw(crop, ChannelOrder::Rgb, |_, v| v);

        let (_, prediction) = self.session.run_with(|session| {
            let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;
            Ok(extract_f32!(outputs, 0, "gender/age prediction"))
        })?;

        decode_gender_age(&prediction)
    }
}

/// `[female, male, age/100]` → (argmax gender, rounded age).
fn decode_gender_age(prediction: &[f32]) -> Result<(Gender, u8), ModelError> {
    let [female, male, age, ..] = prediction else {
        return Err(ModelError::InferenceFailed(format!(
            "gender/age output has {} values, expected 3",
            prediction.len()
        )));
    };
    let gender = Gender::from_class(usize::from(male > female));
    let age = (age * 100.0).round().clamp(0.0, u8::MAX as f32) as u8;
    Ok((gender, age))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_gender_age() {
        assert_eq!(decode_gender_age(&[0.9, 0.1, 0.254]).unwrap(), (Gender::Female, 25));
        assert_eq!(decode_gender_age(&[0.2, 0.7, 0.6]).unwrap(), (Gender::Male, 60));
        // Ties resolve to the first class, as argmax does.
        assert_eq!(decode_gender_age(&[0.5, 0.5, 0.0]).unwrap().0, Gender::Female);
    }

    #[test]
    fn test_decode_gender_age_clamps_and_validates() {
        assert_eq!(decode_gender_age(&[0.0, 1.0, 3.0]).unwrap().1, 255);
        assert_eq!(decode_gender_age(&[0.0, 1.0, -0.2]).unwrap().1, 0);
        assert!(decode_gender_age(&[0.1, 0.9]).is_err());
    }
}
