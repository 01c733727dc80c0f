mod common;

use common::*;
use image::{Rgb, RgbImage};
use std::sync::atomic::Ordering;

fn solid(colour: [u8; 3]) -> RgbImage {
    RgbImage::from_pixel(FRAME_SIZE, FRAME_SIZE, Rgb(colour))
}

#[test]
fn average_face_merges_embeddings() {
    let (analyser, _) = analyser();
    let frames = [solid([100, 0, 0]), solid([0, 100, 0])];

    let face = analyser.get_average_face(&frames, 0).unwrap().unwrap();
    assert_eq!(face.embedding.values, vec![51.0, 51.0, 1.0]);

    // Renormalised mean of the two unit embeddings.
    let n = (101.0f32 * 101.0 + 2.0).sqrt();
    let mean = [102.0 / (2.0 * n), 102.0 / (2.0 * n), 1.0 / n];
    let len = mean.iter().map(|v| v * v).sum::<f32>().sqrt();
    for (got, want) in face.normed_embedding.values.iter().zip(mean.iter()) {
        assert!((got - want / len).abs() < 1e-5, "got {got}, want {}", want / len);
    }
    assert!((face.normed_embedding.norm() - 1.0).abs() < 1e-5);
    assert_eq!(face.bounding_box, FACE_BOX);
}

#[test]
fn average_face_skips_frames_without_faces() {
    let (analyser, _) = analyser();
    let frames = [face_frame(None), solid([100, 0, 0])];
    let face = analyser.get_average_face(&frames, 0).unwrap().unwrap();
    assert_eq!(face.embedding.values, vec![101.0, 1.0, 1.0]);

    assert!(analyser.get_average_face(&[face_frame(None)], 0).unwrap().is_none());
    assert!(analyser.get_average_face(&[], 0).unwrap().is_none());
}

#[test]
fn faces_are_cached_by_frame_content() {
    let (analyser, calls) = analyser();
    let frame = solid([10, 20, 30]);

    let first = analyser.get_many_faces(&frame).unwrap();
    let second = analyser.get_many_faces(&frame.clone()).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].embedding, second[0].embedding);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Empty results are recomputed every time.
    let empty = face_frame(None);
    assert!(analyser.get_many_faces(&empty).unwrap().is_empty());
    assert!(analyser.get_many_faces(&empty).unwrap().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    analyser.clear_cache();
    analyser.get_many_faces(&frame).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[test]
fn faces_serialize_to_json() {
    let (analyser, _) = analyser();
    let faces = analyser.get_many_faces(&solid([50, 60, 70])).unwrap();
    let json = serde_json::to_value(&faces).unwrap();
    assert_eq!(json[0]["gender"], "female");
    assert_eq!(json[0]["age"], 30);
    assert_eq!(json[0]["bounding_box"]["x1"], 60.0);
}
