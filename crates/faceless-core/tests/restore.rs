mod common;

use common::*;
use faceless_core::restorer::{FaceRestorer, RestorerOptions};
use faceless_core::scheduler::SchedulerOptions;
use image::Rgb;

const SKIN: Rgb<u8> = Rgb([200, 50, 50]);

fn restorer(blend: u8) -> FaceRestorer {
    let (analyser, _) = analyser();
    let options = RestorerOptions {
        blend,
        ..RestorerOptions::default()
    };
    FaceRestorer::with_model(options, analyser, masker(), Box::new(WhiteRestorer { size: 512 })).with_scheduler(
        SchedulerOptions {
            workers: 2,
            queue_per_worker: 1,
        },
    )
}

fn assert_near(actual: [u8; 3], expected: [u8; 3]) {
    for (a, e) in actual.iter().zip(expected.iter()) {
        assert!(a.abs_diff(*e) <= 1, "got {actual:?}, expected {expected:?}");
    }
}

#[test]
fn restore_video_leaves_faceless_frames_byte_identical() {
    let frames = TempDir::new("restore-video");
    frames.write("0001.png", &face_frame(Some(SKIN)));
    frames.write("0002.png", &face_frame(None));
    frames.write("0003.png", &face_frame(Some(SKIN)));
    let empty_before = std::fs::read(frames.path().join("0002.png")).unwrap();

    let summary = restorer(80).restore_video(frames.path()).unwrap();
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.rewritten, 2);
    assert_eq!(std::fs::read(frames.path().join("0002.png")).unwrap(), empty_before);

    for name in ["0001.png", "0003.png"] {
        let out = image::open(frames.path().join(name)).unwrap().into_rgb8();
        // 20% original, 80% restored white.
        assert_near(out.get_pixel(100, 100).0, [244, 214, 214]);
        assert_eq!(*out.get_pixel(5, 5), BACKGROUND);
    }
}

#[test]
fn zero_blend_keeps_original() {
    let dir = TempDir::new("restore-zero-blend");
    let input = dir.write("face.png", &face_frame(Some(SKIN)));
    let written = restorer(0).restore_images(&[input], &dir.path().join("out")).unwrap();
    let out = image::open(&written[0]).unwrap().into_rgb8();
    assert_eq!(out, face_frame(Some(SKIN)));
}

#[test]
fn restore_images_writes_every_input() {
    let dir = TempDir::new("restore-images");
    let inputs = vec![
        dir.write("a.png", &face_frame(Some(SKIN))),
        dir.write("b.png", &face_frame(None)),
    ];
    let output_dir = dir.path().join("out");
    let written = restorer(100).restore_images(&inputs, &output_dir).unwrap();

    assert_eq!(written, vec![output_dir.join("0001.png"), output_dir.join("0002.png")]);
    let restored = image::open(&written[0]).unwrap().into_rgb8();
    assert_near(restored.get_pixel(100, 100).0, [255, 255, 255]);
    let copied = image::open(&written[1]).unwrap().into_rgb8();
    assert_eq!(copied, face_frame(None));
}

#[test]
fn corrupt_frame_fails_restore_video() {
    let frames = TempDir::new("restore-corrupt");
    frames.write("0001.png", &face_frame(Some(SKIN)));
    std::fs::write(frames.path().join("0002.png"), b"\x89PNG truncated").unwrap();

    let result = restorer(80).restore_video(frames.path());
    assert!(matches!(result, Err(faceless_core::ProcessError::InvalidFrame(_))));
}

#[test]
fn restore_video_releases_cached_analysis() {
    let (analyser, calls) = analyser();
    let restorer = FaceRestorer::with_model(
        RestorerOptions::default(),
        std::sync::Arc::clone(&analyser),
        masker(),
        Box::new(WhiteRestorer { size: 512 }),
    );
    let frames = TempDir::new("restore-cache");
    frames.write("0001.png", &face_frame(Some(SKIN)));

    restorer.restore_video(frames.path()).unwrap();
    let after_job = calls.load(std::sync::atomic::Ordering::SeqCst);
    assert!(after_job >= 1);

    // The original frame was analysed during the job; a cached result would skip detection.
    analyser.get_many_faces(&face_frame(Some(SKIN))).unwrap();
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), after_job + 1);
}
