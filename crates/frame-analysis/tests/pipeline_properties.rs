//! End-to-end properties of the sampling pipeline over an in-memory video

use blade_inspect_common::{ProcessingError, VideoStream};
use blade_inspect_frame_analysis::{
    FrameSource, PipelineConfig, PipelineError, ProcessorConfig, Termination, VideoPipeline,
};
use blade_inspect_object_detection::{BoundingBox, Detection, Detector, ObjectDetectionError};
use image::{Rgb, RgbImage};
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// In-memory frame source; the frame index is painted into the first pixel
struct SyntheticVideo {
    stream: VideoStream,
    next: u64,
    fail_at: Option<u64>,
}

impl SyntheticVideo {
    fn new(fps: u32, frames: u64) -> Self {
        Self {
            stream: VideoStream::new(fps, frames).unwrap(),
            next: 0,
            fail_at: None,
        }
    }

    fn failing_at(mut self, index: u64) -> Self {
        self.fail_at = Some(index);
        self
    }
}

impl Iterator for SyntheticVideo {
    type Item = blade_inspect_common::Result<RgbImage>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.stream.total_frame_count {
            return None;
        }
        if self.fail_at == Some(self.next) {
            self.next = self.stream.total_frame_count;
            return Some(Err(ProcessingError::CorruptedFile(
                "invalid data found when processing input".to_string(),
            )));
        }
        let index = self.next;
        self.next += 1;
        Some(Ok(paint_index(index)))
    }
}

impl FrameSource for SyntheticVideo {
    fn stream(&self) -> VideoStream {
        self.stream
    }
}

fn paint_index(index: u64) -> RgbImage {
    let mut img = RgbImage::from_pixel(32, 24, Rgb([40, 40, 40]));
    img.put_pixel(0, 0, Rgb([(index >> 16) as u8, (index >> 8) as u8, index as u8]));
    img
}

fn read_index(img: &RgbImage) -> u64 {
    let px = img.get_pixel(0, 0);
    (u64::from(px[0]) << 16) | (u64::from(px[1]) << 8) | u64::from(px[2])
}

/// Deterministic detector: one detection per frame whose box depends on the
/// painted index; fails on the configured frame
struct IndexDetector {
    names: Vec<String>,
    fail_on: Option<u64>,
    calls: AtomicUsize,
}

impl IndexDetector {
    fn new() -> Self {
        Self {
            names: vec!["crack".to_string(), "erosion".to_string()],
            fail_on: None,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Detector for IndexDetector {
    fn detect(
        &self,
        image: &RgbImage,
        _confidence_threshold: f32,
    ) -> Result<Vec<Detection>, ObjectDetectionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let index = read_index(image);
        if self.fail_on == Some(index) {
            return Err(ObjectDetectionError::Inference(format!(
                "tensor shape mismatch on frame {index}"
            )));
        }
        // Uneven work so parallel workers finish out of order
        if index % 2 == 0 {
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        let class_id = (index % 2) as u32;
        Ok(vec![Detection {
            class_id,
            class_name: self.names[class_id as usize].clone(),
            confidence: 0.5,
            bbox: BoundingBox::new(1.0, 1.0, 2.0 + (index % 20) as f32, 10.0),
        }])
    }

    fn class_names(&self) -> &[String] {
        &self.names
    }
}

struct EmptyDetector;

impl Detector for EmptyDetector {
    fn detect(&self, _: &RgbImage, _: f32) -> Result<Vec<Detection>, ObjectDetectionError> {
        Ok(Vec::new())
    }

    fn class_names(&self) -> &[String] {
        &[]
    }
}

fn config(workers: usize) -> PipelineConfig {
    PipelineConfig {
        workers,
        processor: ProcessorConfig {
            encode_frames: false,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn indices(result: &blade_inspect_frame_analysis::AggregateResult) -> Vec<u64> {
    result.frames.iter().map(|f| f.frame_index).collect()
}

#[test]
fn test_thirty_fps_ten_seconds_gives_twenty_frames() {
    init_tracing();
    let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config(1));
    let result = pipeline.analyze(SyntheticVideo::new(30, 300), || false).unwrap();

    assert_eq!(result.sampling_interval, 15);
    assert_eq!(result.frames.len(), 20);
    assert_eq!(indices(&result), (0..300).step_by(15).collect::<Vec<u64>>());
    assert_eq!(result.stream.duration, 10.0);
    assert_eq!(result.termination, Termination::Completed);
    assert!(!result.is_partial());
}

#[test]
fn test_one_fps_analyses_every_frame() {
    let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config(1));
    let result = pipeline.analyze(SyntheticVideo::new(1, 7), || false).unwrap();

    assert_eq!(result.sampling_interval, 1);
    assert_eq!(indices(&result), (0..7).collect::<Vec<u64>>());
}

#[test]
fn test_interval_and_timestamps_hold_across_frame_rates() {
    for fps in [2, 5, 24, 25, 29, 30, 50, 60] {
        let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config(1));
        let result = pipeline
            .analyze(SyntheticVideo::new(fps, u64::from(fps) * 3), || false)
            .unwrap();

        let interval = (fps / 2).max(1);
        assert_eq!(result.sampling_interval, interval, "fps {fps}");
        for frame in &result.frames {
            assert_eq!(frame.frame_index % u64::from(interval), 0);
            assert_eq!(
                frame.timestamp_seconds,
                frame.frame_index as f64 / f64::from(fps)
            );
        }
    }
}

#[test]
fn test_workers_preserve_order_and_match_sequential_run() {
    init_tracing();
    let sequential = VideoPipeline::new(Arc::new(IndexDetector::new()), config(1))
        .analyze(SyntheticVideo::new(4, 120), || false)
        .unwrap();

    for _ in 0..3 {
        let parallel = VideoPipeline::new(Arc::new(IndexDetector::new()), config(4))
            .analyze(SyntheticVideo::new(4, 120), || false)
            .unwrap();

        let order = indices(&parallel);
        assert!(order.windows(2).all(|w| w[0] < w[1]), "not ascending: {order:?}");
        assert_eq!(parallel.frames, sequential.frames);
        assert_eq!(parallel.frame_count_processed, 60);
    }
}

#[test]
fn test_encoded_frames_are_jpeg() {
    let config = PipelineConfig {
        workers: 2,
        ..Default::default()
    };
    let pipeline = VideoPipeline::new(Arc::new(EmptyDetector), config);
    let result = pipeline.analyze(SyntheticVideo::new(10, 20), || false).unwrap();

    assert_eq!(result.frames.len(), 4);
    for frame in &result.frames {
        assert_eq!(&frame.encoded_image[..2], &[0xFF, 0xD8]);
    }
}

#[test]
fn test_zero_detections_keep_every_sampled_frame() {
    let pipeline = VideoPipeline::new(Arc::new(EmptyDetector), config(1));
    let result = pipeline.analyze(SyntheticVideo::new(30, 90), || false).unwrap();

    assert_eq!(indices(&result), vec![0, 15, 30, 45, 60, 75]);
    assert!(result.frames.iter().all(|f| f.detections.is_empty()));
    assert_eq!(result.total_detections, 0);
}

#[test]
fn test_detector_failure_is_isolated_to_one_frame() {
    for workers in [1, 3] {
        let detector = IndexDetector {
            fail_on: Some(30),
            ..IndexDetector::new()
        };
        let pipeline = VideoPipeline::new(Arc::new(detector), config(workers));
        let result = pipeline.analyze(SyntheticVideo::new(30, 90), || false).unwrap();

        assert_eq!(result.frames.len(), 6);
        assert_eq!(result.detection_failures, 1);
        for frame in &result.frames {
            if frame.frame_index == 30 {
                assert!(frame.detections.is_empty());
                assert!(frame
                    .detection_error
                    .as_deref()
                    .is_some_and(|e| e.contains("tensor shape mismatch")));
            } else {
                assert_eq!(frame.detections.len(), 1);
                assert!(frame.detection_error.is_none());
            }
        }
        assert_eq!(result.termination, Termination::Completed);
    }
}

#[test]
fn test_mid_stream_decode_error_truncates() {
    for workers in [1, 4] {
        let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config(workers));
        let source = SyntheticVideo::new(30, 300).failing_at(100);
        let result = pipeline.analyze(source, || false).unwrap();

        assert_eq!(indices(&result), vec![0, 15, 30, 45, 60, 75, 90]);
        assert!(result.is_partial());
        match &result.termination {
            Termination::Truncated { reason } => assert!(reason.contains("invalid data")),
            other => panic!("expected truncation, got {other:?}"),
        }
    }
}

#[test]
fn test_decode_error_before_any_frame_is_fatal() {
    let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config(4));
    let source = SyntheticVideo::new(30, 300).failing_at(0);
    let err = pipeline.analyze(source, || false).unwrap_err();

    assert!(matches!(
        err,
        PipelineError::Source(ProcessingError::CorruptedFile(_))
    ));
}

#[test]
fn test_frame_cap_truncates() {
    let config = PipelineConfig {
        max_sampled_frames: Some(5),
        ..config(2)
    };
    let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config);
    let result = pipeline.analyze(SyntheticVideo::new(30, 300), || false).unwrap();

    assert_eq!(result.frame_count_processed, 5);
    assert_eq!(indices(&result), vec![0, 15, 30, 45, 60]);
    assert!(result.is_partial());
}

#[test]
fn test_cap_equal_to_sample_count_completes() {
    let config = PipelineConfig {
        max_sampled_frames: Some(20),
        ..config(1)
    };
    let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config);
    let result = pipeline.analyze(SyntheticVideo::new(30, 300), || false).unwrap();

    assert_eq!(result.frame_count_processed, 20);
    assert_eq!(result.termination, Termination::Completed);
}

#[test]
fn test_cancellation_stops_decoding() {
    let detector = Arc::new(IndexDetector::new());
    let pipeline = VideoPipeline::new(detector.clone(), config(1));
    let polls = AtomicUsize::new(0);

    let result = pipeline
        .analyze(SyntheticVideo::new(30, 300), || {
            polls.fetch_add(1, Ordering::SeqCst) >= 40
        })
        .unwrap();

    assert_eq!(result.termination, Termination::Cancelled);
    // Frames 0..40 were decoded before the flag flipped
    assert_eq!(indices(&result), vec![0, 15, 30]);
    assert_eq!(detector.calls.load(Ordering::SeqCst), 3);
}

#[test]
fn test_stream_consumer_can_stop_the_run() {
    for workers in [1, 4] {
        let pipeline = VideoPipeline::new(Arc::new(IndexDetector::new()), config(workers));
        let mut received = Vec::new();

        let result = pipeline
            .stream(SyntheticVideo::new(30, 300), || false, |record| {
                received.push(record.frame_index);
                if received.len() == 3 {
                    ControlFlow::Break(())
                } else {
                    ControlFlow::Continue(())
                }
            })
            .unwrap();

        assert_eq!(received, vec![0, 15, 30]);
        assert_eq!(result.termination, Termination::Cancelled);
        assert_eq!(result.frame_count_processed, 3);
        assert!(result.frames.is_empty());
    }
}
