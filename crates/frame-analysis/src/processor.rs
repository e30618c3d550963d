//! Per-frame detection and encoding

use crate::encode::{encode_jpeg, DEFAULT_JPEG_QUALITY};
use crate::error::PipelineError;
use blade_inspect_common::VideoStream;
use blade_inspect_object_detection::{Detection, Detector};
use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, warn};

/// Detector confidence threshold used for video analysis
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.25;

/// Result bundle for one analysed frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    /// Zero-based position of the frame in decode order
    pub frame_index: u64,
    /// `frame_index / frame_rate`
    pub timestamp_seconds: f64,
    /// Detections in detector order
    pub detections: Vec<Detection>,
    /// JPEG encoding of the unannotated frame (empty when encoding is disabled)
    pub encoded_image: Vec<u8>,
    /// Set when the detector failed on this frame; `detections` is then empty
    pub detection_error: Option<String>,
}

/// Frame processor settings
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Minimum confidence passed to the detector
    pub confidence_threshold: f32,
    /// JPEG quality for transported frames (1-100)
    pub jpeg_quality: u8,
    /// Whether to attach the encoded frame to each record
    pub encode_frames: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            encode_frames: true,
        }
    }
}

/// Runs the detector on a frame and packages the result
///
/// Stateless across frames, so one processor can be shared by several worker
/// threads.
pub struct FrameProcessor {
    detector: Arc<dyn Detector>,
    config: ProcessorConfig,
    stream: VideoStream,
}

impl FrameProcessor {
    pub fn new(detector: Arc<dyn Detector>, config: ProcessorConfig, stream: VideoStream) -> Self {
        Self {
            detector,
            config,
            stream,
        }
    }

    /// Analyse the frame at `frame_index`
    ///
    /// A detector failure is recorded on the returned record; only an encoding
    /// failure is an error.
    pub fn process(&self, frame_index: u64, frame: &RgbImage) -> Result<FrameRecord, PipelineError> {
        let (detections, detection_error) =
            match self.detector.detect(frame, self.config.confidence_threshold) {
                Ok(detections) => (detections, None),
                Err(e) => {
                    warn!("Detection failed on frame {}: {}", frame_index, e);
                    (Vec::new(), Some(e.to_string()))
                }
            };

        let encoded_image = if self.config.encode_frames {
            encode_jpeg(frame, self.config.jpeg_quality).map_err(|e| PipelineError::Encode {
                frame_index,
                message: e.to_string(),
            })?
        } else {
            Vec::new()
        };

        debug!(
            "Frame {}: {} detection(s), {} JPEG bytes",
            frame_index,
            detections.len(),
            encoded_image.len()
        );

        Ok(FrameRecord {
            frame_index,
            timestamp_seconds: self.stream.timestamp_of(frame_index),
            detections,
            encoded_image,
            detection_error,
        })
    }
}
