//! API request and response types

use base64::{engine::general_purpose::STANDARD, Engine as _};
use blade_inspect_frame_analysis::{AggregateResult, FrameRecord};
use blade_inspect_object_detection::Detection;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Root endpoint response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub message: String,
    pub status: String,
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,
    /// Crate version
    pub version: String,
}

/// Error body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub detail: String,
}

/// Loaded model description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfoResponse {
    pub model_name: String,
    /// Class id to class name
    pub classes: BTreeMap<u32, String>,
    pub num_classes: usize,
    pub model_path: String,
}

/// One detection on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionDto {
    #[serde(rename = "class")]
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in pixels
    pub bbox: [f32; 4],
    pub class_id: u32,
}

impl From<&Detection> for DetectionDto {
    fn from(d: &Detection) -> Self {
        Self {
            class_name: d.class_name.clone(),
            confidence: d.confidence,
            bbox: d.bbox.to_array(),
            class_id: d.class_id,
        }
    }
}

/// Single image prediction response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePredictionResponse {
    pub success: bool,
    pub detections: Vec<DetectionDto>,
    /// Base64 PNG with the detections drawn
    pub annotated_image: String,
    pub total_detections: usize,
}

/// One analysed frame on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameDto {
    pub frame_number: u64,
    /// Seconds from the start of the video
    pub timestamp: f64,
    pub detections: Vec<DetectionDto>,
    /// Base64 JPEG of the unannotated frame
    pub frame_image: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detection_error: Option<String>,
}

impl From<FrameRecord> for FrameDto {
    fn from(record: FrameRecord) -> Self {
        Self {
            frame_number: record.frame_index,
            timestamp: record.timestamp_seconds,
            detections: record.detections.iter().map(DetectionDto::from).collect(),
            frame_image: STANDARD.encode(&record.encoded_image),
            detection_error: record.detection_error,
        }
    }
}

/// Frame-by-frame video analysis response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoFramesResponse {
    pub success: bool,
    pub fps: u32,
    pub total_frames: u64,
    pub duration: f64,
    pub frame_interval: u32,
    pub frames: Vec<FrameDto>,
    pub message: String,
    pub frames_processed: u64,
    /// True when the video was not read to the end
    pub partial: bool,
}

impl From<AggregateResult> for VideoFramesResponse {
    fn from(result: AggregateResult) -> Self {
        let message = result.message();
        let partial = result.is_partial();
        Self {
            success: true,
            fps: result.stream.frame_rate,
            total_frames: result.stream.total_frame_count,
            duration: result.stream.duration,
            frame_interval: result.sampling_interval,
            frames: result.frames.into_iter().map(FrameDto::from).collect(),
            message,
            frames_processed: result.frame_count_processed,
            partial,
        }
    }
}

/// Whole-video statistics response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoSummaryResponse {
    pub success: bool,
    pub fps: u32,
    pub total_frames: u64,
    pub duration: f64,
    pub frames_analyzed: u64,
    pub total_detections: u64,
    /// Detections per class name
    pub class_counts: BTreeMap<String, u64>,
    pub frames_with_detections: u64,
    pub message: String,
}

/// One line of the NDJSON frame stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamEvent {
    Metadata {
        fps: u32,
        total_frames: u64,
        duration: f64,
        frame_interval: u32,
    },
    Frame(FrameDto),
    Summary {
        frames_processed: u64,
        partial: bool,
        message: String,
    },
    Error {
        detail: String,
    },
}

impl StreamEvent {
    /// Serialize as one newline-terminated JSON line
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","detail":"Failed to serialize event: {e}"}}"#)
        });
        line.push('\n');
        line
    }
}
