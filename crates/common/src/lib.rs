//! Common types and utilities for blade damage video analysis

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Processing errors
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("Failed to open video: {0}")]
    Decode(String),

    #[error("No video stream found")]
    NoVideoStream,

    #[error("Invalid frame rate: {0} (must be at least 1 fps)")]
    InvalidFrameRate(f64),

    #[error("Corrupted file: {0}")]
    CorruptedFile(String),

    #[error("FFmpeg error: {0}")]
    FFmpegError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    ImageError(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl ProcessingError {
    /// Whether the error is caused by the uploaded input rather than the host
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            ProcessingError::Decode(_)
                | ProcessingError::NoVideoStream
                | ProcessingError::InvalidFrameRate(_)
                | ProcessingError::CorruptedFile(_)
        )
    }
}

impl From<image::ImageError> for ProcessingError {
    fn from(err: image::ImageError) -> Self {
        ProcessingError::ImageError(err.to_string())
    }
}

/// Result type for processing operations
pub type Result<T> = std::result::Result<T, ProcessingError>;

/// Timing metadata of an opened video
///
/// `frame_rate` is the container's average rate truncated to whole frames per
/// second. `duration` is derived once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VideoStream {
    pub frame_rate: u32,
    pub total_frame_count: u64,
    pub duration: f64,
}

impl VideoStream {
    /// Build stream metadata, rejecting a zero frame rate
    pub fn new(frame_rate: u32, total_frame_count: u64) -> Result<Self> {
        if frame_rate == 0 {
            return Err(ProcessingError::InvalidFrameRate(0.0));
        }
        Ok(Self {
            frame_rate,
            total_frame_count,
            duration: total_frame_count as f64 / f64::from(frame_rate),
        })
    }

    /// Timestamp in seconds of the frame at `frame_index`
    #[must_use]
    #[inline]
    pub fn timestamp_of(&self, frame_index: u64) -> f64 {
        frame_index as f64 / f64::from(self.frame_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_stream_duration() {
        let stream = VideoStream::new(30, 300).unwrap();
        assert_eq!(stream.duration, 10.0);
        assert_eq!(stream.timestamp_of(15), 0.5);
        assert_eq!(stream.timestamp_of(0), 0.0);
    }

    #[test]
    fn test_video_stream_rejects_zero_fps() {
        let err = VideoStream::new(0, 100).unwrap_err();
        assert!(matches!(err, ProcessingError::InvalidFrameRate(_)));
        assert!(err.is_input_error());
    }

    #[test]
    fn test_empty_video_has_zero_duration() {
        let stream = VideoStream::new(25, 0).unwrap();
        assert_eq!(stream.duration, 0.0);
    }

    #[test]
    fn test_io_error_is_not_input_error() {
        let err = ProcessingError::from(std::io::Error::other("disk full"));
        assert!(!err.is_input_error());
    }
}
