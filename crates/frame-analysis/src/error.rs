use blade_inspect_common::ProcessingError;
use thiserror::Error;

/// Fatal errors of an analysis run
///
/// Detector failures on a single frame are not errors; they are recorded on
/// the frame (see `FrameRecord::detection_error`).
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Source(#[from] ProcessingError),

    #[error("Failed to encode frame {frame_index}: {message}")]
    Encode { frame_index: u64, message: String },

    #[error("Frame {got} arrived after frame {previous}")]
    OutOfOrder { previous: u64, got: u64 },

    #[error("Frame worker thread panicked")]
    WorkerPanicked,
}

impl PipelineError {
    /// Whether the error is caused by the uploaded input rather than the host
    #[must_use]
    pub fn is_input_error(&self) -> bool {
        matches!(self, PipelineError::Source(e) if e.is_input_error())
    }
}
