//! Ordered collection of frame records into one analysis result

use crate::error::PipelineError;
use crate::processor::FrameRecord;
use blade_inspect_common::VideoStream;

/// How an analysis run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The frame source was exhausted
    Completed,
    /// The run stopped early but the records produced so far are valid
    Truncated { reason: String },
    /// The consumer went away before the run finished
    Cancelled,
}

/// Full result of one video analysis
#[derive(Debug, Clone)]
pub struct AggregateResult {
    pub stream: VideoStream,
    pub sampling_interval: u32,
    /// Records in ascending frame order (empty in counting mode)
    pub frames: Vec<FrameRecord>,
    pub frame_count_processed: u64,
    /// Frames whose detector call failed
    pub detection_failures: u64,
    /// Detections summed over all accepted frames
    pub total_detections: u64,
    pub termination: Termination,
}

impl AggregateResult {
    /// True unless every frame of the source was considered
    #[must_use]
    pub fn is_partial(&self) -> bool {
        self.termination != Termination::Completed
    }

    /// Human readable summary line
    #[must_use]
    pub fn message(&self) -> String {
        match &self.termination {
            Termination::Completed => format!("Processed {} frames", self.frame_count_processed),
            Termination::Truncated { reason } => format!(
                "Processed {} frames (stopped early: {})",
                self.frame_count_processed, reason
            ),
            Termination::Cancelled => format!(
                "Processed {} frames (cancelled)",
                self.frame_count_processed
            ),
        }
    }
}

/// Accumulates frame records and enforces their order
///
/// In buffering mode every record is kept; in counting mode `record` hands the
/// record back so the caller can forward it.
#[derive(Debug)]
pub struct Aggregator {
    stream: VideoStream,
    sampling_interval: u32,
    buffer: Option<Vec<FrameRecord>>,
    last_index: Option<u64>,
    accepted: u64,
    detection_failures: u64,
    total_detections: u64,
}

impl Aggregator {
    /// Aggregator that keeps every record
    pub fn buffering(stream: VideoStream, sampling_interval: u32, capacity_hint: usize) -> Self {
        Self::with_buffer(stream, sampling_interval, Some(Vec::with_capacity(capacity_hint)))
    }

    /// Aggregator that only counts records
    pub fn counting(stream: VideoStream, sampling_interval: u32) -> Self {
        Self::with_buffer(stream, sampling_interval, None)
    }

    fn with_buffer(
        stream: VideoStream,
        sampling_interval: u32,
        buffer: Option<Vec<FrameRecord>>,
    ) -> Self {
        Self {
            stream,
            sampling_interval,
            buffer,
            last_index: None,
            accepted: 0,
            detection_failures: 0,
            total_detections: 0,
        }
    }

    /// Number of records accepted so far
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    /// Accept the next record
    ///
    /// Returns the record back in counting mode, `None` when it was buffered.
    pub fn record(&mut self, record: FrameRecord) -> Result<Option<FrameRecord>, PipelineError> {
        if let Some(previous) = self.last_index {
            if record.frame_index <= previous {
                return Err(PipelineError::OutOfOrder {
                    previous,
                    got: record.frame_index,
                });
            }
        }

        self.last_index = Some(record.frame_index);
        self.accepted += 1;
        self.total_detections += record.detections.len() as u64;
        if record.detection_error.is_some() {
            self.detection_failures += 1;
        }

        match self.buffer.as_mut() {
            Some(buffer) => {
                buffer.push(record);
                Ok(None)
            }
            None => Ok(Some(record)),
        }
    }

    pub fn finish(self, termination: Termination) -> AggregateResult {
        AggregateResult {
            stream: self.stream,
            sampling_interval: self.sampling_interval,
            frames: self.buffer.unwrap_or_default(),
            frame_count_processed: self.accepted,
            detection_failures: self.detection_failures,
            total_detections: self.total_detections,
            termination,
        }
    }
}
