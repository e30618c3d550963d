//! Sampling and detection pipeline over a frame source
//!
//! The calling thread decodes. With `workers <= 1` it also runs detection and
//! encoding inline. With more workers the selected frames go through a bounded
//! channel to a fixed pool of scoped threads, and a collector thread restores
//! dispatch order with a reorder buffer before handing records to the
//! aggregator.
//!
//! ```text
//! [decode] --job(seq, idx, frame)--> [worker x N] --(seq, record)--> [collector: reorder -> aggregate]
//! ```

use crate::aggregator::{AggregateResult, Aggregator, Termination};
use crate::error::PipelineError;
use crate::processor::{FrameProcessor, FrameRecord, ProcessorConfig};
use crate::sampler::FrameSampler;
use blade_inspect_common::VideoStream;
use blade_inspect_object_detection::Detector;
use blade_inspect_video_decoder::FrameSource;
use crossbeam_channel::bounded;
use image::RgbImage;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Which frames of the source are analysed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SamplingPolicy {
    /// Every `max(1, fps / 2)`-th frame
    #[default]
    TwoPerSecond,
    /// Every frame (batch video analysis)
    EveryFrame,
}

/// Pipeline configuration
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub processor: ProcessorConfig,
    /// Frame processor threads; 0 and 1 both mean inline processing
    pub workers: usize,
    /// Stop with `Termination::Truncated` once this many frames were selected
    pub max_sampled_frames: Option<u64>,
    pub sampling: SamplingPolicy,
    /// Frames in flight between decode and the workers
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            processor: ProcessorConfig::default(),
            workers: 1,
            max_sampled_frames: None,
            sampling: SamplingPolicy::TwoPerSecond,
            channel_capacity: 8,
        }
    }
}

/// Lifecycle of one analysis run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Opening,
    Processing,
    Aggregating,
    Done,
    Errored,
}

/// Video analysis pipeline bound to a detector
///
/// Holds no per-run state; one instance serves any number of runs, including
/// concurrent ones.
pub struct VideoPipeline {
    detector: Arc<dyn Detector>,
    config: PipelineConfig,
}

/// Upper bound on records preallocated for a buffered run
///
/// The container's frame count is only a hint and may be arbitrarily large.
const MAX_PREALLOCATED_RECORDS: u64 = 1024;

/// Work item sent to a frame worker: dispatch sequence, frame index, pixels
type Job = (u64, u64, RgbImage);

impl VideoPipeline {
    pub fn new(detector: Arc<dyn Detector>, config: PipelineConfig) -> Self {
        Self { detector, config }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Sampler used for a video with the given stream metadata
    #[must_use]
    pub fn sampler_for(&self, stream: &VideoStream) -> FrameSampler {
        match self.config.sampling {
            SamplingPolicy::TwoPerSecond => FrameSampler::for_frame_rate(stream.frame_rate),
            SamplingPolicy::EveryFrame => FrameSampler::every(1),
        }
    }

    /// Analyse `source` and keep every record in the result
    ///
    /// `is_cancelled` is polled before each decoded frame; once it returns true
    /// the run ends with `Termination::Cancelled`.
    pub fn analyze<S, C>(&self, source: S, is_cancelled: C) -> Result<AggregateResult, PipelineError>
    where
        S: FrameSource,
        C: Fn() -> bool,
    {
        let stream = source.stream();
        let sampler = self.sampler_for(&stream);
        let capacity = sampler.expected_samples(stream.total_frame_count);
        let capacity = self
            .config
            .max_sampled_frames
            .map_or(capacity, |max| capacity.min(max))
            .min(MAX_PREALLOCATED_RECORDS);
        let aggregator = Aggregator::buffering(stream, sampler.interval(), capacity as usize);

        self.run(source, aggregator, &is_cancelled, |_| ControlFlow::Continue(()))
    }

    /// Analyse `source`, handing each record to `on_frame` in frame order
    ///
    /// Records are not retained. The run ends with `Termination::Cancelled`
    /// when `is_cancelled` returns true before a decoded frame or when
    /// `on_frame` returns `ControlFlow::Break`.
    pub fn stream<S, C, F>(
        &self,
        source: S,
        is_cancelled: C,
        on_frame: F,
    ) -> Result<AggregateResult, PipelineError>
    where
        S: FrameSource,
        C: Fn() -> bool,
        F: FnMut(FrameRecord) -> ControlFlow<()> + Send,
    {
        let stream = source.stream();
        let sampler = self.sampler_for(&stream);
        let aggregator = Aggregator::counting(stream, sampler.interval());

        self.run(source, aggregator, &is_cancelled, on_frame)
    }

    fn run<S, F>(
        &self,
        mut source: S,
        aggregator: Aggregator,
        is_cancelled: &dyn Fn() -> bool,
        emit: F,
    ) -> Result<AggregateResult, PipelineError>
    where
        S: FrameSource,
        F: FnMut(FrameRecord) -> ControlFlow<()> + Send,
    {
        let mut state = PipelineState::Opening;
        let stream = source.stream();
        let sampler = self.sampler_for(&stream);
        let processor = FrameProcessor::new(
            Arc::clone(&self.detector),
            self.config.processor.clone(),
            stream,
        );

        info!(
            "Analysing video: {} fps, {} frames ({:.2}s), interval {}, ~{} samples, {} worker(s)",
            stream.frame_rate,
            stream.total_frame_count,
            stream.duration,
            sampler.interval(),
            sampler.expected_samples(stream.total_frame_count),
            self.config.workers.max(1)
        );

        transition(&mut state, PipelineState::Processing);
        let processed = if self.config.workers > 1 {
            self.run_parallel(&mut source, sampler, &processor, aggregator, is_cancelled, emit)
        } else {
            self.run_sequential(&mut source, sampler, &processor, aggregator, is_cancelled, emit)
        };

        let (aggregator, termination) = match processed {
            Ok(outcome) => outcome,
            Err(e) => {
                transition(&mut state, PipelineState::Errored);
                return Err(e);
            }
        };

        transition(&mut state, PipelineState::Aggregating);
        let result = aggregator.finish(termination);
        transition(&mut state, PipelineState::Done);

        if result.detection_failures > 0 {
            warn!(
                "Detection failed on {} of {} frames",
                result.detection_failures, result.frame_count_processed
            );
        }
        info!(
            "{} ({} detections)",
            result.message(),
            result.total_detections
        );
        Ok(result)
    }

    fn run_sequential<S, F>(
        &self,
        source: &mut S,
        sampler: FrameSampler,
        processor: &FrameProcessor,
        mut aggregator: Aggregator,
        is_cancelled: &dyn Fn() -> bool,
        mut emit: F,
    ) -> Result<(Aggregator, Termination), PipelineError>
    where
        S: FrameSource,
        F: FnMut(FrameRecord) -> ControlFlow<()>,
    {
        let termination = self.drive(source, sampler, is_cancelled, |frame_index, frame| {
            let record = processor.process(frame_index, &frame)?;
            Ok(match aggregator.record(record)? {
                Some(record) => emit(record),
                None => ControlFlow::Continue(()),
            })
        })?;

        Ok((aggregator, termination))
    }

    fn run_parallel<S, F>(
        &self,
        source: &mut S,
        sampler: FrameSampler,
        processor: &FrameProcessor,
        aggregator: Aggregator,
        is_cancelled: &dyn Fn() -> bool,
        emit: F,
    ) -> Result<(Aggregator, Termination), PipelineError>
    where
        S: FrameSource,
        F: FnMut(FrameRecord) -> ControlFlow<()> + Send,
    {
        let capacity = self.config.channel_capacity.max(1);
        let (job_tx, job_rx) = bounded::<Job>(capacity);
        let (result_tx, result_rx) = bounded::<(u64, Result<FrameRecord, PipelineError>)>(capacity);
        let stop = AtomicBool::new(false);

        thread::scope(|scope| -> Result<(Aggregator, Termination), PipelineError> {
            let workers: Vec<_> = (0..self.config.workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    let result_tx = result_tx.clone();
                    scope.spawn(move || {
                        for (seq, frame_index, frame) in job_rx {
                            let record = processor.process(frame_index, &frame);
                            if result_tx.send((seq, record)).is_err() {
                                break;
                            }
                        }
                    })
                })
                .collect();
            drop(job_rx);
            drop(result_tx);

            let stop_ref = &stop;
            let collector = scope.spawn(move || {
                let outcome = collect_in_order(result_rx, aggregator, emit);
                if !matches!(outcome, Ok((_, None))) {
                    stop_ref.store(true, Ordering::Relaxed);
                }
                outcome
            });

            let mut seq = 0u64;
            let decoded = self.drive(source, sampler, is_cancelled, |frame_index, frame| {
                if stop.load(Ordering::Relaxed) || job_tx.send((seq, frame_index, frame)).is_err() {
                    return Ok(ControlFlow::Break(()));
                }
                seq += 1;
                Ok(ControlFlow::Continue(()))
            });
            drop(job_tx);

            let mut panicked = false;
            for worker in workers {
                panicked |= worker.join().is_err();
            }
            let collected = collector.join().map_err(|_| PipelineError::WorkerPanicked)?;
            if panicked {
                return Err(PipelineError::WorkerPanicked);
            }

            let (aggregator, stopped) = collected?;
            let termination = decoded?;
            Ok((aggregator, stopped.unwrap_or(termination)))
        })
    }

    /// Decode loop shared by both execution modes
    ///
    /// Calls `dispatch` with every selected frame until the source ends, the
    /// frame cap is hit, the run is cancelled, or `dispatch` breaks.
    fn drive<S, D>(
        &self,
        source: &mut S,
        sampler: FrameSampler,
        is_cancelled: &dyn Fn() -> bool,
        mut dispatch: D,
    ) -> Result<Termination, PipelineError>
    where
        S: FrameSource,
        D: FnMut(u64, RgbImage) -> Result<ControlFlow<()>, PipelineError>,
    {
        let mut decoded = 0u64;
        let mut selected = 0u64;

        loop {
            if is_cancelled() {
                debug!("Run cancelled after {} decoded frames", decoded);
                return Ok(Termination::Cancelled);
            }

            let frame = match source.next() {
                None => return Ok(Termination::Completed),
                Some(Ok(frame)) => frame,
                Some(Err(e)) if decoded == 0 => return Err(e.into()),
                Some(Err(e)) => {
                    warn!("Decoding stopped after {} frames: {}", decoded, e);
                    return Ok(Termination::Truncated {
                        reason: e.to_string(),
                    });
                }
            };

            let frame_index = decoded;
            decoded += 1;
            if !sampler.selects(frame_index) {
                continue;
            }

            if let Some(max) = self.config.max_sampled_frames {
                if selected >= max {
                    info!("Sampled frame limit of {} reached at frame {}", max, frame_index);
                    return Ok(Termination::Truncated {
                        reason: format!("sampled frame limit of {max} reached"),
                    });
                }
            }
            selected += 1;

            if dispatch(frame_index, frame)?.is_break() {
                return Ok(Termination::Cancelled);
            }
        }
    }
}

/// Reorder worker results by dispatch sequence and feed them to the aggregator
///
/// Returns `Some(Termination::Cancelled)` when `emit` asked to stop.
fn collect_in_order<F>(
    results: crossbeam_channel::Receiver<(u64, Result<FrameRecord, PipelineError>)>,
    mut aggregator: Aggregator,
    mut emit: F,
) -> Result<(Aggregator, Option<Termination>), PipelineError>
where
    F: FnMut(FrameRecord) -> ControlFlow<()>,
{
    let mut pending = BTreeMap::new();
    let mut next_seq = 0u64;

    for (seq, record) in results {
        pending.insert(seq, record);
        while let Some(record) = pending.remove(&next_seq) {
            next_seq += 1;
            if let Some(record) = aggregator.record(record?)? {
                if emit(record).is_break() {
                    return Ok((aggregator, Some(Termination::Cancelled)));
                }
            }
        }
    }

    if !pending.is_empty() {
        debug!("{} out-of-order results left after workers exited", pending.len());
    }
    Ok((aggregator, None))
}

fn transition(state: &mut PipelineState, next: PipelineState) {
    debug!("Pipeline state {:?} -> {:?}", state, next);
    *state = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use blade_inspect_common::ProcessingError;
    use blade_inspect_object_detection::{Detection, ObjectDetectionError};

    struct NoDetections;

    impl Detector for NoDetections {
        fn detect(&self, _: &RgbImage, _: f32) -> Result<Vec<Detection>, ObjectDetectionError> {
            Ok(Vec::new())
        }

        fn class_names(&self) -> &[String] {
            &[]
        }
    }

    struct Frames {
        stream: VideoStream,
        items: std::vec::IntoIter<blade_inspect_common::Result<RgbImage>>,
    }

    impl Frames {
        fn new(fps: u32, count: u64) -> Self {
            let items: Vec<_> = (0..count).map(|_| Ok(RgbImage::new(4, 4))).collect();
            Self {
                stream: VideoStream::new(fps, count).unwrap(),
                items: items.into_iter(),
            }
        }
    }

    impl Iterator for Frames {
        type Item = blade_inspect_common::Result<RgbImage>;

        fn next(&mut self) -> Option<Self::Item> {
            self.items.next()
        }
    }

    impl FrameSource for Frames {
        fn stream(&self) -> VideoStream {
            self.stream
        }
    }

    fn pipeline(config: PipelineConfig) -> VideoPipeline {
        VideoPipeline::new(Arc::new(NoDetections), config)
    }

    #[test]
    fn test_every_frame_policy() {
        let config = PipelineConfig {
            sampling: SamplingPolicy::EveryFrame,
            ..Default::default()
        };
        let result = pipeline(config).analyze(Frames::new(30, 12), || false).unwrap();
        assert_eq!(result.sampling_interval, 1);
        assert_eq!(result.frame_count_processed, 12);
    }

    #[test]
    fn test_stream_forwards_without_buffering() {
        let mut seen = Vec::new();
        let result = pipeline(PipelineConfig::default())
            .stream(Frames::new(10, 20), || false, |record| {
                seen.push(record.frame_index);
                ControlFlow::Continue(())
            })
            .unwrap();

        assert_eq!(seen, vec![0, 5, 10, 15]);
        assert!(result.frames.is_empty());
        assert_eq!(result.frame_count_processed, 4);
        assert_eq!(result.termination, Termination::Completed);
    }

    #[test]
    fn test_error_on_first_frame_is_fatal() {
        let source = Frames {
            stream: VideoStream::new(30, 10).unwrap(),
            items: vec![Err(ProcessingError::CorruptedFile("bad packet".into()))].into_iter(),
        };
        let err = pipeline(PipelineConfig::default())
            .analyze(source, || false)
            .unwrap_err();
        assert!(err.is_input_error());
    }

    #[test]
    fn test_empty_source_completes() {
        let result = pipeline(PipelineConfig::default())
            .analyze(Frames::new(25, 0), || false)
            .unwrap();
        assert!(result.frames.is_empty());
        assert_eq!(result.termination, Termination::Completed);
    }

    #[test]
    fn test_overstated_frame_count_is_not_preallocated() {
        // Header claims 2^40 frames, the source yields two
        let mut source = Frames::new(2, 2);
        source.stream = VideoStream::new(2, 1 << 40).unwrap();

        let result = pipeline(PipelineConfig::default()).analyze(source, || false).unwrap();
        assert_eq!(result.frame_count_processed, 2);
        assert!(result.frames.capacity() <= MAX_PREALLOCATED_RECORDS as usize);
        assert_eq!(result.termination, Termination::Completed);

        let mut source = Frames::new(2, 2);
        source.stream = VideoStream::new(2, u64::MAX / 2).unwrap();
        let result = pipeline(PipelineConfig::default()).analyze(source, || false).unwrap();
        assert_eq!(result.frame_count_processed, 2);
    }

    #[test]
    fn test_stream_stops_when_cancelled() {
        let polls = std::cell::Cell::new(0);
        let mut seen = Vec::new();
        let result = pipeline(PipelineConfig::default())
            .stream(
                Frames::new(10, 20),
                || {
                    polls.set(polls.get() + 1);
                    polls.get() > 6
                },
                |record| {
                    seen.push(record.frame_index);
                    ControlFlow::Continue(())
                },
            )
            .unwrap();

        assert_eq!(seen, vec![0, 5]);
        assert_eq!(result.termination, Termination::Cancelled);
        assert_eq!(result.frame_count_processed, 2);
    }

    #[test]
    fn test_sampler_follows_policy() {
        let stream = VideoStream::new(24, 48).unwrap();
        assert_eq!(pipeline(PipelineConfig::default()).sampler_for(&stream).interval(), 12);
    }
}
