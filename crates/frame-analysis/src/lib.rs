//! Frame sampling and detection aggregation for uploaded videos
//!
//! A run reads frames from a [`FrameSource`], keeps the ones chosen by the
//! [`FrameSampler`], hands each to the [`FrameProcessor`] (detection plus JPEG
//! encoding) and collects the resulting [`FrameRecord`]s in frame order with the
//! [`Aggregator`].
//!
//! ```text
//! FrameSource -> FrameSampler -> FrameProcessor (1..N workers) -> reorder -> Aggregator
//! ```

pub mod aggregator;
pub mod encode;
pub mod error;
pub mod pipeline;
pub mod processor;
pub mod sampler;

pub use aggregator::{AggregateResult, Aggregator, Termination};
pub use blade_inspect_video_decoder::FrameSource;
pub use error::PipelineError;
pub use pipeline::{PipelineConfig, PipelineState, SamplingPolicy, VideoPipeline};
pub use processor::{FrameProcessor, FrameRecord, ProcessorConfig};
pub use sampler::FrameSampler;
