//! Server configuration from environment variables

use blade_inspect_frame_analysis::encode::DEFAULT_JPEG_QUALITY;
use blade_inspect_frame_analysis::processor::DEFAULT_CONFIDENCE_THRESHOLD;
use blade_inspect_frame_analysis::{PipelineConfig, ProcessorConfig, SamplingPolicy};
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "0.0.0.0:8000";
pub const DEFAULT_MODEL_PATH: &str = "models/blade-damage.onnx";
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Runtime settings of the API server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (`API_SERVER_ADDR`)
    pub addr: String,
    /// ONNX model file (`MODEL_PATH`)
    pub model_path: PathBuf,
    /// Optional dataset YAML with class names (`CLASS_NAMES_PATH`)
    pub class_names_path: Option<PathBuf>,
    /// ONNX Runtime sessions shared by all requests (`DETECTOR_POOL_SIZE`)
    pub detector_pool_size: usize,
    /// Frame processor threads per video request (`FRAME_WORKERS`)
    pub frame_workers: usize,
    /// Request body limit (`MAX_UPLOAD_BYTES`)
    pub max_upload_bytes: usize,
    /// Cap on analysed frames for buffered responses (`MAX_SAMPLED_FRAMES`)
    pub max_sampled_frames: Option<u64>,
    /// Detector threshold (`CONFIDENCE_THRESHOLD`)
    pub confidence_threshold: f32,
    /// Quality of returned frame JPEGs (`JPEG_QUALITY`)
    pub jpeg_quality: u8,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            model_path: PathBuf::from(DEFAULT_MODEL_PATH),
            class_names_path: None,
            detector_pool_size: 1,
            frame_workers: 1,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            max_sampled_frames: None,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl ServerConfig {
    /// Read the configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read the configuration through `lookup`; unset keys keep their defaults
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            addr: get("API_SERVER_ADDR").unwrap_or(defaults.addr),
            model_path: get("MODEL_PATH").map_or(defaults.model_path, PathBuf::from),
            class_names_path: get("CLASS_NAMES_PATH").map(PathBuf::from),
            detector_pool_size: parse(&get, "DETECTOR_POOL_SIZE")?
                .unwrap_or(defaults.detector_pool_size),
            frame_workers: parse(&get, "FRAME_WORKERS")?.unwrap_or(defaults.frame_workers),
            max_upload_bytes: parse(&get, "MAX_UPLOAD_BYTES")?
                .unwrap_or(defaults.max_upload_bytes),
            max_sampled_frames: parse(&get, "MAX_SAMPLED_FRAMES")?,
            confidence_threshold: parse(&get, "CONFIDENCE_THRESHOLD")?
                .unwrap_or(defaults.confidence_threshold),
            jpeg_quality: parse(&get, "JPEG_QUALITY")?.unwrap_or(defaults.jpeg_quality),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &'static str, value: String, reason: &str| ConfigError::Invalid {
            key,
            value,
            reason: reason.to_string(),
        };

        if self.detector_pool_size == 0 {
            return Err(invalid("DETECTOR_POOL_SIZE", "0".into(), "must be at least 1"));
        }
        if self.frame_workers == 0 {
            return Err(invalid("FRAME_WORKERS", "0".into(), "must be at least 1"));
        }
        if self.max_sampled_frames == Some(0) {
            return Err(invalid("MAX_SAMPLED_FRAMES", "0".into(), "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(invalid(
                "CONFIDENCE_THRESHOLD",
                self.confidence_threshold.to_string(),
                "must be between 0 and 1",
            ));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(invalid(
                "JPEG_QUALITY",
                self.jpeg_quality.to_string(),
                "must be between 1 and 100",
            ));
        }
        Ok(())
    }

    /// Pipeline settings for frame-by-frame responses (two frames per second, JPEGs attached)
    pub fn frames_pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            processor: self.processor_config(true),
            workers: self.frame_workers,
            max_sampled_frames: self.max_sampled_frames,
            sampling: SamplingPolicy::TwoPerSecond,
            ..Default::default()
        }
    }

    /// Pipeline settings for whole-video statistics (every frame, no images)
    pub fn batch_pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            processor: self.processor_config(false),
            workers: self.frame_workers,
            max_sampled_frames: None,
            sampling: SamplingPolicy::EveryFrame,
            ..Default::default()
        }
    }

    fn processor_config(&self, encode_frames: bool) -> ProcessorConfig {
        ProcessorConfig {
            confidence_threshold: self.confidence_threshold,
            jpeg_quality: self.jpeg_quality,
            encode_frames,
        }
    }
}

fn parse<T, G>(get: &G, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
                key,
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
