//! Blade damage detection using `YOLOv8`-style models via ONNX Runtime
//!
//! The rest of the workspace only sees the [`Detector`] trait: give it an RGB
//! image and a confidence threshold, get back a list of [`Detection`]s in the
//! pixel coordinates of that image. [`YoloDetector`] is the ONNX backend for
//! models exported with Ultralytics (`yolo export format=onnx`).
//!
//! # Concurrency
//! A [`YoloDetector`] owns a fixed pool of ONNX sessions. Each `detect` call
//! checks out one session for the duration of inference, so the detector can
//! be shared (`Arc<dyn Detector>`) across requests: at most `pool_size`
//! inferences run at once and further callers wait. A pool of one serializes
//! all inference.
//!
//! # Example
//! ```no_run
//! use blade_inspect_object_detection::{Detector, ObjectDetectionConfig, YoloDetector};
//!
//! # fn main() -> anyhow::Result<()> {
//! let detector = YoloDetector::new("blade-damage.onnx", ObjectDetectionConfig::default(), None, 1)?;
//!
//! let img = image::open("blade.jpg")?.to_rgb8();
//! for detection in detector.detect(&img, 0.25)? {
//!     println!("{}: {:.2}%", detection.class_name, detection.confidence * 100.0);
//! }
//! # Ok(())
//! # }
//! ```

pub mod annotate;
pub mod class_names;
pub mod pool;

use image::RgbImage;
use ndarray::Array;
use ort::{
    execution_providers::{CPUExecutionProvider, CUDAExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pool::ResourcePool;

/// Object detection capability consumed by the analysis pipeline
///
/// Implementations must be deterministic for identical input and threshold,
/// and safe to call from several threads at once.
pub trait Detector: Send + Sync {
    /// Detect objects in an RGB image, dropping detections below `confidence_threshold`
    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, ObjectDetectionError>;

    /// Class names indexed by class id
    fn class_names(&self) -> &[String];

    /// Human-readable detector name (for logging and model info)
    fn name(&self) -> &str {
        "detector"
    }

    /// Resolve a class id to its name
    fn class_name(&self, class_id: u32) -> &str {
        self.class_names()
            .get(class_id as usize)
            .map_or("unknown", String::as_str)
    }
}

/// Configuration for object detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectDetectionConfig {
    /// `IoU` threshold for non-maximum suppression (0.0-1.0)
    pub iou_threshold: f32,
    /// Maximum number of detections to return per image
    pub max_detections: usize,
    /// Input image size (`YOLOv8` default is 640x640)
    pub input_size: u32,
}

impl Default for ObjectDetectionConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.45,
            max_detections: 300,
            input_size: 640,
        }
    }
}

impl ObjectDetectionConfig {
    /// Fewer, more separated detections
    #[must_use]
    pub fn fast() -> Self {
        Self {
            iou_threshold: 0.5,
            max_detections: 100,
            input_size: 640,
        }
    }

    /// More detections, stricter duplicate removal
    #[must_use]
    pub fn accurate() -> Self {
        Self {
            iou_threshold: 0.4,
            max_detections: 500,
            input_size: 640,
        }
    }
}

/// Bounding box in pixel coordinates (`x1 < x2`, `y1 < y2`)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BoundingBox {
    /// Create a new bounding box from corner coordinates
    #[must_use]
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Create a box from centre coordinates and size
    #[must_use]
    pub fn from_center(cx: f32, cy: f32, width: f32, height: f32) -> Self {
        Self::new(
            cx - width / 2.0,
            cy - height / 2.0,
            cx + width / 2.0,
            cy + height / 2.0,
        )
    }

    /// Width of the box
    #[must_use]
    #[inline]
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    /// Height of the box
    #[must_use]
    #[inline]
    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    /// Get center coordinates
    #[must_use]
    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }

    /// Get area of bounding box
    #[must_use]
    #[inline]
    pub fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Box scaled per axis and clipped to `[0, width] x [0, height]`
    #[must_use]
    pub fn scaled_and_clipped(&self, sx: f32, sy: f32, width: f32, height: f32) -> Self {
        Self::new(
            (self.x1 * sx).clamp(0.0, width),
            (self.y1 * sy).clamp(0.0, height),
            (self.x2 * sx).clamp(0.0, width),
            (self.y2 * sy).clamp(0.0, height),
        )
    }

    /// Whether the box has positive width and height
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    /// Corners as `[x1, y1, x2, y2]`
    #[must_use]
    pub fn to_array(&self) -> [f32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }

    /// Calculate Intersection over Union (`IoU`) with another box
    #[must_use]
    #[inline]
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let x1 = self.x1.max(other.x1);
        let y1 = self.y1.max(other.y1);
        let x2 = self.x2.min(other.x2);
        let y2 = self.y2.min(other.y2);

        let intersection_area = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        let union_area = self.area() + other.area() - intersection_area;

        if union_area > 0.0 {
            intersection_area / union_area
        } else {
            0.0
        }
    }
}

/// Object detection result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Model class id
    pub class_id: u32,
    /// Human-readable class name
    pub class_name: String,
    /// Confidence score (0-1)
    pub confidence: f32,
    /// Bounding box in pixel coordinates of the analysed image
    pub bbox: BoundingBox,
}

/// `YOLOv8` detector over a pool of ONNX Runtime sessions
pub struct YoloDetector {
    sessions: ResourcePool<Session>,
    config: ObjectDetectionConfig,
    class_names: Vec<String>,
    model_path: PathBuf,
}

impl YoloDetector {
    /// Load `pool_size` sessions of the ONNX model at `model_path`
    ///
    /// Class names come from `class_names` when given, otherwise from the
    /// model's `names` metadata; failing both, detections are named `class_<id>`.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        config: ObjectDetectionConfig,
        class_names: Option<Vec<String>>,
        pool_size: usize,
    ) -> Result<Self, ObjectDetectionError> {
        let model_path = model_path.as_ref();
        if !model_path.exists() {
            return Err(ObjectDetectionError::ModelLoad(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }

        let pool_size = pool_size.max(1);
        info!(
            "Loading detector model from {} ({} session(s))",
            model_path.display(),
            pool_size
        );

        let intra_threads = (num_cpus::get_physical() / pool_size).max(1);
        let mut sessions = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            sessions.push(create_session(model_path, intra_threads)?);
        }

        let class_names = match class_names {
            Some(names) => names,
            None => match metadata_class_names(&sessions[0]) {
                Some(names) => names,
                None => {
                    warn!("Model has no class names metadata; using placeholders");
                    Vec::new()
                }
            },
        };

        info!(
            "Detector model loaded with {} class name(s)",
            class_names.len()
        );

        Ok(Self {
            sessions: ResourcePool::new(sessions),
            config,
            class_names,
            model_path: model_path.to_path_buf(),
        })
    }

    /// Path the model was loaded from
    #[must_use]
    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    /// Detection configuration
    #[must_use]
    pub fn config(&self) -> &ObjectDetectionConfig {
        &self.config
    }

    /// Number of sessions in the pool
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.sessions.size()
    }
}

impl Detector for YoloDetector {
    fn detect(
        &self,
        image: &RgbImage,
        confidence_threshold: f32,
    ) -> Result<Vec<Detection>, ObjectDetectionError> {
        debug!(
            "Running object detection on {}x{} image",
            image.width(),
            image.height()
        );

        let input_array = preprocess_image(image, self.config.input_size)?;

        let mut session = self.sessions.checkout().ok_or(ObjectDetectionError::PoolClosed)?;

        let input_tensor = TensorRef::from_array_view(input_array.view())
            .map_err(|e| ObjectDetectionError::Inference(e.to_string()))?;
        let outputs = session
            .run(ort::inputs![input_tensor])
            .map_err(|e| ObjectDetectionError::Inference(e.to_string()))?;

        let (shape, data) = outputs[0].try_extract_tensor::<f32>().map_err(|e| {
            ObjectDetectionError::Inference(format!("Failed to extract tensor: {e}"))
        })?;

        let detections = postprocess_predictions(
            shape.as_ref(),
            data,
            &PostprocessParams {
                confidence_threshold,
                iou_threshold: self.config.iou_threshold,
                max_detections: self.config.max_detections,
                input_size: self.config.input_size,
                image_width: image.width(),
                image_height: image.height(),
            },
            &self.class_names,
        )?;

        debug!("Detected {} objects", detections.len());

        Ok(detections)
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn name(&self) -> &str {
        "yolov8-onnx"
    }
}

/// Create an optimized ONNX Runtime session (CUDA when available, CPU otherwise)
fn create_session(model_path: &Path, intra_threads: usize) -> Result<Session, ObjectDetectionError> {
    Session::builder()
        .map_err(|e| ObjectDetectionError::ModelLoad(e.to_string()))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(|e| ObjectDetectionError::ModelLoad(e.to_string()))?
        .with_intra_threads(intra_threads)
        .map_err(|e| ObjectDetectionError::ModelLoad(e.to_string()))?
        .with_execution_providers([
            CUDAExecutionProvider::default().build(),
            CPUExecutionProvider::default().build(),
        ])
        .map_err(|e| ObjectDetectionError::ModelLoad(e.to_string()))?
        .commit_from_file(model_path)
        .map_err(|e| ObjectDetectionError::ModelLoad(e.to_string()))
}

/// Read class names from Ultralytics export metadata, if present
fn metadata_class_names(session: &Session) -> Option<Vec<String>> {
    let metadata = session.metadata().ok()?;
    let raw = metadata.custom("names").ok()??;
    match class_names::parse_metadata_names(&raw) {
        Ok(names) => Some(names),
        Err(e) => {
            warn!("Ignoring unreadable model names metadata: {}", e);
            None
        }
    }
}

/// Preprocess image to `YOLOv8` input format (1, 3, H, W) with normalization
fn preprocess_image(
    image: &RgbImage,
    input_size: u32,
) -> Result<Array<f32, ndarray::Dim<[usize; 4]>>, ObjectDetectionError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(ObjectDetectionError::ImageProcessing(
            "Cannot run detection on an empty image".to_string(),
        ));
    }

    let resized = image::imageops::resize(
        image,
        input_size,
        input_size,
        image::imageops::FilterType::Triangle,
    );

    let size = input_size as usize;
    let mut input_array = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let (x, y) = (x as usize, y as usize);
        input_array[[0, 0, y, x]] = f32::from(pixel[0]) / 255.0;
        input_array[[0, 1, y, x]] = f32::from(pixel[1]) / 255.0;
        input_array[[0, 2, y, x]] = f32::from(pixel[2]) / 255.0;
    }

    Ok(input_array)
}

/// Parameters for decoding raw model output
#[derive(Debug, Clone, Copy)]
pub struct PostprocessParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub max_detections: usize,
    pub input_size: u32,
    pub image_width: u32,
    pub image_height: u32,
}

/// Decode `YOLOv8` output of shape `(1, 4 + classes, anchors)` into detections
///
/// Boxes are mapped back from the square model input to the pixel grid of the
/// original image.
pub fn postprocess_predictions(
    dims: &[i64],
    data: &[f32],
    params: &PostprocessParams,
    class_names: &[String],
) -> Result<Vec<Detection>, ObjectDetectionError> {
    if dims.len() != 3 {
        return Err(ObjectDetectionError::Inference(format!(
            "Expected 3D output tensor, got {}D",
            dims.len()
        )));
    }

    let num_features = dims[1] as usize;
    let num_anchors = dims[2] as usize;
    if num_features <= 4 || data.len() < num_features * num_anchors {
        return Err(ObjectDetectionError::Inference(format!(
            "Unexpected output shape {dims:?} for {} values",
            data.len()
        )));
    }
    let num_classes = num_features - 4;

    let sx = params.image_width as f32 / params.input_size as f32;
    let sy = params.image_height as f32 / params.input_size as f32;
    let (w, h) = (params.image_width as f32, params.image_height as f32);

    let mut raw_detections = Vec::with_capacity(num_anchors / 10);

    // Layout [batch, features, anchors]: feature f of anchor i is at f * anchors + i
    for anchor_idx in 0..num_anchors {
        let get_feature = |feature_idx: usize| data[feature_idx * num_anchors + anchor_idx];

        let mut max_prob = 0.0f32;
        let mut max_class_id = 0usize;
        for class_id in 0..num_classes {
            let prob = get_feature(4 + class_id);
            if prob > max_prob {
                max_prob = prob;
                max_class_id = class_id;
            }
        }

        if max_prob < params.confidence_threshold {
            continue;
        }

        let bbox = BoundingBox::from_center(
            get_feature(0),
            get_feature(1),
            get_feature(2),
            get_feature(3),
        )
        .scaled_and_clipped(sx, sy, w, h);
        if !bbox.is_valid() {
            continue;
        }

        let class_name = class_names
            .get(max_class_id)
            .cloned()
            .unwrap_or_else(|| format!("class_{max_class_id}"));

        raw_detections.push(Detection {
            class_id: max_class_id as u32,
            class_name,
            confidence: max_prob,
            bbox,
        });
    }

    debug!("Raw detections before NMS: {}", raw_detections.len());

    let mut detections = apply_nms(raw_detections, params.iou_threshold);
    detections.truncate(params.max_detections);

    Ok(detections)
}

/// Per-class non-maximum suppression, highest confidence first
pub fn apply_nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for candidate in detections {
        let suppressed = keep.iter().any(|kept| {
            kept.class_id == candidate.class_id && kept.bbox.iou(&candidate.bbox) >= iou_threshold
        });
        if !suppressed {
            keep.push(candidate);
        }
    }

    debug!("Detections after NMS: {}", keep.len());
    keep
}

/// Error types for object detection
#[derive(Debug, Error)]
pub enum ObjectDetectionError {
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    #[error("Inference error: {0}")]
    Inference(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Class names error: {0}")]
    ClassNames(String),

    #[error("Detector session pool is empty")]
    PoolClosed,

    #[error("ONNX Runtime error: {0}")]
    OnnxRuntime(#[from] ort::Error),
}
