//! REST API for wind turbine blade damage detection
//!
//! Exposes the detector for single images, whole videos (detection statistics
//! over every frame) and videos sampled at two frames per second with
//! per-frame detections and images, either as one JSON document or streamed
//! as NDJSON.

pub mod config;
mod error;
mod handlers;
mod types;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use blade_inspect_frame_analysis::VideoPipeline;
use blade_inspect_object_detection::Detector;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::{ConfigError, ServerConfig};
pub use error::ApiError;
pub use handlers::*;
pub use types::*;

/// Name reported by `/model/info`
pub const DEFAULT_MODEL_NAME: &str = "Wind Turbine Damage Detection";

/// Static description of the loaded model
#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_name: String,
    pub model_path: String,
}

/// API server state shared across handlers
#[derive(Clone)]
pub struct ApiState {
    /// Shared detector (internally pooled, safe for concurrent requests)
    pub detector: Arc<dyn Detector>,
    pub model: Arc<ModelInfo>,
    /// Two frames per second, JPEG frames attached
    pub frames_pipeline: Arc<VideoPipeline>,
    /// Every frame, statistics only
    pub batch_pipeline: Arc<VideoPipeline>,
    pub confidence_threshold: f32,
    pub max_upload_bytes: usize,
}

impl ApiState {
    pub fn new(detector: Arc<dyn Detector>, model: ModelInfo, config: &ServerConfig) -> Self {
        Self {
            frames_pipeline: Arc::new(VideoPipeline::new(
                detector.clone(),
                config.frames_pipeline(),
            )),
            batch_pipeline: Arc::new(VideoPipeline::new(
                detector.clone(),
                config.batch_pipeline(),
            )),
            detector,
            model: Arc::new(model),
            confidence_threshold: config.confidence_threshold,
            max_upload_bytes: config.max_upload_bytes,
        }
    }
}

/// Build the API router with all endpoints
pub fn build_router(state: ApiState) -> Router {
    let body_limit = state.max_upload_bytes;

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/model/info", get(model_info))
        .route("/predict/image", post(predict_image))
        .route("/predict/video", post(predict_video))
        .route("/predict/video/frames", post(predict_video_frames))
        .route(
            "/predict/video/frames/stream",
            post(predict_video_frames_stream),
        )
        // Middleware
        // Enforced while the multipart body is read, so the 413 carries `detail`
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on an already bound listener
pub async fn serve(listener: tokio::net::TcpListener, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("API server listening on {}", listener.local_addr()?);
    axum::serve(listener, build_router(state)).await
}

/// Start the API server
pub async fn start_server(addr: &str, state: ApiState) -> Result<(), std::io::Error> {
    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state).await
}
