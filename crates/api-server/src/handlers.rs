//! HTTP request handlers for API endpoints

use axum::{
    body::{Body, Bytes},
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Response},
    Json,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use blade_inspect_frame_analysis::encode::encode_png;
use blade_inspect_frame_analysis::FrameSource;
use blade_inspect_object_detection::annotate::annotate;
use blade_inspect_video_decoder::{suffix_for_upload, UploadedVideo};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ops::ControlFlow;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, info_span, warn};
use uuid::Uuid;

use crate::error::ApiError;
use crate::types::{
    DetectionDto, FrameDto, HealthResponse, ImagePredictionResponse, ModelInfoResponse,
    StatusResponse, StreamEvent, VideoFramesResponse, VideoSummaryResponse,
};
use crate::ApiState;

/// Lines buffered between the analysis thread and the HTTP response
const STREAM_CHANNEL_CAPACITY: usize = 4;

/// Multipart field carrying the upload
const FILE_FIELD: &str = "file";

/// An uploaded file read from the multipart body
struct Upload {
    bytes: Bytes,
    file_name: Option<String>,
}

/// Read the `file` field of a multipart body
async fn read_upload(mut multipart: Multipart) -> Result<Upload, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field.bytes().await?;
        if bytes.is_empty() {
            return Err(ApiError::BadRequest("Uploaded file is empty".to_string()));
        }
        return Ok(Upload { bytes, file_name });
    }
    Err(ApiError::BadRequest(format!(
        "Missing multipart field '{FILE_FIELD}'"
    )))
}

/// Service banner
pub async fn root() -> impl IntoResponse {
    Json(StatusResponse {
        message: "Wind Turbine Damage Detection API".to_string(),
        status: "running".to_string(),
    })
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Describe the loaded detector
pub async fn model_info(State(state): State<ApiState>) -> impl IntoResponse {
    let names = state.detector.class_names();
    let classes: BTreeMap<u32, String> = names
        .iter()
        .enumerate()
        .map(|(id, name)| (id as u32, name.clone()))
        .collect();

    Json(ModelInfoResponse {
        model_name: state.model.model_name.clone(),
        num_classes: classes.len(),
        classes,
        model_path: state.model.model_path.clone(),
    })
}

/// Detect damage on a single image and return it annotated
pub async fn predict_image(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Json<ImagePredictionResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let span = info_span!("predict_image", request_id = %Uuid::new_v4());
    info!(parent: &span, "Image upload: {} bytes", upload.bytes.len());

    let detector = state.detector.clone();
    let threshold = state.confidence_threshold;
    let response = tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        let image = image::load_from_memory(&upload.bytes)?.to_rgb8();
        let detections = detector.detect(&image, threshold)?;
        let annotated = encode_png(&annotate(&image, &detections))?;
        info!(
            "{}x{} image: {} detection(s)",
            image.width(),
            image.height(),
            detections.len()
        );

        Ok::<_, ApiError>(ImagePredictionResponse {
            success: true,
            total_detections: detections.len(),
            detections: detections.iter().map(DetectionDto::from).collect(),
            annotated_image: STANDARD.encode(annotated),
        })
    })
    .await??;

    Ok(Json(response))
}

/// Analyse every frame of a video and return detection statistics
pub async fn predict_video(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Json<VideoSummaryResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let span = info_span!("predict_video", request_id = %Uuid::new_v4());
    info!(parent: &span, "Video upload: {} bytes", upload.bytes.len());

    // Dropped together with this future when the client goes away
    let (alive_tx, _alive_rx) = oneshot::channel::<()>();

    let pipeline = state.batch_pipeline.clone();
    let response = tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        let suffix = suffix_for_upload(upload.file_name.as_deref());
        let video = UploadedVideo::open(&upload.bytes, &suffix)?;

        let mut class_counts: BTreeMap<String, u64> = BTreeMap::new();
        let mut frames_with_detections = 0u64;
        let result = pipeline.stream(video, || alive_tx.is_closed(), |record| {
            if !record.detections.is_empty() {
                frames_with_detections += 1;
            }
            for detection in record.detections {
                *class_counts.entry(detection.class_name).or_default() += 1;
            }
            ControlFlow::Continue(())
        })?;

        Ok::<_, ApiError>(VideoSummaryResponse {
            success: true,
            fps: result.stream.frame_rate,
            total_frames: result.stream.total_frame_count,
            duration: result.stream.duration,
            frames_analyzed: result.frame_count_processed,
            total_detections: result.total_detections,
            message: result.message(),
            class_counts,
            frames_with_detections,
        })
    })
    .await??;

    Ok(Json(response))
}

/// Analyse about two frames per second and return per-frame detections with images
pub async fn predict_video_frames(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Json<VideoFramesResponse>, ApiError> {
    let upload = read_upload(multipart).await?;
    let span = info_span!("predict_video_frames", request_id = %Uuid::new_v4());
    info!(parent: &span, "Video upload: {} bytes", upload.bytes.len());

    // Dropped together with this future when the client goes away
    let (alive_tx, _alive_rx) = oneshot::channel::<()>();

    let pipeline = state.frames_pipeline.clone();
    let result = tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        let suffix = suffix_for_upload(upload.file_name.as_deref());
        let video = UploadedVideo::open(&upload.bytes, &suffix)?;
        Ok::<_, ApiError>(pipeline.analyze(video, || alive_tx.is_closed())?)
    })
    .await??;

    Ok(Json(VideoFramesResponse::from(result)))
}

/// Same analysis as [`predict_video_frames`], streamed as NDJSON
///
/// Emits a `metadata` line, one `frame` line per analysed frame and a final
/// `summary` line, or an `error` line if the run fails after streaming began.
pub async fn predict_video_frames_stream(
    State(state): State<ApiState>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    let upload = read_upload(multipart).await?;
    let span = info_span!("predict_video_frames_stream", request_id = %Uuid::new_v4());
    info!(parent: &span, "Video upload: {} bytes", upload.bytes.len());

    let (line_tx, line_rx) = mpsc::channel::<Result<String, Infallible>>(STREAM_CHANNEL_CAPACITY);
    let (opened_tx, opened_rx) = oneshot::channel::<Result<(), ApiError>>();

    let pipeline = state.frames_pipeline.clone();
    tokio::task::spawn_blocking(move || {
        let _enter = span.enter();
        let suffix = suffix_for_upload(upload.file_name.as_deref());
        let video = match UploadedVideo::open(&upload.bytes, &suffix) {
            Ok(video) => video,
            Err(e) => {
                let _ = opened_tx.send(Err(e.into()));
                return;
            }
        };

        let stream = video.stream();
        let metadata = StreamEvent::Metadata {
            fps: stream.frame_rate,
            total_frames: stream.total_frame_count,
            duration: stream.duration,
            frame_interval: pipeline.sampler_for(&stream).interval(),
        };
        if opened_tx.send(Ok(())).is_err() || line_tx.blocking_send(Ok(metadata.to_line())).is_err() {
            info!("Client disconnected before streaming started");
            return;
        }

        let outcome = pipeline.stream(video, || line_tx.is_closed(), |record| {
            let line = StreamEvent::Frame(FrameDto::from(record)).to_line();
            match line_tx.blocking_send(Ok(line)) {
                Ok(()) => ControlFlow::Continue(()),
                Err(_) => ControlFlow::Break(()),
            }
        });

        let last = match outcome {
            Ok(result) => StreamEvent::Summary {
                frames_processed: result.frame_count_processed,
                partial: result.is_partial(),
                message: result.message(),
            },
            Err(e) => {
                warn!("Streaming analysis failed: {}", e);
                StreamEvent::Error {
                    detail: e.to_string(),
                }
            }
        };
        let _ = line_tx.blocking_send(Ok(last.to_line()));
    });

    opened_rx
        .await
        .map_err(|_| ApiError::Internal("Analysis task ended unexpectedly".to_string()))??;

    Ok((
        [(header::CONTENT_TYPE, "application/x-ndjson")],
        Body::from_stream(ReceiverStream::new(line_rx)),
    )
        .into_response())
}

