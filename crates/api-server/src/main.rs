//! API Server Binary Entry Point

use anyhow::Context;
use blade_inspect_api_server::{start_server, ApiState, ModelInfo, ServerConfig, DEFAULT_MODEL_NAME};
use blade_inspect_object_detection::class_names::load_class_names_yaml;
use blade_inspect_object_detection::{ObjectDetectionConfig, YoloDetector};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "blade_inspect_api_server=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env().context("Invalid server configuration")?;

    let class_names = config
        .class_names_path
        .as_ref()
        .map(load_class_names_yaml)
        .transpose()
        .context("Failed to load class names")?;

    let detector = YoloDetector::new(
        &config.model_path,
        ObjectDetectionConfig::default(),
        class_names,
        config.detector_pool_size,
    )
    .with_context(|| format!("Failed to load model {}", config.model_path.display()))?;

    let model = ModelInfo {
        model_name: DEFAULT_MODEL_NAME.to_string(),
        model_path: config.model_path.display().to_string(),
    };
    let state = ApiState::new(Arc::new(detector), model, &config);

    tracing::info!("Starting Wind Turbine Damage Detection API Server");
    start_server(&config.addr, state).await?;

    Ok(())
}
