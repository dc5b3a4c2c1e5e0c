use std::sync::Arc;

use axum::extract::multipart::{MultipartError, MultipartRejection};
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::ServiceConfig;
use crate::detection::{
    AlertDispatcher, DetectError, DetectionResult, DetectionService, HttpAlertSink, ImageValidator,
    ObjectDetector, OnnxPersonCounter, ValidationError,
};
use crate::error::TransportError;

/// Extra room above the image limit for multipart framing and other fields.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("failed to load model: {0}")]
    Model(Box<dyn std::error::Error + Send + Sync>),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Error reply in the `{"detail": ...}` shape clients expect.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

impl From<DetectError> for ApiError {
    fn from(e: DetectError) -> Self {
        match e {
            DetectError::Validation(e) => Self::bad_request(e.to_string()),
            DetectError::Inference(e) => Self {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                detail: e.to_string(),
            },
        }
    }
}

#[derive(Deserialize)]
struct DetectQuery {
    camera_id: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

pub fn router(service: DetectionService) -> Router {
    let body_limit = service.max_image_bytes() * 2 + MULTIPART_OVERHEAD;

    Router::new()
        .route("/detect", post(detect_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(service)
}

async fn detect_handler(
    State(service): State<DetectionService>,
    Query(query): Query<DetectQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<DetectionResult>, ApiError> {
    let camera_id = query
        .camera_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("camera_id query parameter is required"))?;

    let mut multipart = multipart.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let image = read_image_field(&mut multipart, service.max_image_bytes()).await?;

    let result = service.detect(image, &camera_id).await.map_err(|e| {
        tracing::warn!(camera = %camera_id, error = %e, "detection rejected");
        ApiError::from(e)
    })?;

    Ok(Json(result))
}

/// Reads the `image` field, refusing it with the validator's message as soon
/// as it grows past `max_bytes`.
async fn read_image_field(
    multipart: &mut Multipart,
    max_bytes: usize,
) -> Result<Vec<u8>, ApiError> {
    let too_large = |size: usize| {
        ApiError::bad_request(
            ValidationError::PayloadTooLarge {
                size,
                limit: max_bytes,
            }
            .to_string(),
        )
    };
    let multipart_error = |e: MultipartError, size: usize| {
        if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
            too_large(size)
        } else {
            ApiError {
                status: e.status(),
                detail: e.body_text(),
            }
        }
    };

    loop {
        let field = multipart
            .next_field()
            .await
            .map_err(|e| multipart_error(e, 0))?;
        let Some(mut field) = field else {
            return Err(ApiError::bad_request("image field is required"));
        };
        if field.name() != Some("image") {
            continue;
        }

        let mut image = Vec::new();
        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| multipart_error(e, image.len()))?
        {
            image.extend_from_slice(&chunk);
            if image.len() > max_bytes {
                tracing::debug!(received = image.len(), limit = max_bytes, "image upload cut off");
                return Err(too_large(image.len()));
            }
        }
        return Ok(image);
    }
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

/// Load the model and serve the detection API until ctrl-c.
pub async fn serve(config: ServiceConfig) -> Result<(), ServeError> {
    let model_path = config.model_path.clone();
    let (confidence, iou) = (config.confidence_threshold, config.iou_threshold);
    let detector = tokio::task::spawn_blocking(move || ObjectDetector::new(&model_path, confidence, iou))
        .await
        .map_err(|e| ServeError::Model(Box::new(e)))?
        .map_err(ServeError::Model)?;

    let sink = HttpAlertSink::new(
        config.report_url.clone(),
        config.warning_url.clone(),
        config.alert_timeout(),
    )?;
    let service = DetectionService::new(
        ImageValidator::new(config.max_image_bytes),
        Arc::new(OnnxPersonCounter::new(detector)),
        AlertDispatcher::new(Arc::new(sink)),
        config.capacity,
    );

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!(capacity = config.capacity, "starting detection service on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
            }
            tracing::info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
