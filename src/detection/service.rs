use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::alert::AlertDispatcher;
use super::object::{InferenceError, PersonCounter};
use super::validate::{ImageValidator, ValidationError};

/// One inference call. Lives only for the duration of `detect`.
#[derive(Debug, Clone)]
pub struct DetectionRequest {
    pub image_bytes: Vec<u8>,
    pub camera_id: String,
    pub capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub camera_id: String,
    pub occupancy: u32,
    pub capacity: u32,
    pub status: ResultStatus,
}

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Inference(#[from] InferenceError),
}

/// Validate, score and dispatch one image. Holds no per-request state; the
/// scorer is shared read-only between concurrent requests.
#[derive(Clone)]
pub struct DetectionService {
    validator: ImageValidator,
    scorer: Arc<dyn PersonCounter>,
    dispatcher: AlertDispatcher,
    capacity: u32,
}

impl DetectionService {
    pub fn new(
        validator: ImageValidator,
        scorer: Arc<dyn PersonCounter>,
        dispatcher: AlertDispatcher,
        capacity: u32,
    ) -> Self {
        Self {
            validator,
            scorer,
            dispatcher,
            capacity,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn max_image_bytes(&self) -> usize {
        self.validator.max_bytes()
    }

    pub async fn detect(
        &self,
        image_bytes: Vec<u8>,
        camera_id: &str,
    ) -> Result<DetectionResult, DetectError> {
        let request = DetectionRequest {
            image_bytes,
            camera_id: camera_id.to_string(),
            capacity: self.capacity,
        };
        self.validator.check_size(&request.image_bytes)?;

        let occupancy = self.score(request.image_bytes).await?;

        let result = DetectionResult {
            camera_id: request.camera_id,
            occupancy,
            capacity: request.capacity,
            status: ResultStatus::Success,
        };

        tracing::info!(camera = %result.camera_id, occupancy, "detection complete");

        // Delivery outcome is logged by the dispatcher and never affects the reply
        self.dispatcher
            .dispatch(&result.camera_id, result.occupancy, result.capacity)
            .await;

        Ok(result)
    }

    async fn score(&self, image_bytes: Vec<u8>) -> Result<u32, DetectError> {
        let validator = self.validator;
        let scorer = Arc::clone(&self.scorer);

        tokio::task::spawn_blocking(move || -> Result<u32, DetectError> {
            let image = validator.decode(&image_bytes)?;
            let people = scorer.count_people(&image).map_err(|e| {
                tracing::error!(error = %e, "person detection failed");
                e
            })?;
            Ok(people)
        })
        .await
        .map_err(|e| InferenceError(format!("scoring task failed: {e}")))?
    }
}
