use std::time::Duration;

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Url;

use crate::detection::{DetectionResult, ResultStatus};
use crate::error::TransportError;

/// The agent's view of the detection service.
#[async_trait]
pub trait DetectionClient: Send + Sync {
    async fn detect(&self, camera_id: &str, jpeg: Vec<u8>) -> Result<DetectionResult, TransportError>;
    async fn health(&self) -> Result<(), TransportError>;
}

pub struct HttpDetectionClient {
    client: reqwest::Client,
    base_url: String,
    upload_timeout: Duration,
    health_timeout: Duration,
}

impl HttpDetectionClient {
    pub fn new(
        base_url: impl Into<String>,
        upload_timeout: Duration,
        health_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            client,
            base_url,
            upload_timeout,
            health_timeout,
        })
    }

    fn url(&self, path: &str, params: &[(&str, &str)]) -> Result<Url, TransportError> {
        Url::parse_with_params(&format!("{}{}", self.base_url, path), params)
            .map_err(|e| TransportError::Malformed(format!("invalid url: {e}")))
    }
}

#[async_trait]
impl DetectionClient for HttpDetectionClient {
    async fn detect(&self, camera_id: &str, jpeg: Vec<u8>) -> Result<DetectionResult, TransportError> {
        let url = self.url("/detect", &[("camera_id", camera_id)])?;
        let part = Part::bytes(jpeg)
            .file_name(format!("{camera_id}.jpg"))
            .mime_str("image/jpeg")?;
        let form = Form::new().part("image", part);

        let body = self
            .client
            .post(url)
            .timeout(self.upload_timeout)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        parse_detection(&body, camera_id)
    }

    async fn health(&self) -> Result<(), TransportError> {
        let url = self.url("/health", &[])?;
        self.client
            .get(url)
            .timeout(self.health_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Decode a detection reply, refusing anything that does not describe a
/// successful reading for this camera.
pub fn parse_detection(body: &[u8], camera_id: &str) -> Result<DetectionResult, TransportError> {
    let result: DetectionResult = serde_json::from_slice(body)
        .map_err(|e| TransportError::Malformed(format!("detection reply: {e}")))?;

    if result.status != ResultStatus::Success {
        return Err(TransportError::Malformed("detection reply reports an error".to_string()));
    }
    if result.capacity == 0 {
        return Err(TransportError::Malformed("detection reply has zero capacity".to_string()));
    }
    if result.camera_id != camera_id {
        return Err(TransportError::Malformed(format!(
            "detection reply is for camera {}",
            result.camera_id
        )));
    }

    Ok(result)
}
