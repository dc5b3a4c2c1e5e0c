mod ffmpeg;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

pub use ffmpeg::{FfmpegCamera, FfmpegOpener, MjpegSplitter};

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ffmpeg not found")]
    FfmpegNotFound,
    #[error("ffmpeg failed: {0}")]
    FfmpegFailed(String),
    #[error("no frame from {0}")]
    NoFrame(String),
    #[error("camera init failed after {attempts} attempts: {last_error}")]
    InitExhausted { attempts: u32, last_error: String },
}

/// A started capture device. Dropping it releases the device.
pub trait CameraDevice: Send + Sync {
    /// Most recent full-quality frame as JPEG, if it is fresh.
    fn capture_still(&self) -> Result<Vec<u8>, DeviceError>;

    /// Most recent frame for live preview, regardless of age.
    fn latest_frame(&self) -> Option<Vec<u8>>;
}

pub trait CameraOpener: Send + Sync + 'static {
    type Camera: CameraDevice + 'static;

    fn open(&self) -> Result<Self::Camera, DeviceError>;
}

/// Open the camera, trying at most `attempts` times with `backoff` between
/// tries. Running out of attempts is fatal for the agent.
pub async fn open_with_retry<O: CameraOpener>(
    opener: Arc<O>,
    attempts: u32,
    backoff: Duration,
) -> Result<O::Camera, DeviceError> {
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=attempts {
        let opener = Arc::clone(&opener);
        let result = tokio::task::spawn_blocking(move || opener.open())
            .await
            .map_err(|e| DeviceError::FfmpegFailed(format!("camera open task failed: {e}")))
            .and_then(|r| r);

        match result {
            Ok(camera) => {
                tracing::info!(attempt, "camera initialized");
                return Ok(camera);
            }
            Err(e) => {
                tracing::warn!(attempt, attempts, error = %e, "camera init attempt failed");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::time::sleep(backoff).await;
        }
    }

    Err(DeviceError::InitExhausted {
        attempts,
        last_error,
    })
}
