use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::camera::{CameraDevice, DeviceError};
use crate::detection::DetectionResult;
use crate::error::TransportError;
use crate::status::SnapshotHandle;

use super::client::DetectionClient;
use super::{AgentState, Lifecycle};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The foreground loop: capture a still, upload it, publish the reading.
pub struct CaptureLoop {
    camera_id: String,
    camera: Arc<dyn CameraDevice>,
    client: Arc<dyn DetectionClient>,
    snapshot: SnapshotHandle,
    lifecycle: Lifecycle,
    interval: Duration,
    archive_dir: Option<PathBuf>,
}

impl CaptureLoop {
    pub fn new(
        camera_id: impl Into<String>,
        camera: Arc<dyn CameraDevice>,
        client: Arc<dyn DetectionClient>,
        snapshot: SnapshotHandle,
        lifecycle: Lifecycle,
        interval: Duration,
    ) -> Self {
        Self {
            camera_id: camera_id.into(),
            camera,
            client,
            snapshot,
            lifecycle,
            interval,
            archive_dir: None,
        }
    }

    pub fn with_archive(mut self, dir: Option<PathBuf>) -> Self {
        self.archive_dir = dir;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(camera = %self.camera_id, period_secs = self.interval.as_secs(), "capture loop started");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if *shutdown.borrow() {
                break;
            }

            // a cycle in flight finishes before shutdown is observed again
            if let Err(e) = self.run_cycle().await {
                tracing::warn!(camera = %self.camera_id, error = %e, "capture cycle failed, waiting for next period");
            }
        }

        tracing::info!(camera = %self.camera_id, "capture loop stopped");
    }

    /// One capture and upload. The snapshot is only touched on success.
    pub async fn run_cycle(&self) -> Result<(), CycleError> {
        self.lifecycle.transition(AgentState::Capturing);
        let result = self.capture_and_detect().await;
        self.lifecycle.transition(AgentState::Ready);

        let (reading, at) = result?;
        self.snapshot
            .publish_reading(reading.occupancy, reading.capacity, at);
        tracing::info!(
            camera = %self.camera_id,
            occupancy = reading.occupancy,
            capacity = reading.capacity,
            "occupancy updated"
        );
        Ok(())
    }

    async fn capture_and_detect(&self) -> Result<(DetectionResult, DateTime<Local>), CycleError> {
        let camera = Arc::clone(&self.camera);
        let jpeg = tokio::task::spawn_blocking(move || camera.capture_still())
            .await
            .map_err(|e| DeviceError::FfmpegFailed(format!("capture task failed: {e}")))??;
        let captured_at = Local::now();
        tracing::debug!(camera = %self.camera_id, bytes = jpeg.len(), "still captured");

        if let Some(dir) = &self.archive_dir {
            archive_still(dir, &self.camera_id, captured_at, &jpeg).await;
        }

        let reading = self.client.detect(&self.camera_id, jpeg).await?;
        Ok((reading, Local::now()))
    }
}

pub fn archive_file_name(camera_id: &str, at: DateTime<Local>) -> String {
    format!("{}_{}.jpg", camera_id, at.format("%Y%m%d_%H%M%S"))
}

async fn archive_still(dir: &Path, camera_id: &str, at: DateTime<Local>, jpeg: &[u8]) {
    let path = dir.join(archive_file_name(camera_id, at));
    let write = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, jpeg).await
    };
    match write.await {
        Ok(()) => tracing::debug!(path = %path.display(), "still archived"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to archive still"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::tests::StillCamera;
    use crate::detection::ResultStatus;
    use crate::status::{StatusSnapshot, SystemStatus};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct ScriptedClient {
        replies: Mutex<Vec<Result<DetectionResult, TransportError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedClient {
        fn new(replies: Vec<Result<DetectionResult, TransportError>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DetectionClient for ScriptedClient {
        async fn detect(
            &self,
            camera_id: &str,
            _jpeg: Vec<u8>,
        ) -> Result<DetectionResult, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok(reading(camera_id, 1, 40));
            }
            replies.remove(0)
        }

        async fn health(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn reading(camera_id: &str, occupancy: u32, capacity: u32) -> DetectionResult {
        DetectionResult {
            camera_id: camera_id.to_string(),
            occupancy,
            capacity,
            status: ResultStatus::Success,
        }
    }

    fn capture_loop(camera: StillCamera, client: Arc<ScriptedClient>) -> (CaptureLoop, SnapshotHandle) {
        let snapshot = SnapshotHandle::new(StatusSnapshot::initial(40));
        let lifecycle = Lifecycle::new();
        lifecycle.transition(AgentState::Ready);
        let capture = CaptureLoop::new(
            "bus-1",
            Arc::new(camera),
            client,
            snapshot.clone(),
            lifecycle,
            Duration::from_millis(20),
        );
        (capture, snapshot)
    }

    #[tokio::test]
    async fn successful_cycle_publishes_reading() {
        let client = Arc::new(ScriptedClient::new(vec![Ok(reading("bus-1", 39, 40))]));
        let (capture, snapshot) = capture_loop(StillCamera::new(vec![0xFF, 0xD8, 0xFF, 0xD9]), client);

        capture.run_cycle().await.unwrap();

        let current = snapshot.current();
        assert_eq!(current.occupancy, 39);
        assert_eq!(current.status, SystemStatus::NearFull);
        assert!(current.last_update.is_some());
        assert_eq!(capture.lifecycle.current(), AgentState::Ready);
    }

    #[tokio::test]
    async fn failed_upload_leaves_snapshot_unchanged() {
        let client = Arc::new(ScriptedClient::new(vec![
            Ok(reading("bus-1", 20, 40)),
            Err(TransportError::Timeout),
            Err(TransportError::Malformed("not json".to_string())),
        ]));
        let (capture, snapshot) = capture_loop(StillCamera::new(vec![1, 2, 3]), client);

        capture.run_cycle().await.unwrap();
        let before = snapshot.current();

        assert!(matches!(
            capture.run_cycle().await,
            Err(CycleError::Transport(TransportError::Timeout))
        ));
        assert!(capture.run_cycle().await.is_err());

        let after = snapshot.current();
        assert_eq!(after.occupancy, before.occupancy);
        assert_eq!(after.status, before.status);
        assert_eq!(after.last_update, before.last_update);
        assert_eq!(capture.lifecycle.current(), AgentState::Ready);
    }

    #[tokio::test]
    async fn camera_failure_skips_upload() {
        let client = Arc::new(ScriptedClient::new(Vec::new()));
        let camera = StillCamera {
            fail: true,
            ..StillCamera::new(Vec::new())
        };
        let (capture, snapshot) = capture_loop(camera, client.clone());

        assert!(matches!(capture.run_cycle().await, Err(CycleError::Device(_))));
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
        assert_eq!(snapshot.current().status, SystemStatus::Initializing);
    }

    #[tokio::test]
    async fn loop_keeps_going_after_failures_and_stops_on_shutdown() {
        let client = Arc::new(ScriptedClient::new(vec![
            Err(TransportError::Timeout),
            Ok(reading("bus-1", 41, 40)),
        ]));
        let (capture, snapshot) = capture_loop(StillCamera::new(vec![9]), client.clone());
        let (tx, rx) = watch::channel(false);

        let mut updates = snapshot.subscribe();
        let handle = tokio::spawn(capture.run(rx));
        updates.changed().await.unwrap();
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(client.calls.load(Ordering::SeqCst) >= 2);
        assert_eq!(snapshot.current().status, SystemStatus::Full);
    }

    #[test]
    fn archive_names_use_camera_and_timestamp() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        assert_eq!(archive_file_name("bus-1", at), "bus-1_20240309_070501.jpg");
    }

    #[tokio::test]
    async fn stills_are_archived_before_upload() {
        let dir = std::env::temp_dir().join(format!("busload-archive-{}", std::process::id()));
        let client = Arc::new(ScriptedClient::new(Vec::new()));
        let (capture, _snapshot) = capture_loop(StillCamera::new(vec![0xAB; 16]), client);
        let capture = capture.with_archive(Some(dir.clone()));

        capture.run_cycle().await.unwrap();

        let mut entries = std::fs::read_dir(&dir).unwrap();
        let entry = entries.next().unwrap().unwrap();
        assert!(entry.file_name().to_string_lossy().starts_with("bus-1_"));
        assert_eq!(std::fs::read(entry.path()).unwrap(), vec![0xAB; 16]);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
