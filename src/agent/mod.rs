pub mod capture;
pub mod client;
pub mod display;
pub mod location;
pub mod monitor;
pub mod overlay;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::api::live::{self, LiveState};
use crate::camera::{open_with_retry, CameraDevice, CameraOpener, DeviceError, FfmpegOpener};
use crate::config::AgentConfig;
use crate::error::TransportError;
use crate::status::{SnapshotHandle, StatusSnapshot};

pub use capture::{CaptureLoop, CycleError};
pub use client::{DetectionClient, HttpDetectionClient};
pub use display::{DisplayLines, LogDisplay, StatusDisplay};
pub use location::{IpLocationProvider, LocationProvider};
pub use monitor::HealthProbe;

const DISPLAY_REFRESH: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Uninitialized,
    Initializing,
    Ready,
    Capturing,
    ShuttingDown,
}

/// The agent's current lifecycle state, shared with the capture loop.
#[derive(Clone)]
pub struct Lifecycle {
    state: Arc<Mutex<AgentState>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(AgentState::Uninitialized)),
        }
    }

    pub fn current(&self) -> AgentState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(AgentState::ShuttingDown)
    }

    pub fn transition(&self, next: AgentState) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if *state == next {
            return;
        }
        match next {
            AgentState::Capturing | AgentState::Ready if *state != AgentState::Initializing => {
                tracing::debug!(from = ?*state, to = ?next, "agent state")
            }
            _ => tracing::info!(from = ?*state, to = ?next, "agent state"),
        }
        *state = next;
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the capture agent until ctrl-c. Camera init failure is fatal.
pub async fn run(config: AgentConfig) -> Result<(), AgentError> {
    let client: Arc<dyn DetectionClient> = Arc::new(HttpDetectionClient::new(
        config.detect_url.clone(),
        config.upload_timeout(),
        config.health_timeout(),
    )?);
    let locator: Arc<dyn LocationProvider> = Arc::new(IpLocationProvider::new(
        config.location_url.clone(),
        config.health_timeout(),
    )?);
    let opener = Arc::new(FfmpegOpener::new(&config));

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.stream_port));
    let listener = TcpListener::bind(addr).await?;

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
        }
        tracing::info!("shutdown signal received");
    };

    run_with(
        &config,
        listener,
        opener,
        client,
        locator,
        LogDisplay::default(),
        ctrl_c,
    )
    .await
}

/// Run the agent on the given parts until `stop` resolves or the capture
/// loop ends. Every task is joined and the camera released before returning.
pub async fn run_with<O, D, S>(
    config: &AgentConfig,
    listener: TcpListener,
    opener: Arc<O>,
    client: Arc<dyn DetectionClient>,
    locator: Arc<dyn LocationProvider>,
    display: D,
    stop: S,
) -> Result<(), AgentError>
where
    O: CameraOpener,
    D: StatusDisplay + 'static,
    S: Future<Output = ()>,
{
    let lifecycle = Lifecycle::new();
    let snapshot = SnapshotHandle::new(StatusSnapshot::initial(config.capacity));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let display = tokio::spawn(display::run(
        display,
        snapshot.clone(),
        config.display_columns,
        config.stale_after(),
        DISPLAY_REFRESH,
        shutdown_rx.clone(),
    ));

    lifecycle.transition(AgentState::Initializing);
    let camera = match open_with_retry(opener, config.init_attempts, config.init_backoff()).await {
        Ok(camera) => Arc::new(camera),
        Err(e) => {
            tracing::error!(device = %config.device, error = %e, "camera initialization failed");
            lifecycle.transition(AgentState::ShuttingDown);
            let _ = shutdown_tx.send(true);
            if let Err(e) = display.await {
                tracing::error!(error = %e, "display task failed");
            }
            return Err(e.into());
        }
    };
    snapshot.set_camera_ready(true);
    lifecycle.transition(AgentState::Ready);

    let device: Arc<dyn CameraDevice> = camera.clone();
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    tasks.push((
        "health probe",
        tokio::spawn(
            HealthProbe::new(
                Arc::clone(&client),
                snapshot.clone(),
                config.health_interval(),
                config.archive_dir.clone(),
            )
            .run(shutdown_rx.clone()),
        ),
    ));

    tasks.push((
        "location refresh",
        tokio::spawn(location::run(
            locator,
            snapshot.clone(),
            config.location_interval(),
            shutdown_rx.clone(),
        )),
    ));

    let live_state = LiveState {
        snapshot: snapshot.clone(),
        camera: Arc::clone(&device),
        camera_id: config.camera_id.clone(),
        frame_interval: Duration::from_secs(1) / config.stream_fps,
        stale_after: config.stale_after(),
        display_columns: config.display_columns,
        shutdown: shutdown_rx.clone(),
    };
    let server_shutdown = shutdown_rx.clone();
    match listener.local_addr() {
        Ok(addr) => tracing::info!("serving live view on http://{}", addr),
        Err(e) => tracing::warn!(error = %e, "live view address unknown"),
    }
    tasks.push((
        "live server",
        tokio::spawn(async move {
            let result = axum::serve(listener, live::router(live_state))
                .with_graceful_shutdown(wait_for_shutdown(server_shutdown))
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "live server failed");
            }
        }),
    ));

    let capture = CaptureLoop::new(
        config.camera_id.clone(),
        device,
        client,
        snapshot.clone(),
        lifecycle.clone(),
        config.capture_interval(),
    )
    .with_archive(config.archive_dir.clone());
    let mut capture_handle = tokio::spawn(capture.run(shutdown_rx.clone()));

    tokio::select! {
        _ = stop => {}
        result = &mut capture_handle => {
            if let Err(e) = result {
                tracing::error!(error = %e, "capture task failed");
            }
        }
    }

    lifecycle.transition(AgentState::ShuttingDown);
    let _ = shutdown_tx.send(true);

    if !capture_handle.is_finished() {
        if let Err(e) = capture_handle.await {
            tracing::error!(error = %e, "capture task failed");
        }
    }
    for (name, handle) in tasks {
        if let Err(e) = handle.await {
            tracing::error!(task = name, error = %e, "task failed");
        }
    }
    if let Err(e) = display.await {
        tracing::error!(error = %e, "display task failed");
    }

    snapshot.set_camera_ready(false);
    // Releasing the camera kills and reaps ffmpeg.
    if let Err(e) = tokio::task::spawn_blocking(move || drop(camera)).await {
        tracing::warn!(error = %e, "camera release failed");
    }
    tracing::info!("shutdown complete");

    Ok(())
}

pub(crate) async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
