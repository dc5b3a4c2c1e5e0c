use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Local;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::agent::display::DisplayLines;
use crate::agent::overlay;
use crate::camera::CameraDevice;
use crate::status::{SnapshotHandle, StatusSnapshot};

/// State shared by the agent's local endpoints.
#[derive(Clone)]
pub struct LiveState {
    pub snapshot: SnapshotHandle,
    pub camera: Arc<dyn CameraDevice>,
    pub camera_id: String,
    pub frame_interval: Duration,
    pub stale_after: Duration,
    pub display_columns: usize,
    pub shutdown: watch::Receiver<bool>,
}

#[derive(Serialize)]
struct StatusResponse {
    camera_id: String,
    stale: bool,
    snapshot: StatusSnapshot,
    display: DisplayLines,
    overlay: Vec<String>,
}

pub fn router(state: LiveState) -> Router {
    Router::new()
        .route("/api/status", get(status_handler))
        .route("/video_feed", get(video_feed_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn status_handler(State(state): State<LiveState>) -> Response {
    let snapshot = state.snapshot.current();
    let stale = snapshot.is_stale(Local::now(), state.stale_after);

    axum::Json(StatusResponse {
        display: DisplayLines::render(&snapshot, state.display_columns, stale),
        overlay: overlay::overlay_lines(&snapshot, &state.camera_id, stale),
        camera_id: state.camera_id,
        stale,
        snapshot,
    })
    .into_response()
}

/// Endless `multipart/x-mixed-replace` stream of annotated frames. Ends when
/// the agent shuts down so graceful shutdown does not wait on viewers.
async fn video_feed_handler(State(state): State<LiveState>) -> Response {
    let stream = futures::stream::unfold(state, |mut state| async move {
        loop {
            if *state.shutdown.borrow() {
                return None;
            }
            tokio::select! {
                _ = tokio::time::sleep(state.frame_interval) => {}
                _ = state.shutdown.changed() => return None,
            }

            if let Some(part) = next_part(&state).await {
                return Some((Ok::<_, Infallible>(part), state));
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")],
        Body::from_stream(stream),
    )
        .into_response()
}

async fn next_part(state: &LiveState) -> Option<Bytes> {
    let frame = state.camera.latest_frame()?;
    let snapshot = state.snapshot.current();
    let stale = snapshot.is_stale(Local::now(), state.stale_after);

    let camera_id = state.camera_id.clone();
    let annotated = tokio::task::spawn_blocking(move || {
        overlay::annotate(&frame, &snapshot, &camera_id, stale)
    })
    .await;
    match annotated {
        Ok(Ok(jpeg)) => Some(multipart_frame(&jpeg)),
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "frame annotation failed");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, "frame task failed");
            None
        }
    }
}

pub fn multipart_frame(jpeg: &[u8]) -> Bytes {
    let mut part = Vec::with_capacity(jpeg.len() + 64);
    part.extend_from_slice(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n");
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n");
    Bytes::from(part)
}
