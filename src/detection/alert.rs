use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Payload shared by the reporting and warning endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OccupancyReport {
    pub camera_id: String,
    pub occupancy: u32,
    pub capacity: u32,
}

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn report(&self, report: &OccupancyReport) -> Result<(), TransportError>;
    async fn warn(&self, report: &OccupancyReport) -> Result<(), TransportError>;
}

pub struct HttpAlertSink {
    client: reqwest::Client,
    report_url: String,
    warning_url: String,
}

impl HttpAlertSink {
    pub fn new(
        report_url: impl Into<String>,
        warning_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            report_url: report_url.into(),
            warning_url: warning_url.into(),
        })
    }

    async fn post(&self, url: &str, report: &OccupancyReport) -> Result<(), TransportError> {
        self.client
            .post(url)
            .json(report)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl AlertSink for HttpAlertSink {
    async fn report(&self, report: &OccupancyReport) -> Result<(), TransportError> {
        self.post(&self.report_url, report).await
    }

    async fn warn(&self, report: &OccupancyReport) -> Result<(), TransportError> {
        self.post(&self.warning_url, report).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub reported: bool,
    /// `None` when occupancy was within capacity and no warning was due.
    pub warned: Option<bool>,
}

/// Best-effort delivery of detection results. Neither delivery can fail the
/// caller, and a failed report never prevents the warning.
#[derive(Clone)]
pub struct AlertDispatcher {
    sink: Arc<dyn AlertSink>,
}

impl AlertDispatcher {
    pub fn new(sink: Arc<dyn AlertSink>) -> Self {
        Self { sink }
    }

    pub async fn dispatch(&self, camera_id: &str, occupancy: u32, capacity: u32) -> DispatchOutcome {
        let report = OccupancyReport {
            camera_id: camera_id.to_string(),
            occupancy,
            capacity,
        };

        let reported = match self.sink.report(&report).await {
            Ok(()) => {
                tracing::info!(camera = %camera_id, "occupancy reported");
                true
            }
            Err(e) => {
                tracing::error!(camera = %camera_id, error = %e, "failed to report occupancy");
                false
            }
        };

        let warned = if occupancy > capacity {
            match self.sink.warn(&report).await {
                Ok(()) => {
                    tracing::warn!(
                        camera = %camera_id,
                        occupancy,
                        capacity,
                        "over-capacity warning sent"
                    );
                    Some(true)
                }
                Err(e) => {
                    tracing::error!(camera = %camera_id, error = %e, "failed to send warning");
                    Some(false)
                }
            }
        } else {
            None
        };

        DispatchOutcome { reported, warned }
    }
}
