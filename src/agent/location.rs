use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use serde::Deserialize;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::TransportError;
use crate::status::SnapshotHandle;

pub const UNKNOWN_LOCATION: &str = "Location unknown";

#[async_trait]
pub trait LocationProvider: Send + Sync {
    /// Resolve a short human-readable label for the current position.
    async fn locate(&self) -> Result<String, TransportError>;
}

/// Reply of an ipinfo-style geolocation endpoint. Other fields are ignored.
#[derive(Debug, Deserialize)]
struct IpLocation {
    city: Option<String>,
    country: Option<String>,
}

impl IpLocation {
    fn label(self) -> String {
        let parts: Vec<String> = [self.city, self.country]
            .into_iter()
            .flatten()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() {
            UNKNOWN_LOCATION.to_string()
        } else {
            parts.join(", ")
        }
    }
}

pub struct IpLocationProvider {
    client: reqwest::Client,
    url: String,
}

impl IpLocationProvider {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl LocationProvider for IpLocationProvider {
    async fn locate(&self) -> Result<String, TransportError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let location: IpLocation = serde_json::from_slice(&body)
            .map_err(|e| TransportError::Malformed(format!("location reply: {e}")))?;
        Ok(location.label())
    }
}

/// One best-effort lookup. Failure keeps the previous label and marks it
/// unavailable; nothing is retried before the next period.
pub async fn refresh_once(provider: &dyn LocationProvider, snapshot: &SnapshotHandle) {
    match provider.locate().await {
        Ok(label) => {
            tracing::info!(location = %label, "location updated");
            snapshot.set_location(label, Local::now());
        }
        Err(e) => {
            tracing::warn!(error = %e, "location lookup failed");
            snapshot.mark_location_unavailable();
        }
    }
}

pub async fn run(
    provider: Arc<dyn LocationProvider>,
    snapshot: SnapshotHandle,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        refresh_once(provider.as_ref(), &snapshot).await;
    }

    tracing::debug!("location refresh stopped");
}
