use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sysinfo::Disks;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::status::SnapshotHandle;

use super::client::DetectionClient;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Periodic reachability and resource check. Writes only `api_reachable`.
pub struct HealthProbe {
    client: Arc<dyn DetectionClient>,
    snapshot: SnapshotHandle,
    interval: Duration,
    storage_path: PathBuf,
}

impl HealthProbe {
    pub fn new(
        client: Arc<dyn DetectionClient>,
        snapshot: SnapshotHandle,
        interval: Duration,
        storage_path: Option<PathBuf>,
    ) -> Self {
        Self {
            client,
            snapshot,
            interval,
            storage_path: storage_path.unwrap_or_else(|| PathBuf::from("/")),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
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
            self.probe_once().await;
        }

        tracing::debug!("health probe stopped");
    }

    pub async fn probe_once(&self) -> bool {
        let reachable = match self.client.health().await {
            Ok(()) => {
                tracing::info!("detection service reachable");
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "detection service unreachable");
                false
            }
        };
        self.snapshot.set_api_reachable(reachable);

        let path = self.storage_path.clone();
        match tokio::task::spawn_blocking(move || free_space(&path)).await {
            Ok(Some(free)) => {
                tracing::info!(free_gb = format!("{:.2}", free as f64 / BYTES_PER_GB), "disk space");
            }
            Ok(None) => tracing::warn!(path = %self.storage_path.display(), "no disk found for path"),
            Err(e) => tracing::warn!(error = %e, "disk check failed"),
        }

        let camera_ready = self.snapshot.current().camera_ready;
        tracing::info!(camera_ready, "camera status");

        reachable
    }
}

/// Free bytes on the filesystem holding `path`, chosen by longest mount prefix.
pub fn free_space(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}
