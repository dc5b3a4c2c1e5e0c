use std::time::Duration;

use chrono::Local;
use serde::Serialize;
use tokio::sync::watch;

use crate::status::{SnapshotHandle, StatusSnapshot};

/// The two lines shown on the character display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayLines {
    pub top: String,
    pub bottom: String,
}

impl DisplayLines {
    pub fn render(snapshot: &StatusSnapshot, columns: usize, stale: bool) -> Self {
        let status: String = snapshot
            .status
            .label()
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        let top = format!("Occ:{}/{} {}", snapshot.occupancy, snapshot.capacity, status);
        // the stale marker always stays visible
        let top = if stale {
            let mut top = truncate(&top, columns.saturating_sub(1));
            top.push('*');
            top
        } else {
            truncate(&top, columns)
        };

        Self {
            top,
            bottom: truncate(&snapshot.location_label, columns),
        }
    }
}

fn truncate(line: &str, columns: usize) -> String {
    line.chars().take(columns).collect()
}

/// A small status display. Write errors are the caller's to log.
pub trait StatusDisplay: Send {
    fn show(&mut self, lines: &DisplayLines) -> std::io::Result<()>;
    fn clear(&mut self) -> std::io::Result<()>;
}

/// Display backed by the log, for hosts without a panel attached.
#[derive(Debug, Default)]
pub struct LogDisplay {
    last: Option<DisplayLines>,
}

impl StatusDisplay for LogDisplay {
    fn show(&mut self, lines: &DisplayLines) -> std::io::Result<()> {
        if self.last.as_ref() != Some(lines) {
            tracing::info!(top = %lines.top, bottom = %lines.bottom, "display");
            self.last = Some(lines.clone());
        }
        Ok(())
    }

    fn clear(&mut self) -> std::io::Result<()> {
        self.last = None;
        tracing::info!("display cleared");
        Ok(())
    }
}

/// Redraw on every snapshot change and on a periodic tick, so stale data gets
/// its marker even when nothing is published. Clears the display on exit.
pub async fn run<D: StatusDisplay>(
    mut display: D,
    snapshot: SnapshotHandle,
    columns: usize,
    stale_after: Duration,
    refresh: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> D {
    let mut updates = snapshot.subscribe();
    let mut ticker = tokio::time::interval(refresh);

    loop {
        let current = updates.borrow_and_update().clone();
        let stale = current.is_stale(Local::now(), stale_after);
        if let Err(e) = display.show(&DisplayLines::render(&current, columns, stale)) {
            tracing::warn!(error = %e, "display update failed");
        }

        tokio::select! {
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }

    if let Err(e) = display.clear() {
        tracing::warn!(error = %e, "display clear failed");
    }
    display
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::SystemStatus;
    use std::sync::{Arc, Mutex};

    fn snapshot(occupancy: u32, capacity: u32, status: SystemStatus, location: &str) -> StatusSnapshot {
        StatusSnapshot {
            occupancy,
            capacity,
            status,
            location_label: location.to_string(),
            ..StatusSnapshot::initial(capacity)
        }
    }

    #[test]
    fn renders_occupancy_and_location() {
        let lines = DisplayLines::render(&snapshot(12, 40, SystemStatus::Ok, "Pune, IN"), 16, false);
        assert_eq!(lines.top, "Occ:12/40 OK");
        assert_eq!(lines.bottom, "Pune, IN");
    }

    #[test]
    fn strips_spaces_and_truncates() {
        let lines = DisplayLines::render(
            &snapshot(33, 40, SystemStatus::NearFull, "Chhatrapati Sambhajinagar, IN"),
            16,
            false,
        );
        assert_eq!(lines.top, "Occ:33/40 NEARFU");
        assert_eq!(lines.bottom, "Chhatrapati Samb");
    }

    #[test]
    fn stale_reading_is_marked() {
        let lines = DisplayLines::render(&snapshot(40, 40, SystemStatus::Full, "IN"), 20, true);
        assert_eq!(lines.top, "Occ:40/40 FULL!*");

        let narrow = DisplayLines::render(&snapshot(33, 40, SystemStatus::NearFull, "IN"), 16, true);
        assert_eq!(narrow.top, "Occ:33/40 NEARF*");
    }

    #[derive(Clone, Default)]
    struct SharedDisplay {
        shown: Arc<Mutex<Vec<DisplayLines>>>,
        cleared: Arc<Mutex<bool>>,
    }

    impl StatusDisplay for SharedDisplay {
        fn show(&mut self, lines: &DisplayLines) -> std::io::Result<()> {
            self.shown.lock().unwrap().push(lines.clone());
            Ok(())
        }

        fn clear(&mut self) -> std::io::Result<()> {
            *self.cleared.lock().unwrap() = true;
            Ok(())
        }
    }

    #[tokio::test]
    async fn display_follows_snapshot_and_clears_on_shutdown() {
        let handle = SnapshotHandle::new(StatusSnapshot::initial(40));
        let display = SharedDisplay::default();
        let (tx, rx) = watch::channel(false);

        let task = tokio::spawn(run(
            display.clone(),
            handle.clone(),
            16,
            Duration::from_secs(10),
            Duration::from_secs(60),
            rx,
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.publish_reading(41, 40, Local::now());
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        let shown = display.shown.lock().unwrap();
        assert_eq!(shown.first().unwrap().top, "Occ:0/40 Initial");
        assert_eq!(shown.last().unwrap().top, "Occ:41/40 FULL!");
        assert!(*display.cleared.lock().unwrap());
    }
}
