//! Periodischer Geräte-Scan
//!
//! Fragt alle Transporte nach den angeschlossenen Geräten und übergibt die
//! Gesamtliste an den [`RemapManager`]. Die Scanner selbst blockieren und
//! laufen deshalb in `spawn_blocking`.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::device::{DeviceDescriptor, DeviceScanner};
use crate::remap::{RemapManager, SchedulerError};

pub struct ScanLoop {
    scanners: Vec<Box<dyn DeviceScanner>>,
    manager: Arc<RemapManager>,
    interval: Duration,
}

impl ScanLoop {
    pub fn new(
        scanners: Vec<Box<dyn DeviceScanner>>,
        manager: Arc<RemapManager>,
        interval: Duration,
    ) -> Self {
        Self {
            scanners,
            manager,
            interval,
        }
    }

    /// Einmal alle Transporte abfragen und das Ergebnis anwenden
    pub async fn scan_once(&mut self) -> Result<usize, SchedulerError> {
        let mut scanners = std::mem::take(&mut self.scanners);
        let (scanners, found) = tokio::task::spawn_blocking(move || {
            let mut found: Vec<DeviceDescriptor> = Vec::new();
            for scanner in scanners.iter_mut() {
                let devices = scanner.scan();
                debug!("Scanner '{}' reports {} device(s)", scanner.name(), devices.len());
                found.extend(devices);
            }
            (scanners, found)
        })
        .await
        .map_err(|e| SchedulerError::Join(format!("Scanner ist abgestürzt: {e}")))?;
        self.scanners = scanners;

        let count = found.len();
        self.manager.set_devices(found).await;
        Ok(count)
    }

    /// Läuft bis `cancel` ausgelöst wird
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), SchedulerError> {
        info!(
            "Starting scan loop with {} transport(s), every {:?}",
            self.scanners.len(),
            self.interval
        );
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Scan loop cancelled");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.scan_once().await {
                        error!("Scan failed: {}", e);
                        return Err(e);
                    }
                }
            }
        }
        Ok(())
    }
}
