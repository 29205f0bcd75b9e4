//! Manager für alle Worker, indexiert nach Geräte-ID

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::RemapperConfig;
use crate::device::{DeviceDescriptor, DeviceInfo};
use crate::remap::events::{EventEmitter, RemapEvent, RemapEventKind};
use crate::remap::handle::WorkerHandle;
use crate::remap::worker::{WorkerCommand, WorkerSettings};
use crate::remap::{BackendRegistry, Profile, SchedulerError, WorkerPhase};
use crate::report::NormalizedInputReport;

/// Momentaufnahme eines verwalteten Geräts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub info: DeviceInfo,
    pub phase: WorkerPhase,
    pub profile: Option<String>,
}

/// Startet, stoppt und steuert die Worker
///
/// Die Worker-Tabelle ist die einzige Struktur, die sich Scanner und Scheduler
/// teilen. Das Lock wird nur zum Einfügen und Entnehmen gehalten. Gestoppt und
/// gejoint wird immer außerhalb. Abgleich und Shutdown laufen nacheinander,
/// damit pro Geräte-ID höchstens ein Worker existiert.
pub struct RemapManager {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    lifecycle: Mutex<()>,
    /// Profile, die beim Anschließen automatisch geladen werden
    bindings: Mutex<HashMap<String, Profile>>,
    backends: Arc<BackendRegistry>,
    settings: WorkerSettings,
    events: mpsc::Sender<RemapEvent>,
    closed: CancellationToken,
}

impl RemapManager {
    pub fn new(
        config: &RemapperConfig,
        backends: BackendRegistry,
        events: mpsc::Sender<RemapEvent>,
    ) -> Self {
        info!("Creating new RemapManager");
        let bindings = config
            .bindings
            .iter()
            .filter_map(|binding| {
                config
                    .binding_for(&binding.device)
                    .map(|path| (binding.device.clone(), Profile::new(path)))
            })
            .collect();

        Self {
            workers: Mutex::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            bindings: Mutex::new(bindings),
            backends: Arc::new(backends),
            settings: WorkerSettings::from_config(config),
            events,
            closed: CancellationToken::new(),
        }
    }

    fn emitter(&self, device_id: &str) -> EventEmitter {
        EventEmitter::new(device_id, self.events.clone())
    }

    /// Gleicht die Worker mit der aktuellen Geräteliste ab
    ///
    /// Verschwundene Geräte werden gestoppt, neue gestartet. Worker, deren
    /// Verbindung fehlgeschlagen ist, werden neu gestartet, solange das Gerät
    /// noch gemeldet wird.
    pub async fn set_devices(&self, descriptors: Vec<DeviceDescriptor>) {
        let _lifecycle = self.lifecycle.lock().await;
        if self.closed.is_cancelled() {
            debug!("Manager closed, ignoring device list");
            return;
        }
        let present: HashSet<&str> = descriptors.iter().map(DeviceDescriptor::id).collect();

        let (removed, finished) = {
            let mut workers = self.workers.lock().await;
            let removed_ids: Vec<String> = workers
                .keys()
                .filter(|id| !present.contains(id.as_str()))
                .cloned()
                .collect();
            let finished_ids: Vec<String> = workers
                .iter()
                .filter(|(id, handle)| present.contains(id.as_str()) && handle.is_finished())
                .map(|(id, _)| id.clone())
                .collect();

            let removed: Vec<WorkerHandle> = removed_ids
                .iter()
                .filter_map(|id| workers.remove(id))
                .collect();
            let finished: Vec<WorkerHandle> = finished_ids
                .iter()
                .filter_map(|id| workers.remove(id))
                .collect();
            (removed, finished)
        };

        for mut handle in removed {
            info!("Device removed: {}", handle.info());
            if let Err(e) = handle.stop().await {
                warn!("Error stopping worker {}: {}", handle.id(), e);
            }
            self.emitter(handle.id()).emit(RemapEventKind::Detached);
        }

        let mut restart_profiles: HashMap<String, Option<Profile>> = HashMap::new();
        for mut handle in finished {
            debug!("Worker for {} finished, restarting", handle.id());
            let profile = handle.profile().cloned();
            if let Err(e) = handle.stop().await {
                warn!("Error joining worker {}: {}", handle.id(), e);
            }
            restart_profiles.insert(handle.id().to_string(), profile);
        }

        for descriptor in descriptors {
            let id = descriptor.id().to_string();
            if self.workers.lock().await.contains_key(&id) {
                continue;
            }

            let profile = match restart_profiles.remove(&id) {
                Some(profile) => profile,
                None => {
                    info!("Device attached: {}", descriptor.info);
                    self.emitter(&id).emit(RemapEventKind::Attached {
                        name: descriptor.info.name.clone(),
                    });
                    self.bindings.lock().await.get(&id).cloned()
                }
            };

            self.start_worker(descriptor, profile).await;
        }
    }

    async fn start_worker(&self, descriptor: DeviceDescriptor, profile: Option<Profile>) {
        let id = descriptor.id().to_string();
        let device = match descriptor.open() {
            Ok(device) => device,
            Err(e) => {
                warn!("Opening {} failed: {}", id, e);
                self.emitter(&id)
                    .emit(RemapEventKind::ConnectionFailed(e.to_string()));
                return;
            }
        };

        let mut handle = WorkerHandle::spawn(
            device,
            self.backends.clone(),
            self.settings.clone(),
            self.emitter(&id),
        );
        if let Some(profile) = profile {
            if let Err(e) = handle.send_command(WorkerCommand::LoadProfile(profile)) {
                warn!("Could not hand profile to {}: {}", id, e);
            }
        }
        self.workers.lock().await.insert(id, handle);
    }

    async fn command(&self, device_id: &str, command: WorkerCommand) -> Result<(), SchedulerError> {
        let mut workers = self.workers.lock().await;
        let handle = workers
            .get_mut(device_id)
            .ok_or_else(|| SchedulerError::UnknownDevice(device_id.to_string()))?;
        handle.send_command(command)
    }

    /// Setzt das Profil eines laufenden Geräts, `None` entfernt das Backend
    pub async fn set_profile(
        &self,
        device_id: &str,
        profile: Option<Profile>,
    ) -> Result<(), SchedulerError> {
        let command = match profile {
            Some(profile) => WorkerCommand::LoadProfile(profile),
            None => WorkerCommand::ClearProfile,
        };
        self.command(device_id, command).await
    }

    pub async fn reload_profile(&self, device_id: &str) -> Result<(), SchedulerError> {
        self.command(device_id, WorkerCommand::ReloadProfile).await
    }

    pub async fn reload_all_profiles(&self) {
        let mut workers = self.workers.lock().await;
        for (id, handle) in workers.iter_mut() {
            if let Err(e) = handle.send_command(WorkerCommand::ReloadProfile) {
                warn!("Reload on {} failed: {}", id, e);
            }
        }
    }

    /// Merkt ein Profil für ein Gerät vor. Wirkt beim nächsten Anschließen.
    pub async fn bind_profile(&self, device_id: &str, profile: Option<Profile>) {
        let mut bindings = self.bindings.lock().await;
        match profile {
            Some(profile) => {
                debug!("Binding {} to {}", device_id, profile);
                bindings.insert(device_id.to_string(), profile);
            }
            None => {
                bindings.remove(device_id);
            }
        }
    }

    pub async fn devices(&self) -> Vec<DeviceStatus> {
        let workers = self.workers.lock().await;
        let mut devices: Vec<DeviceStatus> = workers
            .values()
            .map(|handle| DeviceStatus {
                info: handle.info().clone(),
                phase: handle.phase(),
                profile: handle.profile().map(Profile::to_string),
            })
            .collect();
        devices.sort_by(|a, b| a.info.id.cmp(&b.info.id));
        devices
    }

    pub async fn subscribe(
        &self,
        device_id: &str,
    ) -> Result<watch::Receiver<NormalizedInputReport>, SchedulerError> {
        self.workers
            .lock()
            .await
            .get(device_id)
            .map(WorkerHandle::subscribe)
            .ok_or_else(|| SchedulerError::UnknownDevice(device_id.to_string()))
    }

    /// Stoppt alle Worker und wartet auf jeden einzelnen
    pub async fn shutdown(&self) {
        info!("Shutting down RemapManager");
        self.closed.cancel();
        let _lifecycle = self.lifecycle.lock().await;

        let handles: Vec<WorkerHandle> = {
            let mut workers = self.workers.lock().await;
            workers.drain().map(|(_, handle)| handle).collect()
        };

        for mut handle in handles {
            if let Err(e) = handle.stop().await {
                error!("Worker {} did not stop cleanly: {}", handle.id(), e);
            }
        }
        info!("All workers stopped");
    }
}
