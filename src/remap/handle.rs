//! Handle auf einen Worker im Blocking-Thread

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::device::{Device, DeviceInfo};
use crate::remap::events::EventEmitter;
use crate::remap::worker::{self, RemapWorker, WorkerChannels, WorkerCommand, WorkerSettings};
use crate::remap::{BackendRegistry, Profile, SchedulerError, WorkerPhase};
use crate::report::NormalizedInputReport;

const COMMAND_BUFFER: usize = 16;

/// Besitzt den Worker-Thread eines Geräts
///
/// [`WorkerHandle::stop`] bricht ab und wartet auf das Ende des Threads. Erst
/// danach wird das [`Device`] freigegeben. Ein gedroppter Handle bricht den
/// Worker nur ab.
#[derive(Debug)]
pub struct WorkerHandle {
    info: DeviceInfo,
    cancel: CancellationToken,
    commands: mpsc::Sender<WorkerCommand>,
    reports: watch::Receiver<NormalizedInputReport>,
    phase: watch::Receiver<WorkerPhase>,
    profile: Option<Profile>,
    task: Option<JoinHandle<Device>>,
}

impl WorkerHandle {
    /// Startet den Worker. Muss innerhalb einer Tokio-Runtime aufgerufen werden.
    pub fn spawn(
        device: Device,
        backends: Arc<BackendRegistry>,
        settings: WorkerSettings,
        events: EventEmitter,
    ) -> Self {
        let info = device.info().clone();
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (report_tx, report_rx) =
            watch::channel(NormalizedInputReport::new(info.layout));
        let (phase_tx, phase_rx) = watch::channel(WorkerPhase::Connecting);
        let cancel = CancellationToken::new();

        let worker = RemapWorker::create(
            device,
            backends,
            settings,
            WorkerChannels {
                commands: command_rx,
                reports: report_tx,
                phase: phase_tx,
                cancel: cancel.clone(),
            },
            events,
        );

        let name = info.id.clone();
        let task = tokio::task::spawn_blocking(move || {
            debug!("Worker thread started: {}", name);
            worker::run(worker)
        });
        info!("Spawned worker for {}", info);

        Self {
            info,
            cancel,
            commands: command_tx,
            reports: report_rx,
            phase: phase_rx,
            profile: None,
            task: Some(task),
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase.borrow()
    }

    /// Zuletzt gesetztes Profil, wird bei einem Neustart wieder geladen
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    /// Der Worker hat seine Schleife verlassen oder der Thread ist beendet
    pub fn is_finished(&self) -> bool {
        self.phase() == WorkerPhase::Idle
            || self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn subscribe(&self) -> watch::Receiver<NormalizedInputReport> {
        self.reports.clone()
    }

    /// Stellt einen Befehl zu, ohne zu warten. Ist die Warteschlange voll,
    /// hängt der Worker und der Befehl wird verworfen.
    pub fn send_command(&mut self, command: WorkerCommand) -> Result<(), SchedulerError> {
        let profile = match &command {
            WorkerCommand::LoadProfile(profile) => Some(Some(profile.clone())),
            WorkerCommand::ClearProfile => Some(None),
            WorkerCommand::ReloadProfile => None,
        };
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Command queue of {} is full", self.info.id);
                SchedulerError::Busy(self.info.id.clone())
            }
            mpsc::error::TrySendError::Closed(_) => SchedulerError::ChannelClosed,
        })?;
        if let Some(profile) = profile {
            self.profile = profile;
        }
        Ok(())
    }

    /// Bricht den Worker ab und wartet, bis der Thread beendet ist
    pub async fn stop(&mut self) -> Result<(), SchedulerError> {
        debug!("Sending cancellation to worker: {}", self.info.id);
        self.cancel.cancel();

        match self.task.take() {
            Some(task) => match task.await {
                Ok(device) => {
                    debug!("Worker joined: {}", self.info.id);
                    drop(device);
                    Ok(())
                }
                Err(e) => {
                    error!("Worker panicked: {} - {}", self.info.id, e);
                    Err(SchedulerError::Join(format!(
                        "Worker {} ist abgestürzt: {}",
                        self.info.id, e
                    )))
                }
            },
            None => {
                debug!("Worker already stopped: {}", self.info.id);
                Ok(())
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if self.task.is_some() {
            warn!("Worker handle for {} dropped without stop", self.info.id);
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::ScriptedDevice;
    use std::time::Duration;

    fn settings() -> WorkerSettings {
        WorkerSettings {
            tick: Duration::from_millis(1),
            ..WorkerSettings::default()
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stop_joins_worker() {
        let device = ScriptedDevice::new("pad");
        let written = device.written.clone();
        let mut handle = WorkerHandle::spawn(
            Device::new(Box::new(device)),
            Arc::new(BackendRegistry::new()),
            settings(),
            EventEmitter::disabled("pad"),
        );

        let mut phase = handle.phase.clone();
        phase
            .wait_for(|p| *p == WorkerPhase::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        handle.stop().await.unwrap();
        assert!(handle.is_finished());
        assert_eq!(handle.phase(), WorkerPhase::Idle);
        assert!(!written.lock().unwrap().is_empty());

        // Zweites Stop ist ein No-op
        handle.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn commands_track_profile() {
        let mut handle = WorkerHandle::spawn(
            Device::new(Box::new(ScriptedDevice::new("pad"))),
            Arc::new(BackendRegistry::new()),
            settings(),
            EventEmitter::disabled("pad"),
        );

        handle
            .send_command(WorkerCommand::LoadProfile(Profile::new("a.toml")))
            .unwrap();
        assert_eq!(handle.profile(), Some(&Profile::new("a.toml")));
        handle.send_command(WorkerCommand::ClearProfile).unwrap();
        assert_eq!(handle.profile(), None);

        handle.stop().await.unwrap();
        assert!(matches!(
            handle.send_command(WorkerCommand::ReloadProfile),
            Err(SchedulerError::ChannelClosed)
        ));
    }
}
