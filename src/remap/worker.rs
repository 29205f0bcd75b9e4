//! Worker pro Gerät als statum-Zustandsmaschine
//!
//! ```text
//! Idle ──► Connecting ──► Running ──► Stopping ──► Idle
//!              │                          ▲
//!              └──────────────────────────┘
//!                 (Verbindung fehlgeschlagen)
//! ```
//!
//! Der Worker läuft in einem eigenen Blocking-Thread und besitzt das [`Device`]
//! exklusiv. Erst nach dem Join bekommt der Aufrufer es zurück.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use statum::{machine, state};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemapperConfig;
use crate::device::Device;
use crate::motion::{MotionProcessor, MotionSettings};
use crate::remap::events::{ConsoleSink, EventEmitter, RemapEventKind};
use crate::remap::{BackendRegistry, Profile, RemapBackend, RemapError};
use crate::report::{NormalizedInputReport, NormalizedOutputReport};

/// Beobachtbarer Zustand eines Workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum WorkerPhase {
    Idle,
    Connecting,
    Running,
    Stopping,
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerPhase::Idle => "idle",
            WorkerPhase::Connecting => "connecting",
            WorkerPhase::Running => "running",
            WorkerPhase::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Befehle an einen laufenden Worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerCommand {
    LoadProfile(Profile),
    ClearProfile,
    ReloadProfile,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    pub tick: Duration,
    pub motion: MotionSettings,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(20),
            motion: MotionSettings::default(),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &RemapperConfig) -> Self {
        Self {
            tick: config.scheduler.tick_interval(),
            motion: config.motion,
        }
    }
}

/// Kanäle, über die ein Worker mit seinem Handle spricht
pub struct WorkerChannels {
    pub commands: mpsc::Receiver<WorkerCommand>,
    pub reports: watch::Sender<NormalizedInputReport>,
    pub phase: watch::Sender<WorkerPhase>,
    pub cancel: CancellationToken,
}

#[state]
#[derive(Debug, Clone)]
pub enum WorkerState {
    Idle,
    Connecting,
    Running,
    Stopping,
}

#[machine]
pub struct RemapWorker<S: WorkerState> {
    device: Device,
    backends: Arc<BackendRegistry>,
    settings: WorkerSettings,
    channels: WorkerChannels,
    events: EventEmitter,
    motion: Option<MotionProcessor>,
    backend: Option<Box<dyn RemapBackend>>,
    profile: Option<Profile>,
    last_error: Option<String>,
}

impl<S: WorkerState> RemapWorker<S> {
    pub fn device_id(&self) -> &str {
        self.device.id()
    }

    fn publish_phase(&self, phase: WorkerPhase) {
        debug!("Worker {} is {}", self.device.id(), phase);
        self.channels.phase.send_replace(phase);
    }

    /// Meldet einen Backend-Fehler, aber nur wenn sich die Meldung geändert hat
    fn report_error(&mut self, error: &RemapError) {
        let message = error.to_string();
        if self.last_error.as_deref() == Some(message.as_str()) {
            return;
        }
        warn!("Backend error on {}: {}", self.device.id(), message);
        self.events
            .emit(RemapEventKind::BackendError(message.clone()));
        self.last_error = Some(message);
    }

    fn drop_backend(&mut self) {
        if let Some(mut backend) = self.backend.take() {
            debug!("Shutting down backend {}", backend.name());
            backend.shutdown();
        }
    }

    /// Tauscht das aktive Backend aus. Schlägt das Laden fehl, läuft der Worker ohne Backend weiter.
    fn load_profile(&mut self, profile: Profile) {
        self.drop_backend();
        let console = ConsoleSink::new(self.events.clone());
        match self.backends.load(&profile, console) {
            Ok(backend) => {
                info!(
                    "Loaded profile {} on {} ({})",
                    profile,
                    self.device.id(),
                    backend.name()
                );
                self.backend = Some(backend);
                self.events
                    .emit(RemapEventKind::BackendLoaded(profile.to_string()));
            }
            Err(e) => self.report_error(&e),
        }
        self.profile = Some(profile);
    }

    fn handle_command(&mut self, command: WorkerCommand) {
        match command {
            WorkerCommand::LoadProfile(profile) => self.load_profile(profile),
            WorkerCommand::ClearProfile => {
                self.drop_backend();
                self.profile = None;
                info!("Cleared profile on {}", self.device.id());
                self.events.emit(RemapEventKind::BackendCleared);
            }
            WorkerCommand::ReloadProfile => match self.profile.clone() {
                Some(profile) => self.load_profile(profile),
                None => debug!("Nothing to reload on {}", self.device.id()),
            },
        }
    }

    /// Arbeitet alle anstehenden Befehle ab. `false`, wenn der Handle weg ist.
    fn drain_commands(&mut self) -> bool {
        loop {
            match self.channels.commands.try_recv() {
                Ok(command) => self.handle_command(command),
                Err(mpsc::error::TryRecvError::Empty) => return true,
                Err(mpsc::error::TryRecvError::Disconnected) => return false,
            }
        }
    }
}

impl RemapWorker<Idle> {
    pub fn create(
        device: Device,
        backends: Arc<BackendRegistry>,
        settings: WorkerSettings,
        channels: WorkerChannels,
        events: EventEmitter,
    ) -> Self {
        debug!("Creating worker for {}", device.info());
        Self::new(
            device, backends, settings, channels, events, None, // motion
            None,                                               // backend
            None,                                               // profile
            None,                                               // last_error
        )
    }

    pub fn start(self) -> RemapWorker<Connecting> {
        self.publish_phase(WorkerPhase::Connecting);
        self.transition()
    }

    /// Gibt das Gerät nach dem Ende des Workers heraus
    pub fn into_device(self) -> Device {
        self.device
    }
}

impl RemapWorker<Connecting> {
    /// Verbindet das Gerät. Bei Fehlschlag geht es direkt nach `Stopping`,
    /// der Scanner startet den Worker beim nächsten Durchlauf neu.
    pub fn connect(mut self) -> Result<RemapWorker<Running>, RemapWorker<Stopping>> {
        info!("Connecting {}", self.device.info());
        if let Err(e) = self.device.connect() {
            warn!("Connecting {} failed: {}", self.device.id(), e);
            self.events
                .emit(RemapEventKind::ConnectionFailed(e.to_string()));
            self.publish_phase(WorkerPhase::Stopping);
            return Err(self.transition());
        }
        if !self.device.is_connected() {
            self.events.emit(RemapEventKind::ConnectionFailed(
                "Gerät meldet keine Verbindung".to_string(),
            ));
            self.publish_phase(WorkerPhase::Stopping);
            return Err(self.transition());
        }

        if self.device.info().capabilities.six_axis {
            self.motion = Some(MotionProcessor::new(self.settings.motion));
        }
        self.events.emit(RemapEventKind::Connected);
        self.publish_phase(WorkerPhase::Running);
        Ok(self.transition())
    }
}

impl RemapWorker<Running> {
    /// Ein Durchlauf: lesen, fusionieren, remappen, schreiben
    fn tick(&mut self, dt: f32) {
        self.device.read_input();

        if let Some(motion) = self.motion.as_mut() {
            if self.device.is_fresh() && self.device.motion_calibrated() {
                motion.update(self.device.report_mut());
            }
        }

        let output = match self.backend.as_mut() {
            Some(backend) => match backend.remap(self.device.last_report(), dt) {
                Ok(output) => output,
                Err(e) => {
                    self.report_error(&e);
                    self.drop_backend();
                    NormalizedOutputReport::default()
                }
            },
            None => NormalizedOutputReport::default(),
        };

        self.device.write_output(&output);
        self.channels
            .reports
            .send_replace(self.device.last_report().clone());
    }

    /// Hauptschleife bis Abbruch, Handle-Verlust oder Verbindungsverlust
    pub fn run_until_cancelled(mut self) -> RemapWorker<Stopping> {
        info!("Worker running for {}", self.device.info());
        let tick = self.settings.tick;
        let mut last_tick: Option<Instant> = None;

        loop {
            if self.channels.cancel.is_cancelled() {
                info!("Cancellation received for {}", self.device.id());
                break;
            }
            if !self.drain_commands() {
                info!("Handle dropped, stopping {}", self.device.id());
                break;
            }
            if !self.device.is_connected() {
                warn!("{} lost its connection", self.device.id());
                self.events
                    .emit(RemapEventKind::Warning("Verbindung verloren".to_string()));
                break;
            }

            let now = Instant::now();
            let dt = last_tick
                .map(|last| now.duration_since(last).as_secs_f32())
                .unwrap_or(0.0);
            last_tick = Some(now);

            self.tick(dt);
            thread::sleep(tick);
        }

        self.publish_phase(WorkerPhase::Stopping);
        self.transition()
    }
}

impl RemapWorker<Stopping> {
    /// Baut das Backend ab und trennt das Gerät
    pub fn shutdown(mut self) -> RemapWorker<Idle> {
        info!("Stopping worker for {}", self.device.id());
        self.drop_backend();
        self.device.disconnect();
        self.motion = None;
        self.publish_phase(WorkerPhase::Idle);
        self.transition()
    }
}

/// Kompletter Lebenszyklus, läuft im Blocking-Thread
pub fn run(worker: RemapWorker<Idle>) -> Device {
    let stopping = match worker.start().connect() {
        Ok(running) => running.run_until_cancelled(),
        Err(stopping) => stopping,
    };
    stopping.shutdown().into_device()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::ScriptedDevice;
    use crate::device::DeviceError;
    use crate::remap::events::RemapEvent;
    use glam::{Quat, Vec3};

    struct Harness {
        commands: mpsc::Sender<WorkerCommand>,
        reports: watch::Receiver<NormalizedInputReport>,
        phase: watch::Receiver<WorkerPhase>,
        cancel: CancellationToken,
        events: mpsc::Receiver<RemapEvent>,
    }

    fn worker(device: ScriptedDevice, backends: BackendRegistry) -> (RemapWorker<Idle>, Harness) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (report_tx, report_rx) = watch::channel(NormalizedInputReport::default());
        let (phase_tx, phase_rx) = watch::channel(WorkerPhase::Idle);
        let (event_tx, event_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let id = device.info.id.clone();

        let worker = RemapWorker::create(
            Device::new(Box::new(device)),
            Arc::new(backends),
            WorkerSettings {
                tick: Duration::from_millis(1),
                motion: MotionSettings::default(),
            },
            WorkerChannels {
                commands: command_rx,
                reports: report_tx,
                phase: phase_tx,
                cancel: cancel.clone(),
            },
            EventEmitter::new(&id, event_tx),
        );
        let harness = Harness {
            commands: command_tx,
            reports: report_rx,
            phase: phase_rx,
            cancel,
            events: event_rx,
        };
        (worker, harness)
    }

    struct Failing;

    impl RemapBackend for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn remap(
            &mut self,
            _input: &NormalizedInputReport,
            _dt: f32,
        ) -> Result<NormalizedOutputReport, RemapError> {
            Err(RemapError::Runtime("boom".to_string()))
        }
    }

    fn failing_registry() -> BackendRegistry {
        let mut backends = BackendRegistry::new();
        backends.register(
            "fail",
            Arc::new(|_profile: &Profile, _console: ConsoleSink| {
                Ok(Box::new(Failing) as Box<dyn RemapBackend>)
            }),
        );
        backends
    }

    #[test]
    fn states_advance_and_return_device() {
        let device = ScriptedDevice::new("pad");
        let written = device.written.clone();
        let (worker, mut harness) = worker(device, BackendRegistry::new());

        let connecting = worker.start();
        assert_eq!(*harness.phase.borrow(), WorkerPhase::Connecting);
        let mut running = connecting.connect().ok().unwrap();
        assert_eq!(*harness.phase.borrow(), WorkerPhase::Running);

        running.tick(0.0);
        assert_eq!(written.lock().unwrap().len(), 1);
        assert_eq!(
            written.lock().unwrap()[0],
            NormalizedOutputReport::default()
        );

        harness.cancel.cancel();
        let device = running.run_until_cancelled().shutdown().into_device();
        assert_eq!(*harness.phase.borrow(), WorkerPhase::Idle);
        assert!(!device.is_connected());
        assert!(harness.reports.has_changed().unwrap());

        let kinds: Vec<RemapEventKind> = std::iter::from_fn(|| harness.events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![RemapEventKind::Connected]);
    }

    #[test]
    fn runtime_error_is_reported_once_and_disables_backend() {
        let device = ScriptedDevice::new("pad");
        let (worker, mut harness) = worker(device, failing_registry());
        let mut running = worker.start().connect().ok().unwrap();

        harness
            .commands
            .try_send(WorkerCommand::LoadProfile(Profile::new("a.fail")))
            .unwrap();
        assert!(running.drain_commands());
        assert!(running.backend.is_some());

        running.tick(0.0);
        assert!(running.backend.is_none());
        running.tick(0.0);

        // Gleiche Meldung nach erneutem Laden wird nicht wiederholt
        running.handle_command(WorkerCommand::ReloadProfile);
        running.tick(0.0);

        let errors = std::iter::from_fn(|| harness.events.try_recv().ok())
            .filter(|e| matches!(e.kind, RemapEventKind::BackendError(_)))
            .count();
        assert_eq!(errors, 1);
    }

    #[test]
    fn load_failure_keeps_running_in_pass_through() {
        let device = ScriptedDevice::new("pad");
        let written = device.written.clone();
        let (worker, mut harness) = worker(device, BackendRegistry::new());
        let mut running = worker.start().connect().ok().unwrap();

        running.handle_command(WorkerCommand::LoadProfile(Profile::new("x.lua")));
        assert!(running.backend.is_none());
        running.tick(0.0);

        assert_eq!(
            written.lock().unwrap().last(),
            Some(&NormalizedOutputReport::default())
        );
        assert!(std::iter::from_fn(|| harness.events.try_recv().ok())
            .any(|e| matches!(e.kind, RemapEventKind::BackendError(_))));
    }

    #[test]
    fn clear_and_reload_without_profile() {
        let (worker, mut harness) = worker(ScriptedDevice::new("pad"), failing_registry());
        let mut running = worker.start().connect().ok().unwrap();

        running.handle_command(WorkerCommand::ReloadProfile);
        assert!(running.backend.is_none());
        running.handle_command(WorkerCommand::LoadProfile(Profile::new("b.fail")));
        running.handle_command(WorkerCommand::ClearProfile);
        assert!(running.backend.is_none());
        assert!(running.profile.is_none());

        let kinds: Vec<RemapEventKind> = std::iter::from_fn(|| harness.events.try_recv().ok())
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                RemapEventKind::Connected,
                RemapEventKind::BackendLoaded("b.fail".to_string()),
                RemapEventKind::BackendCleared,
            ]
        );
    }

    fn motion_report(gyro_y: f32) -> NormalizedInputReport {
        let mut report = NormalizedInputReport::default();
        report.raw_accel = Vec3::Y;
        report.gyro = Vec3::new(0.0, gyro_y, 0.0);
        report
    }

    #[test]
    fn only_fresh_reports_are_fused() {
        let mut device = ScriptedDevice::new("pad");
        device.info.capabilities.six_axis = true;
        let script = device.script.clone();
        let (worker, harness) = worker(device, BackendRegistry::new());
        let mut running = worker.start().connect().ok().unwrap();
        assert!(running.motion.is_some());

        // Sprünge über dem Gate, damit kein Bias gelernt wird
        script.lock().unwrap().push_back(Ok(Some(motion_report(90.0))));
        running.tick(0.0);
        thread::sleep(Duration::from_millis(5));
        script.lock().unwrap().push_back(Ok(Some(motion_report(180.0))));
        running.tick(0.005);

        let fused = harness.reports.borrow().clone();
        assert_ne!(fused.delta_rotation, Quat::IDENTITY);
        assert_ne!(fused.orientation, Quat::IDENTITY);
        assert!((fused.gravity.length() - 1.0).abs() < 1e-3);
        let orientation = running.motion.as_ref().unwrap().orientation();

        {
            let mut script = script.lock().unwrap();
            script.push_back(Err(DeviceError::Timeout));
            script.push_back(Ok(None));
        }
        thread::sleep(Duration::from_millis(5));
        running.tick(0.005);
        running.tick(0.005);

        assert_eq!(running.motion.as_ref().unwrap().orientation(), orientation);
        let stale = harness.reports.borrow().clone();
        assert_eq!(stale.orientation, fused.orientation);
        assert_eq!(stale.delta_rotation, fused.delta_rotation);
    }

    #[test]
    fn connect_failure_ends_in_idle() {
        struct Broken(ScriptedDevice);

        impl crate::device::InputDevice for Broken {
            fn info(&self) -> &crate::device::DeviceInfo {
                &self.0.info
            }
            fn connect(&mut self) -> Result<(), DeviceError> {
                Err(DeviceError::Open("busy".to_string()))
            }
            fn disconnect(&mut self) {}
            fn is_connected(&self) -> bool {
                false
            }
            fn poll_input(&mut self) -> Result<Option<NormalizedInputReport>, DeviceError> {
                Err(DeviceError::NotConnected)
            }
            fn send_output(&mut self, _report: &NormalizedOutputReport) -> Result<(), DeviceError> {
                Err(DeviceError::NotConnected)
            }
        }

        let (command_tx, command_rx) = mpsc::channel(1);
        let (report_tx, _report_rx) = watch::channel(NormalizedInputReport::default());
        let (phase_tx, phase_rx) = watch::channel(WorkerPhase::Idle);
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let worker = RemapWorker::create(
            Device::new(Box::new(Broken(ScriptedDevice::new("pad")))),
            Arc::new(BackendRegistry::new()),
            WorkerSettings::default(),
            WorkerChannels {
                commands: command_rx,
                reports: report_tx,
                phase: phase_tx,
                cancel: CancellationToken::new(),
            },
            EventEmitter::new("pad", event_tx),
        );

        let device = run(worker);
        drop(command_tx);
        assert_eq!(device.id(), "pad");
        assert_eq!(*phase_rx.borrow(), WorkerPhase::Idle);
        assert!(matches!(
            event_rx.try_recv().unwrap().kind,
            RemapEventKind::ConnectionFailed(_)
        ));
    }
}
