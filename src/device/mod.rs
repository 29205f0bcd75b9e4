//! Geräteabstraktion
//!
//! Jede physische Eingabequelle implementiert [`InputDevice`]. Der Scheduler
//! arbeitet ausschließlich mit dem [`Device`]-Wrapper, der transiente Lesefehler
//! schluckt und stattdessen den zuletzt gültigen Report liefert.

pub mod bridge;
pub mod hid;
pub mod registry;
pub mod serial;
pub mod tcp;

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::codec::CodecError;
use crate::report::{NormalizedInputReport, NormalizedOutputReport, ReportLayout};

pub use registry::{TransportConstructor, TransportRegistry};

/// Fehler beim Zugriff auf ein Gerät
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("I/O-Fehler: {0}")]
    Io(#[from] std::io::Error),

    #[error("Fehler am seriellen Port: {0}")]
    Serial(#[from] serialport::Error),

    #[error("HID-Fehler: {0}")]
    Hid(#[from] hidapi::HidError),

    #[error("Zeitüberschreitung beim Lesen")]
    Timeout,

    #[error("Gerät ist nicht verbunden")]
    NotConnected,

    #[error("Gerät konnte nicht geöffnet werden: {0}")]
    Open(String),

    #[error("Nicht unterstützt: {0}")]
    Unsupported(String),

    #[error("Ungültiger Report: {0}")]
    Codec(#[from] CodecError),
}

/// Fähigkeiten eines Geräts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub six_axis: bool,
    pub touch: bool,
    pub feedback: bool,
}

/// Stammdaten eines Geräts, vom Scanner erzeugt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    /// Stabile ID, z.B. Portname, Peer-Adresse oder HID-Seriennummer
    pub id: String,
    pub name: String,
    /// Transport-Kennung ("serial", "tcp", "dualshock")
    pub kind: String,
    pub capabilities: Capabilities,
    pub layout: ReportLayout,
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({})", self.name, self.id, self.kind)
    }
}

/// Schnittstelle, die jeder Transport implementiert
///
/// Alle Aufrufe dürfen blockieren, aber höchstens bis zum Lese-Timeout des
/// Transports. Implementierungen besitzen ihr Transport-Handle exklusiv.
pub trait InputDevice: Send {
    fn info(&self) -> &DeviceInfo;

    fn connect(&mut self) -> Result<(), DeviceError>;

    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// Liest einen Report. `Ok(None)` heißt "innerhalb des Timeouts keine Daten".
    fn poll_input(&mut self) -> Result<Option<NormalizedInputReport>, DeviceError>;

    fn send_output(&mut self, report: &NormalizedOutputReport) -> Result<(), DeviceError>;

    /// Fordert die Gegenseite auf, die Verbindung zu trennen
    fn force_disconnect(&mut self) {}

    /// Liefern die Sensoren skalierte Werte, auf denen die Fusion arbeiten kann?
    fn motion_calibrated(&self) -> bool {
        true
    }
}

/// Gerät mit "last known report"-Semantik
///
/// Wird das `Device` gedroppt, trennt es die Verbindung. Da der Worker das
/// `Device` besitzt und erst nach seinem Ende zurückgibt, kann der Transport
/// nie freigegeben werden, solange noch gelesen wird.
pub struct Device {
    inner: Box<dyn InputDevice>,
    last_report: NormalizedInputReport,
    fresh: bool,
    misses: u32,
}

impl Device {
    pub fn new(inner: Box<dyn InputDevice>) -> Self {
        let last_report = NormalizedInputReport::new(inner.info().layout);
        Self {
            inner,
            last_report,
            fresh: false,
            misses: 0,
        }
    }

    pub fn info(&self) -> &DeviceInfo {
        self.inner.info()
    }

    pub fn id(&self) -> &str {
        &self.inner.info().id
    }

    pub fn connect(&mut self) -> Result<(), DeviceError> {
        if self.inner.is_connected() {
            return Ok(());
        }
        self.inner.connect()?;
        info!("Device connected: {}", self.inner.info());
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if self.inner.is_connected() {
            self.inner.disconnect();
            info!("Device disconnected: {}", self.inner.info());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    pub fn force_disconnect(&mut self) {
        self.inner.force_disconnect();
    }

    pub fn motion_calibrated(&self) -> bool {
        self.inner.motion_calibrated()
    }

    /// Liest den nächsten Report. Schlägt der Transport fehl, bleibt der letzte
    /// gültige Report stehen und [`Device::is_fresh`] liefert `false`.
    pub fn read_input(&mut self) -> &NormalizedInputReport {
        match self.inner.poll_input() {
            Ok(Some(report)) => {
                if report.layout() == self.last_report.layout() {
                    self.last_report = report;
                    self.fresh = true;
                    self.misses = 0;
                } else {
                    warn!(
                        "Dropping report with unexpected layout from {}",
                        self.inner.info().id
                    );
                    self.fresh = false;
                }
            }
            Ok(None) => self.record_miss(None),
            Err(e) => self.record_miss(Some(e)),
        }
        &self.last_report
    }

    fn record_miss(&mut self, error: Option<DeviceError>) {
        self.fresh = false;
        self.misses = self.misses.saturating_add(1);
        match error {
            Some(e) if self.misses == 1 => {
                warn!("Read from {} failed: {}", self.inner.info().id, e)
            }
            Some(e) => debug!("Read from {} failed again: {}", self.inner.info().id, e),
            None => debug!("No data from {} within timeout", self.inner.info().id),
        }
    }

    pub fn is_fresh(&self) -> bool {
        self.fresh
    }

    /// Anzahl aufeinanderfolgender Lesevorgänge ohne neue Daten
    pub fn misses(&self) -> u32 {
        self.misses
    }

    pub fn last_report(&self) -> &NormalizedInputReport {
        &self.last_report
    }

    /// Zugriff für die Fusion, die ihre Ergebnisse in den Report zurückschreibt
    pub fn report_mut(&mut self) -> &mut NormalizedInputReport {
        &mut self.last_report
    }

    /// Best effort, Fehler werden nur protokolliert
    pub fn write_output(&mut self, report: &NormalizedOutputReport) {
        if !self.inner.is_connected() {
            return;
        }
        if let Err(e) = self.inner.send_output(report) {
            warn!("Write to {} failed: {}", self.inner.info().id, e);
        }
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("info", self.inner.info())
            .field("fresh", &self.fresh)
            .field("misses", &self.misses)
            .finish()
    }
}

type Factory = dyn Fn() -> Result<Box<dyn InputDevice>, DeviceError> + Send + Sync;

/// Vom Scanner gefundenes Gerät samt Konstruktor
///
/// Die Factory darf keine I/O durchführen. Geöffnet wird erst durch
/// [`Device::connect`] im Worker.
#[derive(Clone)]
pub struct DeviceDescriptor {
    pub info: DeviceInfo,
    factory: Arc<Factory>,
}

impl DeviceDescriptor {
    pub fn new<F>(info: DeviceInfo, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn InputDevice>, DeviceError> + Send + Sync + 'static,
    {
        Self {
            info,
            factory: Arc::new(factory),
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn open(&self) -> Result<Device, DeviceError> {
        (self.factory)().map(Device::new)
    }
}

impl fmt::Debug for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceDescriptor")
            .field("info", &self.info)
            .finish()
    }
}

/// Liefert bei jedem Aufruf die aktuell angeschlossenen Geräte eines Transports
pub trait DeviceScanner: Send {
    fn name(&self) -> &str;

    fn scan(&mut self) -> Vec<DeviceDescriptor>;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    pub type Script = Arc<Mutex<VecDeque<Result<Option<NormalizedInputReport>, DeviceError>>>>;

    /// Gerät, das vorgegebene Lese-Ergebnisse abspielt
    pub struct ScriptedDevice {
        pub info: DeviceInfo,
        pub script: Script,
        pub written: Arc<Mutex<Vec<NormalizedOutputReport>>>,
        pub connected: bool,
    }

    impl ScriptedDevice {
        pub fn new(id: &str) -> Self {
            Self {
                info: DeviceInfo {
                    id: id.to_string(),
                    name: format!("Scripted {id}"),
                    kind: "scripted".to_string(),
                    capabilities: Capabilities::default(),
                    layout: ReportLayout::default(),
                },
                script: Arc::default(),
                written: Arc::default(),
                connected: false,
            }
        }
    }

    impl InputDevice for ScriptedDevice {
        fn info(&self) -> &DeviceInfo {
            &self.info
        }

        fn connect(&mut self) -> Result<(), DeviceError> {
            self.connected = true;
            Ok(())
        }

        fn disconnect(&mut self) {
            self.connected = false;
        }

        fn is_connected(&self) -> bool {
            self.connected
        }

        fn poll_input(&mut self) -> Result<Option<NormalizedInputReport>, DeviceError> {
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }

        fn send_output(&mut self, report: &NormalizedOutputReport) -> Result<(), DeviceError> {
            self.written.lock().unwrap().push(*report);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::ScriptedDevice;
    use super::*;

    fn report_with_axis(value: f32) -> NormalizedInputReport {
        let mut report = NormalizedInputReport::default();
        report.set_axis(0, value);
        report
    }

    #[test]
    fn transient_failures_return_last_good_report() {
        let scripted = ScriptedDevice::new("pad");
        {
            let mut script = scripted.script.lock().unwrap();
            script.push_back(Ok(Some(report_with_axis(0.5))));
            script.push_back(Err(DeviceError::Timeout));
            script.push_back(Ok(None));
            script.push_back(Err(DeviceError::Io(std::io::Error::other("gone"))));
            script.push_back(Ok(Some(report_with_axis(-0.25))));
        }
        let mut device = Device::new(Box::new(scripted));
        device.connect().unwrap();

        assert_eq!(device.read_input().axis(0), Some(0.5));
        assert!(device.is_fresh());

        for _ in 0..3 {
            assert_eq!(device.read_input().axis(0), Some(0.5));
            assert!(!device.is_fresh());
        }
        assert_eq!(device.misses(), 3);

        assert_eq!(device.read_input().axis(0), Some(-0.25));
        assert!(device.is_fresh());
        assert_eq!(device.misses(), 0);
    }

    #[test]
    fn report_with_foreign_layout_is_rejected() {
        let scripted = ScriptedDevice::new("pad");
        scripted
            .script
            .lock()
            .unwrap()
            .push_back(Ok(Some(NormalizedInputReport::new(ReportLayout {
                axes: 2,
                ..ReportLayout::default()
            }))));
        let mut device = Device::new(Box::new(scripted));

        assert_eq!(device.read_input().axes().len(), 6);
        assert!(!device.is_fresh());
    }

    #[test]
    fn writes_are_skipped_while_disconnected() {
        let scripted = ScriptedDevice::new("pad");
        let written = scripted.written.clone();
        let mut device = Device::new(Box::new(scripted));

        device.write_output(&NormalizedOutputReport::default());
        assert!(written.lock().unwrap().is_empty());

        device.connect().unwrap();
        device.write_output(&NormalizedOutputReport::default());
        assert_eq!(written.lock().unwrap().len(), 1);
    }

    #[test]
    fn descriptor_opens_fresh_instances() {
        let descriptor = DeviceDescriptor::new(ScriptedDevice::new("pad").info, || {
            Ok(Box::new(ScriptedDevice::new("pad")) as Box<dyn InputDevice>)
        });

        let first = descriptor.open().unwrap();
        let second = descriptor.open().unwrap();
        assert_eq!(first.id(), "pad");
        assert!(!first.is_connected() && !second.is_connected());
    }
}
