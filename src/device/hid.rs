//! DualShock 4 über HID
//!
//! Die `HidApi`-Instanz wird zwischen Scanner und Geräten geteilt, da hidapi
//! pro Prozess nur eine Instanz zulässt.

use std::ffi::CString;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use hidapi::{HidApi, HidDevice};
use tracing::{debug, warn};

use crate::codec::dualshock::{self, Connection, CALIBRATION_FEATURE_ID, DS4_LAYOUT, VENDOR_ID};
use crate::device::{Capabilities, DeviceDescriptor, DeviceError, DeviceInfo, DeviceScanner, InputDevice};
use crate::report::{NormalizedInputReport, NormalizedOutputReport};

pub const KIND: &str = "dualshock";

const INPUT_BUFFER: usize = 128;

pub type SharedHidApi = Arc<Mutex<HidApi>>;

fn lock(api: &SharedHidApi) -> Result<std::sync::MutexGuard<'_, HidApi>, DeviceError> {
    api.lock()
        .map_err(|_| DeviceError::Open("HID-API-Sperre vergiftet".to_string()))
}

pub fn dualshock_info(id: &str) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name: "DualShock 4".to_string(),
        kind: KIND.to_string(),
        capabilities: Capabilities {
            six_axis: true,
            touch: true,
            feedback: true,
        },
        layout: DS4_LAYOUT,
    }
}

pub struct DualShockDevice {
    info: DeviceInfo,
    api: SharedHidApi,
    path: CString,
    timeout: Duration,
    device: Option<HidDevice>,
    /// Wird mit dem ersten Input-Report bekannt
    connection: Option<Connection>,
    report: NormalizedInputReport,
    buf: Vec<u8>,
}

impl DualShockDevice {
    pub fn new(info: DeviceInfo, api: SharedHidApi, path: CString, timeout: Duration) -> Self {
        let report = NormalizedInputReport::new(info.layout);
        Self {
            info,
            api,
            path,
            timeout,
            device: None,
            connection: None,
            report,
            buf: vec![0u8; INPUT_BUFFER],
        }
    }
}

impl InputDevice for DualShockDevice {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = lock(&self.api)?.open_path(&self.path)?;

        // Über Bluetooth sendet der Controller erst nach dieser Abfrage den vollen Report
        let mut feature = [0u8; 64];
        feature[0] = CALIBRATION_FEATURE_ID;
        if let Err(e) = device.get_feature_report(&mut feature) {
            warn!("Feature report of {} unavailable: {}", self.info.id, e);
        }

        self.device = Some(device);
        self.connection = None;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.device = None;
    }

    fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    fn poll_input(&mut self) -> Result<Option<NormalizedInputReport>, DeviceError> {
        let device = self.device.as_ref().ok_or(DeviceError::NotConnected)?;
        let timeout_ms = i32::try_from(self.timeout.as_millis()).unwrap_or(i32::MAX);

        let n = device.read_timeout(&mut self.buf, timeout_ms)?;
        if n == 0 {
            return Ok(None);
        }

        let connection = dualshock::decode_input_into(&self.buf[..n], &mut self.report)?;
        if self.connection != Some(connection) {
            debug!("{} reports via {:?}", self.info.id, connection);
            self.connection = Some(connection);
        }
        Ok(Some(self.report.clone()))
    }

    fn send_output(&mut self, report: &NormalizedOutputReport) -> Result<(), DeviceError> {
        let device = self.device.as_ref().ok_or(DeviceError::NotConnected)?;
        let Some(connection) = self.connection else {
            return Ok(());
        };
        device.write(&dualshock::encode_output(report, connection))?;
        Ok(())
    }
}

/// Findet alle Sony-Controller
pub struct HidScanner {
    api: SharedHidApi,
    timeout: Duration,
}

impl HidScanner {
    pub fn new(api: SharedHidApi, timeout: Duration) -> Self {
        Self { api, timeout }
    }
}

impl DeviceScanner for HidScanner {
    fn name(&self) -> &str {
        KIND
    }

    fn scan(&mut self) -> Vec<DeviceDescriptor> {
        let mut api = match lock(&self.api) {
            Ok(api) => api,
            Err(e) => {
                warn!("HID scan skipped: {}", e);
                return Vec::new();
            }
        };
        if let Err(e) = api.refresh_devices() {
            warn!("Failed to refresh HID devices: {}", e);
            return Vec::new();
        }

        let mut descriptors: Vec<DeviceDescriptor> = Vec::new();
        for device in api.device_list().filter(|d| d.vendor_id() == VENDOR_ID) {
            let path = device.path().to_owned();
            let id = match device.serial_number() {
                Some(serial) if !serial.is_empty() => serial.to_string(),
                _ => path.to_string_lossy().into_owned(),
            };
            // Ein Controller kann mehrere Collections melden
            if descriptors.iter().any(|d| d.id() == id) {
                continue;
            }

            debug!(
                "Found DualShock {:04X}:{:04X} at {:?}",
                device.vendor_id(),
                device.product_id(),
                path
            );
            let info = dualshock_info(&id);
            let factory_info = info.clone();
            let shared = self.api.clone();
            let timeout = self.timeout;
            descriptors.push(DeviceDescriptor::new(info, move || {
                Ok(Box::new(DualShockDevice::new(
                    factory_info.clone(),
                    shared.clone(),
                    path.clone(),
                    timeout,
                )) as Box<dyn InputDevice>)
            }));
        }
        descriptors
    }
}
