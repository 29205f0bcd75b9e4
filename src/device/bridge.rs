//! Gemeinsames Gerät für serielle und TCP-Bridges
//!
//! Beide Transporte sprechen dasselbe Request/Response-Protokoll und
//! unterscheiden sich nur im Framing und im Verbindungsaufbau. Diese Teile
//! liefert ein [`BridgeLink`].

use tracing::{debug, info, warn};

use crate::codec::bridge::{self, BridgeInfo, Framing, BRIDGE_LAYOUT, INFO_REQUEST, STATE_REQUEST};
use crate::codec::SensorScale;
use crate::device::{Capabilities, DeviceError, DeviceInfo, InputDevice};
use crate::report::{NormalizedInputReport, NormalizedOutputReport};

/// Byte-Kanal zu einer Bridge
pub trait BridgeLink: Send {
    fn framing(&self) -> Framing;

    fn open(&mut self) -> Result<(), DeviceError>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Verwirft bereits empfangene, ungelesene Bytes
    fn clear_input(&mut self) -> Result<(), DeviceError>;

    fn write_all(&mut self, buf: &[u8]) -> Result<(), DeviceError>;

    /// Füllt `buf` vollständig oder scheitert, bei Ablauf des Timeouts mit
    /// [`DeviceError::Timeout`]
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError>;

    fn shutdown(&mut self) {}
}

/// Capabilities aller Bridges
pub const BRIDGE_CAPABILITIES: Capabilities = Capabilities {
    six_axis: true,
    touch: false,
    feedback: true,
};

pub fn bridge_info(id: &str, name: String, kind: &str) -> DeviceInfo {
    DeviceInfo {
        id: id.to_string(),
        name,
        kind: kind.to_string(),
        capabilities: BRIDGE_CAPABILITIES,
        layout: BRIDGE_LAYOUT,
    }
}

pub struct BridgeDevice<L> {
    info: DeviceInfo,
    link: L,
    /// Einmalig gelesener Info-Report; fehlt er, wird beim nächsten Poll neu angefragt
    bridge_info: Option<BridgeInfo>,
    report: NormalizedInputReport,
    state_buf: Vec<u8>,
}

impl<L: BridgeLink> BridgeDevice<L> {
    pub fn new(info: DeviceInfo, link: L) -> Self {
        let state_buf = vec![0u8; link.framing().state_len];
        let report = NormalizedInputReport::new(info.layout);
        Self {
            info,
            link,
            bridge_info: None,
            report,
            state_buf,
        }
    }

    pub fn bridge_info(&self) -> Option<&BridgeInfo> {
        self.bridge_info.as_ref()
    }

    fn request_info(&mut self) -> Result<BridgeInfo, DeviceError> {
        let mut buf = vec![0u8; self.link.framing().info_len];
        self.link.clear_input()?;
        self.link.write_all(&[INFO_REQUEST])?;
        self.link.read_exact(&mut buf)?;
        Ok(BridgeInfo::decode(&buf)?)
    }

    fn scale(&self) -> SensorScale {
        self.bridge_info.map(|i| i.scale).unwrap_or_default()
    }
}

impl<L: BridgeLink> InputDevice for BridgeDevice<L> {
    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn connect(&mut self) -> Result<(), DeviceError> {
        self.link.open()?;
        self.bridge_info = None;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.link.close();
    }

    fn is_connected(&self) -> bool {
        self.link.is_open()
    }

    fn poll_input(&mut self) -> Result<Option<NormalizedInputReport>, DeviceError> {
        if !self.link.is_open() {
            return Err(DeviceError::NotConnected);
        }

        if self.bridge_info.is_none() {
            match self.request_info() {
                Ok(received) => {
                    info!(
                        "Bridge {} reports {} axes, {} buttons, {} povs, accel ±{}g, gyro ±{}°/s",
                        self.info.id,
                        received.axes,
                        received.buttons,
                        received.povs,
                        received.scale.accel,
                        received.scale.gyro
                    );
                    self.bridge_info = Some(received);
                }
                Err(DeviceError::Timeout) => {
                    debug!("Bridge {} did not answer the info request", self.info.id)
                }
                Err(e) => return Err(e),
            }
        }

        self.link.clear_input()?;
        self.link.write_all(&[STATE_REQUEST])?;
        match self.link.read_exact(&mut self.state_buf) {
            Ok(()) => {}
            Err(DeviceError::Timeout) => return Ok(None),
            Err(e) => return Err(e),
        }

        let scale = self.scale();
        bridge::decode_state_into(&self.state_buf, &scale, &mut self.report)?;
        Ok(Some(self.report.clone()))
    }

    fn send_output(&mut self, report: &NormalizedOutputReport) -> Result<(), DeviceError> {
        let framing = self.link.framing();
        let frame = bridge::encode_output(report, &framing);

        self.link.clear_input()?;
        self.link.write_all(&frame)?;

        if framing.ack {
            let mut ack = [0u8; 1];
            match self.link.read_exact(&mut ack) {
                Ok(()) | Err(DeviceError::Timeout) => {}
                Err(e) => warn!("Bridge {} ack failed: {}", self.info.id, e),
            }
        }
        Ok(())
    }

    fn force_disconnect(&mut self) {
        self.link.shutdown();
    }

    fn motion_calibrated(&self) -> bool {
        self.bridge_info
            .map(|i| i.scale.is_known())
            .unwrap_or(false)
    }
}
