//! Serielle Mikrocontroller-Bridge

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, warn};

use crate::codec::bridge::Framing;
use crate::device::bridge::{bridge_info, BridgeDevice, BridgeLink};
use crate::device::{DeviceDescriptor, DeviceError, DeviceScanner, InputDevice};

pub const KIND: &str = "serial";

pub struct SerialLink {
    path: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialLink {
    pub fn new(path: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            timeout,
            port: None,
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn SerialPort>, DeviceError> {
        self.port.as_mut().ok_or(DeviceError::NotConnected)
    }
}

impl BridgeLink for SerialLink {
    fn framing(&self) -> Framing {
        Framing::SERIAL
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, self.baud_rate)
            .timeout(self.timeout)
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn clear_input(&mut self) -> Result<(), DeviceError> {
        self.port()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        self.port()?.write_all(buf)?;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        match self.port()?.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::TimedOut => Err(DeviceError::Timeout),
            Err(e) => Err(e.into()),
        }
    }
}

/// Listet alle seriellen Ports als potentielle Bridges
pub struct SerialScanner {
    baud_rate: u32,
    timeout: Duration,
}

impl SerialScanner {
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self { baud_rate, timeout }
    }
}

impl DeviceScanner for SerialScanner {
    fn name(&self) -> &str {
        KIND
    }

    fn scan(&mut self) -> Vec<DeviceDescriptor> {
        let ports = match serialport::available_ports() {
            Ok(ports) => ports,
            Err(e) => {
                warn!("Failed to enumerate serial ports: {}", e);
                return Vec::new();
            }
        };

        ports
            .into_iter()
            .map(|p| {
                debug!("Found serial port {}", p.port_name);
                let info = bridge_info(&p.port_name, format!("Controller {}", p.port_name), KIND);
                let factory_info = info.clone();
                let baud_rate = self.baud_rate;
                let timeout = self.timeout;
                DeviceDescriptor::new(info, move || {
                    let link = SerialLink::new(factory_info.id.clone(), baud_rate, timeout);
                    Ok(Box::new(BridgeDevice::new(factory_info.clone(), link)) as Box<dyn InputDevice>)
                })
            })
            .collect()
    }
}
