//! Explizite Registry der Transporte
//!
//! Jeder Transport registriert unter einem Schlüssel einen Konstruktor, der aus
//! der Konfiguration seinen Scanner baut. Deaktivierte Transporte liefern `None`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hidapi::HidApi;
use tracing::{error, info};

use crate::config::RemapperConfig;
use crate::device::hid::{self, HidScanner};
use crate::device::serial::{self, SerialScanner};
use crate::device::tcp::{self, TcpScanner};
use crate::device::{DeviceError, DeviceScanner};

pub type TransportConstructor =
    fn(&RemapperConfig) -> Result<Option<Box<dyn DeviceScanner>>, DeviceError>;

#[derive(Debug, Clone, Default)]
pub struct TransportRegistry {
    constructors: BTreeMap<String, TransportConstructor>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry mit seriellem, TCP- und DualShock-Transport
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(serial::KIND, build_serial);
        registry.register(tcp::KIND, build_tcp);
        registry.register(hid::KIND, build_dualshock);
        registry
    }

    pub fn register(&mut self, key: &str, constructor: TransportConstructor) {
        self.constructors.insert(key.to_string(), constructor);
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    pub fn build(
        &self,
        key: &str,
        config: &RemapperConfig,
    ) -> Result<Option<Box<dyn DeviceScanner>>, DeviceError> {
        let constructor = self
            .constructors
            .get(key)
            .ok_or_else(|| DeviceError::Unsupported(format!("Transport '{key}'")))?;
        constructor(config)
    }

    /// Baut alle aktivierten Transporte. Fehlschläge werden protokolliert und übersprungen.
    pub fn build_enabled(&self, config: &RemapperConfig) -> Vec<Box<dyn DeviceScanner>> {
        let mut scanners = Vec::new();
        for key in self.keys() {
            match self.build(key, config) {
                Ok(Some(scanner)) => {
                    info!("Transport '{}' enabled", key);
                    scanners.push(scanner);
                }
                Ok(None) => info!("Transport '{}' disabled", key),
                Err(e) => error!("Transport '{}' failed to start: {}", key, e),
            }
        }
        scanners
    }
}

fn build_serial(config: &RemapperConfig) -> Result<Option<Box<dyn DeviceScanner>>, DeviceError> {
    if !config.serial.enabled {
        return Ok(None);
    }
    Ok(Some(Box::new(SerialScanner::new(
        config.serial.baud_rate,
        config.scheduler.read_timeout(),
    ))))
}

fn build_tcp(config: &RemapperConfig) -> Result<Option<Box<dyn DeviceScanner>>, DeviceError> {
    if !config.tcp.enabled {
        return Ok(None);
    }
    let addr: SocketAddr = config
        .tcp
        .listen_addr
        .parse()
        .map_err(|e| DeviceError::Open(format!("{}: {e}", config.tcp.listen_addr)))?;
    Ok(Some(Box::new(TcpScanner::bind(
        addr,
        config.scheduler.read_timeout(),
    )?)))
}

fn build_dualshock(config: &RemapperConfig) -> Result<Option<Box<dyn DeviceScanner>>, DeviceError> {
    if !config.hid.enabled {
        return Ok(None);
    }
    let api = Arc::new(Mutex::new(HidApi::new()?));
    Ok(Some(Box::new(HidScanner::new(
        api,
        config.scheduler.read_timeout(),
    ))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_register_three_transports() {
        let registry = TransportRegistry::with_defaults();
        let keys: Vec<&str> = registry.keys().collect();
        assert_eq!(keys, vec!["dualshock", "serial", "tcp"]);
    }

    #[test]
    fn disabled_transport_builds_nothing() {
        let mut config = RemapperConfig::default();
        config.serial.enabled = false;
        let registry = TransportRegistry::with_defaults();
        assert!(registry.build("serial", &config).unwrap().is_none());
    }

    #[test]
    fn unknown_key_is_unsupported() {
        let registry = TransportRegistry::new();
        let err = registry
            .build("directinput", &RemapperConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, DeviceError::Unsupported(_)));
    }

    #[test]
    fn enabled_tcp_binds_listener() {
        let mut config = RemapperConfig::default();
        config.tcp.listen_addr = "127.0.0.1:0".to_string();
        let scanner = TransportRegistry::with_defaults()
            .build("tcp", &config)
            .unwrap()
            .unwrap();
        assert_eq!(scanner.name(), "tcp");
    }
}
