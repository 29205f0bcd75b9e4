//! padremap: Controller-Normalisierung, Sechs-Achsen-Fusion und Remapping pro Gerät

pub mod codec;
pub mod config;
pub mod device;
pub mod motion;
pub mod remap;
pub mod report;
pub mod scanner;

pub use config::RemapperConfig;
pub use device::{Device, DeviceDescriptor, DeviceInfo, DeviceScanner, InputDevice};
pub use remap::{BackendRegistry, NativeRegistry, RemapBackend, RemapManager, Profile};
pub use report::{NormalizedInputReport, NormalizedOutputReport};
