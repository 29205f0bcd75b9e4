//! Remap-Scheduler und Backends
//!
//! Pro angeschlossenem Gerät läuft ein Worker, der Reports liest, sie durch ein
//! [`RemapBackend`] schickt und das Ergebnis an das Gerät zurückschreibt.
//! Backends werden über die Dateiendung des Profils aus der
//! [`BackendRegistry`] geladen.

pub mod events;
pub mod handle;
pub mod manager;
pub mod native;
pub mod rules;
pub mod worker;

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::report::{NormalizedInputReport, NormalizedOutputReport};

pub use events::{ConsoleSink, RemapEvent, RemapEventKind};
pub use handle::WorkerHandle;
pub use manager::RemapManager;
pub use native::NativeRegistry;
pub use worker::WorkerPhase;

/// Fehler eines Backends
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RemapError {
    #[error("Profil {path} konnte nicht geladen werden: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("Profil ist ungültig: {0}")]
    Compile(String),

    #[error("{0}")]
    Runtime(String),

    #[error("Kein Backend für Profiltyp '{0}'")]
    UnknownBackend(String),
}

/// Fehler des Schedulers selbst
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Unbekanntes Gerät: {0}")]
    UnknownDevice(String),

    #[error("Kanal wurde geschlossen")]
    ChannelClosed,

    #[error("Worker {0} nimmt keine Befehle mehr an")]
    Busy(String),

    #[error("Worker konnte nicht beendet werden: {0}")]
    Join(String),
}

/// Vom Nutzer geliefertes Mapping von Input auf Output
pub trait RemapBackend: Send {
    fn name(&self) -> &str;

    /// Berechnet den Output für einen Input; `dt` ist die Zeit seit dem letzten Aufruf in Sekunden
    fn remap(
        &mut self,
        input: &NormalizedInputReport,
        dt: f32,
    ) -> Result<NormalizedOutputReport, RemapError>;

    /// Baut emulierte Ausgabegeräte und sonstige Ressourcen ab
    fn shutdown(&mut self) {}
}

/// Verweis auf eine Profildatei; die Endung wählt das Backend
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Profile {
    path: PathBuf,
}

impl Profile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Dateiendung ohne Punkt
    pub fn key(&self) -> &str {
        self.path
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or_default()
    }

    pub fn read_to_string(&self) -> Result<String, RemapError> {
        std::fs::read_to_string(&self.path).map_err(|e| RemapError::Load {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

pub type BackendLoader =
    Arc<dyn Fn(&Profile, ConsoleSink) -> Result<Box<dyn RemapBackend>, RemapError> + Send + Sync>;

/// Ordnet Profiltypen ihren Ladern zu
#[derive(Clone, Default)]
pub struct BackendRegistry {
    loaders: HashMap<String, BackendLoader>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `toml` → Regel-Backend, `native` → kompilierte Funktionen aus `natives`
    pub fn with_defaults(natives: NativeRegistry) -> Self {
        let mut registry = Self::new();
        registry.register(rules::PROFILE_KEY, Arc::new(rules::load));
        let natives = Arc::new(natives);
        registry.register(
            native::PROFILE_KEY,
            Arc::new(move |profile: &Profile, console: ConsoleSink| {
                native::load(&natives, profile, console)
            }),
        );
        registry
    }

    pub fn register(&mut self, key: &str, loader: BackendLoader) {
        self.loaders.insert(key.to_string(), loader);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.loaders.contains_key(key)
    }

    pub fn load(
        &self,
        profile: &Profile,
        console: ConsoleSink,
    ) -> Result<Box<dyn RemapBackend>, RemapError> {
        let loader = self
            .loaders
            .get(profile.key())
            .ok_or_else(|| RemapError::UnknownBackend(profile.key().to_string()))?;
        loader(profile, console)
    }
}

impl fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<&String> = self.loaders.keys().collect();
        keys.sort();
        f.debug_struct("BackendRegistry").field("keys", &keys).finish()
    }
}
