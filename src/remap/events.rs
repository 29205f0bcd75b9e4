//! Events der Worker an den Rest der Anwendung

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::error;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RemapEventKind {
    /// Scanner hat ein neues Gerät gemeldet
    Attached { name: String },
    Detached,
    Connected,
    ConnectionFailed(String),
    /// Pfad des geladenen Profils
    BackendLoaded(String),
    BackendCleared,
    BackendError(String),
    Warning(String),
    /// Ausgabe eines Backends
    Console(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemapEvent {
    pub device_id: String,
    pub timestamp: DateTime<Local>,
    pub kind: RemapEventKind,
}

impl fmt::Display for RemapEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = self.timestamp.format("%H:%M:%S%.3f");
        match &self.kind {
            RemapEventKind::Attached { name } => write!(f, "[{time}] {} attached ({name})", self.device_id),
            RemapEventKind::Detached => write!(f, "[{time}] {} detached", self.device_id),
            RemapEventKind::Connected => write!(f, "[{time}] {} connected", self.device_id),
            RemapEventKind::ConnectionFailed(e) => {
                write!(f, "[{time}] {} connection failed: {e}", self.device_id)
            }
            RemapEventKind::BackendLoaded(p) => write!(f, "[{time}] {} loaded {p}", self.device_id),
            RemapEventKind::BackendCleared => write!(f, "[{time}] {} profile cleared", self.device_id),
            RemapEventKind::BackendError(e) => write!(f, "[{time}] {} backend error: {e}", self.device_id),
            RemapEventKind::Warning(w) => write!(f, "[{time}] {} warning: {w}", self.device_id),
            RemapEventKind::Console(text) => write!(f, "[{time}] {}: {text}", self.device_id),
        }
    }
}

/// Sendet Events im Namen eines Geräts, ohne je zu blockieren
#[derive(Debug, Clone)]
pub struct EventEmitter {
    device_id: Arc<str>,
    tx: Option<mpsc::Sender<RemapEvent>>,
}

impl EventEmitter {
    pub fn new(device_id: &str, tx: mpsc::Sender<RemapEvent>) -> Self {
        Self {
            device_id: Arc::from(device_id),
            tx: Some(tx),
        }
    }

    pub fn disabled(device_id: &str) -> Self {
        Self {
            device_id: Arc::from(device_id),
            tx: None,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn emit(&self, kind: RemapEventKind) {
        let Some(tx) = &self.tx else {
            return;
        };
        let event = RemapEvent {
            device_id: self.device_id.to_string(),
            timestamp: Local::now(),
            kind,
        };
        if let Err(e) = tx.try_send(event) {
            match e {
                mpsc::error::TrySendError::Full(event) => {
                    error!("Event buffer full, dropping: {}", event)
                }
                mpsc::error::TrySendError::Closed(_) => {}
            }
        }
    }
}

/// Textkanal eines Backends, landet als [`RemapEventKind::Console`] im Event-Strom
#[derive(Debug, Clone)]
pub struct ConsoleSink {
    emitter: EventEmitter,
}

impl ConsoleSink {
    pub fn new(emitter: EventEmitter) -> Self {
        Self { emitter }
    }

    pub fn disabled(device_id: &str) -> Self {
        Self::new(EventEmitter::disabled(device_id))
    }

    pub fn print(&self, text: impl Into<String>) {
        self.emitter.emit(RemapEventKind::Console(text.into()));
    }

    pub fn warn(&self, text: impl Into<String>) {
        self.emitter.emit(RemapEventKind::Warning(text.into()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_text_becomes_event() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = ConsoleSink::new(EventEmitter::new("COM3", tx));
        sink.print("hello");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.device_id, "COM3");
        assert_eq!(event.kind, RemapEventKind::Console("hello".to_string()));
    }

    #[test]
    fn full_buffer_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let emitter = EventEmitter::new("pad", tx);
        emitter.emit(RemapEventKind::Connected);
        emitter.emit(RemapEventKind::Detached);

        assert_eq!(rx.try_recv().unwrap().kind, RemapEventKind::Connected);
        assert!(rx.try_recv().is_err());
    }
}
