//! TCP-Bridge
//!
//! Ein Listener nimmt Verbindungen von Mikrocontrollern an. Jede Gegenstelle
//! wird zu einem Gerät mit ihrer IP als ID. Schließt die Gegenstelle den
//! Stream, wird das Gerät beim nächsten Scan entfernt.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::codec::bridge::Framing;
use crate::device::bridge::{bridge_info, BridgeDevice, BridgeLink};
use crate::device::{DeviceDescriptor, DeviceError, DeviceScanner, InputDevice};

pub const KIND: &str = "tcp";

pub struct TcpLink {
    stream: TcpStream,
    timeout: Duration,
    alive: Arc<AtomicBool>,
    open: bool,
}

impl TcpLink {
    pub fn new(stream: TcpStream, timeout: Duration, alive: Arc<AtomicBool>) -> Self {
        Self {
            stream,
            timeout,
            alive,
            open: false,
        }
    }

    fn mark_dead(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
        self.open = false;
    }

    fn check(&self) -> Result<(), DeviceError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }
}

impl BridgeLink for TcpLink {
    fn framing(&self) -> Framing {
        Framing::TCP
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(DeviceError::NotConnected);
        }
        self.stream.set_read_timeout(Some(self.timeout))?;
        self.stream.set_write_timeout(Some(self.timeout))?;
        self.stream.set_nodelay(true)?;
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn is_open(&self) -> bool {
        self.open && self.alive.load(Ordering::SeqCst)
    }

    fn clear_input(&mut self) -> Result<(), DeviceError> {
        self.check()?;
        self.stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 64];
        let result = loop {
            match self.stream.read(&mut scratch) {
                Ok(0) => {
                    self.mark_dead();
                    break Err(DeviceError::NotConnected);
                }
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e.into()),
            }
        };
        self.stream.set_nonblocking(false)?;
        result
    }

    fn write_all(&mut self, buf: &[u8]) -> Result<(), DeviceError> {
        self.check()?;
        match self.stream.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(DeviceError::Timeout)
            }
            Err(e) => {
                if matches!(e.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) {
                    self.mark_dead();
                }
                Err(e.into())
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.check()?;
        match self.stream.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(DeviceError::Timeout)
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.mark_dead();
                Err(DeviceError::NotConnected)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.stream.shutdown(Shutdown::Both) {
            debug!("TCP shutdown failed: {}", e);
        }
        self.mark_dead();
    }
}

struct Peer {
    stream: TcpStream,
    alive: Arc<AtomicBool>,
}

/// Nimmt neue Gegenstellen an und meldet alle noch lebenden
pub struct TcpScanner {
    listener: TcpListener,
    timeout: Duration,
    peers: HashMap<String, Peer>,
}

impl TcpScanner {
    pub fn bind(addr: SocketAddr, timeout: Duration) -> Result<Self, DeviceError> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("Listening for TCP bridges on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            timeout,
            peers: HashMap::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DeviceError> {
        Ok(self.listener.local_addr()?)
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        warn!("Rejecting TCP peer {}: {}", addr, e);
                        continue;
                    }
                    let id = addr.ip().to_string();
                    info!("TCP bridge connected from {}", id);
                    if let Some(old) = self.peers.insert(
                        id,
                        Peer {
                            stream,
                            alive: Arc::new(AtomicBool::new(true)),
                        },
                    ) {
                        old.alive.store(false, Ordering::SeqCst);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("Accepting TCP peer failed: {}", e);
                    break;
                }
            }
        }
    }
}

impl DeviceScanner for TcpScanner {
    fn name(&self) -> &str {
        KIND
    }

    fn scan(&mut self) -> Vec<DeviceDescriptor> {
        self.accept_pending();

        self.peers.retain(|id, peer| {
            let alive = peer.alive.load(Ordering::SeqCst);
            if !alive {
                info!("TCP bridge {} closed", id);
            }
            alive
        });

        let mut descriptors = Vec::with_capacity(self.peers.len());
        for (id, peer) in &self.peers {
            let stream = match peer.stream.try_clone() {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Cannot share TCP stream of {}: {}", id, e);
                    continue;
                }
            };
            let info = bridge_info(id, format!("Controller {id}"), KIND);
            let factory_info = info.clone();
            let alive = peer.alive.clone();
            let timeout = self.timeout;
            descriptors.push(DeviceDescriptor::new(info, move || {
                let link = TcpLink::new(stream.try_clone()?, timeout, alive.clone());
                Ok(Box::new(BridgeDevice::new(factory_info.clone(), link)) as Box<dyn InputDevice>)
            }));
        }
        descriptors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::bridge::{BridgeInfo, RawState, INFO_REQUEST, STATE_REQUEST};
    use crate::codec::SensorScale;
    use crate::device::Device;
    use std::thread;
    use std::time::Instant;

    fn scan_until(scanner: &mut TcpScanner, expected: usize) -> Vec<DeviceDescriptor> {
        for _ in 0..100 {
            let found = scanner.scan();
            if found.len() == expected {
                return found;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("scanner never reported {expected} peers");
    }

    #[test]
    fn peer_becomes_device_and_is_dropped_on_close() {
        let mut scanner =
            TcpScanner::bind("127.0.0.1:0".parse().unwrap(), Duration::from_millis(500)).unwrap();
        let addr = scanner.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            let mut op = [0u8; 1];
            // Info-Anfrage
            stream.read_exact(&mut op).unwrap();
            assert_eq!(op[0], INFO_REQUEST);
            let info = BridgeInfo {
                axes: 12,
                buttons: 32,
                povs: 2,
                scale: SensorScale::new(4, 2000),
            };
            stream.write_all(&info.encode(Framing::TCP.info_len)).unwrap();
            // State-Anfrage
            stream.read_exact(&mut op).unwrap();
            assert_eq!(op[0], STATE_REQUEST);
            let mut state = RawState::default();
            state.axes[0] = i16::MAX;
            stream.write_all(&state.encode(Framing::TCP.state_len)).unwrap();
        });

        let found = scan_until(&mut scanner, 1);
        assert_eq!(found[0].id(), "127.0.0.1");

        let mut device: Device = found[0].open().unwrap();
        device.connect().unwrap();
        let report = device.read_input().clone();
        assert!(device.is_fresh());
        assert_eq!(report.axes()[0], 1.0);

        peer.join().unwrap();

        // Gegenstelle ist weg: nächster Lesevorgang bemerkt EOF
        for _ in 0..10 {
            device.read_input();
            if !device.is_connected() {
                break;
            }
        }
        assert!(!device.is_connected());
        assert!(scan_until(&mut scanner, 0).is_empty());
    }

    #[test]
    fn write_to_stalled_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        // Gegenstelle liest nie
        let (_stalled, _) = listener.accept().unwrap();

        let mut link = TcpLink::new(
            client,
            Duration::from_millis(200),
            Arc::new(AtomicBool::new(true)),
        );
        link.open().unwrap();

        let chunk = vec![0u8; 1 << 20];
        let started = Instant::now();
        let mut result = Ok(());
        for _ in 0..64 {
            result = link.write_all(&chunk);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(DeviceError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(link.is_open());
    }
}
