//! In-memory serial endpoint double shared by the integration tests.
//!
//! A [`MockEndpoint`] stands in for one physical device: the test feeds
//! bytes that "arrive from the wire" and inspects what the relay wrote back
//! out. Cloned ports share the same wiring, mirroring `try_clone` on a real
//! serial handle.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use relay_core::errors::PortError;
use relay_core::port::{RelayPort, SerialConfig, SharedPortOpener};

#[derive(Default)]
struct Wires {
    /// Bytes travelling toward the relay.
    inbound: VecDeque<u8>,
    /// Bytes the relay wrote out.
    outbound: Vec<u8>,
    /// When set, reads fail like a vanished device.
    dead: bool,
}

/// Test handle for one mock endpoint.
#[derive(Clone, Default)]
pub struct MockEndpoint {
    wires: Arc<Mutex<Wires>>,
}

impl MockEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bytes` readable by the relay, as if they arrived on the wire.
    pub fn feed(&self, bytes: &[u8]) {
        self.wires
            .lock()
            .unwrap()
            .inbound
            .extend(bytes.iter().copied());
    }

    /// Everything the relay has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.wires.lock().unwrap().outbound.clone()
    }

    /// Simulate the device going away: subsequent reads fail.
    pub fn disconnect(&self) {
        self.wires.lock().unwrap().dead = true;
    }

    /// A `RelayPort` over this endpoint.
    pub fn port(&self) -> Box<dyn RelayPort> {
        Box::new(MockPort {
            wires: self.wires.clone(),
        })
    }
}

struct MockPort {
    wires: Arc<Mutex<Wires>>,
}

impl MockPort {
    fn dead_error() -> PortError {
        PortError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "mock device gone"))
    }
}

impl RelayPort for MockPort {
    fn bytes_to_read(&mut self) -> Result<usize, PortError> {
        let wires = self.wires.lock().unwrap();
        if wires.dead {
            return Err(Self::dead_error());
        }
        Ok(wires.inbound.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, PortError> {
        let mut wires = self.wires.lock().unwrap();
        if wires.dead {
            return Err(Self::dead_error());
        }
        let n = buf.len().min(wires.inbound.len());
        for slot in &mut buf[..n] {
            *slot = wires.inbound.pop_front().expect("length checked above");
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, PortError> {
        self.wires.lock().unwrap().outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), PortError> {
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn RelayPort>, PortError> {
        Ok(Box::new(MockPort {
            wires: self.wires.clone(),
        }))
    }
}

/// Opener mapping a relay's two port names onto two mock endpoints.
pub fn opener_for(
    client_name: &str,
    client: MockEndpoint,
    host_name: &str,
    host: MockEndpoint,
) -> SharedPortOpener {
    let client_name = client_name.to_string();
    let host_name = host_name.to_string();
    Arc::new(move |cfg: &SerialConfig| {
        if cfg.port == client_name {
            Ok(client.port())
        } else if cfg.port == host_name {
            Ok(host.port())
        } else {
            Err(PortError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no mock endpoint named `{}`", cfg.port),
            )))
        }
    })
}

/// Poll `cond` until it holds or `timeout` passes; returns the final result.
pub fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}
