//! Bidirectional APDU relay coordinator.
//!
//! `Relay` wires two serial pipelines together and runs one direction worker
//! per flow. Each worker drains its source rx ring into a private staging
//! buffer, extracts complete APDUs with the framer, and forwards them into
//! the destination tx ring under a latency measurement, retrying short
//! writes with a 1 ms back-off. The two directions share nothing mutable
//! beyond the cumulative counters, so neither can stall the other.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::apdu::{self, Apdu};
use crate::errors::{ApduError, PortError, RelayError};
use crate::metrics::{BufferUsage, LatencyMeter, MetricSnapshot, MetricsCollector};
use crate::pipeline::{self, SerialPipeline};
use crate::port::{self, SerialConfig, SharedPortOpener};

/// Bytes pulled from a source pipeline per worker iteration.
const CHUNK: usize = 1024;

/// Cooperative yield between worker iterations.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// Back-off between enqueue attempts when a destination ring is full.
const RETRY_BACKOFF: Duration = Duration::from_millis(1);

/// How much of the staging buffer the validation-error callback sees.
const VALIDATION_PREFIX: usize = 10;

/// How long `stop()` waits for the direction workers.
const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Relay direction tag, as it appears in snapshot maps and callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    ClientToHost,
    HostToClient,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::ClientToHost => "client_to_host",
            Direction::HostToClient => "host_to_client",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle states of the relay, independent of the pipeline states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            RelayState::Stopped => "stopped",
            RelayState::Starting => "starting",
            RelayState::Running => "running",
            RelayState::Stopping => "stopping",
            RelayState::Error => "error",
        }
    }
}

impl fmt::Display for RelayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelayConfig {
    /// Endpoint facing the emulated card / reader.
    pub client_port: String,
    /// Endpoint facing the target card / terminal.
    pub host_port: String,
    #[serde(default = "default_baudrate")]
    pub baudrate: u32,
    /// Capacity of each of the four ring buffers, in bytes.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Soft latency alert threshold in milliseconds.
    #[serde(default = "default_latency_threshold_ms")]
    pub latency_threshold_ms: f64,
    /// Extra enqueue attempts when a destination ring is full.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_true")]
    pub enable_apdu_validation: bool,
}

fn default_baudrate() -> u32 {
    921_600
}

fn default_buffer_size() -> usize {
    8192
}

fn default_latency_threshold_ms() -> f64 {
    5.0
}

fn default_retry_attempts() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl RelayConfig {
    /// Configuration for the given ports with all defaults.
    pub fn new(client_port: impl Into<String>, host_port: impl Into<String>) -> Self {
        Self {
            client_port: client_port.into(),
            host_port: host_port.into(),
            baudrate: default_baudrate(),
            buffer_size: default_buffer_size(),
            latency_threshold_ms: default_latency_threshold_ms(),
            retry_attempts: default_retry_attempts(),
            enable_apdu_validation: default_true(),
        }
    }

    /// Reject configurations that cannot produce a working relay.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.client_port.is_empty() {
            return Err(RelayError::Config("client_port must not be empty".into()));
        }
        if self.host_port.is_empty() {
            return Err(RelayError::Config("host_port must not be empty".into()));
        }
        if self.buffer_size == 0 {
            return Err(RelayError::Config("buffer_size must be at least 1".into()));
        }
        if self.baudrate == 0 {
            return Err(RelayError::Config("baudrate must be greater than 0".into()));
        }
        Ok(())
    }

    fn client_serial(&self) -> SerialConfig {
        SerialConfig::new(&self.client_port, self.baudrate)
    }

    fn host_serial(&self) -> SerialConfig {
        SerialConfig::new(&self.host_port, self.baudrate)
    }
}

/// Cumulative relay counters.
///
/// Each direction worker writes only its own fields; a reader may observe
/// slight skew between fields, which is acceptable for this metric.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RelayStats {
    pub client_to_host_bytes: u64,
    pub host_to_client_bytes: u64,
    pub client_to_host_apdus: u64,
    pub host_to_client_apdus: u64,
    pub validation_errors: u64,
    pub retries: u64,
    pub uptime_seconds: f64,
}

#[derive(Debug, Default)]
struct Counters {
    client_to_host_bytes: AtomicU64,
    host_to_client_bytes: AtomicU64,
    client_to_host_apdus: AtomicU64,
    host_to_client_apdus: AtomicU64,
    validation_errors: AtomicU64,
    retries: AtomicU64,
}

impl Counters {
    fn for_direction(&self, direction: Direction) -> (&AtomicU64, &AtomicU64) {
        match direction {
            Direction::ClientToHost => (&self.client_to_host_bytes, &self.client_to_host_apdus),
            Direction::HostToClient => (&self.host_to_client_bytes, &self.host_to_client_apdus),
        }
    }

    fn snapshot(&self, uptime_seconds: f64) -> RelayStats {
        RelayStats {
            client_to_host_bytes: self.client_to_host_bytes.load(Ordering::Relaxed),
            host_to_client_bytes: self.host_to_client_bytes.load(Ordering::Relaxed),
            client_to_host_apdus: self.client_to_host_apdus.load(Ordering::Relaxed),
            host_to_client_apdus: self.host_to_client_apdus.load(Ordering::Relaxed),
            validation_errors: self.validation_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            uptime_seconds,
        }
    }
}

/// Invoked after each relayed APDU. Runs on the direction worker; keep it
/// non-blocking.
pub type ApduCallback = Arc<dyn Fn(Direction, &Apdu) + Send + Sync>;

/// Invoked when validation rejects bytes: direction, the staging prefix that
/// was in front of the parser (up to 10 bytes), and the reason.
pub type ValidationErrorCallback = Arc<dyn Fn(Direction, &[u8], &ApduError) + Send + Sync>;

/// Invoked on relay-level failures (pipeline death, runtime errors).
pub type RelayErrorCallback = Arc<dyn Fn(&RelayError) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    apdu_relayed: Mutex<Option<ApduCallback>>,
    validation_error: Mutex<Option<ValidationErrorCallback>>,
    error: Mutex<Option<RelayErrorCallback>>,
}

impl Callbacks {
    fn apdu_relayed(&self) -> Option<ApduCallback> {
        self.apdu_relayed.lock().unwrap().clone()
    }

    fn validation_error(&self) -> Option<ValidationErrorCallback> {
        self.validation_error.lock().unwrap().clone()
    }

    fn error(&self) -> Option<RelayErrorCallback> {
        self.error.lock().unwrap().clone()
    }
}

struct Pipelines {
    client: Arc<SerialPipeline>,
    host: Arc<SerialPipeline>,
}

/// Bidirectional APDU relay between a client-side and a host-side endpoint.
pub struct Relay {
    config: RelayConfig,
    opener: SharedPortOpener,
    state: Arc<Mutex<RelayState>>,
    pipelines: Mutex<Option<Pipelines>>,
    client_to_host: Arc<LatencyMeter>,
    host_to_client: Arc<LatencyMeter>,
    collector: MetricsCollector,
    counters: Arc<Counters>,
    callbacks: Arc<Callbacks>,
    stop: Mutex<Arc<AtomicBool>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started_at: Mutex<Option<Instant>>,
}

impl Relay {
    /// Relay over real serial devices.
    pub fn new(config: RelayConfig) -> Self {
        Self::with_port_opener(config, Arc::new(port::open_port))
    }

    /// Relay whose pipelines open endpoints through `opener`. Tests use this
    /// to wire in-memory ports.
    pub fn with_port_opener(config: RelayConfig, opener: SharedPortOpener) -> Self {
        let client_to_host = Arc::new(LatencyMeter::new());
        let host_to_client = Arc::new(LatencyMeter::new());
        for (direction, meter) in [
            (Direction::ClientToHost, &client_to_host),
            (Direction::HostToClient, &host_to_client),
        ] {
            meter.set_latency_threshold(config.latency_threshold_ms);
            meter.on_threshold_exceeded(move |elapsed, threshold| {
                warn!(
                    "{direction}: APDU took {:.3} ms (threshold {:.3} ms)",
                    elapsed as f64 / 1e6,
                    threshold as f64 / 1e6
                );
            });
        }
        let collector = MetricsCollector::new();
        collector.add_meter(Direction::ClientToHost.as_str(), client_to_host.clone());
        collector.add_meter(Direction::HostToClient.as_str(), host_to_client.clone());

        Self {
            config,
            opener,
            state: Arc::new(Mutex::new(RelayState::Stopped)),
            pipelines: Mutex::new(None),
            client_to_host,
            host_to_client,
            collector,
            counters: Arc::new(Counters::default()),
            callbacks: Arc::new(Callbacks::default()),
            stop: Mutex::new(Arc::new(AtomicBool::new(false))),
            workers: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn state(&self) -> RelayState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RelayState::Running
    }

    /// Seconds since the last successful `start()`, 0 before the first one.
    pub fn uptime(&self) -> f64 {
        self.started_at
            .lock()
            .unwrap()
            .map(|t| t.elapsed().as_secs_f64())
            .unwrap_or(0.0)
    }

    /// The latency meter serving one direction.
    pub fn meter(&self, direction: Direction) -> Arc<LatencyMeter> {
        match direction {
            Direction::ClientToHost => self.client_to_host.clone(),
            Direction::HostToClient => self.host_to_client.clone(),
        }
    }

    pub fn on_apdu_relayed(&self, callback: impl Fn(Direction, &Apdu) + Send + Sync + 'static) {
        *self.callbacks.apdu_relayed.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn on_validation_error(
        &self,
        callback: impl Fn(Direction, &[u8], &ApduError) + Send + Sync + 'static,
    ) {
        *self.callbacks.validation_error.lock().unwrap() = Some(Arc::new(callback));
    }

    pub fn on_error(&self, callback: impl Fn(&RelayError) + Send + Sync + 'static) {
        *self.callbacks.error.lock().unwrap() = Some(Arc::new(callback));
    }

    /// Build both pipelines, start them and launch the direction workers.
    ///
    /// On any failure everything already started is torn down and the relay
    /// lands in the error state (or stays stopped for configuration errors).
    pub fn start(&self) -> Result<(), RelayError> {
        self.config.validate()?;
        {
            let mut state = self.state.lock().unwrap();
            if *state != RelayState::Stopped {
                return Err(RelayError::NotStopped(state.as_str()));
            }
            *state = RelayState::Starting;
        }
        match self.bring_up() {
            Ok(()) => {
                *self.started_at.lock().unwrap() = Some(Instant::now());
                *self.state.lock().unwrap() = RelayState::Running;
                info!(
                    "relay running: {} <-> {}",
                    self.config.client_port, self.config.host_port
                );
                Ok(())
            }
            Err(e) => {
                *self.state.lock().unwrap() = RelayState::Error;
                if let Some(callback) = self.callbacks.error() {
                    callback(&e);
                }
                Err(e)
            }
        }
    }

    fn bring_up(&self) -> Result<(), RelayError> {
        let client = Arc::new(SerialPipeline::with_opener(
            self.config.client_serial(),
            self.config.buffer_size,
            self.boxed_opener(),
        ));
        let host = Arc::new(SerialPipeline::with_opener(
            self.config.host_serial(),
            self.config.buffer_size,
            self.boxed_opener(),
        ));
        client.set_error_callback(self.escalation());
        host.set_error_callback(self.escalation());

        client.start()?;
        if let Err(e) = host.start() {
            client.stop();
            return Err(e.into());
        }

        let stop = Arc::new(AtomicBool::new(false));
        *self.stop.lock().unwrap() = stop.clone();

        for direction in [Direction::ClientToHost, Direction::HostToClient] {
            let (source, dest) = match direction {
                Direction::ClientToHost => (client.clone(), host.clone()),
                Direction::HostToClient => (host.clone(), client.clone()),
            };
            let worker = DirectionWorker {
                direction,
                source,
                dest,
                meter: self.meter(direction),
                counters: self.counters.clone(),
                callbacks: self.callbacks.clone(),
                stop: stop.clone(),
                validate: self.config.enable_apdu_validation,
                retry_attempts: self.config.retry_attempts,
            };
            let handle = thread::Builder::new()
                .name(format!("relay-{}", direction.as_str()))
                .spawn(move || worker.run())
                .map_err(|e| {
                    self.shutdown_workers();
                    client.stop();
                    host.stop();
                    RelayError::Spawn(e)
                })?;
            self.workers.lock().unwrap().push(handle);
        }

        *self.pipelines.lock().unwrap() = Some(Pipelines { client, host });
        Ok(())
    }

    /// Cancel the workers, stop both pipelines and land in `Stopped`.
    /// Idempotent; callable from any state.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, RelayState::Stopped | RelayState::Stopping) {
                return;
            }
            *state = RelayState::Stopping;
        }
        self.shutdown_workers();
        if let Some(pipelines) = &*self.pipelines.lock().unwrap() {
            pipelines.client.stop();
            pipelines.host.stop();
        }
        *self.state.lock().unwrap() = RelayState::Stopped;
        info!("relay stopped");
    }

    /// Per-direction metric snapshots with live buffer-fill ratios.
    pub fn metrics(&self) -> HashMap<String, MetricSnapshot> {
        let mut snapshots = self.collector.all_snapshots();
        if let Some(pipelines) = &*self.pipelines.lock().unwrap() {
            if let Some(snapshot) = snapshots.get_mut(Direction::ClientToHost.as_str()) {
                snapshot.buffer_usage = BufferUsage {
                    rx_buffer: pipelines.client.rx_fill_ratio(),
                    tx_buffer: pipelines.host.tx_fill_ratio(),
                };
            }
            if let Some(snapshot) = snapshots.get_mut(Direction::HostToClient.as_str()) {
                snapshot.buffer_usage = BufferUsage {
                    rx_buffer: pipelines.host.rx_fill_ratio(),
                    tx_buffer: pipelines.client.tx_fill_ratio(),
                };
            }
        }
        snapshots
    }

    /// Cumulative byte/APDU/error/retry counts plus uptime.
    pub fn stats(&self) -> RelayStats {
        self.counters.snapshot(self.uptime())
    }

    fn shutdown_workers(&self) {
        self.stop.lock().unwrap().store(true, Ordering::Relaxed);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            pipeline::join_with_timeout(handle, JOIN_TIMEOUT);
        }
    }

    fn boxed_opener(&self) -> port::PortOpener {
        let opener = self.opener.clone();
        Box::new(move |cfg| opener(cfg))
    }

    /// Error callback handed to both pipelines: a fatal port error fails the
    /// relay and surfaces through the user's error callback.
    fn escalation(&self) -> pipeline::ErrorCallback {
        let state = self.state.clone();
        let callbacks = self.callbacks.clone();
        Arc::new(move |e: &PortError| {
            {
                let mut state = state.lock().unwrap();
                // An orderly shutdown must not be reclassified as a failure.
                if *state == RelayState::Running {
                    *state = RelayState::Error;
                }
            }
            if let Some(callback) = callbacks.error() {
                callback(&RelayError::Runtime(e.to_string()));
            }
        })
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

/// One direction of the relay: source rx ring → framer → destination tx ring.
struct DirectionWorker {
    direction: Direction,
    source: Arc<SerialPipeline>,
    dest: Arc<SerialPipeline>,
    meter: Arc<LatencyMeter>,
    counters: Arc<Counters>,
    callbacks: Arc<Callbacks>,
    stop: Arc<AtomicBool>,
    validate: bool,
    retry_attempts: u32,
}

impl DirectionWorker {
    fn run(self) {
        let mut staging = Vec::new();
        while !self.stop.load(Ordering::Relaxed) {
            self.source.read_into(&mut staging, CHUNK);
            self.drain_staging(&mut staging);
            thread::sleep(IDLE_SLEEP);
        }
        debug!("{} worker exiting", self.direction);
    }

    /// Extract and forward every complete APDU at the front of `staging`.
    fn drain_staging(&self, staging: &mut Vec<u8>) {
        while !staging.is_empty() && !self.stop.load(Ordering::Relaxed) {
            if !apdu::is_complete(staging) {
                break; // wait for more bytes
            }
            let parsed = match apdu::parse(staging, self.validate) {
                Ok(parsed) => parsed,
                Err(reason) => {
                    self.counters
                        .validation_errors
                        .fetch_add(1, Ordering::Relaxed);
                    if let Some(callback) = self.callbacks.validation_error() {
                        let prefix = &staging[..staging.len().min(VALIDATION_PREFIX)];
                        callback(self.direction, prefix, &reason);
                    }
                    // One-byte resynchronization: drop the offending byte
                    // and try again from the next one.
                    staging.drain(..1);
                    continue;
                }
            };
            let len = parsed.encoded_len();
            let handle = self.meter.start_measurement();
            if self.forward(&staging[..len]) {
                self.meter.end_measurement(handle);
                let (bytes, apdus) = self.counters.for_direction(self.direction);
                bytes.fetch_add(len as u64, Ordering::Relaxed);
                apdus.fetch_add(1, Ordering::Relaxed);
                if let Some(callback) = self.callbacks.apdu_relayed() {
                    callback(self.direction, &parsed);
                }
                self.meter.record_throughput(len as u64, 1);
            } else {
                // Destination stayed full through every retry; drop the APDU
                // rather than stalling the opposite direction. The
                // measurement still ends so the handle is not leaked.
                self.meter.record_error();
                self.meter.end_measurement(handle);
                warn!(
                    "{}: dropped {len}-byte APDU, destination buffer full",
                    self.direction
                );
            }
            staging.drain(..len);
        }
    }

    /// Enqueue `frame` into the destination tx ring, retrying short writes
    /// with a 1 ms back-off.
    fn forward(&self, frame: &[u8]) -> bool {
        for attempt in 0..=self.retry_attempts {
            if self.stop.load(Ordering::Relaxed) {
                return false;
            }
            if self.dest.write(frame) == frame.len() {
                return true;
            }
            if attempt < self.retry_attempts {
                self.counters.retries.fetch_add(1, Ordering::Relaxed);
                thread::sleep(RETRY_BACKOFF);
            }
        }
        false
    }
}
