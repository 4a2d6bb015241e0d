//! Serial pipeline: one duplex endpoint, two rings, two workers.
//!
//! The rx worker moves bytes from the port into the rx ring; the tx worker
//! drains the tx ring onto the port. Both are plain named threads that poll
//! with a 100 µs idle sleep and watch a shared stop flag, so `stop()` is
//! observed within one sleep interval plus one 1 ms port timeout.
//!
//! Overflow policy on rx is freshness over completeness: when the ring has
//! no room for a chunk just read from the port, the backlog is dropped and
//! the newest bytes admitted. The port is never stalled by a slow consumer.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::errors::{BufferError, PipelineError, PortError};
use crate::port::{self, PortOpener, RelayPort, SerialConfig};
use crate::ring::RingBuffer;

/// Stack chunk moved per worker iteration.
const CHUNK: usize = 1024;

/// Idle wait when a worker has nothing to do.
const IDLE_SLEEP: Duration = Duration::from_micros(100);

/// How long `stop()` waits for a worker before detaching it.
const JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Invoked from worker context on a fatal port error. Must not block.
pub type ErrorCallback = Arc<dyn Fn(&PortError) + Send + Sync>;

/// Lifecycle states of a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            PipelineState::Stopped => "stopped",
            PipelineState::Starting => "starting",
            PipelineState::Running => "running",
            PipelineState::Stopping => "stopping",
            PipelineState::Error => "error",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Monotonic per-pipeline counters, written by the workers.
#[derive(Debug, Default)]
struct PipelineCounters {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    rx_errors: AtomicU64,
    tx_errors: AtomicU64,
}

/// Copyable view of the pipeline counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
}

/// One duplex serial endpoint with buffered rx/tx and background workers.
pub struct SerialPipeline {
    config: SerialConfig,
    opener: PortOpener,
    rx_ring: Arc<RingBuffer>,
    tx_ring: Arc<RingBuffer>,
    counters: Arc<PipelineCounters>,
    state: Arc<Mutex<PipelineState>>,
    stop: Mutex<Arc<AtomicBool>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Extra handle to the open port, kept for `flush_tx`.
    port: Mutex<Option<Box<dyn RelayPort>>>,
    on_error: Arc<Mutex<Option<ErrorCallback>>>,
}

impl SerialPipeline {
    /// Pipeline over a real serial device with `buffer_size`-byte rings.
    pub fn new(config: SerialConfig, buffer_size: usize) -> Self {
        Self::with_opener(config, buffer_size, Box::new(port::open_port))
    }

    /// Pipeline whose endpoint comes from `opener` instead of the OS serial
    /// layer. Tests wire in-memory ports through this.
    pub fn with_opener(config: SerialConfig, buffer_size: usize, opener: PortOpener) -> Self {
        Self {
            config,
            opener,
            rx_ring: Arc::new(RingBuffer::new(buffer_size)),
            tx_ring: Arc::new(RingBuffer::new(buffer_size)),
            counters: Arc::new(PipelineCounters::default()),
            state: Arc::new(Mutex::new(PipelineState::Stopped)),
            stop: Mutex::new(Arc::new(AtomicBool::new(false))),
            workers: Mutex::new(Vec::new()),
            port: Mutex::new(None),
            on_error: Arc::new(Mutex::new(None)),
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.state.lock().unwrap()
    }

    pub fn is_running(&self) -> bool {
        self.state() == PipelineState::Running
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            bytes_received: self.counters.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            rx_errors: self.counters.rx_errors.load(Ordering::Relaxed),
            tx_errors: self.counters.tx_errors.load(Ordering::Relaxed),
        }
    }

    /// Fill ratio of the receive ring, 0.0..=1.0.
    pub fn rx_fill_ratio(&self) -> f64 {
        self.rx_ring.fill_ratio()
    }

    /// Fill ratio of the transmit ring, 0.0..=1.0.
    pub fn tx_fill_ratio(&self) -> f64 {
        self.tx_ring.fill_ratio()
    }

    /// Install the fatal-error callback. Replaces any previous one.
    pub fn set_error_callback(&self, callback: ErrorCallback) {
        *self.on_error.lock().unwrap() = Some(callback);
    }

    /// Open the port, clear both rings and launch the workers.
    pub fn start(&self) -> Result<(), PipelineError> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != PipelineState::Stopped {
                return Err(PipelineError::NotStopped(state.as_str()));
            }
            *state = PipelineState::Starting;
        }
        match self.bring_up() {
            Ok(()) => {
                *self.state.lock().unwrap() = PipelineState::Running;
                info!("pipeline {} running", self.config.port);
                Ok(())
            }
            Err(e) => {
                *self.state.lock().unwrap() = PipelineState::Error;
                error!("pipeline {} failed to start: {e}", self.config.port);
                Err(e)
            }
        }
    }

    fn bring_up(&self) -> Result<(), PipelineError> {
        let rx_port = (self.opener)(&self.config)?;
        let tx_port = rx_port.try_clone()?;
        let flush_port = rx_port.try_clone()?;

        self.rx_ring.clear();
        self.tx_ring.clear();

        let stop = Arc::new(AtomicBool::new(false));
        *self.stop.lock().unwrap() = stop.clone();

        let rx_ctx = WorkerCtx {
            ring: self.rx_ring.clone(),
            counters: self.counters.clone(),
            stop: stop.clone(),
            state: self.state.clone(),
            on_error: self.on_error.clone(),
            port_name: self.config.port.clone(),
        };
        let tx_ctx = WorkerCtx {
            ring: self.tx_ring.clone(),
            counters: self.counters.clone(),
            stop,
            state: self.state.clone(),
            on_error: self.on_error.clone(),
            port_name: self.config.port.clone(),
        };

        let rx = thread::Builder::new()
            .name("serial-rx".into())
            .spawn(move || rx_loop(rx_port, rx_ctx))
            .map_err(|e| PipelineError::Port(PortError::Io(e)))?;
        let tx = thread::Builder::new()
            .name("serial-tx".into())
            .spawn(move || tx_loop(tx_port, tx_ctx))
            .map_err(|e| PipelineError::Port(PortError::Io(e)))?;

        let mut workers = self.workers.lock().unwrap();
        workers.push(rx);
        workers.push(tx);
        *self.port.lock().unwrap() = Some(flush_port);
        Ok(())
    }

    /// Signal the workers, join them with a bounded timeout and release the
    /// port. Safe to call from any state; a no-op when already stopped.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if matches!(*state, PipelineState::Stopped | PipelineState::Stopping) {
                return;
            }
            *state = PipelineState::Stopping;
        }
        self.stop.lock().unwrap().store(true, Ordering::Relaxed);
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in workers {
            join_with_timeout(handle, JOIN_TIMEOUT);
        }
        *self.port.lock().unwrap() = None;
        *self.state.lock().unwrap() = PipelineState::Stopped;
        info!("pipeline {} stopped", self.config.port);
    }

    /// Queue bytes for transmission. Returns how many were accepted: all of
    /// them, or zero when the tx ring lacks space or the pipeline is not
    /// running. The caller decides whether to retry.
    pub fn write(&self, data: &[u8]) -> usize {
        if !self.is_running() {
            return 0;
        }
        match self.tx_ring.write(data) {
            Ok(n) => n,
            Err(BufferError::NoSpace { .. }) => 0,
        }
    }

    /// Take up to `max` received bytes, or `None` when there are none.
    pub fn read(&self, max: usize) -> Option<Vec<u8>> {
        if !self.is_running() {
            return None;
        }
        self.rx_ring.read(max).map(|view| view.to_vec())
    }

    /// Look at up to `max` received bytes without consuming them.
    pub fn peek(&self, max: usize) -> Option<Vec<u8>> {
        self.rx_ring.peek(max).map(|view| view.to_vec())
    }

    /// Append up to `max` received bytes to `out`; returns how many arrived.
    pub(crate) fn read_into(&self, out: &mut Vec<u8>, max: usize) -> usize {
        if !self.is_running() {
            return 0;
        }
        match self.rx_ring.read(max) {
            Some(view) => {
                out.extend_from_slice(&view);
                view.len()
            }
            None => 0,
        }
    }

    /// Ask the OS to drain its serial output buffer.
    pub fn flush_tx(&self) {
        if let Some(port) = self.port.lock().unwrap().as_mut() {
            if let Err(e) = port.flush() {
                warn!("flush on {} failed: {e}", self.config.port);
            }
        }
    }
}

impl Drop for SerialPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Everything a port worker shares with its pipeline.
struct WorkerCtx {
    ring: Arc<RingBuffer>,
    counters: Arc<PipelineCounters>,
    stop: Arc<AtomicBool>,
    state: Arc<Mutex<PipelineState>>,
    on_error: Arc<Mutex<Option<ErrorCallback>>>,
    port_name: String,
}

fn rx_loop(mut port: Box<dyn RelayPort>, ctx: WorkerCtx) {
    let mut chunk = [0u8; CHUNK];
    while !ctx.stop.load(Ordering::Relaxed) {
        let pending = match port.bytes_to_read() {
            Ok(n) => n,
            Err(e) => {
                if fail(&ctx, &ctx.counters.rx_errors, &e) {
                    break;
                }
                continue;
            }
        };
        if pending == 0 {
            thread::sleep(IDLE_SLEEP);
            continue;
        }
        let want = pending.min(chunk.len());
        match port.read(&mut chunk[..want]) {
            Ok(0) => thread::sleep(IDLE_SLEEP),
            Ok(got) => {
                ctx.counters
                    .bytes_received
                    .fetch_add(got as u64, Ordering::Relaxed);
                push_drop_oldest(&ctx.ring, &chunk[..got]);
            }
            Err(e) => {
                if fail(&ctx, &ctx.counters.rx_errors, &e) {
                    break;
                }
            }
        }
    }
    debug!("rx worker for {} exiting", ctx.port_name);
}

fn tx_loop(mut port: Box<dyn RelayPort>, ctx: WorkerCtx) {
    let mut chunk = [0u8; CHUNK];
    'outer: while !ctx.stop.load(Ordering::Relaxed) {
        let n = match ctx.ring.read(chunk.len()) {
            Some(view) => {
                let n = view.len();
                chunk[..n].copy_from_slice(&view);
                n
            }
            None => 0,
        };
        if n == 0 {
            thread::sleep(IDLE_SLEEP);
            continue;
        }
        let mut written = 0;
        while written < n && !ctx.stop.load(Ordering::Relaxed) {
            match port.write(&chunk[written..n]) {
                // Write timeout: the bytes count as unwritten, try again.
                Ok(0) => thread::sleep(IDLE_SLEEP),
                Ok(m) => {
                    written += m;
                    ctx.counters
                        .bytes_sent
                        .fetch_add(m as u64, Ordering::Relaxed);
                }
                Err(e) => {
                    if fail(&ctx, &ctx.counters.tx_errors, &e) {
                        break 'outer;
                    }
                }
            }
        }
    }
    debug!("tx worker for {} exiting", ctx.port_name);
}

/// Admit `data` to the ring, clearing the backlog first when it does not
/// fit. Chunks larger than the whole ring keep only their newest bytes.
fn push_drop_oldest(ring: &RingBuffer, data: &[u8]) {
    if ring.write(data).is_ok() {
        return;
    }
    ring.clear();
    let keep = &data[data.len().saturating_sub(ring.capacity())..];
    let _ = ring.write(keep);
    debug!("rx ring overflow, dropped backlog for {} new bytes", data.len());
}

/// Count one worker error; returns true when the loop must exit.
fn fail(ctx: &WorkerCtx, counter: &AtomicU64, e: &PortError) -> bool {
    counter.fetch_add(1, Ordering::Relaxed);
    if !e.is_fatal() {
        return false;
    }
    // During an orderly stop the port may legitimately error under us.
    if ctx.stop.load(Ordering::Relaxed) {
        return true;
    }
    error!("serial worker on {} failed: {e}", ctx.port_name);
    *ctx.state.lock().unwrap() = PipelineState::Error;
    let callback = ctx.on_error.lock().unwrap().clone();
    if let Some(callback) = callback {
        callback(e);
    }
    true
}

/// Join `handle`, giving up (and detaching the thread) after `timeout`.
pub(crate) fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(
                "worker `{}` did not stop within {timeout:?}; detaching",
                handle.thread().name().unwrap_or("<unnamed>")
            );
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let _ = handle.join();
}
