//! Latency and throughput accounting for the relay data plane.
//!
//! Each relay direction owns a [`LatencyMeter`]. Workers bracket the
//! forwarding of one APDU with `start_measurement`/`end_measurement`; the
//! derived numbers (percentiles, throughput, error rate) are computed on
//! demand from a bounded window of recent samples and a handful of monotonic
//! counters. A [`MetricsCollector`] groups the per-direction meters into the
//! snapshot map the coordinator serves to its callers.
//!
//! Timing uses the monotonic clock with nanosecond precision; only the
//! snapshot timestamp is wall-clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

/// Samples kept for statistics, per meter.
const DEFAULT_WINDOW: usize = 100;

/// Alert threshold before `set_latency_threshold` is called: 5 ms.
const DEFAULT_THRESHOLD_NS: u64 = 5_000_000;

const NS_PER_MS: f64 = 1_000_000.0;

/// Invoked with (elapsed_ns, threshold_ns) when a measurement overruns the
/// configured threshold. Must not block; it runs on the worker thread.
pub type ThresholdCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Opaque token tying an `end_measurement` to its `start_measurement`.
///
/// Carries the start instant, so ending a measurement is one map removal
/// and a clock read. Handles are single-use by construction (consumed by
/// value) and refuse to settle against a foreign or reset meter.
#[derive(Debug)]
pub struct MeasurementHandle {
    id: u64,
    started: Instant,
}

struct MeterInner {
    samples: VecDeque<u64>,
    window: usize,
    live: HashSet<u64>,
    total_bytes: u64,
    total_messages: u64,
    errors: u64,
    epoch: Instant,
}

/// High-resolution latency meter with bounded history.
pub struct LatencyMeter {
    inner: Mutex<MeterInner>,
    next_id: AtomicU64,
    threshold_ns: AtomicU64,
    on_threshold: Mutex<Option<ThresholdCallback>>,
}

impl Default for LatencyMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl LatencyMeter {
    /// Meter with the default 100-sample window.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Meter keeping the most recent `window` samples.
    pub fn with_window(window: usize) -> Self {
        assert!(window > 0, "sample window must be at least 1");
        Self {
            inner: Mutex::new(MeterInner {
                samples: VecDeque::with_capacity(window),
                window,
                live: HashSet::new(),
                total_bytes: 0,
                total_messages: 0,
                errors: 0,
                epoch: Instant::now(),
            }),
            next_id: AtomicU64::new(0),
            threshold_ns: AtomicU64::new(DEFAULT_THRESHOLD_NS),
            on_threshold: Mutex::new(None),
        }
    }

    /// Begin timing one operation.
    pub fn start_measurement(&self) -> MeasurementHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().live.insert(id);
        MeasurementHandle {
            id,
            started: Instant::now(),
        }
    }

    /// Finish timing and fold the elapsed nanoseconds into the history.
    ///
    /// Returns `None` when the handle does not belong to a live measurement
    /// on this meter (for example after [`LatencyMeter::reset`]).
    pub fn end_measurement(&self, handle: MeasurementHandle) -> Option<u64> {
        let elapsed = handle.started.elapsed().as_nanos() as u64;
        {
            let mut inner = self.lock();
            if !inner.live.remove(&handle.id) {
                return None;
            }
            if inner.samples.len() == inner.window {
                inner.samples.pop_front();
            }
            inner.samples.push_back(elapsed);
        }
        let threshold = self.threshold_ns.load(Ordering::Relaxed);
        if elapsed > threshold {
            let callback = self.on_threshold.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(callback) = callback {
                callback(elapsed, threshold);
            }
        }
        Some(elapsed)
    }

    /// Fold processed bytes and message counts into the running totals.
    pub fn record_throughput(&self, bytes: u64, messages: u64) {
        let mut inner = self.lock();
        inner.total_bytes += bytes;
        inner.total_messages += messages;
    }

    /// Count one failed delivery.
    pub fn record_error(&self) {
        self.lock().errors += 1;
    }

    /// Errors recorded since construction (or the last reset).
    pub fn error_count(&self) -> u64 {
        self.lock().errors
    }

    /// Soft alert threshold in milliseconds. Crossing it fires the threshold
    /// callback but never fails the measurement.
    pub fn set_latency_threshold(&self, threshold_ms: f64) {
        self.threshold_ns
            .store((threshold_ms * NS_PER_MS) as u64, Ordering::Relaxed);
    }

    /// Install the threshold callback.
    pub fn on_threshold_exceeded(&self, callback: impl Fn(u64, u64) + Send + Sync + 'static) {
        *self.on_threshold.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(callback));
    }

    /// Statistics over the current sample window.
    pub fn latency_stats(&self) -> LatencyStats {
        let samples: Vec<u64> = self.lock().samples.iter().copied().collect();
        LatencyStats::from_samples(&samples)
    }

    /// Throughput since the meter was constructed (or last reset).
    pub fn throughput_stats(&self) -> ThroughputStats {
        let (bytes, messages, duration) = {
            let inner = self.lock();
            (
                inner.total_bytes,
                inner.total_messages,
                inner.epoch.elapsed().as_secs_f64(),
            )
        };
        if duration <= 0.0 {
            return ThroughputStats::default();
        }
        ThroughputStats {
            bytes_per_second: bytes as f64 / duration,
            messages_per_second: messages as f64 / duration,
            total_bytes: bytes,
            total_messages: messages,
            duration_seconds: duration,
        }
    }

    /// Errors per message, 0.0..=1.0. Zero while nothing has been relayed.
    pub fn error_rate(&self) -> f64 {
        let inner = self.lock();
        if inner.total_messages == 0 {
            return 0.0;
        }
        inner.errors as f64 / inner.total_messages as f64
    }

    /// Full metric snapshot with the given buffer usage attached.
    pub fn snapshot(&self, buffer_usage: BufferUsage) -> MetricSnapshot {
        MetricSnapshot {
            timestamp: unix_now(),
            latency: self.latency_stats(),
            throughput: self.throughput_stats(),
            error_rate: self.error_rate(),
            buffer_usage,
        }
    }

    /// Forget all samples, live measurements and counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.live.clear();
        inner.total_bytes = 0;
        inner.total_messages = 0;
        inner.errors = 0;
        inner.epoch = Instant::now();
    }

    fn lock(&self) -> MutexGuard<'_, MeterInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Latency statistics over the sample window, in nanoseconds.
///
/// Serializes to the wire shape collaborators expect: `count` plus the
/// millisecond projections of every other field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatencyStats {
    pub count: usize,
    pub min_ns: u64,
    pub max_ns: u64,
    pub mean_ns: f64,
    pub median_ns: f64,
    pub std_dev_ns: f64,
    pub p95_ns: u64,
    pub p99_ns: u64,
}

impl LatencyStats {
    fn from_samples(samples: &[u64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let count = samples.len();
        let mut sorted = samples.to_vec();
        sorted.sort_unstable();

        let mean = samples.iter().sum::<u64>() as f64 / count as f64;
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) as f64 / 2.0
        } else {
            sorted[count / 2] as f64
        };
        // Sample standard deviation (n - 1 denominator).
        let std_dev = if count > 1 {
            let variance = samples
                .iter()
                .map(|&s| {
                    let d = s as f64 - mean;
                    d * d
                })
                .sum::<f64>()
                / (count as f64 - 1.0);
            variance.sqrt()
        } else {
            0.0
        };

        Self {
            count,
            min_ns: sorted[0],
            max_ns: sorted[count - 1],
            mean_ns: mean,
            median_ns: median,
            std_dev_ns: std_dev,
            p95_ns: nearest_rank(&sorted, 0.95),
            p99_ns: nearest_rank(&sorted, 0.99),
        }
    }

    pub fn min_ms(&self) -> f64 {
        self.min_ns as f64 / NS_PER_MS
    }

    pub fn max_ms(&self) -> f64 {
        self.max_ns as f64 / NS_PER_MS
    }

    pub fn mean_ms(&self) -> f64 {
        self.mean_ns / NS_PER_MS
    }

    pub fn median_ms(&self) -> f64 {
        self.median_ns / NS_PER_MS
    }

    pub fn std_dev_ms(&self) -> f64 {
        self.std_dev_ns / NS_PER_MS
    }

    pub fn p95_ms(&self) -> f64 {
        self.p95_ns as f64 / NS_PER_MS
    }

    pub fn p99_ms(&self) -> f64 {
        self.p99_ns as f64 / NS_PER_MS
    }
}

impl Serialize for LatencyStats {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("LatencyStats", 8)?;
        s.serialize_field("count", &self.count)?;
        s.serialize_field("min_ms", &self.min_ms())?;
        s.serialize_field("max_ms", &self.max_ms())?;
        s.serialize_field("mean_ms", &self.mean_ms())?;
        s.serialize_field("median_ms", &self.median_ms())?;
        s.serialize_field("std_dev_ms", &self.std_dev_ms())?;
        s.serialize_field("p95_ms", &self.p95_ms())?;
        s.serialize_field("p99_ms", &self.p99_ms())?;
        s.end()
    }
}

/// Nearest-rank percentile over an ascending window.
fn nearest_rank(sorted: &[u64], q: f64) -> u64 {
    let rank = (q * sorted.len() as f64).ceil() as usize;
    sorted[rank.max(1) - 1]
}

/// Throughput derived from the monotonic totals.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ThroughputStats {
    pub bytes_per_second: f64,
    pub messages_per_second: f64,
    pub total_bytes: u64,
    pub total_messages: u64,
    pub duration_seconds: f64,
}

/// Fill ratios of the two ring buffers serving one relay direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct BufferUsage {
    pub rx_buffer: f64,
    pub tx_buffer: f64,
}

/// Point-in-time view of one direction's metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricSnapshot {
    /// Wall-clock seconds since the Unix epoch.
    pub timestamp: f64,
    pub latency: LatencyStats,
    pub throughput: ThroughputStats,
    pub error_rate: f64,
    pub buffer_usage: BufferUsage,
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

/// Named registry of latency meters.
#[derive(Default)]
pub struct MetricsCollector {
    meters: Mutex<HashMap<String, Arc<LatencyMeter>>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_meter(&self, name: impl Into<String>, meter: Arc<LatencyMeter>) {
        self.lock().insert(name.into(), meter);
    }

    pub fn remove_meter(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn meter(&self, name: &str) -> Option<Arc<LatencyMeter>> {
        self.lock().get(name).cloned()
    }

    /// Snapshot every registered meter. Buffer usage defaults to zero; the
    /// coordinator overlays live fill ratios before handing the map out.
    pub fn all_snapshots(&self) -> HashMap<String, MetricSnapshot> {
        self.lock()
            .iter()
            .map(|(name, meter)| (name.clone(), meter.snapshot(BufferUsage::default())))
            .collect()
    }

    pub fn reset_all(&self) {
        for meter in self.lock().values() {
            meter.reset();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<LatencyMeter>>> {
        self.meters.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn measurement_appends_one_sample() {
        let meter = LatencyMeter::new();
        let handle = meter.start_measurement();
        thread::sleep(Duration::from_millis(1));
        let elapsed = meter.end_measurement(handle).unwrap();
        assert!(elapsed >= 1_000_000);
        let stats = meter.latency_stats();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.min_ns, elapsed);
        assert_eq!(stats.max_ns, elapsed);
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let a = LatencyMeter::new();
        let b = LatencyMeter::new();
        let handle = a.start_measurement();
        // Same id space, different meter: `b` never started this one.
        assert_eq!(b.end_measurement(handle), None);
        assert_eq!(b.latency_stats().count, 0);
    }

    #[test]
    fn reset_invalidates_live_handles() {
        let meter = LatencyMeter::new();
        let handle = meter.start_measurement();
        meter.reset();
        assert_eq!(meter.end_measurement(handle), None);
        assert_eq!(meter.latency_stats().count, 0);
    }

    #[test]
    fn window_is_bounded() {
        let meter = LatencyMeter::with_window(3);
        for _ in 0..5 {
            let handle = meter.start_measurement();
            meter.end_measurement(handle);
        }
        assert_eq!(meter.latency_stats().count, 3);
    }

    #[test]
    fn stats_over_known_samples() {
        let samples: Vec<u64> = (1..=100).collect();
        let stats = LatencyStats::from_samples(&samples);
        assert_eq!(stats.count, 100);
        assert_eq!(stats.min_ns, 1);
        assert_eq!(stats.max_ns, 100);
        assert!((stats.mean_ns - 50.5).abs() < 1e-9);
        assert!((stats.median_ns - 50.5).abs() < 1e-9);
        // Sample std dev of 1..=100.
        assert!((stats.std_dev_ns - 29.011491975882016).abs() < 1e-6);
        assert_eq!(stats.p95_ns, 95);
        assert_eq!(stats.p99_ns, 99);
    }

    #[test]
    fn percentiles_on_tiny_windows() {
        let stats = LatencyStats::from_samples(&[7]);
        assert_eq!(stats.p95_ns, 7);
        assert_eq!(stats.p99_ns, 7);
        assert_eq!(stats.std_dev_ns, 0.0);

        let stats = LatencyStats::from_samples(&[10, 20]);
        assert_eq!(stats.p95_ns, 20);
        assert_eq!(stats.median_ns, 15.0);
    }

    #[test]
    fn throughput_accumulates() {
        let meter = LatencyMeter::new();
        meter.record_throughput(1000, 4);
        meter.record_throughput(24, 1);
        let stats = meter.throughput_stats();
        assert_eq!(stats.total_bytes, 1024);
        assert_eq!(stats.total_messages, 5);
        assert!(stats.duration_seconds > 0.0);
        assert!(stats.bytes_per_second > 0.0);
    }

    #[test]
    fn error_rate_guards_division_by_zero() {
        let meter = LatencyMeter::new();
        assert_eq!(meter.error_rate(), 0.0);
        meter.record_error();
        assert_eq!(meter.error_rate(), 0.0);
        assert_eq!(meter.error_count(), 1);
        meter.record_throughput(100, 4);
        assert_eq!(meter.error_rate(), 0.25);
    }

    #[test]
    fn threshold_callback_fires_on_overrun() {
        let meter = LatencyMeter::new();
        meter.set_latency_threshold(0.0001);
        let fired = Arc::new(AtomicBool::new(false));
        let seen = fired.clone();
        meter.on_threshold_exceeded(move |elapsed, threshold| {
            assert!(elapsed > threshold);
            seen.store(true, Ordering::Relaxed);
        });
        let handle = meter.start_measurement();
        thread::sleep(Duration::from_millis(1));
        meter.end_measurement(handle).unwrap();
        assert!(fired.load(Ordering::Relaxed));
    }

    #[test]
    fn snapshot_matches_the_wire_shape() {
        let meter = LatencyMeter::new();
        let handle = meter.start_measurement();
        meter.end_measurement(handle).unwrap();
        meter.record_throughput(12, 1);
        let snapshot = meter.snapshot(BufferUsage {
            rx_buffer: 0.25,
            tx_buffer: 0.5,
        });

        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json["timestamp"].as_f64().unwrap() > 0.0);
        let latency = &json["latency"];
        assert_eq!(latency["count"], 1);
        for key in [
            "min_ms", "max_ms", "mean_ms", "median_ms", "std_dev_ms", "p95_ms", "p99_ms",
        ] {
            assert!(latency[key].is_f64(), "missing latency key {key}");
        }
        assert_eq!(json["throughput"]["total_bytes"], 12);
        assert_eq!(json["throughput"]["total_messages"], 1);
        assert!(json["throughput"]["bytes_per_second"].as_f64().unwrap() > 0.0);
        assert_eq!(json["error_rate"], 0.0);
        assert_eq!(json["buffer_usage"]["rx_buffer"], 0.25);
        assert_eq!(json["buffer_usage"]["tx_buffer"], 0.5);
    }

    #[test]
    fn collector_snapshots_every_meter() {
        let collector = MetricsCollector::new();
        collector.add_meter("client_to_host", Arc::new(LatencyMeter::new()));
        collector.add_meter("host_to_client", Arc::new(LatencyMeter::new()));
        let snapshots = collector.all_snapshots();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots.contains_key("client_to_host"));
        assert!(snapshots.contains_key("host_to_client"));
        assert_eq!(snapshots["client_to_host"].latency.count, 0);
    }
}
