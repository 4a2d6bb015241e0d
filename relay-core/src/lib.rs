//! Bidirectional ISO 7816-4 APDU relay between two serial endpoints.
//!
//! The crate forwards command/response APDUs between a "client" side
//! (emulated card, reader-facing) and a "host" side (target card,
//! terminal-facing) while framing the byte stream, enforcing structural
//! validity and measuring per-direction latency with nanosecond precision.
//!
//! Layering, leaves first:
//!
//! * [`ring`]: bounded SPSC byte rings backing every pipeline
//! * [`apdu`]: stateless framer/parser over the relayed stream
//! * [`port`]: the serial endpoint seam and port discovery
//! * [`pipeline`]: one duplex endpoint plus its rx/tx workers
//! * [`metrics`]: latency meters, throughput counters, snapshots
//! * [`relay`]: the coordinator joining both directions
//!
//! The [`relay::Relay`] API is the single in-process surface; control
//! planes, telemetry publishers and other collaborators live outside this
//! crate and consume its snapshots and callbacks.

pub mod apdu;
pub mod errors;
pub mod metrics;
pub mod pipeline;
pub mod port;
pub mod relay;
pub mod ring;

pub use apdu::Apdu;
pub use metrics::{
    BufferUsage, LatencyMeter, LatencyStats, MeasurementHandle, MetricSnapshot, MetricsCollector,
    ThroughputStats,
};
pub use pipeline::{PipelineState, PipelineStats, SerialPipeline};
pub use port::{RelayPort, SerialConfig};
pub use relay::{Direction, Relay, RelayConfig, RelayState, RelayStats};
pub use ring::RingBuffer;
