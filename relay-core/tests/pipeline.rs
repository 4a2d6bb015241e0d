//! Serial pipeline behavior against an in-memory endpoint.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use common::{MockEndpoint, wait_for};
use relay_core::pipeline::{PipelineState, SerialPipeline};
use relay_core::port::{PortOpener, SerialConfig};

const WAIT: Duration = Duration::from_secs(2);

fn pipeline_over(endpoint: &MockEndpoint, buffer_size: usize) -> SerialPipeline {
    let endpoint = endpoint.clone();
    let opener: PortOpener = Box::new(move |_cfg: &SerialConfig| Ok(endpoint.port()));
    SerialPipeline::with_opener(SerialConfig::new("mock0", 921_600), buffer_size, opener)
}

#[test]
fn bytes_flow_in_both_directions() {
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 8192);
    pipeline.start().unwrap();
    assert!(pipeline.is_running());

    endpoint.feed(b"from the wire");
    assert!(wait_for(WAIT, || pipeline.peek(64).is_some()));
    assert_eq!(pipeline.read(64).unwrap(), b"from the wire");
    assert_eq!(pipeline.stats().bytes_received, 13);

    assert_eq!(pipeline.write(b"to the wire"), 11);
    assert!(wait_for(WAIT, || endpoint.written() == b"to the wire"));
    assert_eq!(pipeline.stats().bytes_sent, 11);

    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn read_and_write_are_gated_on_running() {
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 64);
    assert_eq!(pipeline.write(b"abc"), 0);
    assert!(pipeline.read(16).is_none());

    pipeline.start().unwrap();
    pipeline.stop();
    assert_eq!(pipeline.write(b"abc"), 0);
}

#[test]
fn restart_reuses_the_pipeline() {
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 256);
    for round in 0u8..2 {
        pipeline.start().unwrap();
        endpoint.feed(&[round]);
        assert!(wait_for(WAIT, || pipeline.stats().bytes_received == u64::from(round) + 1));
        pipeline.stop();
        assert_eq!(pipeline.state(), PipelineState::Stopped);
    }
}

#[test]
fn double_start_is_rejected() {
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 64);
    pipeline.start().unwrap();
    assert!(pipeline.start().is_err());
    pipeline.stop();
}

#[test]
fn stop_is_idempotent() {
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 64);
    pipeline.stop();
    pipeline.start().unwrap();
    pipeline.stop();
    pipeline.stop();
    assert_eq!(pipeline.state(), PipelineState::Stopped);
}

#[test]
fn rx_overflow_drops_the_oldest_bytes() {
    // Ring of 16 bytes, burst of 32 before the consumer runs: the port is
    // fully drained but only the newest 16 bytes stay readable.
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 16);
    pipeline.start().unwrap();

    let burst: Vec<u8> = (0..32).collect();
    endpoint.feed(&burst);
    assert!(wait_for(WAIT, || pipeline.stats().bytes_received == 32));

    assert!(wait_for(WAIT, || pipeline.peek(32).is_some()));
    assert_eq!(pipeline.read(32).unwrap(), &burst[16..]);
    pipeline.stop();
}

#[test]
fn tx_ring_overflow_reports_zero_queued() {
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 4);
    pipeline.start().unwrap();
    // Twelve bytes can never fit a four-byte ring.
    assert_eq!(pipeline.write(&[0u8; 12]), 0);
    pipeline.stop();
    assert!(endpoint.written().is_empty());
}

#[test]
fn vanished_device_fails_the_pipeline() {
    let endpoint = MockEndpoint::new();
    let pipeline = pipeline_over(&endpoint, 64);
    let failures = Arc::new(AtomicUsize::new(0));
    let seen = failures.clone();
    pipeline.set_error_callback(Arc::new(move |_e| {
        seen.fetch_add(1, Ordering::Relaxed);
    }));
    pipeline.start().unwrap();

    endpoint.disconnect();
    assert!(wait_for(WAIT, || pipeline.state() == PipelineState::Error));
    assert!(wait_for(WAIT, || failures.load(Ordering::Relaxed) >= 1));
    assert!(pipeline.stats().rx_errors >= 1);
    pipeline.stop();
}

#[test]
fn open_failure_moves_the_pipeline_to_error() {
    let opener: PortOpener = Box::new(|cfg: &SerialConfig| {
        Err(relay_core::errors::PortError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no such device `{}`", cfg.port),
        )))
    });
    let pipeline = SerialPipeline::with_opener(SerialConfig::new("missing", 921_600), 64, opener);
    assert!(pipeline.start().is_err());
    assert_eq!(pipeline.state(), PipelineState::Error);
}
