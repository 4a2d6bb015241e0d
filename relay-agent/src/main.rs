use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use relay_core::Relay;

mod config;
mod logger;

/// Entry point for the relay agent.
/// Initializes logging and configuration, wires the relay's callbacks into
/// the log, starts both directions, and then emits a JSON metric snapshot
/// per direction at the configured interval until the relay dies or the
/// process is killed.
fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Keep logger alive for the duration of the process.
    let _logger = logger::init_logger()?;

    let config_path = config::find_config_file();
    let cfg = config::Config::load(&config_path)?;
    info!("Configuration loaded from {}", config_path.display());

    let visible = relay_core::port::list_ports();
    if !visible.is_empty() {
        info!("Serial ports visible: {}", visible.join(", "));
    }
    let candidates = relay_core::port::find_nfc_ports();
    if !candidates.is_empty() {
        info!("Likely NFC hardware: {}", candidates.join(", "));
    }

    let relay = Relay::new(cfg.relay.clone());
    relay.on_error(|e| error!("relay error: {e}"));
    relay.on_validation_error(|direction, prefix, reason| {
        warn!("{direction}: resynchronized after {reason}; head bytes {prefix:02X?}");
    });

    relay.start()?;
    info!(
        "Relay running: {} <-> {} at {} baud",
        cfg.relay.client_port, cfg.relay.host_port, cfg.relay.baudrate
    );

    let interval = Duration::from_secs(cfg.monitor.snapshot_interval_secs);
    loop {
        thread::sleep(interval);

        for (direction, snapshot) in relay.metrics() {
            match serde_json::to_string(&snapshot) {
                Ok(json) => info!("{direction} {json}"),
                Err(e) => warn!("failed to serialize snapshot: {e}"),
            }
        }
        if cfg.monitor.log_totals {
            let stats = relay.stats();
            info!(
                "totals: c2h {} APDUs / {} B, h2c {} APDUs / {} B, {} validation errors, {} retries, up {:.0}s",
                stats.client_to_host_apdus,
                stats.client_to_host_bytes,
                stats.host_to_client_apdus,
                stats.host_to_client_bytes,
                stats.validation_errors,
                stats.retries,
                stats.uptime_seconds
            );
        }

        if !relay.is_running() {
            error!("relay left the running state; shutting down");
            relay.stop();
            return Err("relay failed".into());
        }
    }
}
