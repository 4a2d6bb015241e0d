use std::io::Write;
use std::thread;

use flexi_logger::{DeferredNow, Duplicate, FileSpec, Logger, LoggerHandle, WriteMode};
use log::Record;

/// Set up file logging under `logs/`, duplicated to stderr from info level
/// up. The returned handle must stay alive for the process lifetime.
pub fn init_logger() -> Result<LoggerHandle, Box<dyn std::error::Error>> {
    let handle = Logger::try_with_env_or_str("info")?
        .log_to_file(FileSpec::default().directory("logs").suppress_timestamp())
        .append()
        .duplicate_to_stderr(Duplicate::Info)
        .write_mode(WriteMode::BufferAndFlush)
        .format(line_format)
        .start()?;
    Ok(handle)
}

/// One line per record: local time with milliseconds, level, the emitting
/// thread (workers are named, so log lines attribute to rx/tx/direction
/// workers), source location, then the message.
fn line_format(w: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    write!(
        w,
        "{} {:5} [{}] {}:{} {}",
        now.format("%Y-%m-%d %H:%M:%S%.3f"),
        record.level(),
        thread::current().name().unwrap_or("main"),
        record.file().unwrap_or("?"),
        record.line().unwrap_or(0),
        record.args()
    )
}
