use std::io;

use thiserror::Error;

/// Errors from a serial endpoint.
#[derive(Debug, Error)]
pub enum PortError {
    /// The port could not be opened or configured.
    #[error("failed to open serial port `{port}`: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    /// A read or write on an open port failed.
    #[error("serial I/O error: {0}")]
    Io(#[from] io::Error),

    /// The device went away (unplugged cable, vanished USB adapter).
    #[error("serial port `{port}` disconnected")]
    Disconnected { port: String },
}

impl PortError {
    /// Transient conditions keep the worker loop alive; anything else tears
    /// the pipeline down.
    pub fn is_fatal(&self) -> bool {
        match self {
            PortError::Io(e) => !matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ),
            _ => true,
        }
    }
}
