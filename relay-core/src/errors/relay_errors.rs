use std::io;

use thiserror::Error;

use super::PipelineError;

/// Configuration and lifecycle errors of the relay coordinator.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The configuration was rejected before anything was started.
    #[error("invalid relay configuration: {0}")]
    Config(String),

    /// A pipeline failed while bringing the relay up; anything already
    /// started has been torn down again.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// `start()` on a relay that is not in the stopped state.
    #[error("relay is {0}, expected stopped")]
    NotStopped(&'static str),

    /// A pipeline hit a fatal port error while the relay was running.
    #[error("pipeline failed at runtime: {0}")]
    Runtime(String),
}
