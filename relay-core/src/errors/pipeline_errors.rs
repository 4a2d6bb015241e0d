use thiserror::Error;

use super::PortError;

/// Errors from the serial pipeline lifecycle.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The underlying endpoint failed to open or clone.
    #[error(transparent)]
    Port(#[from] PortError),

    /// `start()` on a pipeline that is not stopped.
    #[error("pipeline is {0}, expected stopped")]
    NotStopped(&'static str),
}
