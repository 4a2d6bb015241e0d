mod apdu_errors;
mod buffer_errors;
mod pipeline_errors;
mod port_errors;
mod relay_errors;

pub use apdu_errors::ApduError;
pub use buffer_errors::BufferError;
pub use pipeline_errors::PipelineError;
pub use port_errors::PortError;
pub use relay_errors::RelayError;
