use thiserror::Error;

/// All errors that can occur on the ring buffer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// A write larger than the remaining space. Writes are all-or-nothing,
    /// so the buffer content is unchanged after this error.
    #[error("no space for {requested} bytes ({available} available)")]
    NoSpace { requested: usize, available: usize },
}
