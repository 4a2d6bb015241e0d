use thiserror::Error;

/// Reasons a byte sequence is rejected by the APDU parser.
///
/// These surface through the relay's validation-error callback, so the
/// display strings are written for log lines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ApduError {
    /// Fewer bytes than one complete encoding of the leading APDU.
    #[error("truncated APDU ({len} bytes)")]
    Truncated { len: usize },

    /// INS bytes 0x00 and 0xFF are invalid in a command APDU.
    #[error("invalid INS 0x{0:02X}")]
    InvalidIns(u8),

    /// A CLA with low nibble 0xF is reserved.
    #[error("reserved CLA 0x{0:02X}")]
    ReservedCla(u8),

    /// Lc does not match the length of the command data.
    #[error("Lc is {lc} but data is {data_len} bytes")]
    LengthMismatch { lc: u16, data_len: usize },
}
