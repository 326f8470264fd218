//! Wire codec error types.

use thiserror::Error;

/// Wire codec errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {size} > {limit}")]
    Size {
        /// Announced or buffered size
        size: usize,
        /// Configured limit
        limit: usize,
    },

    /// Frame trailer does not match the payload
    #[error("frame checksum mismatch: expected {expected:#010x}, got {actual:#010x}")]
    Checksum {
        /// Checksum carried by the frame
        expected: u32,
        /// Checksum computed over the payload
        actual: u32,
    },

    /// Malformed frame structure
    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}
