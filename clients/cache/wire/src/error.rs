//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Buffer shorter than the fixed header being decoded
    #[error("incomplete header")]
    Incomplete,

    /// Negative or out-of-range length field
    #[error("invalid length {0}")]
    Length(i32),
}
