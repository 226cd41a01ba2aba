//! Protocol error types

use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Errors that can occur while encoding or decoding protocol lines
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A line exceeded the maximum accepted length
    #[error("Line too long: exceeds maximum of {max} bytes")]
    LineTooLong { max: usize },

    /// Malformed JSON payload
    #[error("Malformed message: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LinesCodecError> for ProtocolError {
    fn from(err: LinesCodecError) -> Self {
        match err {
            LinesCodecError::MaxLineLengthExceeded => ProtocolError::LineTooLong {
                max: crate::codec::MAX_LINE_LENGTH,
            },
            LinesCodecError::Io(e) => ProtocolError::Io(e),
        }
    }
}
