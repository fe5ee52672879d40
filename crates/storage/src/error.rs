//! Error types for the image writer.

use std::io;
use std::time::Duration;

/// Errors produced by the image writer.
#[derive(Debug, thiserror::Error)]
pub enum WriterError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("unsupported image compression: {0}")]
    UnknownCompression(String),

    #[error(transparent)]
    Bmap(#[from] BmapError),

    #[error("transfer stalled: no data received for {0:?}")]
    Stalled(Duration),

    #[error("transfer size mismatch: declared {declared} bytes, received {received}")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("data channel closed")]
    ChannelClosed,

    #[error("block map cannot change while a transfer is running")]
    Busy,
}

impl WriterError {
    /// Recovers a block-map error that travelled through a decoder as an
    /// [`io::Error`].
    pub(crate) fn from_io(err: io::Error) -> Self {
        match err.downcast::<BmapError>() {
            Ok(bmap) => WriterError::Bmap(bmap),
            Err(err) => WriterError::Io(err),
        }
    }
}

/// Errors produced by block-map parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum BmapError {
    #[error("invalid block map: {0}")]
    Descriptor(String),

    #[error("checksum mismatch in blocks {first}-{last}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        first: u64,
        last: u64,
        expected: String,
        actual: String,
    },

    #[error("image ended before blocks {first}-{last} were complete")]
    Incomplete { first: u64, last: u64 },
}

impl From<BmapError> for io::Error {
    fn from(err: BmapError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}
