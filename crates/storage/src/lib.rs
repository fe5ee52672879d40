//! Streaming image writer for shared storage.
//!
//! A client streams a (possibly compressed) disk image over a plain TCP
//! data channel. The [`ImageWriter`] receives it on a dedicated worker
//! thread, decompresses it, optionally validates it against a
//! [`BlockMap`], and commits it to a [`StorageSink`].
//!
//! # Wire format
//!
//! Raw bytes, no framing. The client connects to the port returned by
//! [`ImageWriter::start`] and writes the image; the end of the transfer is
//! declared out of band with [`ImageWriter::flush`].

pub mod bmap;
pub mod compression;
pub mod error;
mod ingress;
pub mod sink;
pub mod writer;

pub use bmap::{BlockMap, BlockRange, ChecksumType};
pub use compression::Compression;
pub use error::{BmapError, WriterError};
pub use sink::{SeekSink, StorageSink};
pub use writer::{ImageWriter, WriterConfig};

use std::time::Duration;

/// Per-receive timeout of the writer loop.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Size of a network chunk (1 MB).
pub const DEFAULT_CHUNK_SIZE: usize = 1024 * 1024;

/// Bytes allowed to sit in the receive queue before the data channel
/// stops reading from the socket (16 MB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * DEFAULT_CHUNK_SIZE;

/// Idle receive windows tolerated before a transfer is declared stalled.
pub const STALL_TOLERANCE: u32 = 1;
