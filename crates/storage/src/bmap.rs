//! Block-map descriptors and streaming validation.
//!
//! A block map lists the ranges of an image that carry data, each with a
//! digest. Everything outside those ranges is skipped on the sink, and
//! each mapped range is hashed while it is written and compared to its
//! digest before the next one starts.
//!
//! The descriptor is JSON:
//!
//! ```json
//! {
//!   "BlockSize": 4096,
//!   "ImageSize": 8388608,
//!   "MappedBlocksCount": 3,
//!   "ChecksumType": "sha256",
//!   "BlockMap": [{"first": 0, "last": 2, "chksum": "9f86d0..."}]
//! }
//! ```

use std::io;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::error::BmapError;
use crate::sink::{StorageSink, write_all};

/// Digest algorithm used for the per-range checksums.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Sha256,
    Md5,
}

/// A mapped range of blocks, `first..=last`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    pub first: u64,
    pub last: u64,
    /// Hex digest of the range's bytes.
    pub chksum: String,
}

/// Block-map descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BlockMap {
    pub block_size: u64,
    pub image_size: u64,
    #[serde(default)]
    pub mapped_blocks_count: u64,
    pub checksum_type: ChecksumType,
    pub block_map: Vec<BlockRange>,
}

impl BlockMap {
    /// Parses and validates a JSON descriptor.
    pub fn from_json(json: &str) -> Result<Self, BmapError> {
        let map: BlockMap =
            serde_json::from_str(json).map_err(|e| BmapError::Descriptor(e.to_string()))?;
        map.validate()?;
        Ok(map)
    }

    /// Parses and validates an already decoded JSON descriptor.
    pub fn from_value(value: serde_json::Value) -> Result<Self, BmapError> {
        let map: BlockMap =
            serde_json::from_value(value).map_err(|e| BmapError::Descriptor(e.to_string()))?;
        map.validate()?;
        Ok(map)
    }

    /// Checks that the ranges are well formed, ascending and inside the image.
    pub fn validate(&self) -> Result<(), BmapError> {
        if self.block_size == 0 {
            return Err(BmapError::Descriptor("block size is zero".into()));
        }

        let blocks = self.image_size.div_ceil(self.block_size);
        let mut next_free = 0u64;
        for range in &self.block_map {
            if range.first > range.last {
                return Err(BmapError::Descriptor(format!(
                    "range {}-{} is reversed",
                    range.first, range.last
                )));
            }
            if range.first < next_free {
                return Err(BmapError::Descriptor(format!(
                    "range {}-{} overlaps or is out of order",
                    range.first, range.last
                )));
            }
            if range.last >= blocks {
                return Err(BmapError::Descriptor(format!(
                    "range {}-{} ends past the end of the image ({blocks} blocks)",
                    range.first, range.last
                )));
            }
            if hex::decode(&range.chksum).is_err() {
                return Err(BmapError::Descriptor(format!(
                    "range {}-{} has a malformed checksum",
                    range.first, range.last
                )));
            }
            next_free = range.last.checked_add(1).ok_or_else(|| {
                BmapError::Descriptor(format!("range {}-{} overflows", range.first, range.last))
            })?;
        }
        Ok(())
    }

    /// Number of blocks covered by the ranges.
    pub fn mapped_blocks(&self) -> u64 {
        self.block_map
            .iter()
            .map(|r| r.last.saturating_sub(r.first).saturating_add(1))
            .fold(0, u64::saturating_add)
    }
}

// ---------------------------------------------------------------------------
// Validator
// ---------------------------------------------------------------------------

/// Running digest of the current range.
enum Hasher {
    Sha256(Sha256),
    Md5(Md5),
}

impl Hasher {
    fn new(kind: ChecksumType) -> Self {
        match kind {
            ChecksumType::Sha256 => Hasher::Sha256(Sha256::new()),
            ChecksumType::Md5 => Hasher::Md5(Md5::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Md5(h) => h.update(data),
        }
    }

    /// Returns the hex digest and resets the state.
    fn finalize_reset(&mut self) -> String {
        match self {
            Hasher::Sha256(h) => hex::encode(h.finalize_reset()),
            Hasher::Md5(h) => hex::encode(h.finalize_reset()),
        }
    }
}

/// Byte extent of a mapped range.
struct Extent {
    start: u64,
    end: u64,
    first: u64,
    last: u64,
    digest: String,
}

/// Streams decoded image bytes to a sink following a [`BlockMap`].
///
/// Positions are tracked in bytes, so a chunk boundary may fall anywhere
/// inside a block or between a hole and a mapped range.
pub(crate) struct BmapValidator {
    extents: Vec<Extent>,
    current: usize,
    position: u64,
    hasher: Hasher,
}

impl BmapValidator {
    pub(crate) fn new(map: &BlockMap) -> Self {
        let extents = map
            .block_map
            .iter()
            .map(|r| Extent {
                start: r.first.saturating_mul(map.block_size).min(map.image_size),
                end: r
                    .last
                    .saturating_add(1)
                    .saturating_mul(map.block_size)
                    .min(map.image_size),
                first: r.first,
                last: r.last,
                digest: r.chksum.to_ascii_lowercase(),
            })
            .collect();
        Self {
            extents,
            current: 0,
            position: 0,
            hasher: Hasher::new(map.checksum_type),
        }
    }

    /// Feeds decoded bytes, writing mapped ones and skipping the rest.
    pub(crate) fn feed(&mut self, mut buf: &[u8], sink: &mut dyn StorageSink) -> io::Result<()> {
        while !buf.is_empty() {
            let Some(extent) = self.extents.get(self.current) else {
                // Past the last mapped range: the tail is a hole.
                sink.skip(buf.len() as u64)?;
                self.position += buf.len() as u64;
                return Ok(());
            };

            if self.position < extent.start {
                let n = (extent.start - self.position).min(buf.len() as u64) as usize;
                sink.skip(n as u64)?;
                self.position += n as u64;
                buf = &buf[n..];
                continue;
            }

            let n = (extent.end - self.position).min(buf.len() as u64) as usize;
            write_all(sink, &buf[..n])?;
            self.hasher.update(&buf[..n]);
            self.position += n as u64;
            buf = &buf[n..];

            if self.position == extent.end {
                let actual = self.hasher.finalize_reset();
                if actual != extent.digest {
                    return Err(BmapError::ChecksumMismatch {
                        first: extent.first,
                        last: extent.last,
                        expected: extent.digest.clone(),
                        actual,
                    }
                    .into());
                }
                debug!(first = extent.first, last = extent.last, "block range verified");
                self.current += 1;
            }
        }
        Ok(())
    }

    /// Fails if a mapped range was not fully received.
    pub(crate) fn finish(&self) -> Result<(), BmapError> {
        match self.extents.get(self.current) {
            Some(extent) => Err(BmapError::Incomplete {
                first: extent.first,
                last: extent.last,
            }),
            None => Ok(()),
        }
    }
}
