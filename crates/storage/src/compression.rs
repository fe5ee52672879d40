//! Image codecs and the decode pipeline.
//!
//! Compressed chunks go into a per-codec decoder and decoded output flows
//! into [`Downstream`], which applies the block map (if any) and commits to
//! the sink. gzip and xz use write-side decoders; bzip2 and zstd are driven
//! through their stream APIs so the end of the stream is tracked here.

use std::fmt;
use std::io::{self, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use tracing::debug;
use zstd::stream::raw::Operation;

use crate::bmap::{BlockMap, BmapValidator};
use crate::error::WriterError;
use crate::sink::{StorageSink, write_all};
use crate::writer::Progress;

/// Compression of the incoming image stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    #[default]
    Raw,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl Compression {
    /// Canonical name, as accepted by [`FromStr`].
    pub fn as_str(self) -> &'static str {
        match self {
            Compression::Raw => "raw",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
            Compression::Xz => "xz",
            Compression::Zstd => "zstd",
        }
    }

    /// Guesses the compression from an image file name.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Compression::Gzip,
            Some("bz2") => Compression::Bzip2,
            Some("xz") => Compression::Xz,
            Some("zst") => Compression::Zstd,
            _ => Compression::Raw,
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Compression {
    type Err = WriterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "raw" | "none" => Ok(Compression::Raw),
            "gzip" | "gz" => Ok(Compression::Gzip),
            "bzip2" | "bz2" => Ok(Compression::Bzip2),
            "xz" | "lzma" => Ok(Compression::Xz),
            "zstd" | "zst" => Ok(Compression::Zstd),
            _ => Err(WriterError::UnknownCompression(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Downstream
// ---------------------------------------------------------------------------

/// Receives decoded bytes: block-map validation, then the sink.
pub(crate) struct Downstream {
    sink: Box<dyn StorageSink>,
    validator: Option<BmapValidator>,
    progress: Arc<Progress>,
    /// Decoded bytes seen so far.
    decoded: u64,
}

impl Downstream {
    pub(crate) fn new(
        sink: Box<dyn StorageSink>,
        bmap: Option<&BlockMap>,
        progress: Arc<Progress>,
    ) -> Self {
        Self {
            sink,
            validator: bmap.map(BmapValidator::new),
            progress,
            decoded: 0,
        }
    }

    fn finish(&mut self) -> Result<(), WriterError> {
        if let Some(validator) = &self.validator {
            validator.finish()?;
        }
        self.sink.finish()?;
        self.publish();
        Ok(())
    }

    /// Publishes the committed byte count: the sink's own position when it
    /// reports one, our counter otherwise.
    fn publish(&mut self) {
        let written = self.sink.tell().unwrap_or(self.decoded);
        self.progress.set_written(written);
    }
}

impl Write for Downstream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.validator {
            Some(validator) => validator.feed(buf, self.sink.as_mut())?,
            None => write_all(self.sink.as_mut(), buf)?,
        }
        self.decoded += buf.len() as u64;
        self.publish();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Output buffer of the stream-API decoders.
const DECODE_BUF: usize = 64 * 1024;

enum Stage {
    /// No chunk seen yet; the decoder is created on first use.
    Idle(Downstream),
    Raw(Downstream),
    Gzip(flate2::write::GzDecoder<Downstream>),
    Bzip2(Bzip2Stage),
    Xz(xz2::write::XzDecoder<Downstream>),
    Zstd(ZstdStage),
    /// Transient state while switching stages, or after a failed switch.
    Poisoned,
}

/// Decoder chain of one transfer.
pub(crate) struct Pipeline {
    compression: Compression,
    stage: Stage,
    /// Bytes found after the end of the compressed stream.
    trailing: u64,
}

impl Pipeline {
    pub(crate) fn new(compression: Compression, downstream: Downstream) -> Self {
        Self {
            compression,
            stage: Stage::Idle(downstream),
            trailing: 0,
        }
    }

    fn activate(&mut self) -> io::Result<()> {
        if !matches!(self.stage, Stage::Idle(_)) {
            return Ok(());
        }
        let Stage::Idle(down) = std::mem::replace(&mut self.stage, Stage::Poisoned) else {
            return Ok(());
        };
        self.stage = match self.compression {
            Compression::Raw => Stage::Raw(down),
            Compression::Gzip => Stage::Gzip(flate2::write::GzDecoder::new(down)),
            Compression::Bzip2 => Stage::Bzip2(Bzip2Stage::new(down)),
            Compression::Xz => Stage::Xz(xz2::write::XzDecoder::new(down)),
            Compression::Zstd => Stage::Zstd(ZstdStage::new(down)?),
        };
        debug!(compression = %self.compression, "decoder created");
        Ok(())
    }

    /// Decodes one network chunk and forwards the output.
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Result<(), WriterError> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.activate().map_err(WriterError::from_io)?;

        let result = match &mut self.stage {
            Stage::Raw(down) => down.write_all(chunk),
            Stage::Gzip(dec) => feed_decoder(dec, chunk, &mut self.trailing),
            Stage::Bzip2(dec) => dec.feed(chunk, &mut self.trailing),
            Stage::Xz(dec) => feed_decoder(dec, chunk, &mut self.trailing),
            Stage::Zstd(dec) => dec.feed(chunk),
            Stage::Idle(_) | Stage::Poisoned => Err(io::Error::other("decoder unavailable")),
        };
        result.map_err(WriterError::from_io)
    }

    /// Drains the decoder and completes the block map and the sink.
    ///
    /// A compressed stream that stops before its end marker fails with
    /// `UnexpectedEof`.
    pub(crate) fn finish(&mut self) -> Result<(), WriterError> {
        // xz2's decoder only exposes `finish`, which hands the writer back.
        if let Stage::Xz(dec) = &mut self.stage {
            let down = dec.finish().map_err(WriterError::from_io)?;
            self.stage = Stage::Raw(down);
        }
        let down = match &mut self.stage {
            Stage::Idle(down) | Stage::Raw(down) => down,
            Stage::Gzip(dec) => {
                dec.try_finish().map_err(WriterError::from_io)?;
                dec.get_mut()
            }
            Stage::Bzip2(dec) => dec.finish().map_err(WriterError::from_io)?,
            Stage::Xz(dec) => dec.get_mut(),
            Stage::Zstd(dec) => dec.finish().map_err(WriterError::from_io)?,
            Stage::Poisoned => return Err(io::Error::other("decoder unavailable").into()),
        };
        if self.trailing > 0 {
            debug!(bytes = self.trailing, "ignored data after end of compressed stream");
        }
        down.finish()
    }

    /// Bytes discarded after the end of the compressed stream.
    pub(crate) fn trailing(&self) -> u64 {
        self.trailing
    }
}

/// Writes a chunk into a decoder.
///
/// A decoder that reports zero bytes consumed has reached the end of its
/// stream; whatever follows is dropped and the chunk counts as decoded.
fn feed_decoder<W: Write>(dec: &mut W, mut data: &[u8], trailing: &mut u64) -> io::Result<()> {
    while !data.is_empty() {
        match dec.write(data) {
            Ok(0) => {
                *trailing += data.len() as u64;
                break;
            }
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn truncated(codec: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("{codec} stream ended before its end marker"),
    )
}

/// bzip2 on the raw stream API.
///
/// The end of the stream is tracked here rather than by a write-side
/// decoder, so a transfer abandoned mid-stream just releases the state.
struct Bzip2Stage {
    stream: bzip2::Decompress,
    down: Downstream,
    out: Vec<u8>,
    done: bool,
}

impl Bzip2Stage {
    fn new(down: Downstream) -> Self {
        Self {
            stream: bzip2::Decompress::new(false),
            down,
            out: vec![0; DECODE_BUF],
            done: false,
        }
    }

    fn feed(&mut self, mut data: &[u8], trailing: &mut u64) -> io::Result<()> {
        loop {
            if self.done {
                *trailing += data.len() as u64;
                return Ok(());
            }
            let (total_in, total_out) = (self.stream.total_in(), self.stream.total_out());
            let status = self
                .stream
                .decompress(data, &mut self.out)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
            let read = (self.stream.total_in() - total_in) as usize;
            let written = (self.stream.total_out() - total_out) as usize;
            self.down.write_all(&self.out[..written])?;
            data = &data[read..];

            if matches!(status, bzip2::Status::StreamEnd) {
                self.done = true;
            } else if data.is_empty() && written < self.out.len() {
                return Ok(());
            } else if read == 0 && written == 0 {
                return Err(io::Error::other("bzip2 decoder made no progress"));
            }
        }
    }

    fn finish(&mut self) -> io::Result<&mut Downstream> {
        if !self.done {
            return Err(truncated("bzip2"));
        }
        Ok(&mut self.down)
    }
}

/// zstd on the raw stream API; consecutive frames are accepted.
struct ZstdStage {
    stream: zstd::stream::raw::Decoder<'static>,
    down: Downstream,
    out: Vec<u8>,
    /// The last frame was decoded and flushed completely.
    frame_done: bool,
}

impl ZstdStage {
    fn new(down: Downstream) -> io::Result<Self> {
        Ok(Self {
            stream: zstd::stream::raw::Decoder::new()?,
            down,
            out: vec![0; DECODE_BUF],
            frame_done: false,
        })
    }

    fn feed(&mut self, mut data: &[u8]) -> io::Result<()> {
        loop {
            if self.frame_done && !data.is_empty() {
                self.stream.reinit()?;
                self.frame_done = false;
            }
            let status = self.stream.run_on_buffers(data, &mut self.out)?;
            self.down.write_all(&self.out[..status.bytes_written])?;
            data = &data[status.bytes_read..];
            if status.bytes_read > 0 || status.bytes_written > 0 {
                self.frame_done = status.remaining == 0;
            }

            if data.is_empty() && status.bytes_written < self.out.len() {
                return Ok(());
            }
            if status.bytes_read == 0 && status.bytes_written == 0 {
                return Err(io::Error::other("zstd decoder made no progress"));
            }
        }
    }

    fn finish(&mut self) -> io::Result<&mut Downstream> {
        if !self.frame_done {
            return Err(truncated("zstd"));
        }
        Ok(&mut self.down)
    }
}
