//! Storage sink abstraction.

use std::io::{self, Seek, SeekFrom, Write};

/// Destination of a decoded image.
///
/// Only the writer's worker thread touches a sink while a transfer runs.
pub trait StorageSink: Send {
    /// Writes some bytes and returns how many were accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Advances the write position by `len` bytes without writing.
    fn skip(&mut self, len: u64) -> io::Result<()>;

    /// Returns the current write position, if the device can report it.
    fn tell(&mut self) -> Option<u64>;

    /// Commits buffered data once the image is complete.
    fn finish(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Writes the whole buffer to a sink.
pub(crate) fn write_all(sink: &mut dyn StorageSink, mut buf: &[u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match sink.write(buf) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "storage sink accepted no data",
                ));
            }
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Adapts any seekable writer (image file, block device, in-memory cursor)
/// to the [`StorageSink`] contract.
///
/// Skipped regions become holes. When the image ends in a hole, a single
/// zero byte is written at its last offset on [`finish`](StorageSink::finish)
/// so that the destination has the full image length.
pub struct SeekSink<T> {
    inner: T,
    position: u64,
    /// End of the last byte actually written.
    data_end: u64,
}

impl<T: Write + Seek> SeekSink<T> {
    /// Wraps `inner`, starting at its current position.
    pub fn new(mut inner: T) -> io::Result<Self> {
        let position = inner.stream_position()?;
        Ok(Self {
            inner,
            position,
            data_end: position,
        })
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Write + Seek + Send> StorageSink for SeekSink<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.position += n as u64;
        self.data_end = self.data_end.max(self.position);
        Ok(n)
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        let offset = i64::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "skip too large"))?;
        self.position = self.inner.seek(SeekFrom::Current(offset))?;
        Ok(())
    }

    fn tell(&mut self) -> Option<u64> {
        Some(self.position)
    }

    fn finish(&mut self) -> io::Result<()> {
        if self.position > self.data_end {
            self.inner.seek(SeekFrom::Start(self.position - 1))?;
            self.inner.write_all(&[0])?;
            self.data_end = self.position;
        }
        self.inner.flush()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory sink whose contents stay inspectable after the writer
    /// consumed it.
    #[derive(Clone, Default)]
    pub(crate) struct MemorySink {
        pub data: Arc<Mutex<Vec<u8>>>,
        pub skipped: Arc<Mutex<u64>>,
        position: usize,
    }

    impl MemorySink {
        pub fn contents(&self) -> Vec<u8> {
            self.data.lock().unwrap().clone()
        }
    }

    impl StorageSink for MemorySink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut data = self.data.lock().unwrap();
            let end = self.position + buf.len();
            if data.len() < end {
                data.resize(end, 0);
            }
            data[self.position..end].copy_from_slice(buf);
            self.position = end;
            Ok(buf.len())
        }

        fn skip(&mut self, len: u64) -> io::Result<()> {
            *self.skipped.lock().unwrap() += len;
            self.position += len as usize;
            Ok(())
        }

        fn tell(&mut self) -> Option<u64> {
            Some(self.position as u64)
        }
    }

    /// Sink that fails every write.
    pub(crate) struct BrokenSink;

    impl StorageSink for BrokenSink {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::other("device unplugged"))
        }

        fn skip(&mut self, _len: u64) -> io::Result<()> {
            Err(io::Error::other("device unplugged"))
        }

        fn tell(&mut self) -> Option<u64> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn seek_sink_tracks_position() {
        let mut sink = SeekSink::new(Cursor::new(Vec::new())).unwrap();
        write_all(&mut sink, b"abcd").unwrap();
        sink.skip(4).unwrap();
        write_all(&mut sink, b"ef").unwrap();
        assert_eq!(sink.tell(), Some(10));
        sink.finish().unwrap();

        let data = sink.into_inner().into_inner();
        assert_eq!(data, b"abcd\0\0\0\0ef");
    }

    #[test]
    fn seek_sink_pads_trailing_hole() {
        let mut sink = SeekSink::new(Cursor::new(Vec::new())).unwrap();
        write_all(&mut sink, b"xy").unwrap();
        sink.skip(6).unwrap();
        sink.finish().unwrap();

        let data = sink.into_inner().into_inner();
        assert_eq!(data.len(), 8);
        assert_eq!(&data[..2], b"xy");
    }

    #[test]
    fn seek_sink_on_file_keeps_existing_data_in_holes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, vec![0xAAu8; 16]).unwrap();

        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        let mut sink = SeekSink::new(file).unwrap();
        sink.skip(4).unwrap();
        write_all(&mut sink, &[1, 2]).unwrap();
        sink.finish().unwrap();
        drop(sink);

        let data = std::fs::read(&path).unwrap();
        assert_eq!(&data[..4], &[0xAA; 4]);
        assert_eq!(&data[4..6], &[1, 2]);
        assert_eq!(data.len(), 16);
    }

    #[test]
    fn write_all_rejects_zero_progress() {
        struct Stuck;
        impl StorageSink for Stuck {
            fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
                Ok(0)
            }
            fn skip(&mut self, _len: u64) -> io::Result<()> {
                Ok(())
            }
            fn tell(&mut self) -> Option<u64> {
                None
            }
        }
        let err = write_all(&mut Stuck, b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }
}
