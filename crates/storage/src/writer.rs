//! The streaming image writer.
//!
//! One transfer at a time: [`ImageWriter::start`] binds a data channel
//! port and spawns two threads. The ingress thread reads the socket into
//! a bounded queue; the worker drains the queue in order, pings the
//! owning session, and pushes the bytes through the decode pipeline.
//!
//! The worker ends when
//! - a flush was declared and exactly that many bytes were received
//!   (success),
//! - the declared size does not match once the stream has gone quiet,
//! - nothing arrives for more than [`STALL_TOLERANCE`] receive windows,
//! - decoding, validation or the sink fails, or
//! - [`ImageWriter::stop`] is called.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use benchlink_session::SessionPing;
use crossbeam_channel::{Receiver, select};
use tracing::{debug, error, info, warn};

use crate::bmap::BlockMap;
use crate::compression::{Compression, Downstream, Pipeline};
use crate::error::WriterError;
use crate::sink::StorageSink;
use crate::{
    DEFAULT_CHUNK_SIZE, DEFAULT_HIGH_WATER_MARK, DEFAULT_RECV_TIMEOUT, STALL_TOLERANCE, ingress,
};

/// Writer configuration.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Address the data channel binds to.
    pub bind_addr: IpAddr,
    /// Data channel port (0 = OS-assigned).
    pub port: u16,
    /// Receive timeout of the worker loop.
    pub recv_timeout: Duration,
    /// Byte budget of the receive queue.
    pub high_water_mark: usize,
    /// Maximum size of a single network chunk; 0 selects the default.
    pub chunk_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl WriterConfig {
    /// Read size of the data channel.
    pub fn effective_chunk_size(&self) -> usize {
        match self.chunk_size {
            0 => DEFAULT_CHUNK_SIZE,
            n => n,
        }
    }

    /// Queue depth in chunks.
    pub fn queue_depth(&self) -> usize {
        (self.high_water_mark / self.effective_chunk_size()).max(1)
    }
}

/// Transfer state shared between the writer handle and its threads.
#[derive(Default)]
pub(crate) struct Progress {
    received: AtomicU64,
    written: AtomicU64,
    declared: AtomicU64,
    flushed: AtomicBool,
    writing: AtomicBool,
    failed: AtomicBool,
    last_error: Mutex<Option<String>>,
}

impl Progress {
    pub(crate) fn set_written(&self, bytes: u64) {
        self.written.store(bytes, Ordering::Release);
    }

    fn reset(&self) {
        self.received.store(0, Ordering::Release);
        self.written.store(0, Ordering::Release);
        self.declared.store(0, Ordering::Release);
        self.flushed.store(false, Ordering::Release);
        self.failed.store(false, Ordering::Release);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn fail(&self, err: &WriterError) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(err.to_string());
        self.failed.store(true, Ordering::Release);
    }
}

/// Threads and channels of a running transfer.
struct Transfer {
    port: u16,
    exit: Arc<AtomicBool>,
    /// Dropped by `stop()` to wake the worker.
    exit_tx: Option<crossbeam_channel::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    ingress: Option<JoinHandle<()>>,
}

/// Receives an image over the network and commits it to a sink.
pub struct ImageWriter {
    config: WriterConfig,
    compression: Compression,
    bmap: Option<BlockMap>,
    pinger: Option<Arc<dyn SessionPing>>,
    progress: Arc<Progress>,
    transfer: Option<Transfer>,
}

impl ImageWriter {
    pub fn new(config: WriterConfig) -> Self {
        Self {
            config,
            compression: Compression::Raw,
            bmap: None,
            pinger: None,
            progress: Arc::new(Progress::default()),
            transfer: None,
        }
    }

    /// Keeps the transfer's session alive for every received chunk.
    pub fn with_session_ping(mut self, pinger: Arc<dyn SessionPing>) -> Self {
        self.pinger = Some(pinger);
        self
    }

    /// Returns the codec used for the next transfer.
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Selects the codec for the next transfer and returns the previous one.
    pub fn set_compression(&mut self, compression: Compression) -> Compression {
        debug!(%compression, "image compression selected");
        std::mem::replace(&mut self.compression, compression)
    }

    /// Attaches a block map to the next transfer, or clears it.
    pub fn set_bmap(&mut self, bmap: Option<BlockMap>) -> Result<(), WriterError> {
        if self.writing() {
            return Err(WriterError::Busy);
        }
        if let Some(map) = &bmap {
            map.validate()?;
            info!(
                ranges = map.block_map.len(),
                blocks = map.mapped_blocks(),
                "block map attached"
            );
        }
        self.bmap = bmap;
        Ok(())
    }

    /// Returns the attached block map, if any.
    pub fn bmap(&self) -> Option<&BlockMap> {
        self.bmap.as_ref()
    }

    /// Binds the data channel and starts a transfer into `sink`.
    ///
    /// Returns the bound port. A transfer that is still running is stopped
    /// first.
    pub fn start(
        &mut self,
        sink: Box<dyn StorageSink>,
        session: Option<&str>,
    ) -> Result<u16, WriterError> {
        if self.transfer.is_some() {
            self.stop();
        }

        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr)?;
        let port = listener.local_addr()?.port();

        let (queue_tx, queue_rx) = crossbeam_channel::bounded(self.config.queue_depth());
        let (exit_tx, exit_rx) = crossbeam_channel::bounded::<()>(0);
        let exit = Arc::new(AtomicBool::new(false));

        self.progress.reset();
        self.progress.writing.store(true, Ordering::Release);

        let ingress = match ingress::spawn(
            listener,
            queue_tx,
            Arc::clone(&exit),
            self.config.effective_chunk_size(),
        ) {
            Ok(handle) => handle,
            Err(e) => {
                self.progress.writing.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        let downstream = Downstream::new(sink, self.bmap.as_ref(), Arc::clone(&self.progress));
        let worker = Worker {
            queue: queue_rx,
            exit_rx,
            exit: Arc::clone(&exit),
            pipeline: Pipeline::new(self.compression, downstream),
            progress: Arc::clone(&self.progress),
            pinger: self.pinger.clone(),
            session: session.map(str::to_string),
            recv_timeout: self.config.recv_timeout,
        };
        let spawned = thread::Builder::new()
            .name("image-writer".into())
            .spawn(move || worker.run());
        let worker = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                exit.store(true, Ordering::Release);
                let _ = ingress.join();
                self.progress.writing.store(false, Ordering::Release);
                return Err(e.into());
            }
        };

        info!(
            port,
            compression = %self.compression,
            bmap = self.bmap.is_some(),
            session = session.unwrap_or("-"),
            "image transfer started"
        );

        self.transfer = Some(Transfer {
            port,
            exit,
            exit_tx: Some(exit_tx),
            worker: Some(worker),
            ingress: Some(ingress),
        });
        Ok(port)
    }

    /// Declares that the producer sent exactly `total` bytes.
    ///
    /// Non-blocking: the worker evaluates it on its next idle window.
    pub fn flush(&self, total: u64) {
        self.progress.declared.store(total, Ordering::Release);
        self.progress.flushed.store(true, Ordering::Release);
        debug!(total, "image transfer flushed");
    }

    /// Stops the transfer and waits for its threads. Idempotent.
    ///
    /// Must not be called from the worker thread.
    pub fn stop(&mut self) {
        let Some(mut transfer) = self.transfer.take() else {
            return;
        };

        transfer.exit.store(true, Ordering::Release);
        drop(transfer.exit_tx.take());
        if let Some(handle) = transfer.worker.take() {
            if handle.join().is_err() {
                error!("image writer thread panicked");
                self.progress.failed.store(true, Ordering::Release);
            }
        }
        if let Some(handle) = transfer.ingress.take() {
            let _ = handle.join();
        }

        self.progress.writing.store(false, Ordering::Release);
        self.bmap = None;
        info!(port = transfer.port, "image transfer stopped");
    }

    /// Port of the running transfer's data channel.
    pub fn port(&self) -> Option<u16> {
        self.transfer.as_ref().map(|t| t.port)
    }

    /// Whether the last transfer failed.
    pub fn failed(&self) -> bool {
        self.progress.failed.load(Ordering::Acquire)
    }

    /// Whether a transfer is in progress.
    pub fn writing(&self) -> bool {
        self.progress.writing.load(Ordering::Acquire)
    }

    /// Bytes committed to the sink by the current or last transfer.
    pub fn written(&self) -> u64 {
        self.progress.written.load(Ordering::Acquire)
    }

    /// Bytes received over the data channel.
    pub fn received(&self) -> u64 {
        self.progress.received.load(Ordering::Acquire)
    }

    /// Reason of the last failure.
    pub fn last_error(&self) -> Option<String> {
        self.progress
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for ImageWriter {
    fn drop(&mut self) {
        self.stop();
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

enum Outcome {
    Complete,
    Stopped,
    Failed(WriterError),
}

struct Worker {
    queue: Receiver<Vec<u8>>,
    exit_rx: Receiver<()>,
    exit: Arc<AtomicBool>,
    pipeline: Pipeline,
    progress: Arc<Progress>,
    pinger: Option<Arc<dyn SessionPing>>,
    session: Option<String>,
    recv_timeout: Duration,
}

impl Worker {
    fn run(mut self) {
        let outcome = self.receive_loop();

        match outcome {
            Outcome::Complete => match self.pipeline.finish() {
                Ok(()) => info!(
                    received = self.progress.received.load(Ordering::Acquire),
                    written = self.progress.written.load(Ordering::Acquire),
                    "image transfer complete"
                ),
                Err(e) => {
                    error!("image transfer failed while finishing: {e}");
                    self.progress.fail(&e);
                }
            },
            Outcome::Stopped => debug!("image writer stopped"),
            Outcome::Failed(e) => {
                error!("image transfer failed: {e}");
                self.progress.fail(&e);
            }
        }

        // Closes the data channel.
        self.exit.store(true, Ordering::Release);
        self.progress.writing.store(false, Ordering::Release);
    }

    fn receive_loop(&mut self) -> Outcome {
        let mut stalls = 0u32;

        loop {
            select! {
                recv(self.exit_rx) -> _ => return Outcome::Stopped,
                recv(self.queue) -> msg => match msg {
                    Ok(chunk) => {
                        stalls = 0;
                        self.progress
                            .received
                            .fetch_add(chunk.len() as u64, Ordering::AcqRel);
                        if let (Some(pinger), Some(session)) = (&self.pinger, &self.session) {
                            pinger.ping(session);
                        }
                        if let Err(e) = self.pipeline.feed(&chunk) {
                            return Outcome::Failed(e);
                        }
                    }
                    Err(_) => {
                        if self.exit.load(Ordering::Acquire) {
                            return Outcome::Stopped;
                        }
                        return Outcome::Failed(WriterError::ChannelClosed);
                    }
                },
                default(self.recv_timeout) => {
                    if let Some(outcome) = self.on_idle(&mut stalls) {
                        return outcome;
                    }
                }
            }
        }
    }

    /// Evaluates a receive window that brought no data.
    fn on_idle(&self, stalls: &mut u32) -> Option<Outcome> {
        let received = self.progress.received.load(Ordering::Acquire);

        if self.progress.flushed.load(Ordering::Acquire) {
            let declared = self.progress.declared.load(Ordering::Acquire);
            if received == declared {
                return Some(Outcome::Complete);
            }
            return Some(Outcome::Failed(WriterError::SizeMismatch { declared, received }));
        }

        *stalls += 1;
        if *stalls > STALL_TOLERANCE {
            return Some(Outcome::Failed(WriterError::Stalled(
                self.recv_timeout * *stalls,
            )));
        }
        warn!(received, stalls = *stalls, "no image data within receive window");
        None
    }
}
