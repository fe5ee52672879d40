//! Buffered console reader.
//!
//! A reader thread drains the console into a bounded buffer of lines so
//! that clients can fetch output at their own pace. Lines keep their `\n`
//! terminator; `\r\n` is normalized to `\n`. Output after the last line
//! feed is kept apart as the partial line.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::ConsoleInterface;
use crate::DriverError;

/// Lines kept before the oldest are dropped.
pub const DEFAULT_CAPACITY: usize = 1000;

const IDLE_POLL: Duration = Duration::from_millis(20);
const RECOVERY_DELAY: Duration = Duration::from_millis(500);
const READ_SIZE: usize = 4096;

struct Buffer {
    lines: VecDeque<String>,
    partial: Vec<u8>,
    capacity: usize,
}

impl Buffer {
    fn new(capacity: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            partial: Vec::new(),
            capacity: capacity.max(1),
        }
    }

    fn push(&mut self, data: &[u8]) {
        self.partial.extend_from_slice(data);
        while let Some(pos) = self.partial.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.partial.drain(..=pos).collect();
            if line.ends_with(b"\r\n") {
                line.remove(line.len() - 2);
            }
            if self.lines.len() == self.capacity {
                self.lines.pop_front();
            }
            self.lines.push_back(String::from_utf8_lossy(&line).into_owned());
        }
    }

    fn head(&mut self) -> Option<String> {
        self.lines.pop_front()
    }

    /// Most recent output; discards everything buffered.
    fn tail(&mut self) -> Option<String> {
        let line = if !self.partial.is_empty() {
            Some(String::from_utf8_lossy(&self.partial).into_owned())
        } else {
            self.lines.back().cloned()
        };
        self.clear();
        line
    }

    /// All complete lines (consumed) followed by the partial line (kept).
    fn dump(&mut self) -> String {
        let mut data: String = self.lines.drain(..).collect();
        data.push_str(&String::from_utf8_lossy(&self.partial));
        data
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.partial.clear();
    }
}

struct Shared {
    console: Mutex<Box<dyn ConsoleInterface>>,
    buffer: Mutex<Buffer>,
    paused: AtomicBool,
    exit: AtomicBool,
}

impl Shared {
    fn console(&self) -> MutexGuard<'_, Box<dyn ConsoleInterface>> {
        self.console.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn buffer(&self) -> MutexGuard<'_, Buffer> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Console with a background reader and a line buffer.
pub struct ConsoleLogger {
    shared: Arc<Shared>,
    reader: Option<JoinHandle<()>>,
}

impl ConsoleLogger {
    pub fn new(console: Box<dyn ConsoleInterface>, capacity: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                console: Mutex::new(console),
                buffer: Mutex::new(Buffer::new(capacity)),
                paused: AtomicBool::new(false),
                exit: AtomicBool::new(false),
            }),
            reader: None,
        }
    }

    /// Starts the reader thread. The console is opened by the reader.
    pub fn start(&mut self) -> Result<(), DriverError> {
        if self.reader.is_some() {
            return Ok(());
        }
        self.shared.exit.store(false, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("console-reader".into())
            .spawn(move || reader_loop(&shared))?;
        self.reader = Some(handle);
        info!("console logger started");
        Ok(())
    }

    /// Stops the reader thread and closes the console.
    pub fn stop(&mut self) {
        let Some(handle) = self.reader.take() else {
            return;
        };
        self.shared.exit.store(true, Ordering::Release);
        let _ = handle.join();
        if let Err(e) = self.shared.console().close() {
            warn!("failed to close console: {e}");
        }
        info!("console logger stopped");
    }

    /// Pops the oldest buffered line.
    pub fn head(&self) -> Option<String> {
        self.shared.buffer().head()
    }

    /// Number of buffered lines.
    pub fn lines(&self) -> usize {
        self.shared.buffer().lines.len()
    }

    /// Returns the most recent output and discards the buffer.
    pub fn tail(&self) -> Option<String> {
        self.shared.buffer().tail()
    }

    /// Returns and consumes all buffered lines, plus the pending partial line.
    pub fn dump(&self) -> String {
        self.shared.buffer().dump()
    }

    pub fn clear(&self) {
        self.shared.buffer().clear();
    }

    /// Writes to the console.
    pub fn send(&self, data: &[u8]) -> Result<usize, DriverError> {
        let mut console = self.shared.console();
        if !console.is_open() {
            console.open()?;
        }
        console.write(data)
    }

    /// Closes the console until [`resume`](Self::resume), e.g. while the
    /// target is powered off.
    pub fn pause(&self) -> Result<(), DriverError> {
        let mut console = self.shared.console();
        self.shared.paused.store(true, Ordering::Release);
        debug!("console paused");
        console.close()
    }

    pub fn resume(&self) -> Result<(), DriverError> {
        let mut console = self.shared.console();
        self.shared.paused.store(false, Ordering::Release);
        debug!("console resumed");
        console.open()
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }
}

impl Drop for ConsoleLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reader_loop(shared: &Shared) {
    let mut buf = vec![0u8; READ_SIZE];
    let mut failing = false;

    while !shared.exit.load(Ordering::Acquire) {
        let result = {
            let mut console = shared.console();
            if shared.paused.load(Ordering::Acquire) {
                Ok(None)
            } else {
                read_some(console.as_mut(), &mut buf).map(Some)
            }
        };

        match result {
            Ok(Some(n)) if n > 0 => {
                failing = false;
                shared.buffer().push(&buf[..n]);
            }
            Ok(_) => thread::sleep(IDLE_POLL),
            Err(e) => {
                if !failing {
                    warn!("console read failed, reconnecting: {e}");
                    failing = true;
                } else {
                    debug!("console still unavailable: {e}");
                }
                let _ = shared.console().close();
                pause_for(shared, RECOVERY_DELAY);
            }
        }
    }
    debug!("console reader exiting");
}

fn read_some(console: &mut dyn ConsoleInterface, buf: &mut [u8]) -> Result<usize, DriverError> {
    if !console.is_open() {
        console.open()?;
    }
    match console.pending()? {
        0 => Ok(0),
        n => {
            let len = n.min(buf.len());
            console.read(&mut buf[..len])
        }
    }
}

/// Sleeps for `delay` unless asked to exit.
fn pause_for(shared: &Shared, delay: Duration) {
    let mut left = delay;
    while !left.is_zero() && !shared.exit.load(Ordering::Acquire) {
        let step = left.min(IDLE_POLL);
        thread::sleep(step);
        left -= step;
    }
}
