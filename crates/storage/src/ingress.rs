//! TCP data channel (agent side).
//!
//! Accepts connections on the transfer's ephemeral port and moves raw
//! bytes into the bounded chunk queue. When the queue is full the thread
//! stops reading, which lets TCP flow control slow the sender down.

use std::io::{self, Read};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{SendTimeoutError, Sender};
use tracing::{debug, info, warn};

/// How often blocked socket and queue operations re-check the exit flag.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Spawns the ingress thread for `listener`.
pub(crate) fn spawn(
    listener: TcpListener,
    queue: Sender<Vec<u8>>,
    exit: Arc<AtomicBool>,
    chunk_size: usize,
) -> io::Result<JoinHandle<()>> {
    listener.set_nonblocking(true)?;
    thread::Builder::new()
        .name("image-ingress".into())
        .spawn(move || accept_loop(listener, queue, exit, chunk_size))
}

fn accept_loop(
    listener: TcpListener,
    queue: Sender<Vec<u8>>,
    exit: Arc<AtomicBool>,
    chunk_size: usize,
) {
    while !exit.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, addr)) => {
                info!(%addr, "data channel connection accepted");
                match receive(stream, &queue, &exit, chunk_size) {
                    Ok(Flow::Continue) => debug!(%addr, "data channel connection closed"),
                    Ok(Flow::Stop) => break,
                    Err(e) => warn!(%addr, "data channel read error: {e}"),
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("data channel accept error: {e}");
                break;
            }
        }
    }
    debug!("data channel closed");
}

enum Flow {
    /// Peer closed its side; accept the next connection.
    Continue,
    /// Writer is gone or stopping.
    Stop,
}

fn receive(
    mut stream: TcpStream,
    queue: &Sender<Vec<u8>>,
    exit: &AtomicBool,
    chunk_size: usize,
) -> io::Result<Flow> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(POLL_INTERVAL))?;
    let mut buf = vec![0u8; chunk_size];

    loop {
        if exit.load(Ordering::Acquire) {
            return Ok(Flow::Stop);
        }

        let n = match stream.read(&mut buf) {
            Ok(0) => return Ok(Flow::Continue),
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                continue;
            }
            Err(e) => return Err(e),
        };
        let mut pending = buf[..n].to_vec();
        loop {
            match queue.send_timeout(pending, POLL_INTERVAL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(chunk)) => {
                    if exit.load(Ordering::Acquire) {
                        return Ok(Flow::Stop);
                    }
                    pending = chunk;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Ok(Flow::Stop),
            }
        }
    }
}
