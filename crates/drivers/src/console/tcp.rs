//! Console served over raw TCP (ser2net and friends).

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use super::ConsoleInterface;
use crate::DriverError;
use crate::registry::DriverSpec;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct Options {
    #[serde(default = "default_host")]
    host: String,
    port: u16,
}

fn default_host() -> String {
    "localhost".into()
}

pub struct TcpConsole {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
}

impl TcpConsole {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            stream: None,
        }
    }

    pub fn from_spec(spec: &DriverSpec) -> Result<Self, DriverError> {
        let opts: Options = spec.options("console")?;
        Ok(Self::new(opts.host, opts.port))
    }

    fn stream(&mut self) -> Result<&mut TcpStream, DriverError> {
        self.stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "console not open").into())
    }
}

impl ConsoleInterface for TcpConsole {
    fn open(&mut self) -> Result<(), DriverError> {
        if self.stream.is_some() {
            return Ok(());
        }
        let addr = std::net::ToSocketAddrs::to_socket_addrs(&(self.host.as_str(), self.port))?
            .next()
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("cannot resolve {}", self.host))
            })?;
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        info!(%addr, "console connected");
        self.stream = Some(stream);
        Ok(())
    }

    fn close(&mut self) -> Result<(), DriverError> {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
            debug!(host = %self.host, port = self.port, "console closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    fn pending(&mut self) -> Result<usize, DriverError> {
        let stream = self.stream()?;
        let mut probe = [0u8; 4096];
        stream.set_nonblocking(true)?;
        let peeked = stream.peek(&mut probe);
        stream.set_nonblocking(false)?;
        match peeked {
            Ok(0) => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "console closed by peer").into()),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DriverError> {
        Ok(self.stream()?.read(buf)?)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, DriverError> {
        let stream = self.stream()?;
        stream.write_all(data)?;
        Ok(data.len())
    }
}
