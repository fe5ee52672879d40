//! Target console access.

pub mod logger;
pub mod tcp;

use crate::DriverError;

pub use logger::ConsoleLogger;
pub use tcp::TcpConsole;

/// Byte stream to and from the target's console.
pub trait ConsoleInterface: Send {
    fn open(&mut self) -> Result<(), DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;

    fn is_open(&self) -> bool;

    /// Number of bytes that can be read without blocking.
    fn pending(&mut self) -> Result<usize, DriverError>;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DriverError>;

    fn write(&mut self, data: &[u8]) -> Result<usize, DriverError>;
}
