use std::io;

/// Errors produced by device drivers.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("unknown {kind} variant: {variant}")]
    UnknownVariant { kind: &'static str, variant: String },

    #[error("invalid {kind} configuration: {message}")]
    Config { kind: &'static str, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("command `{command}` failed: {status}")]
    Command { command: String, status: String },

    #[error("USB gadget error: {0}")]
    Gadget(String),

    #[error("{0} is not supported by this device")]
    Unsupported(&'static str),

    #[error("storage is not open")]
    NotOpen,

    #[error("storage is attached to the target")]
    OnTarget,
}

impl DriverError {
    pub(crate) fn config(kind: &'static str, message: impl Into<String>) -> Self {
        DriverError::Config {
            kind,
            message: message.into(),
        }
    }
}
