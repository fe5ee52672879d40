use benchlink_drivers::DriverError;
use benchlink_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_INTERNAL, WS_ERR_CODE_LOCKED, WS_ERR_CODE_NOT_FOUND,
    WS_ERR_CODE_UNAVAILABLE,
};
use benchlink_protocol::envelope::PayloadError;
use benchlink_storage::{BmapError, WriterError};

/// Errors returned by device operations.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("no {0} driver configured")]
    NoDriver(&'static str),

    #[error("device is locked by another session")]
    Locked,

    #[error("invalid USB port #{0}")]
    InvalidPort(usize),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Writer(#[from] WriterError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl DeviceError {
    /// Protocol error code reported to the client.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::NoDriver(_) => WS_ERR_CODE_UNAVAILABLE,
            DeviceError::Locked | DeviceError::Writer(WriterError::Busy) => WS_ERR_CODE_LOCKED,
            DeviceError::InvalidPort(_) => WS_ERR_CODE_NOT_FOUND,
            DeviceError::BadRequest(_)
            | DeviceError::Writer(WriterError::UnknownCompression(_))
            | DeviceError::Writer(WriterError::Bmap(BmapError::Descriptor(_))) => {
                WS_ERR_CODE_BAD_REQUEST
            }
            DeviceError::Driver(DriverError::OnTarget) => WS_ERR_CODE_LOCKED,
            DeviceError::Driver(_) | DeviceError::Writer(_) | DeviceError::Internal(_) => {
                WS_ERR_CODE_INTERNAL
            }
        }
    }
}

impl From<PayloadError> for DeviceError {
    fn from(err: PayloadError) -> Self {
        DeviceError::BadRequest(err.to_string())
    }
}

impl From<BmapError> for DeviceError {
    fn from(err: BmapError) -> Self {
        DeviceError::Writer(WriterError::Bmap(err))
    }
}
