//! Background tasks of a client connection.

pub(crate) mod ping;
pub(crate) mod read;
pub(crate) mod write;
