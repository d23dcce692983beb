use thiserror::Error;

use crate::xhci::trb::CompletionCode;

pub type Result<T> = core::result::Result<T, XhciError>;

/// Errors reported synchronously by configuration and scheduling entry points.
///
/// Hardware-reported transfer failures are *not* represented here: they travel through the
/// per-transfer [`TransferError`] field of a completed batch so that the caller sees them one at
/// a time, oldest first.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum XhciError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("not supported: {0}")]
    NotSupported(&'static str),

    #[error("DMA allocation of {size} bytes failed")]
    OutOfMemory { size: usize },

    #[error("transfer of {len} bytes exceeds the endpoint buffer size {max}")]
    Oversized { len: usize, max: usize },

    #[error("destination of {len} bytes is smaller than the endpoint buffer size {min}")]
    Undersized { len: usize, min: usize },

    #[error("invalid stream ID {0}")]
    InvalidStream(u32),

    #[error("no such endpoint")]
    NoEndpoint,

    #[error("endpoint was torn down")]
    EndpointGone,

    #[error(transparent)]
    Ring(#[from] RingError),

    #[error("failed to start the feed timer: {0:?}")]
    Timer(std::io::ErrorKind),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Producer ring failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    /// The consumer has not advanced far enough to make room for the TD.
    #[error("transfer ring is full")]
    Full,

    /// A reported dequeue pointer does not point into any segment of the ring.
    #[error("dequeue pointer {0:#x} does not belong to this ring")]
    ForeignDequeue(u64),
}

/// Result code attached to a single completed transfer.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransferError {
    #[error("transfer failed with completion code {0:?}")]
    Io(CompletionCode),

    #[error("transfer could not be queued: ring full")]
    RingFull,

    #[error("isochronous IN stream starved: too many missed service intervals")]
    Starved,
}
