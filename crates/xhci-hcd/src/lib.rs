//! Host-side xHCI (USB 3.x) data-transfer engine.
//!
//! This crate implements the parts of an xHCI host-controller driver that move data:
//!
//! - [`xhci::ring::TrbRing`]: the producer TRB ring (transfer/command rings) with Link TRBs and
//!   cycle-bit handling.
//! - [`xhci::event_ring::EventRing`]: the consumer ring the controller reports completions on,
//!   described to hardware by an Event Ring Segment Table.
//! - [`xhci::streams`]: SuperSpeed bulk stream demultiplexing via primary/secondary stream
//!   context arrays.
//! - [`xhci::isoch`]: the isochronous scheduler, which feeds a fixed pool of buffers into the
//!   transfer ring inside the controller's admission window.
//! - [`bus`]: a thin reference-counted endpoint registry and batch submission adapter.
//!
//! Device enumeration, register layouts beyond the few fields the engine reads, and driver
//! framework glue are left to the embedding driver; the engine reaches the controller through
//! the [`xhci::HostController`] trait and DMA memory through [`dma::DmaMemory`].

pub mod bus;
pub mod dma;
pub mod error;
pub mod xhci;

pub use dma::{DmaBuffer, DmaMemory, SharedMemory, SimMemory};
pub use error::{Result, RingError, TransferError, XhciError};
