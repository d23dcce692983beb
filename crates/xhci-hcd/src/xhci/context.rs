//! Endpoint and Stream Context structures handed to the controller.
//!
//! Only the fields the transfer engine programs are exposed. Contexts are 32 bytes
//! (`HCCPARAMS1.CSZ = 0`); stream contexts are always 16 bytes.

use crate::dma::DmaBuffer;

use super::endpoint::{Direction, TransferType};

/// Size of an Endpoint Context in bytes.
pub const CONTEXT_SIZE: usize = 32;
/// Number of 32-bit dwords in an Endpoint Context.
pub const CONTEXT_DWORDS: usize = 8;

/// Size of a Stream Context in bytes.
pub const STREAM_CONTEXT_SIZE: usize = 16;

/// Default CErr value: retry a failing transaction three times before halting.
pub const DEFAULT_ERROR_COUNT: u8 = 3;

/// Endpoint type (Endpoint Context EP Type field).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointType {
    Invalid,
    IsochOut,
    BulkOut,
    InterruptOut,
    Control,
    IsochIn,
    BulkIn,
    InterruptIn,
}

impl EndpointType {
    pub const fn from_raw(raw: u8) -> Self {
        match raw & 0x07 {
            1 => EndpointType::IsochOut,
            2 => EndpointType::BulkOut,
            3 => EndpointType::InterruptOut,
            4 => EndpointType::Control,
            5 => EndpointType::IsochIn,
            6 => EndpointType::BulkIn,
            7 => EndpointType::InterruptIn,
            _ => EndpointType::Invalid,
        }
    }

    pub const fn raw(self) -> u8 {
        match self {
            EndpointType::Invalid => 0,
            EndpointType::IsochOut => 1,
            EndpointType::BulkOut => 2,
            EndpointType::InterruptOut => 3,
            EndpointType::Control => 4,
            EndpointType::IsochIn => 5,
            EndpointType::BulkIn => 6,
            EndpointType::InterruptIn => 7,
        }
    }

    pub const fn new(transfer_type: TransferType, direction: Direction) -> Self {
        match (transfer_type, direction) {
            (TransferType::Control, _) => EndpointType::Control,
            (TransferType::Isochronous, Direction::Out) => EndpointType::IsochOut,
            (TransferType::Isochronous, Direction::In) => EndpointType::IsochIn,
            (TransferType::Bulk, Direction::Out) => EndpointType::BulkOut,
            (TransferType::Bulk, Direction::In) => EndpointType::BulkIn,
            (TransferType::Interrupt, Direction::Out) => EndpointType::InterruptOut,
            (TransferType::Interrupt, Direction::In) => EndpointType::InterruptIn,
        }
    }
}

/// Endpoint Context (32 bytes / 8 dwords).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EndpointContext {
    dwords: [u32; CONTEXT_DWORDS],
}

impl EndpointContext {
    pub fn from_bytes(raw: &[u8; CONTEXT_SIZE]) -> Self {
        let mut dwords = [0u32; CONTEXT_DWORDS];
        for (i, dword) in dwords.iter_mut().enumerate() {
            let off = i * 4;
            *dword = u32::from_le_bytes([raw[off], raw[off + 1], raw[off + 2], raw[off + 3]]);
        }
        Self { dwords }
    }

    pub fn to_bytes(&self) -> [u8; CONTEXT_SIZE] {
        let mut raw = [0u8; CONTEXT_SIZE];
        for (i, dword) in self.dwords.iter().enumerate() {
            raw[i * 4..i * 4 + 4].copy_from_slice(&dword.to_le_bytes());
        }
        raw
    }

    pub fn dword(&self, index: usize) -> u32 {
        self.dwords.get(index).copied().unwrap_or(0)
    }

    /// MaxPStreams field (DW0 bits 10..=14).
    pub fn max_primary_streams(&self) -> u8 {
        ((self.dwords[0] >> 10) & 0x1f) as u8
    }

    pub fn set_max_primary_streams(&mut self, value: u8) {
        self.dwords[0] = (self.dwords[0] & !(0x1f << 10)) | ((u32::from(value) & 0x1f) << 10);
    }

    /// Linear Stream Array flag (DW0 bit 15).
    pub fn linear_stream_array(&self) -> bool {
        self.dwords[0] & (1 << 15) != 0
    }

    pub fn set_linear_stream_array(&mut self, lsa: bool) {
        self.dwords[0] = (self.dwords[0] & !(1 << 15)) | (u32::from(lsa) << 15);
    }

    /// Interval field (DW0 bits 16..=23).
    pub fn interval(&self) -> u8 {
        ((self.dwords[0] >> 16) & 0xff) as u8
    }

    pub fn set_interval(&mut self, interval: u8) {
        self.dwords[0] = (self.dwords[0] & !(0xff << 16)) | (u32::from(interval) << 16);
    }

    /// Error Count field (DW1 bits 1..=2).
    pub fn error_count(&self) -> u8 {
        ((self.dwords[1] >> 1) & 0x03) as u8
    }

    pub fn set_error_count(&mut self, cerr: u8) {
        self.dwords[1] = (self.dwords[1] & !(0x03 << 1)) | ((u32::from(cerr) & 0x03) << 1);
    }

    /// Endpoint Type field (DW1 bits 3..=5).
    pub fn endpoint_type(&self) -> EndpointType {
        EndpointType::from_raw(((self.dwords[1] >> 3) & 0x07) as u8)
    }

    pub fn set_endpoint_type(&mut self, ty: EndpointType) {
        self.dwords[1] = (self.dwords[1] & !(0x07 << 3)) | (u32::from(ty.raw()) << 3);
    }

    /// Max Burst Size field (DW1 bits 8..=15), zero-based.
    pub fn max_burst_size(&self) -> u8 {
        ((self.dwords[1] >> 8) & 0xff) as u8
    }

    pub fn set_max_burst_size(&mut self, value: u8) {
        self.dwords[1] = (self.dwords[1] & !(0xff << 8)) | (u32::from(value) << 8);
    }

    /// Max Packet Size field (DW1 bits 16..=31).
    pub fn max_packet_size(&self) -> u16 {
        (self.dwords[1] >> 16) as u16
    }

    pub fn set_max_packet_size(&mut self, mps: u16) {
        self.dwords[1] = (self.dwords[1] & 0xffff) | (u32::from(mps) << 16);
    }

    /// TR Dequeue Pointer, masked to 16-byte alignment.
    pub fn tr_dequeue_pointer(&self) -> u64 {
        (u64::from(self.dwords[3]) << 32 | u64::from(self.dwords[2])) & !0x0f
    }

    /// Dequeue Cycle State (DCS) bit.
    pub fn dcs(&self) -> bool {
        self.dwords[2] & 0x01 != 0
    }

    /// Sets the TR Dequeue Pointer + DCS bit.
    ///
    /// With streams enabled the pointer addresses the Primary Stream Context Array and DCS must
    /// be zero.
    pub fn set_tr_dequeue_pointer(&mut self, ptr: u64, dcs: bool) {
        let raw = (ptr & !0x0f) | u64::from(dcs);
        self.dwords[2] = raw as u32;
        self.dwords[3] = (raw >> 32) as u32;
    }

    /// Average TRB Length field (DW4 bits 0..=15).
    pub fn average_trb_length(&self) -> u16 {
        self.dwords[4] as u16
    }

    pub fn set_average_trb_length(&mut self, len: u16) {
        self.dwords[4] = (self.dwords[4] & !0xffff) | u32::from(len);
    }
}

/// Stream Context Type (bits 3:1 of a Stream Context).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamContextType {
    /// Entry of a Secondary Stream Array pointing at a transfer ring.
    SecondaryRing,
    /// Entry of a linear Primary Stream Array pointing at a transfer ring.
    PrimaryRing,
    /// Primary entry pointing at a Secondary Stream Array of `2^(n + 1)` entries, `n` in 2..=7.
    SecondaryArray(u8),
}

impl StreamContextType {
    /// Encodes a secondary array of `size` entries (a power of two in 8..=256).
    pub fn for_secondary_array(size: usize) -> Option<Self> {
        if !size.is_power_of_two() || !(8..=256).contains(&size) {
            return None;
        }
        Some(StreamContextType::SecondaryArray(
            size.trailing_zeros() as u8 - 1,
        ))
    }

    pub fn raw(self) -> u8 {
        match self {
            StreamContextType::SecondaryRing => 0,
            StreamContextType::PrimaryRing => 1,
            StreamContextType::SecondaryArray(n) => n & 0x07,
        }
    }

    pub fn from_raw(raw: u8) -> Self {
        match raw & 0x07 {
            0 => StreamContextType::SecondaryRing,
            1 => StreamContextType::PrimaryRing,
            n => StreamContextType::SecondaryArray(n),
        }
    }
}

/// Stream Context (16 bytes).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StreamContext {
    pub dequeue: u64,
    pub stopped_edtla: u32,
}

impl StreamContext {
    pub fn new(ptr: u64, dcs: bool, sct: StreamContextType) -> Self {
        Self {
            dequeue: (ptr & !0x0f) | (u64::from(sct.raw()) << 1) | u64::from(dcs),
            stopped_edtla: 0,
        }
    }

    pub fn dequeue_pointer(&self) -> u64 {
        self.dequeue & !0x0f
    }

    pub fn dcs(&self) -> bool {
        self.dequeue & 0x01 != 0
    }

    pub fn sct(&self) -> StreamContextType {
        StreamContextType::from_raw(((self.dequeue >> 1) & 0x07) as u8)
    }

    pub fn to_bytes(&self) -> [u8; STREAM_CONTEXT_SIZE] {
        let mut out = [0u8; STREAM_CONTEXT_SIZE];
        out[0..8].copy_from_slice(&self.dequeue.to_le_bytes());
        out[8..12].copy_from_slice(&(self.stopped_edtla & 0x00ff_ffff).to_le_bytes());
        out
    }

    pub fn from_bytes(raw: [u8; STREAM_CONTEXT_SIZE]) -> Self {
        let mut dequeue = [0u8; 8];
        dequeue.copy_from_slice(&raw[0..8]);
        Self {
            dequeue: u64::from_le_bytes(dequeue),
            stopped_edtla: u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]) & 0x00ff_ffff,
        }
    }

    /// Writes this context as entry `index` of a stream context array.
    pub fn write_entry(&self, array: &DmaBuffer, index: usize) {
        array.write(index * STREAM_CONTEXT_SIZE, &self.to_bytes());
    }

    pub fn read_entry(array: &DmaBuffer, index: usize) -> Self {
        let mut raw = [0u8; STREAM_CONTEXT_SIZE];
        array.read(index * STREAM_CONTEXT_SIZE, &mut raw);
        Self::from_bytes(raw)
    }
}
