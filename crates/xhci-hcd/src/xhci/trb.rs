//! Transfer Request Blocks.
//!
//! A TRB is 16 bytes: a 64-bit parameter, a 32-bit status word and a 32-bit control word, all
//! little-endian. Field positions follow the xHCI specification bit for bit.

use bitflags::bitflags;

use crate::dma::DmaMemory;

/// Size of a TRB in bytes.
pub const TRB_LEN: usize = 16;

const TRB_TYPE_SHIFT: u32 = 10;
const TRB_TYPE_MASK: u32 = 0x3f << TRB_TYPE_SHIFT;

const XFER_LEN_MASK: u32 = 0x1_ffff;
const TD_SIZE_SHIFT: u32 = 17;
const TD_SIZE_MASK: u32 = 0x1f << TD_SIZE_SHIFT;
const INTERRUPTER_SHIFT: u32 = 22;
const INTERRUPTER_MASK: u32 = 0x3ff << INTERRUPTER_SHIFT;

const EVENT_LEN_MASK: u32 = 0x00ff_ffff;
const COMPLETION_CODE_SHIFT: u32 = 24;

const ISOCH_TBC_SHIFT: u32 = 7;
const ISOCH_TBC_MASK: u32 = 0x3 << ISOCH_TBC_SHIFT;
const ISOCH_TLBPC_SHIFT: u32 = 16;
const ISOCH_TLBPC_MASK: u32 = 0xf << ISOCH_TLBPC_SHIFT;
const ISOCH_FRAME_ID_SHIFT: u32 = 20;
const ISOCH_FRAME_ID_MASK: u32 = 0x7ff << ISOCH_FRAME_ID_SHIFT;

const ENDPOINT_ID_SHIFT: u32 = 16;
const ENDPOINT_ID_MASK: u32 = 0x1f << ENDPOINT_ID_SHIFT;
const SLOT_ID_SHIFT: u32 = 24;
const SLOT_ID_MASK: u32 = 0xff << SLOT_ID_SHIFT;

bitflags! {
    /// Single-bit fields of the TRB control word.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
    pub struct TrbFlags: u32 {
        const CYCLE = 1 << 0;
        /// Toggle Cycle on Link TRBs, Evaluate Next TRB on transfer TRBs.
        const TOGGLE_CYCLE = 1 << 1;
        const ISP = 1 << 2;
        const NO_SNOOP = 1 << 3;
        const CHAIN = 1 << 4;
        const IOC = 1 << 5;
        const IDT = 1 << 6;
        const BEI = 1 << 9;
        /// Start Isoch ASAP.
        const SIA = 1 << 31;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrbType {
    Normal,
    SetupStage,
    DataStage,
    StatusStage,
    Isoch,
    Link,
    EventData,
    NoOp,
    TransferEvent,
    CommandCompletionEvent,
    PortStatusChangeEvent,
    MfindexWrapEvent,
    Unknown(u8),
}

impl TrbType {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => TrbType::Normal,
            2 => TrbType::SetupStage,
            3 => TrbType::DataStage,
            4 => TrbType::StatusStage,
            5 => TrbType::Isoch,
            6 => TrbType::Link,
            7 => TrbType::EventData,
            8 => TrbType::NoOp,
            32 => TrbType::TransferEvent,
            33 => TrbType::CommandCompletionEvent,
            34 => TrbType::PortStatusChangeEvent,
            39 => TrbType::MfindexWrapEvent,
            other => TrbType::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            TrbType::Normal => 1,
            TrbType::SetupStage => 2,
            TrbType::DataStage => 3,
            TrbType::StatusStage => 4,
            TrbType::Isoch => 5,
            TrbType::Link => 6,
            TrbType::EventData => 7,
            TrbType::NoOp => 8,
            TrbType::TransferEvent => 32,
            TrbType::CommandCompletionEvent => 33,
            TrbType::PortStatusChangeEvent => 34,
            TrbType::MfindexWrapEvent => 39,
            TrbType::Unknown(raw) => raw & 0x3f,
        }
    }
}

/// Completion codes reported in event TRBs (status bits 31:24).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionCode {
    Invalid,
    Success,
    DataBufferError,
    BabbleDetected,
    UsbTransactionError,
    TrbError,
    StallError,
    ResourceError,
    BandwidthError,
    NoSlotsAvailable,
    InvalidStreamType,
    SlotNotEnabled,
    EndpointNotEnabled,
    ShortPacket,
    RingUnderrun,
    RingOverrun,
    ParameterError,
    ContextStateError,
    MissedServiceError,
    Stopped,
    IsochBufferOverrun,
    InvalidStreamId,
    Unknown(u8),
}

impl CompletionCode {
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            0 => CompletionCode::Invalid,
            1 => CompletionCode::Success,
            2 => CompletionCode::DataBufferError,
            3 => CompletionCode::BabbleDetected,
            4 => CompletionCode::UsbTransactionError,
            5 => CompletionCode::TrbError,
            6 => CompletionCode::StallError,
            7 => CompletionCode::ResourceError,
            8 => CompletionCode::BandwidthError,
            9 => CompletionCode::NoSlotsAvailable,
            10 => CompletionCode::InvalidStreamType,
            11 => CompletionCode::SlotNotEnabled,
            12 => CompletionCode::EndpointNotEnabled,
            13 => CompletionCode::ShortPacket,
            14 => CompletionCode::RingUnderrun,
            15 => CompletionCode::RingOverrun,
            17 => CompletionCode::ParameterError,
            19 => CompletionCode::ContextStateError,
            23 => CompletionCode::MissedServiceError,
            26 => CompletionCode::Stopped,
            31 => CompletionCode::IsochBufferOverrun,
            34 => CompletionCode::InvalidStreamId,
            other => CompletionCode::Unknown(other),
        }
    }

    pub fn raw(self) -> u8 {
        match self {
            CompletionCode::Invalid => 0,
            CompletionCode::Success => 1,
            CompletionCode::DataBufferError => 2,
            CompletionCode::BabbleDetected => 3,
            CompletionCode::UsbTransactionError => 4,
            CompletionCode::TrbError => 5,
            CompletionCode::StallError => 6,
            CompletionCode::ResourceError => 7,
            CompletionCode::BandwidthError => 8,
            CompletionCode::NoSlotsAvailable => 9,
            CompletionCode::InvalidStreamType => 10,
            CompletionCode::SlotNotEnabled => 11,
            CompletionCode::EndpointNotEnabled => 12,
            CompletionCode::ShortPacket => 13,
            CompletionCode::RingUnderrun => 14,
            CompletionCode::RingOverrun => 15,
            CompletionCode::ParameterError => 17,
            CompletionCode::ContextStateError => 19,
            CompletionCode::MissedServiceError => 23,
            CompletionCode::Stopped => 26,
            CompletionCode::IsochBufferOverrun => 31,
            CompletionCode::InvalidStreamId => 34,
            CompletionCode::Unknown(raw) => raw,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Trb {
    pub parameter: u64,
    pub status: u32,
    pub control: u32,
}

impl Trb {
    pub const fn new(parameter: u64, status: u32, control: u32) -> Self {
        Self {
            parameter,
            status,
            control,
        }
    }

    /// Link TRB pointing at the segment starting at `next_segment`.
    pub fn link(next_segment: u64, toggle_cycle: bool) -> Self {
        let mut trb = Trb::new(next_segment & !0x0f, 0, 0);
        trb.set_trb_type(TrbType::Link);
        trb.set_flag(TrbFlags::TOGGLE_CYCLE, toggle_cycle);
        trb
    }

    pub fn from_bytes(bytes: [u8; TRB_LEN]) -> Self {
        let mut parameter = [0u8; 8];
        parameter.copy_from_slice(&bytes[0..8]);
        Self {
            parameter: u64::from_le_bytes(parameter),
            status: u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]),
            control: u32::from_le_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]),
        }
    }

    pub fn to_bytes(&self) -> [u8; TRB_LEN] {
        let mut out = [0u8; TRB_LEN];
        out[0..8].copy_from_slice(&self.parameter.to_le_bytes());
        out[8..12].copy_from_slice(&self.status.to_le_bytes());
        out[12..16].copy_from_slice(&self.control.to_le_bytes());
        out
    }

    pub fn read_from(mem: &(impl DmaMemory + ?Sized), paddr: u64) -> Self {
        let mut bytes = [0u8; TRB_LEN];
        mem.read_physical(paddr, &mut bytes);
        Self::from_bytes(bytes)
    }

    pub fn write_to(&self, mem: &(impl DmaMemory + ?Sized), paddr: u64) {
        mem.write_physical(paddr, &self.to_bytes());
    }

    pub fn flags(&self) -> TrbFlags {
        TrbFlags::from_bits_truncate(self.control)
    }

    pub fn has_flag(&self, flag: TrbFlags) -> bool {
        self.control & flag.bits() == flag.bits()
    }

    pub fn set_flag(&mut self, flag: TrbFlags, on: bool) {
        if on {
            self.control |= flag.bits();
        } else {
            self.control &= !flag.bits();
        }
    }

    pub fn cycle(&self) -> bool {
        self.has_flag(TrbFlags::CYCLE)
    }

    pub fn set_cycle(&mut self, cycle: bool) {
        self.set_flag(TrbFlags::CYCLE, cycle);
    }

    pub fn chain(&self) -> bool {
        self.has_flag(TrbFlags::CHAIN)
    }

    pub fn link_toggle_cycle(&self) -> bool {
        self.has_flag(TrbFlags::TOGGLE_CYCLE)
    }

    pub fn trb_type_raw(&self) -> u8 {
        ((self.control & TRB_TYPE_MASK) >> TRB_TYPE_SHIFT) as u8
    }

    pub fn trb_type(&self) -> TrbType {
        TrbType::from_raw(self.trb_type_raw())
    }

    pub fn set_trb_type(&mut self, ty: TrbType) {
        self.control =
            (self.control & !TRB_TYPE_MASK) | ((u32::from(ty.raw()) << TRB_TYPE_SHIFT) & TRB_TYPE_MASK);
    }

    /// TRB Transfer Length (status bits 16:0) of a transfer TRB.
    pub fn transfer_length(&self) -> u32 {
        self.status & XFER_LEN_MASK
    }

    pub fn set_transfer_length(&mut self, len: u32) {
        self.status = (self.status & !XFER_LEN_MASK) | (len & XFER_LEN_MASK);
    }

    pub fn set_td_size(&mut self, td_size: u8) {
        self.status =
            (self.status & !TD_SIZE_MASK) | ((u32::from(td_size) << TD_SIZE_SHIFT) & TD_SIZE_MASK);
    }

    pub fn td_size(&self) -> u8 {
        ((self.status & TD_SIZE_MASK) >> TD_SIZE_SHIFT) as u8
    }

    pub fn set_interrupter_target(&mut self, target: u16) {
        self.status = (self.status & !INTERRUPTER_MASK)
            | ((u32::from(target) << INTERRUPTER_SHIFT) & INTERRUPTER_MASK);
    }

    /// Residual byte count reported by a Transfer Event (status bits 23:0).
    pub fn event_transfer_length(&self) -> u32 {
        self.status & EVENT_LEN_MASK
    }

    pub fn completion_code_raw(&self) -> u8 {
        (self.status >> COMPLETION_CODE_SHIFT) as u8
    }

    pub fn completion_code(&self) -> CompletionCode {
        CompletionCode::from_raw(self.completion_code_raw())
    }

    /// Transfer Burst Count of an Isoch TRB (control bits 8:7).
    pub fn isoch_tbc(&self) -> u8 {
        ((self.control & ISOCH_TBC_MASK) >> ISOCH_TBC_SHIFT) as u8
    }

    pub fn set_isoch_tbc(&mut self, tbc: u8) {
        self.control = (self.control & !ISOCH_TBC_MASK)
            | ((u32::from(tbc) << ISOCH_TBC_SHIFT) & ISOCH_TBC_MASK);
    }

    /// Transfer Last Burst Packet Count of an Isoch TRB (control bits 19:16).
    pub fn isoch_tlbpc(&self) -> u8 {
        ((self.control & ISOCH_TLBPC_MASK) >> ISOCH_TLBPC_SHIFT) as u8
    }

    pub fn set_isoch_tlbpc(&mut self, tlbpc: u8) {
        self.control = (self.control & !ISOCH_TLBPC_MASK)
            | ((u32::from(tlbpc) << ISOCH_TLBPC_SHIFT) & ISOCH_TLBPC_MASK);
    }

    /// Frame ID of an Isoch TRB (control bits 30:20).
    pub fn isoch_frame_id(&self) -> u16 {
        ((self.control & ISOCH_FRAME_ID_MASK) >> ISOCH_FRAME_ID_SHIFT) as u16
    }

    pub fn set_isoch_frame_id(&mut self, frame_id: u16) {
        self.control = (self.control & !ISOCH_FRAME_ID_MASK)
            | ((u32::from(frame_id) << ISOCH_FRAME_ID_SHIFT) & ISOCH_FRAME_ID_MASK);
    }

    /// Endpoint ID (DCI) of an event TRB (control bits 20:16).
    pub fn endpoint_id(&self) -> u8 {
        ((self.control & ENDPOINT_ID_MASK) >> ENDPOINT_ID_SHIFT) as u8
    }

    pub fn set_endpoint_id(&mut self, id: u8) {
        self.control = (self.control & !ENDPOINT_ID_MASK)
            | ((u32::from(id) << ENDPOINT_ID_SHIFT) & ENDPOINT_ID_MASK);
    }

    pub fn slot_id(&self) -> u8 {
        ((self.control & SLOT_ID_MASK) >> SLOT_ID_SHIFT) as u8
    }

    pub fn set_slot_id(&mut self, id: u8) {
        self.control =
            (self.control & !SLOT_ID_MASK) | ((u32::from(id) << SLOT_ID_SHIFT) & SLOT_ID_MASK);
    }

    /// Builds a Transfer Event as the controller would post it.
    pub fn transfer_event(
        trb_pointer: u64,
        code: CompletionCode,
        residual: u32,
        slot_id: u8,
        endpoint_id: u8,
    ) -> Self {
        let mut trb = Trb::new(
            trb_pointer,
            (u32::from(code.raw()) << COMPLETION_CODE_SHIFT) | (residual & EVENT_LEN_MASK),
            0,
        );
        trb.set_trb_type(TrbType::TransferEvent);
        trb.set_slot_id(slot_id);
        trb.set_endpoint_id(endpoint_id);
        trb
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout_is_little_endian() {
        let trb = Trb::new(0x1122_3344_5566_7788, 0xaabb_ccdd, 0x0102_0304);
        let bytes = trb.to_bytes();
        assert_eq!(&bytes[0..8], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&bytes[8..12], &[0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(&bytes[12..16], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(Trb::from_bytes(bytes), trb);
    }

    #[test]
    fn isoch_fields_land_on_their_bits() {
        let mut trb = Trb::default();
        trb.set_trb_type(TrbType::Isoch);
        trb.set_isoch_tbc(0x3);
        trb.set_isoch_tlbpc(0xf);
        trb.set_isoch_frame_id(0x7ff);
        trb.set_flag(TrbFlags::IOC, true);
        assert_eq!(trb.control, (5 << 10) | (0x3 << 7) | (0xf << 16) | (0x7ff << 20) | (1 << 5));

        // Out-of-range values are masked to the field width.
        trb.set_isoch_frame_id(0x800);
        assert_eq!(trb.isoch_frame_id(), 0);
        assert_eq!(trb.trb_type(), TrbType::Isoch);
    }

    #[test]
    fn transfer_length_and_td_size_share_the_status_word() {
        let mut trb = Trb::default();
        trb.set_transfer_length(0x1_ffff);
        trb.set_td_size(0x1f);
        trb.set_interrupter_target(0x3ff);
        assert_eq!(trb.status, 0xffff_ffff);
        trb.set_transfer_length(3072);
        assert_eq!(trb.transfer_length(), 3072);
        assert_eq!(trb.td_size(), 0x1f);
    }

    #[test]
    fn transfer_event_fields_roundtrip() {
        let ev = Trb::transfer_event(0xdead_bee0, CompletionCode::ShortPacket, 100, 3, 5);
        assert_eq!(ev.trb_type(), TrbType::TransferEvent);
        assert_eq!(ev.completion_code(), CompletionCode::ShortPacket);
        assert_eq!(ev.event_transfer_length(), 100);
        assert_eq!(ev.slot_id(), 3);
        assert_eq!(ev.endpoint_id(), 5);
        assert_eq!(ev.parameter, 0xdead_bee0);
    }

    #[test]
    fn link_trb_masks_pointer_and_sets_toggle() {
        let link = Trb::link(0x2000f, true);
        assert_eq!(link.parameter, 0x20000);
        assert_eq!(link.trb_type(), TrbType::Link);
        assert!(link.link_toggle_cycle());
        assert!(!Trb::link(0x3000, false).link_toggle_cycle());
    }

    #[test]
    fn unknown_codes_are_preserved() {
        assert_eq!(CompletionCode::from_raw(200), CompletionCode::Unknown(200));
        assert_eq!(CompletionCode::Unknown(200).raw(), 200);
        assert_eq!(TrbType::from_raw(0x3f), TrbType::Unknown(0x3f));
        for raw in 0..=0x3f {
            assert_eq!(TrbType::from_raw(raw).raw(), raw);
        }
    }
}
