//! Event Ring consumer.
//!
//! The controller produces Event TRBs into a set of segments described by the Event Ring Segment
//! Table (ERST). Event rings have no Link TRBs: the controller moves to the next ERST entry when
//! a segment is full and wraps to the first entry after the last one, toggling its cycle state.
//!
//! Software consumes entries whose cycle bit matches the Consumer Cycle State (CCS), toggles CCS
//! when its own dequeue position wraps around the segment table, and reports progress back by
//! writing [`EventRing::erdp`] into the interrupter's ERDP register.

use std::sync::atomic::{fence, Ordering};

use tracing::trace;

use crate::dma::{DmaBuffer, SharedMemory};
use crate::{Result, XhciError};

use super::trb::{Trb, TrbFlags, TRB_LEN};
use super::XhciConfig;

/// Size of one ERST entry in bytes.
pub const ERST_ENTRY_LEN: usize = 16;

/// Largest segment the ERST size field allows.
pub const MAX_EVENT_SEGMENT_TRBS: usize = 4096;

const SEGMENT_ALIGN: usize = 4096;
const ERST_ALIGN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RingPos {
    seg: usize,
    idx: usize,
}

/// One ERST entry as laid out in memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErstEntry {
    pub base: u64,
    pub size_trbs: u16,
}

impl ErstEntry {
    pub fn to_bytes(self) -> [u8; ERST_ENTRY_LEN] {
        let mut out = [0u8; ERST_ENTRY_LEN];
        out[0..8].copy_from_slice(&(self.base & !0x3f).to_le_bytes());
        out[8..12].copy_from_slice(&u32::from(self.size_trbs).to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: [u8; ERST_ENTRY_LEN]) -> Self {
        let mut base = [0u8; 8];
        base.copy_from_slice(&bytes[0..8]);
        let size = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]);
        Self {
            base: u64::from_le_bytes(base) & !0x3f,
            size_trbs: (size & 0xffff) as u16,
        }
    }
}

#[derive(Debug)]
pub struct EventRing {
    segments: Vec<DmaBuffer>,
    trbs_per_segment: usize,
    erst: DmaBuffer,
    dequeue: RingPos,
    ccs: bool,
}

impl EventRing {
    /// Event ring with the segment count and segment size of `config`.
    pub fn new(mem: &SharedMemory, config: &XhciConfig) -> Result<Self> {
        Self::with_geometry(mem, config.event_ring_segments, config.trbs_per_segment)
    }

    pub fn with_geometry(
        mem: &SharedMemory,
        segment_count: usize,
        trbs_per_segment: usize,
    ) -> Result<Self> {
        if segment_count == 0 || segment_count > usize::from(u16::MAX) {
            return Err(XhciError::InvalidConfig(
                "event ring segment count must be between 1 and 65535",
            ));
        }
        if trbs_per_segment == 0 || trbs_per_segment > MAX_EVENT_SEGMENT_TRBS {
            return Err(XhciError::InvalidConfig(
                "event ring segment must hold between 1 and 4096 TRBs",
            ));
        }

        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            segments.push(DmaBuffer::alloc(
                mem,
                trbs_per_segment * TRB_LEN,
                SEGMENT_ALIGN,
            )?);
        }

        let erst = DmaBuffer::alloc(mem, segment_count * ERST_ENTRY_LEN, ERST_ALIGN)?;
        for (i, seg) in segments.iter().enumerate() {
            let entry = ErstEntry {
                base: seg.phys(),
                size_trbs: trbs_per_segment as u16,
            };
            erst.write(i * ERST_ENTRY_LEN, &entry.to_bytes());
        }

        trace!(
            segments = segment_count,
            erst = format_args!("{:#x}", erst.phys()),
            "event ring initialised"
        );

        Ok(Self {
            segments,
            trbs_per_segment,
            erst,
            dequeue: RingPos { seg: 0, idx: 0 },
            ccs: true,
        })
    }

    /// Value for ERSTBA.
    pub fn erst_base(&self) -> u64 {
        self.erst.phys()
    }

    /// Value for ERSTSZ.
    pub fn erst_size(&self) -> u16 {
        self.segments.len() as u16
    }

    pub fn erst_entry(&self, idx: usize) -> Option<ErstEntry> {
        if idx >= self.segments.len() {
            return None;
        }
        let mut raw = [0u8; ERST_ENTRY_LEN];
        self.erst.read(idx * ERST_ENTRY_LEN, &mut raw);
        Some(ErstEntry::from_bytes(raw))
    }

    /// Dequeue pointer to report through ERDP: the next entry software will look at.
    pub fn erdp(&self) -> u64 {
        self.segments[self.dequeue.seg].phys_at(self.dequeue.idx * TRB_LEN)
    }

    pub fn ccs(&self) -> bool {
        self.ccs
    }

    /// Pops the next event if the controller has written one.
    pub fn dequeue(&mut self) -> Option<Trb> {
        let seg = &self.segments[self.dequeue.seg];
        let offset = self.dequeue.idx * TRB_LEN;
        let control = seg.read_u32(offset + 12);
        if (control & TrbFlags::CYCLE.bits() != 0) != self.ccs {
            return None;
        }
        // Pairs with the controller publishing the cycle bit after the rest of the TRB.
        fence(Ordering::Acquire);
        let mut raw = [0u8; TRB_LEN];
        seg.read(offset, &mut raw);
        let trb = Trb::from_bytes(raw);

        self.dequeue.idx += 1;
        if self.dequeue.idx == self.trbs_per_segment {
            self.dequeue.idx = 0;
            self.dequeue.seg += 1;
            if self.dequeue.seg == self.segments.len() {
                self.dequeue.seg = 0;
                self.ccs = !self.ccs;
            }
        }
        Some(trb)
    }

    /// Consumes every pending event, handing each to `f`. Returns the number consumed.
    ///
    /// At most one full lap of the ring is consumed per call.
    pub fn drain(&mut self, mut f: impl FnMut(Trb)) -> usize {
        let limit = self.segments.len() * self.trbs_per_segment;
        let mut consumed = 0;
        while consumed < limit {
            let Some(trb) = self.dequeue() else {
                break;
            };
            f(trb);
            consumed += 1;
        }
        consumed
    }

    /// Zeroes the segments and returns to the initial dequeue position with CCS = 1.
    pub fn reset(&mut self) {
        for seg in &self.segments {
            seg.zero();
        }
        self.dequeue = RingPos { seg: 0, idx: 0 };
        self.ccs = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::{DmaMemory, SimMemory};
    use crate::xhci::trb::{CompletionCode, TrbType};
    use std::sync::Arc;

    /// Minimal controller-side producer that walks the ERST like hardware does.
    struct Producer {
        seg: usize,
        idx: usize,
        cycle: bool,
    }

    impl Producer {
        fn new() -> Self {
            Self {
                seg: 0,
                idx: 0,
                cycle: true,
            }
        }

        fn post(&mut self, mem: &dyn DmaMemory, ring: &EventRing, mut trb: Trb) {
            let entry = ring.erst_entry(self.seg).unwrap();
            trb.set_cycle(self.cycle);
            trb.write_to(mem, entry.base + (self.idx * TRB_LEN) as u64);
            self.idx += 1;
            if self.idx == usize::from(entry.size_trbs) {
                self.idx = 0;
                self.seg += 1;
                if self.seg == usize::from(ring.erst_size()) {
                    self.seg = 0;
                    self.cycle = !self.cycle;
                }
            }
        }
    }

    fn event(n: u64) -> Trb {
        Trb::transfer_event(n << 4, CompletionCode::Success, 0, 1, 2)
    }

    fn setup(segments: usize, per: usize) -> (Arc<SimMemory>, SharedMemory, EventRing) {
        let sim = SimMemory::shared(0x40_000);
        let mem: SharedMemory = sim.clone();
        let ring = EventRing::with_geometry(&mem, segments, per).unwrap();
        (sim, mem, ring)
    }

    #[test]
    fn erst_describes_every_segment() {
        let (_sim, _mem, ring) = setup(3, 16);
        assert_eq!(ring.erst_size(), 3);
        let bases: Vec<u64> = (0..3).map(|i| ring.erst_entry(i).unwrap().base).collect();
        for (i, base) in bases.iter().enumerate() {
            assert_eq!(ring.erst_entry(i).unwrap().size_trbs, 16);
            assert_eq!(base % 64, 0);
        }
        assert_eq!(ring.erdp(), bases[0]);
        assert!(ring.erst_entry(3).is_none());
    }

    #[test]
    fn empty_ring_yields_nothing() {
        let (_sim, _mem, mut ring) = setup(1, 16);
        assert_eq!(ring.dequeue(), None);
        assert_eq!(ring.drain(|_| panic!("no events expected")), 0);
    }

    #[test]
    fn consumes_across_segments_and_toggles_ccs_on_wrap() {
        let (_sim, mem, mut ring) = setup(2, 4);
        let mut hw = Producer::new();

        let mut next = 0u64;
        let mut seen = Vec::new();
        // Three laps of a 2x4 ring in uneven batches.
        for batch in [3usize, 5, 1, 7, 8] {
            for _ in 0..batch {
                hw.post(mem.as_ref(), &ring, event(next));
                next += 1;
            }
            let n = ring.drain(|trb| {
                assert_eq!(trb.trb_type(), TrbType::TransferEvent);
                seen.push(trb.parameter >> 4);
            });
            assert_eq!(n, batch);
        }
        assert_eq!(seen, (0..24).collect::<Vec<_>>());
        // 24 events over an 8-entry ring: three wraps.
        assert!(!ring.ccs());
        assert_eq!(ring.erdp(), ring.erst_entry(0).unwrap().base);
    }

    #[test]
    fn stale_entries_from_the_previous_lap_are_ignored() {
        let (_sim, mem, mut ring) = setup(1, 4);
        let mut hw = Producer::new();
        for i in 0..4 {
            hw.post(mem.as_ref(), &ring, event(i));
        }
        assert_eq!(ring.drain(|_| {}), 4);
        // Old lap entries still have cycle = 1, CCS is now 0.
        assert_eq!(ring.dequeue(), None);
        hw.post(mem.as_ref(), &ring, event(10));
        assert_eq!(ring.dequeue().map(|t| t.parameter >> 4), Some(10));
    }

    #[test]
    fn entry_is_consumed_only_after_its_cycle_bit_is_published() {
        let (_sim, mem, mut ring) = setup(1, 4);
        let base = ring.erst_entry(0).unwrap().base;

        // Body written, control word still carries the previous lap's cycle state.
        let mut trb = event(7);
        trb.set_cycle(false);
        trb.write_to(mem.as_ref(), base);
        assert_eq!(ring.dequeue(), None);
        assert_eq!(ring.erdp(), base);

        trb.set_cycle(true);
        mem.write_u32(base + 12, trb.control);
        let seen = ring.dequeue().unwrap();
        assert_eq!(seen.parameter >> 4, 7);
        assert_eq!(seen.completion_code(), CompletionCode::Success);
        assert_eq!(ring.erdp(), base + TRB_LEN as u64);
    }

    #[test]
    fn ring_follows_configured_geometry() {
        let sim = SimMemory::shared(0x40_000);
        let mem: SharedMemory = sim.clone();
        let config = XhciConfig {
            event_ring_segments: 3,
            trbs_per_segment: 8,
            ..XhciConfig::default()
        };
        let ring = EventRing::new(&mem, &config).unwrap();
        assert_eq!(ring.erst_size(), 3);
        assert!((0..3).all(|i| ring.erst_entry(i).unwrap().size_trbs == 8));
    }

    #[test]
    fn invalid_geometry_is_rejected() {
        let sim = SimMemory::shared(0x10_000);
        let mem: SharedMemory = sim.clone();
        assert!(EventRing::with_geometry(&mem, 0, 16).is_err());
        assert!(EventRing::with_geometry(&mem, 1, 0).is_err());
        assert!(EventRing::with_geometry(&mem, 1, 4097).is_err());
        assert_eq!(sim.live_allocations(), 0);
    }

    #[test]
    fn reset_rewinds_the_consumer() {
        let (_sim, mem, mut ring) = setup(1, 4);
        let mut hw = Producer::new();
        hw.post(mem.as_ref(), &ring, event(1));
        assert!(ring.dequeue().is_some());
        ring.reset();
        assert_eq!(ring.erdp(), ring.erst_entry(0).unwrap().base);
        assert!(ring.ccs());
        assert_eq!(ring.dequeue(), None);
    }
}
