//! Producer TRB ring (transfer and command rings).
//!
//! The ring is a list of equally sized segments. The last slot of every segment holds a Link TRB
//! pointing at the next segment's physical address; the Link TRB of the final segment points back
//! at the first one and carries the Toggle Cycle flag. Software owns the enqueue side and tracks
//! the Producer Cycle State (PCS), which flips once per full traversal of the segment list.
//!
//! The consumer (the controller) reports progress only indirectly, through Transfer/Command
//! Completion events. Whoever processes those events calls [`TrbRing::update_dequeue`] so the
//! ring can tell when it is full. One usable slot is always left empty so that a full ring and an
//! empty ring have different enqueue/dequeue relationships.

use std::sync::atomic::{fence, Ordering};

use tracing::trace;

use crate::dma::{DmaBuffer, SharedMemory};
use crate::error::RingError;
use crate::{Result, XhciError};

use super::trb::{Trb, TrbFlags, TRB_LEN};

/// One 4 KiB page worth of TRBs.
pub const DEFAULT_TRBS_PER_SEGMENT: usize = 256;

const SEGMENT_ALIGN: usize = 4096;

#[derive(Debug)]
struct Segment {
    buf: DmaBuffer,
}

impl Segment {
    fn trb_phys(&self, idx: usize) -> u64 {
        self.buf.phys_at(idx * TRB_LEN)
    }

    fn write(&self, idx: usize, trb: &Trb) {
        self.buf.write(idx * TRB_LEN, &trb.to_bytes());
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct RingPos {
    seg: usize,
    idx: usize,
}

#[derive(Debug)]
pub struct TrbRing {
    segments: Vec<Segment>,
    trbs_per_segment: usize,
    enqueue: RingPos,
    /// Last dequeue pointer reported back by the consumer.
    dequeue: u64,
    pcs: bool,
}

impl TrbRing {
    pub fn new(mem: &SharedMemory, segment_count: usize) -> Result<Self> {
        Self::with_geometry(mem, segment_count, DEFAULT_TRBS_PER_SEGMENT)
    }

    pub fn with_geometry(
        mem: &SharedMemory,
        segment_count: usize,
        trbs_per_segment: usize,
    ) -> Result<Self> {
        if segment_count == 0 {
            return Err(XhciError::InvalidConfig("TRB ring needs at least one segment"));
        }
        if trbs_per_segment < 2 {
            return Err(XhciError::InvalidConfig(
                "TRB ring segment needs room for a TRB and a Link TRB",
            ));
        }

        let mut segments = Vec::with_capacity(segment_count);
        for _ in 0..segment_count {
            let buf = DmaBuffer::alloc(mem, trbs_per_segment * TRB_LEN, SEGMENT_ALIGN)?;
            segments.push(Segment { buf });
        }

        let mut ring = Self {
            segments,
            trbs_per_segment,
            enqueue: RingPos { seg: 0, idx: 0 },
            dequeue: 0,
            pcs: true,
        };
        ring.write_links();
        ring.dequeue = ring.phys(ring.enqueue);
        trace!(
            segments = segment_count,
            base = format_args!("{:#x}", ring.dequeue),
            "TRB ring initialised"
        );
        Ok(ring)
    }

    /// Zeroes every segment and returns the producer to the start with PCS = 1.
    ///
    /// The controller must not be processing the ring (endpoint stopped) when this is called.
    pub fn reset(&mut self) {
        for seg in &self.segments {
            seg.buf.zero();
        }
        self.write_links();
        self.enqueue = RingPos { seg: 0, idx: 0 };
        self.pcs = true;
        self.dequeue = self.phys(self.enqueue);
    }

    fn write_links(&self) {
        let count = self.segments.len();
        for (i, seg) in self.segments.iter().enumerate() {
            let next = &self.segments[(i + 1) % count];
            let link = Trb::link(next.trb_phys(0), i + 1 == count);
            seg.write(self.link_index(), &link);
        }
    }

    fn link_index(&self) -> usize {
        self.trbs_per_segment - 1
    }

    fn phys(&self, pos: RingPos) -> u64 {
        self.segments[pos.seg].trb_phys(pos.idx)
    }

    fn next_pos(&self, pos: RingPos) -> RingPos {
        let idx = pos.idx + 1;
        if idx == self.link_index() {
            RingPos {
                seg: (pos.seg + 1) % self.segments.len(),
                idx: 0,
            }
        } else {
            RingPos { seg: pos.seg, idx }
        }
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn trbs_per_segment(&self) -> usize {
        self.trbs_per_segment
    }

    /// Maximum number of TRBs that can be outstanding at once.
    pub fn capacity(&self) -> usize {
        self.segments.len() * self.link_index() - 1
    }

    /// Last reported dequeue pointer. Before any progress report this is the ring base, which is
    /// the value to program into a TR Dequeue Pointer or CRCR.
    pub fn dequeue_ptr(&self) -> u64 {
        self.dequeue
    }

    /// Producer Cycle State; the initial value doubles as the Dequeue Cycle State for contexts.
    pub fn pcs(&self) -> bool {
        self.pcs
    }

    /// Physical address the next TRB will be written to.
    pub fn enqueue_ptr(&self) -> u64 {
        self.phys(self.enqueue)
    }

    /// Returns `true` if `paddr` addresses a TRB slot of this ring.
    pub fn contains(&self, paddr: u64) -> bool {
        paddr % TRB_LEN as u64 == 0 && self.segments.iter().any(|s| s.buf.contains(paddr))
    }

    /// Number of TRBs that can be enqueued before the ring reports full.
    pub fn free_slots(&self) -> usize {
        let mut pos = self.enqueue;
        let mut free = 0;
        // Bounded by the total slot count, so a dequeue pointer that never matches cannot loop.
        for _ in 0..self.segments.len() * self.link_index() {
            pos = self.next_pos(pos);
            if self.phys(pos) == self.dequeue {
                return free;
            }
            free += 1;
        }
        free
    }

    /// Enqueues a single TRB and returns its physical address.
    pub fn enqueue(&mut self, trb: &Trb) -> core::result::Result<u64, RingError> {
        self.enqueue_td(core::slice::from_ref(trb))
    }

    /// Enqueues a Transfer Descriptor made of one or more TRBs.
    ///
    /// Either the whole TD is written or nothing is. Returns the physical address of the last
    /// TRB, which is the one whose completion event identifies the TD.
    pub fn enqueue_td(&mut self, td: &[Trb]) -> core::result::Result<u64, RingError> {
        if td.is_empty() {
            return Ok(self.enqueue_ptr());
        }

        let mut pos = self.enqueue;
        for _ in td {
            pos = self.next_pos(pos);
            if self.phys(pos) == self.dequeue {
                return Err(RingError::Full);
            }
        }

        let first_pos = self.enqueue;
        let first_cycle = self.pcs;
        let mut last_phys = 0;

        for (i, trb) in td.iter().enumerate() {
            let mut trb = *trb;
            // The first TRB is published last, see below.
            trb.set_cycle(if i == 0 { !self.pcs } else { self.pcs });
            let pos = self.enqueue;
            self.segments[pos.seg].write(pos.idx, &trb);
            last_phys = self.phys(pos);
            self.advance(trb.chain());
        }

        fence(Ordering::Release);
        let mut first = td[0];
        first.set_cycle(first_cycle);
        self.segments[first_pos.seg].write(first_pos.idx, &first);

        Ok(last_phys)
    }

    fn advance(&mut self, chained: bool) {
        self.enqueue.idx += 1;
        if self.enqueue.idx != self.link_index() {
            return;
        }

        let seg = self.enqueue.seg;
        let last = seg + 1 == self.segments.len();
        let next = (seg + 1) % self.segments.len();
        let mut link = Trb::link(self.segments[next].trb_phys(0), last);
        link.set_flag(TrbFlags::CHAIN, chained);
        link.set_cycle(self.pcs);
        self.segments[seg].write(self.link_index(), &link);

        if last {
            self.pcs = !self.pcs;
        }
        self.enqueue = RingPos { seg: next, idx: 0 };
    }

    /// Records the consumer's progress as reported by a completion event.
    pub fn update_dequeue(&mut self, paddr: u64) -> core::result::Result<(), RingError> {
        if !self.contains(paddr) {
            return Err(RingError::ForeignDequeue(paddr));
        }
        self.dequeue = paddr;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma::SimMemory;
    use crate::xhci::trb::TrbType;
    use std::sync::Arc;

    fn mem() -> (Arc<SimMemory>, SharedMemory) {
        let sim = SimMemory::shared(0x40_000);
        let mem: SharedMemory = sim.clone();
        (sim, mem)
    }

    fn normal(param: u64) -> Trb {
        let mut trb = Trb::new(param, 0, 0);
        trb.set_trb_type(TrbType::Normal);
        trb
    }

    #[test]
    fn zero_segments_is_a_setup_error() {
        let (_sim, mem) = mem();
        assert!(matches!(
            TrbRing::new(&mem, 0),
            Err(XhciError::InvalidConfig(_))
        ));
        assert!(TrbRing::with_geometry(&mem, 1, 1).is_err());
    }

    #[test]
    fn links_chain_segments_and_last_one_toggles() {
        let (_sim, mem) = mem();
        let ring = TrbRing::with_geometry(&mem, 3, 4).unwrap();
        let bases: Vec<u64> = ring.segments.iter().map(|s| s.trb_phys(0)).collect();
        for (i, seg) in ring.segments.iter().enumerate() {
            let link = Trb::read_from(&*mem, seg.trb_phys(3));
            assert_eq!(link.trb_type(), TrbType::Link);
            assert_eq!(link.parameter, bases[(i + 1) % 3]);
            assert_eq!(link.link_toggle_cycle(), i == 2);
            assert!(!link.cycle());
        }
        assert_eq!(ring.dequeue_ptr(), bases[0]);
        assert!(ring.pcs());
    }

    #[test]
    fn enqueue_returns_physical_addresses_and_crosses_links() {
        let (_sim, mem) = mem();
        let mut ring = TrbRing::with_geometry(&mem, 2, 3).unwrap();
        let base0 = ring.segments[0].trb_phys(0);
        let base1 = ring.segments[1].trb_phys(0);

        assert_eq!(ring.enqueue(&normal(1)).unwrap(), base0);
        assert_eq!(ring.enqueue(&normal(2)).unwrap(), base0 + 16);
        // The Link TRB at the end of segment 0 now carries the producer cycle.
        let link = Trb::read_from(&*mem, base0 + 32);
        assert!(link.cycle());
        assert_eq!(ring.enqueue(&normal(3)).unwrap(), base1);
        assert!(ring.pcs());
    }

    #[test]
    fn ring_full_is_reported_and_cleared_by_dequeue_updates() {
        let (_sim, mem) = mem();
        let mut ring = TrbRing::with_geometry(&mem, 2, 3).unwrap();
        assert_eq!(ring.capacity(), 3);
        assert_eq!(ring.free_slots(), 3);

        let mut addrs = Vec::new();
        for i in 0..3 {
            addrs.push(ring.enqueue(&normal(i)).unwrap());
        }
        assert_eq!(ring.free_slots(), 0);
        assert_eq!(ring.enqueue(&normal(99)), Err(RingError::Full));

        ring.update_dequeue(addrs[1]).unwrap();
        assert_eq!(ring.free_slots(), 1);
        ring.enqueue(&normal(4)).unwrap();
        // Wrapped past the toggle link: PCS flipped exactly once.
        assert!(!ring.pcs());
        assert_eq!(ring.enqueue(&normal(5)), Err(RingError::Full));
    }

    #[test]
    fn td_is_all_or_nothing() {
        let (_sim, mem) = mem();
        let mut ring = TrbRing::with_geometry(&mem, 1, 4).unwrap();
        let before = ring.enqueue_ptr();
        let td = [normal(1), normal(2), normal(3)];
        assert_eq!(ring.enqueue_td(&td), Err(RingError::Full));
        assert_eq!(ring.enqueue_ptr(), before);

        let last = ring.enqueue_td(&td[..2]).unwrap();
        assert_eq!(last, before + 16);
    }

    #[test]
    fn chained_td_propagates_chain_into_link() {
        let (_sim, mem) = mem();
        let mut ring = TrbRing::with_geometry(&mem, 2, 3).unwrap();
        ring.enqueue(&normal(0)).unwrap();

        let mut first = normal(1);
        first.set_flag(TrbFlags::CHAIN, true);
        let td = [first, normal(2)];
        let last = ring.enqueue_td(&td).unwrap();
        assert_eq!(last, ring.segments[1].trb_phys(0));

        let link = Trb::read_from(&*mem, ring.segments[0].trb_phys(2));
        assert!(link.chain());
        let written = Trb::read_from(&*mem, ring.segments[0].trb_phys(1));
        assert!(written.cycle());
        assert_eq!(written.parameter, 1);
    }

    #[test]
    fn foreign_dequeue_pointers_are_rejected() {
        let (_sim, mem) = mem();
        let mut ring = TrbRing::new(&mem, 1).unwrap();
        let base = ring.dequeue_ptr();
        assert_eq!(
            ring.update_dequeue(base + 8),
            Err(RingError::ForeignDequeue(base + 8))
        );
        assert_eq!(
            ring.update_dequeue(base + 4096),
            Err(RingError::ForeignDequeue(base + 4096))
        );
        assert!(ring.update_dequeue(base + 16).is_ok());
    }

    #[test]
    fn reset_restores_initial_state_without_reallocating() {
        let (sim, mem) = mem();
        let mut ring = TrbRing::with_geometry(&mem, 2, 3).unwrap();
        let allocs = sim.total_allocations();
        for i in 0..3 {
            ring.enqueue(&normal(i)).unwrap();
        }
        ring.reset();
        assert_eq!(sim.total_allocations(), allocs);
        assert!(ring.pcs());
        assert_eq!(ring.enqueue_ptr(), ring.dequeue_ptr());
        assert_eq!(ring.free_slots(), ring.capacity());
        let first = Trb::read_from(&*mem, ring.dequeue_ptr());
        assert_eq!(first, Trb::default());
    }

    #[test]
    fn dropping_the_ring_frees_every_segment() {
        let (sim, mem) = mem();
        let ring = TrbRing::new(&mem, 4).unwrap();
        assert_eq!(sim.live_allocations(), 4);
        drop(ring);
        assert_eq!(sim.live_allocations(), 0);
    }
}
