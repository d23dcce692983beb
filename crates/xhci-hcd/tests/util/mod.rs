#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use xhci_hcd::xhci::context::EndpointContext;
use xhci_hcd::xhci::event_ring::EventRing;
use xhci_hcd::xhci::regs::MFINDEX_MAX;
use xhci_hcd::xhci::trb::{Trb, TrbType, TRB_LEN};
use xhci_hcd::xhci::HostController;
use xhci_hcd::{DmaMemory, SharedMemory, SimMemory};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    });
}

pub fn sim_memory() -> (Arc<SimMemory>, SharedMemory) {
    let sim = SimMemory::shared(0x100_0000);
    let mem: SharedMemory = sim.clone();
    (sim, mem)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Doorbell {
    pub slot_id: u8,
    pub target: u8,
    /// MFINDEX when the doorbell was rung.
    pub mfindex: u32,
}

enum Clock {
    Manual(AtomicU32),
    /// Counts microframes since `start`.
    FreeRunning { start: Instant, offset: u32 },
}

/// Controller double: an MFINDEX clock plus recorded doorbells and endpoint contexts.
pub struct FakeXhc {
    clock: Clock,
    ist: u32,
    max_psa: AtomicU8,
    doorbells: Mutex<Vec<Doorbell>>,
    contexts: Mutex<Vec<(u8, u8, EndpointContext)>>,
}

impl FakeXhc {
    fn with_clock(clock: Clock, ist: u32) -> Arc<Self> {
        Arc::new(Self {
            clock,
            ist,
            max_psa: AtomicU8::new(0),
            doorbells: Mutex::new(Vec::new()),
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// MFINDEX only moves through [`FakeXhc::advance`] / [`FakeXhc::set_mfindex`].
    pub fn manual(ist: u32) -> Arc<Self> {
        Self::with_clock(Clock::Manual(AtomicU32::new(0)), ist)
    }

    /// MFINDEX follows wall-clock time at 125 µs per microframe.
    pub fn free_running(ist: u32, offset: u32) -> Arc<Self> {
        Self::with_clock(
            Clock::FreeRunning {
                start: Instant::now(),
                offset,
            },
            ist,
        )
    }

    pub fn set_max_psa_size(&self, value: u8) {
        self.max_psa.store(value, Ordering::SeqCst);
    }

    pub fn set_mfindex(&self, value: u32) {
        match &self.clock {
            Clock::Manual(now) => now.store(value % MFINDEX_MAX, Ordering::SeqCst),
            Clock::FreeRunning { .. } => panic!("free-running clock cannot be set"),
        }
    }

    pub fn advance(&self, uframes: u32) {
        self.set_mfindex(self.mfindex() + uframes);
    }

    pub fn doorbells(&self) -> Vec<Doorbell> {
        self.doorbells.lock().unwrap().clone()
    }

    pub fn contexts(&self) -> Vec<(u8, u8, EndpointContext)> {
        self.contexts.lock().unwrap().clone()
    }
}

impl HostController for FakeXhc {
    fn mfindex(&self) -> u32 {
        match &self.clock {
            Clock::Manual(now) => now.load(Ordering::SeqCst),
            Clock::FreeRunning { start, offset } => {
                let uframes = start.elapsed().as_micros() / 125;
                ((uframes as u64 + u64::from(*offset)) % u64::from(MFINDEX_MAX)) as u32
            }
        }
    }

    fn hcsparams2(&self) -> u32 {
        // IST bit 3 switches the count from microframes to frames.
        if self.ist < 8 {
            self.ist
        } else {
            (self.ist / 8) | 0x8
        }
    }

    fn hccparams1(&self) -> u32 {
        u32::from(self.max_psa.load(Ordering::SeqCst)) << 12
    }

    fn ring_doorbell(&self, slot_id: u8, target: u8) {
        let mfindex = self.mfindex();
        self.doorbells.lock().unwrap().push(Doorbell {
            slot_id,
            target,
            mfindex,
        });
    }

    fn add_endpoint(
        &self,
        slot_id: u8,
        ep_index: u8,
        ctx: &EndpointContext,
    ) -> xhci_hcd::Result<()> {
        self.contexts.lock().unwrap().push((slot_id, ep_index, *ctx));
        Ok(())
    }
}

/// Consumer side of a transfer ring, walking it the way the controller does.
pub struct RingWalker {
    mem: SharedMemory,
    ptr: u64,
    ccs: bool,
}

impl RingWalker {
    pub fn new(mem: &SharedMemory, dequeue: u64, dcs: bool) -> Self {
        Self {
            mem: Arc::clone(mem),
            ptr: dequeue,
            ccs: dcs,
        }
    }

    /// Next TRB owned by the consumer, with its address. Link TRBs are followed silently.
    pub fn next(&mut self) -> Option<(u64, Trb)> {
        for _ in 0..64 {
            let trb = Trb::read_from(&*self.mem, self.ptr);
            if trb.cycle() != self.ccs {
                return None;
            }
            if trb.trb_type() == TrbType::Link {
                if trb.link_toggle_cycle() {
                    self.ccs = !self.ccs;
                }
                self.ptr = trb.parameter & !0x0f;
                continue;
            }
            let at = self.ptr;
            self.ptr += TRB_LEN as u64;
            return Some((at, trb));
        }
        panic!("link TRB loop in transfer ring");
    }

    pub fn drain(&mut self) -> Vec<(u64, Trb)> {
        std::iter::from_fn(|| self.next()).collect()
    }

    pub fn ccs(&self) -> bool {
        self.ccs
    }
}

/// Producer side of an event ring, writing events the way the controller does.
pub struct EventProducer {
    mem: SharedMemory,
    segments: Vec<(u64, usize)>,
    seg: usize,
    idx: usize,
    pcs: bool,
}

impl EventProducer {
    pub fn new(mem: &SharedMemory, ring: &EventRing) -> Self {
        let segments = (0..usize::from(ring.erst_size()))
            .filter_map(|i| ring.erst_entry(i))
            .map(|e| (e.base, usize::from(e.size_trbs)))
            .collect();
        Self {
            mem: Arc::clone(mem),
            segments,
            seg: 0,
            idx: 0,
            pcs: true,
        }
    }

    pub fn post(&mut self, mut trb: Trb) {
        let (base, len) = self.segments[self.seg];
        trb.set_cycle(self.pcs);
        trb.write_to(&*self.mem, base + (self.idx * TRB_LEN) as u64);
        self.idx += 1;
        if self.idx == len {
            self.idx = 0;
            self.seg += 1;
            if self.seg == self.segments.len() {
                self.seg = 0;
                self.pcs = !self.pcs;
            }
        }
    }
}

/// Polls `cond` until it holds, failing the test after a few seconds.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Copies `len` bytes out of simulated DMA memory.
pub fn read_dma(mem: &SharedMemory, paddr: u64, len: usize) -> Vec<u8> {
    let mut out = vec![0; len];
    mem.read_physical(paddr, &mut out);
    out
}
