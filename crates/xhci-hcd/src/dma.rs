//! DMA memory shared between the driver and the host controller.
//!
//! Every hardware-visible structure in this crate (TRB segments, the ERST, stream context arrays,
//! isochronous data buffers) lives in memory handed out by a [`DmaMemory`] implementation and is
//! addressed by physical address, exactly as the controller sees it. Allocations are owned by a
//! [`DmaBuffer`], which returns the memory to the allocator when dropped; a half-built structure
//! therefore unwinds by simply being dropped.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::{Result, XhciError};

/// Physical memory that both software and the controller can access, plus its allocator.
///
/// Implementations use interior mutability: the controller is a concurrent party and several
/// endpoints write their own buffers from different threads.
pub trait DmaMemory: Send + Sync {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]);

    fn write_physical(&self, paddr: u64, buf: &[u8]);

    /// Allocates `size` bytes aligned to `align` (a power of two). The contents are unspecified.
    fn alloc(&self, size: usize, align: usize) -> Option<u64>;

    fn free(&self, paddr: u64, size: usize);

    fn read_u32(&self, paddr: u64) -> u32 {
        let mut buf = [0u8; 4];
        self.read_physical(paddr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn read_u64(&self, paddr: u64) -> u64 {
        let mut buf = [0u8; 8];
        self.read_physical(paddr, &mut buf);
        u64::from_le_bytes(buf)
    }

    fn write_u32(&self, paddr: u64, value: u32) {
        self.write_physical(paddr, &value.to_le_bytes());
    }

    fn write_u64(&self, paddr: u64, value: u64) {
        self.write_physical(paddr, &value.to_le_bytes());
    }
}

pub type SharedMemory = Arc<dyn DmaMemory>;

/// One zero-initialised DMA allocation, freed exactly once on drop.
pub struct DmaBuffer {
    mem: SharedMemory,
    paddr: u64,
    len: usize,
}

impl DmaBuffer {
    pub fn alloc(mem: &SharedMemory, len: usize, align: usize) -> Result<Self> {
        if len == 0 {
            return Err(XhciError::InvalidConfig("zero-sized DMA buffer"));
        }
        let paddr = mem
            .alloc(len, align)
            .ok_or(XhciError::OutOfMemory { size: len })?;
        let buf = Self {
            mem: Arc::clone(mem),
            paddr,
            len,
        };
        buf.zero();
        Ok(buf)
    }

    pub fn phys(&self) -> u64 {
        self.paddr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Physical address of byte `offset` within the buffer.
    pub fn phys_at(&self, offset: usize) -> u64 {
        debug_assert!(offset <= self.len);
        self.paddr + offset as u64
    }

    /// Returns `true` if `paddr` falls inside this buffer.
    pub fn contains(&self, paddr: u64) -> bool {
        paddr >= self.paddr && paddr < self.paddr + self.len as u64
    }

    pub fn read(&self, offset: usize, buf: &mut [u8]) {
        assert!(offset + buf.len() <= self.len, "DMA read out of bounds");
        self.mem.read_physical(self.phys_at(offset), buf);
    }

    pub fn write(&self, offset: usize, data: &[u8]) {
        assert!(offset + data.len() <= self.len, "DMA write out of bounds");
        self.mem.write_physical(self.phys_at(offset), data);
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw);
        u32::from_le_bytes(raw)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write(offset, &value.to_le_bytes());
    }

    pub fn zero(&self) {
        const CHUNK: [u8; 256] = [0; 256];
        let mut off = 0;
        while off < self.len {
            let n = (self.len - off).min(CHUNK.len());
            self.mem.write_physical(self.paddr + off as u64, &CHUNK[..n]);
            off += n;
        }
    }

    pub fn memory(&self) -> &SharedMemory {
        &self.mem
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.mem.free(self.paddr, self.len);
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("paddr", &format_args!("{:#x}", self.paddr))
            .field("len", &self.len)
            .finish()
    }
}

/// Physical address of the first byte handed out by [`SimMemory`].
///
/// Address 0 is kept unused so a zeroed pointer field never aliases a live allocation.
pub const SIM_MEMORY_BASE: u64 = 0x1_0000;

#[derive(Default)]
struct SimInner {
    data: Vec<u8>,
    /// Live allocations keyed by physical address, value is the size in bytes.
    live: BTreeMap<u64, usize>,
    allocs: usize,
    frees: usize,
    fail_after: Option<usize>,
}

/// Software-backed [`DmaMemory`]: a flat byte array with a first-fit allocator.
///
/// Used to run the transfer engine without a real controller (tests, host-side simulation).
/// It keeps allocation accounting so callers can check that teardown returned every buffer.
pub struct SimMemory {
    inner: Mutex<SimInner>,
}

impl SimMemory {
    pub fn new(size: usize) -> Self {
        Self {
            inner: Mutex::new(SimInner {
                data: vec![0; size],
                ..SimInner::default()
            }),
        }
    }

    pub fn shared(size: usize) -> Arc<Self> {
        Arc::new(Self::new(size))
    }

    fn lock(&self) -> MutexGuard<'_, SimInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of allocations currently outstanding.
    pub fn live_allocations(&self) -> usize {
        self.lock().live.len()
    }

    pub fn total_allocations(&self) -> usize {
        self.lock().allocs
    }

    pub fn total_frees(&self) -> usize {
        self.lock().frees
    }

    /// Makes every allocation after the next `n` successful ones fail. `None` disables injection.
    pub fn fail_after(&self, n: Option<usize>) {
        self.lock().fail_after = n;
    }
}

impl DmaMemory for SimMemory {
    fn read_physical(&self, paddr: u64, buf: &mut [u8]) {
        let inner = self.lock();
        let Some(start) = paddr.checked_sub(SIM_MEMORY_BASE) else {
            buf.fill(0);
            return;
        };
        let start = start as usize;
        let end = start.saturating_add(buf.len());
        if end > inner.data.len() {
            // Out-of-range reads return zeros.
            buf.fill(0);
            return;
        }
        buf.copy_from_slice(&inner.data[start..end]);
    }

    fn write_physical(&self, paddr: u64, buf: &[u8]) {
        let mut inner = self.lock();
        let Some(start) = paddr.checked_sub(SIM_MEMORY_BASE) else {
            return;
        };
        let start = start as usize;
        let end = start.saturating_add(buf.len());
        if end > inner.data.len() {
            return;
        }
        inner.data[start..end].copy_from_slice(buf);
    }

    fn alloc(&self, size: usize, align: usize) -> Option<u64> {
        let mut inner = self.lock();
        if let Some(left) = inner.fail_after.as_mut() {
            if *left == 0 {
                return None;
            }
            *left -= 1;
        }

        let align = align.max(1) as u64;
        let limit = SIM_MEMORY_BASE + inner.data.len() as u64;
        let mut candidate = SIM_MEMORY_BASE;
        for (&base, &len) in inner.live.iter() {
            let aligned = candidate.next_multiple_of(align);
            if aligned + size as u64 <= base {
                break;
            }
            candidate = candidate.max(base + len as u64);
        }
        let paddr = candidate.next_multiple_of(align);
        if paddr + size as u64 > limit {
            return None;
        }
        inner.live.insert(paddr, size);
        inner.allocs += 1;
        Some(paddr)
    }

    fn free(&self, paddr: u64, size: usize) {
        let mut inner = self.lock();
        match inner.live.remove(&paddr) {
            Some(len) => {
                debug_assert_eq!(len, size, "DMA free with mismatched size");
                inner.frees += 1;
            }
            None => {
                tracing::error!(paddr = format_args!("{paddr:#x}"), "free of unknown DMA buffer");
            }
        }
    }
}
