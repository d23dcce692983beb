//! Isochronous transfer scheduling.
//!
//! Each isochronous endpoint owns a fixed pool of DMA buffers ("slots") that cycle through
//! `Empty -> Filled -> Fed -> Complete -> Empty`. Callers fill (OUT) or drain (IN) slots in ring
//! order through [`IsochEndpoint::schedule_out`] / [`IsochEndpoint::schedule_in`]; the feed loop
//! hands filled slots to the controller once their target microframe falls inside the admission
//! window, and [`IsochEndpoint::handle_transfer_event`] moves them to `Complete`.
//!
//! All endpoint state lives behind one mutex. A condition variable announces slot state changes
//! to blocked callers, which re-check their condition after every wake-up. A single deferred
//! timer retries feeding when the next slot's window has not opened yet.

pub mod timer;
pub mod window;

use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::dma::{DmaBuffer, SharedMemory};
use crate::error::TransferError;
use crate::{Result, XhciError};

use self::timer::FeedTimer;
use self::window::{calc_next_mfindex, late_target, window_decide, WindowDecision};
use super::endpoint::{DeviceInfo, Direction, EndpointDesc, TransferType};
use super::regs::MFINDEX_MAX;
use super::ring::TrbRing;
use super::trb::{CompletionCode, Trb};
use super::{HostController, XhciConfig};

/// Smallest buffer pool; one slot on the wire while the next one is being prepared.
pub const DEFAULT_MIN_BUFFERS: usize = 2;

pub const DEFAULT_MAX_LATE_REFEEDS: u32 = 8;

/// Largest payload an Isoch TRB Transfer Length can describe.
const MAX_ISOCH_PAYLOAD: usize = 0x1_ffff;

const BUFFER_ALIGN: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum SlotState {
    /// Free for new data (OUT) or for re-feeding (IN).
    Empty,
    /// Has data and a target microframe, not on the ring yet.
    Filled,
    /// On the ring, waiting for its Transfer Event.
    Fed,
    /// Result ready for the caller.
    Complete,
}

impl SlotState {
    fn can_become(self, next: SlotState) -> bool {
        use SlotState::*;
        matches!(
            (self, next),
            (Empty, Filled) | (Filled, Fed) | (Filled, Complete) | (Fed, Complete) | (Complete, Empty)
        )
    }
}

/// Counters kept per endpoint since setup.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IsochStats {
    /// TRBs placed on the ring.
    pub fed: u64,
    /// Slots completed by the controller without error.
    pub completed: u64,
    /// OUT slots dropped because their service interval had passed.
    pub skipped: u64,
    /// Slots completed with an error (hardware-reported, ring full or starvation).
    pub failed: u64,
    pub bytes_completed: u64,
    /// Times the feed loop stopped on a slot whose window had not opened.
    pub deferrals: u64,
    /// Data-flow resets after setup.
    pub resets: u64,
    /// Late IN slots re-targeted and fed anyway.
    pub late_refeeds: u64,
    /// Late IN slots given up on.
    pub starved: u64,
}

/// Point-in-time view of the slot pool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IsochSnapshot {
    pub slots: Vec<SlotState>,
    pub enqueue: usize,
    pub dequeue: usize,
    pub hw_enqueue: usize,
    pub last_mfindex: Option<u32>,
    pub timer_armed: bool,
}

/// Pool geometry derived from the endpoint and controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IsochGeometry {
    pub buffer_count: usize,
    /// Size of every slot buffer in bytes.
    pub max_size: usize,
    /// Service interval in microframes.
    pub interval: u32,
    pub max_burst: u8,
}

impl IsochGeometry {
    /// The pool covers at least twice the scheduling threshold, otherwise every period would
    /// under/overrun.
    pub fn new(desc: &EndpointDesc, ist: u32, config: &XhciConfig) -> Result<Self> {
        if desc.transfer_type != TransferType::Isochronous {
            return Err(XhciError::NotSupported("not an isochronous endpoint"));
        }
        let interval = desc.interval;
        if interval == 0 || !interval.is_power_of_two() {
            error!(interval, "isochronous service interval must be a power of two");
            return Err(XhciError::InvalidConfig(
                "isochronous service interval must be a power of two",
            ));
        }
        if !(1..=16).contains(&desc.max_burst) {
            return Err(XhciError::InvalidConfig("max burst must be between 1 and 16"));
        }
        if ist >= config.isoch_window_uframes {
            error!(ist, window = config.isoch_window_uframes, "IST does not fit the window");
            return Err(XhciError::InvalidConfig(
                "scheduling threshold leaves no admission window",
            ));
        }

        let max_size = if desc.bytes_per_interval != 0 {
            desc.bytes_per_interval as usize
        } else {
            desc.max_transfer_size
        };
        if max_size == 0 || max_size > MAX_ISOCH_PAYLOAD {
            error!(max_size, "unusable isochronous buffer size");
            return Err(XhciError::InvalidConfig("unusable isochronous buffer size"));
        }

        let buffer_count = config
            .isoch_min_buffers
            .max((2 * ist / interval) as usize);

        // The schedule must stay well inside one MFINDEX period to be classified correctly.
        let horizon = (buffer_count as u64 + 1) * u64::from(interval) + u64::from(ist);
        if horizon >= u64::from(MFINDEX_MAX / 2) {
            error!(interval, buffer_count, "isochronous schedule exceeds the MFINDEX period");
            return Err(XhciError::NotSupported(
                "service interval too long for the MFINDEX period",
            ));
        }

        Ok(Self {
            buffer_count,
            max_size,
            interval,
            max_burst: desc.max_burst,
        })
    }
}

/// Result of one schedule call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IsochTransfer {
    pub transferred: usize,
    pub error: Option<TransferError>,
}

#[derive(Debug)]
struct IsochSlot {
    buffer: DmaBuffer,
    state: SlotState,
    /// Target microframe.
    mfindex: u32,
    size: usize,
    error: Option<TransferError>,
    /// Address of the TRB this slot was fed as.
    trb_phys: u64,
}

impl IsochSlot {
    fn set_state(&mut self, next: SlotState) {
        debug_assert!(
            self.state.can_become(next),
            "isochronous slot moved {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
    }
}

struct IsochState {
    slots: Vec<IsochSlot>,
    /// Next slot the application fills (OUT) or the feed loop prepares (IN).
    enqueue: usize,
    /// Next slot whose result goes back to the application.
    dequeue: usize,
    /// Next slot to feed to the controller (OUT only).
    hw_enqueue: usize,
    last_mfindex: Option<u32>,
    ring: TrbRing,
    timer: Option<FeedTimer>,
    /// Bumped on every arm and clear; a firing with a stale token is ignored.
    timer_token: u64,
    timer_armed: bool,
    late_streak: u32,
    closed: bool,
    stats: IsochStats,
}

impl IsochState {
    fn next(&self, idx: usize) -> usize {
        (idx + 1) % self.slots.len()
    }
}

#[derive(Clone, Copy, Debug)]
struct IsochParams {
    geometry: IsochGeometry,
    direction: Direction,
    slot_id: u8,
    dci: u8,
    doorbell_target: u8,
    ist: u32,
    window: u32,
    max_late_refeeds: u32,
}

struct IsochShared {
    guard: Mutex<IsochState>,
    avail: Condvar,
    hc: Arc<dyn HostController>,
    params: IsochParams,
}

/// Handle to the scheduler of one isochronous endpoint.
#[derive(Clone)]
pub struct IsochEndpoint {
    shared: Arc<IsochShared>,
}

impl IsochEndpoint {
    /// Sizes the pool, allocates the transfer ring, the slot buffers and the feed timer, and
    /// starts from a reset data flow.
    pub fn new(
        hc: Arc<dyn HostController>,
        mem: &SharedMemory,
        config: &XhciConfig,
        device: &DeviceInfo,
        desc: &EndpointDesc,
    ) -> Result<Self> {
        config.validate()?;
        let ist = hc.ist();
        let geometry = IsochGeometry::new(desc, ist, config)?;

        let ring =
            TrbRing::with_geometry(mem, config.transfer_ring_segments, config.trbs_per_segment)?;
        if geometry.buffer_count > ring.capacity() {
            error!(
                buffers = geometry.buffer_count,
                capacity = ring.capacity(),
                "transfer ring too small for the isochronous pool"
            );
            return Err(XhciError::InvalidConfig(
                "transfer ring too small for the isochronous pool",
            ));
        }

        let mut slots = Vec::with_capacity(geometry.buffer_count);
        for _ in 0..geometry.buffer_count {
            slots.push(IsochSlot {
                buffer: DmaBuffer::alloc(mem, geometry.max_size, BUFFER_ALIGN)?,
                state: SlotState::Empty,
                mfindex: 0,
                size: 0,
                error: None,
                trb_phys: 0,
            });
        }

        let params = IsochParams {
            geometry,
            direction: desc.direction,
            slot_id: device.slot_id,
            dci: desc.dci(),
            doorbell_target: desc.doorbell_target(),
            ist,
            window: config.isoch_window_uframes,
            max_late_refeeds: config.isoch_max_late_refeeds,
        };

        let shared = Arc::new(IsochShared {
            guard: Mutex::new(IsochState {
                slots,
                enqueue: 0,
                dequeue: 0,
                hw_enqueue: 0,
                last_mfindex: None,
                ring,
                timer: None,
                timer_token: 0,
                timer_armed: false,
                late_streak: 0,
                closed: false,
                stats: IsochStats::default(),
            }),
            avail: Condvar::new(),
            hc,
            params,
        });

        let weak: Weak<IsochShared> = Arc::downgrade(&shared);
        let timer = FeedTimer::spawn("xhci-isoch-feed", move |token| {
            if let Some(shared) = weak.upgrade() {
                shared.on_timer(token);
            }
        })
        .map_err(|err| XhciError::Timer(err.kind()))?;
        shared.lock().timer = Some(timer);

        info!(
            slot = device.slot_id,
            dci = params.dci,
            buffers = geometry.buffer_count,
            max_size = geometry.max_size,
            interval = geometry.interval,
            "isochronous endpoint set up"
        );
        Ok(Self { shared })
    }

    pub fn geometry(&self) -> IsochGeometry {
        self.shared.params.geometry
    }

    pub fn direction(&self) -> Direction {
        self.shared.params.direction
    }

    /// TR Dequeue Pointer and DCS for the endpoint context.
    pub fn ring_dequeue(&self) -> (u64, bool) {
        let st = self.shared.lock();
        (st.ring.dequeue_ptr(), st.ring.pcs())
    }

    /// Queues `data` for transmission and returns what completed since the previous call.
    ///
    /// Blocks while the next slot is still owned by the controller. Results are summed oldest
    /// first and the sum stops at the first failed slot, so errors are reported one at a time.
    pub fn schedule_out(&self, data: &[u8]) -> Result<IsochTransfer> {
        let shared = &*self.shared;
        let params = shared.params;
        if params.direction != Direction::Out {
            return Err(XhciError::NotSupported("schedule_out on an IN endpoint"));
        }
        if data.len() > params.geometry.max_size {
            error!(
                len = data.len(),
                max = params.geometry.max_size,
                "cannot schedule an oversized isochronous transfer"
            );
            return Err(XhciError::Oversized {
                len: data.len(),
                max: params.geometry.max_size,
            });
        }

        let mut st = shared.lock();
        loop {
            if st.closed {
                return Err(XhciError::EndpointGone);
            }
            match st.slots[st.enqueue].state {
                SlotState::Filled | SlotState::Fed => st = shared.wait(st),
                SlotState::Empty | SlotState::Complete => break,
            }
        }

        let mut result = IsochTransfer::default();
        for _ in 0..st.slots.len() {
            let idx = st.dequeue;
            if st.slots[idx].state != SlotState::Complete {
                break;
            }
            st.dequeue = st.next(idx);
            let slot = &mut st.slots[idx];
            slot.set_state(SlotState::Empty);
            result.transferred += slot.size;
            result.error = slot.error.take();
            if result.error.is_some() {
                break;
            }
        }

        let idx = st.enqueue;
        debug_assert_eq!(st.slots[idx].state, SlotState::Empty);
        st.enqueue = st.next(idx);

        let target = calc_next_mfindex(
            st.last_mfindex,
            shared.hc.mfindex(),
            params.geometry.buffer_count,
            params.geometry.interval,
            params.ist,
        );
        st.last_mfindex = Some(target);
        trace!(buffer = idx, mfindex = target, "buffer will be on schedule");

        let slot = &mut st.slots[idx];
        slot.buffer.write(0, data);
        slot.size = data.len();
        slot.mfindex = target;
        slot.error = None;
        slot.set_state(SlotState::Filled);

        shared.clear_timer(&mut st);
        shared.feed_out(&mut st);
        Ok(result)
    }

    /// Waits for the oldest IN slot to complete and copies its data into `dst`.
    ///
    /// `dst` must hold a full slot. A failed slot is reported with zero bytes.
    pub fn schedule_in(&self, dst: &mut [u8]) -> Result<IsochTransfer> {
        let shared = &*self.shared;
        let params = shared.params;
        if params.direction != Direction::In {
            return Err(XhciError::NotSupported("schedule_in on an OUT endpoint"));
        }
        if dst.len() < params.geometry.max_size {
            error!(
                len = dst.len(),
                min = params.geometry.max_size,
                "cannot schedule an undersized isochronous transfer"
            );
            return Err(XhciError::Undersized {
                len: dst.len(),
                min: params.geometry.max_size,
            });
        }

        let mut st = shared.lock();
        loop {
            if st.closed {
                return Err(XhciError::EndpointGone);
            }
            if st.slots[st.dequeue].state == SlotState::Complete {
                break;
            }
            shared.clear_timer(&mut st);
            shared.feed_in(&mut st);
            if st.slots[st.dequeue].state == SlotState::Complete {
                break;
            }
            trace!(buffer = st.dequeue, "waiting for buffer to complete");
            st = shared.wait(st);
        }

        let idx = st.dequeue;
        st.dequeue = st.next(idx);
        let slot = &mut st.slots[idx];
        let result = match slot.error.take() {
            None => {
                slot.buffer.read(0, &mut dst[..slot.size]);
                IsochTransfer {
                    transferred: slot.size,
                    error: None,
                }
            }
            Some(err) => IsochTransfer {
                transferred: 0,
                error: Some(err),
            },
        };
        slot.set_state(SlotState::Empty);
        Ok(result)
    }

    /// Processes a Transfer Event addressed to this endpoint.
    pub fn handle_transfer_event(&self, trb: &Trb) {
        let shared = &*self.shared;
        let params = shared.params;
        let mut st = shared.lock();
        if st.closed {
            return;
        }

        let code = trb.completion_code();
        let error = match code {
            CompletionCode::RingOverrun | CompletionCode::RingUnderrun => {
                warn!(slot = params.slot_id, dci = params.dci, ?code, "isochronous ring over/underrun");
                shared.reset_locked(&mut st);
                shared.avail.notify_all();
                return;
            }
            CompletionCode::Success | CompletionCode::ShortPacket => None,
            other => {
                warn!(slot = params.slot_id, dci = params.dci, code = ?other, "isochronous transfer failed");
                Some(TransferError::Io(other))
            }
        };

        let residual = trb.event_transfer_length() as usize;
        let mut found_mine = false;
        let mut found_incomplete = false;

        // Events are not guaranteed to arrive in submission order.
        let IsochState { slots, stats, .. } = &mut *st;
        for (idx, slot) in slots.iter_mut().enumerate() {
            match slot.state {
                SlotState::Filled => found_incomplete = true,
                SlotState::Fed if slot.trb_phys != trb.parameter => found_incomplete = true,
                SlotState::Fed => {
                    trace!(buffer = idx, "buffer completed");
                    // A failed slot reports no data.
                    slot.size = match error {
                        Some(_) => 0,
                        None => slot.size.saturating_sub(residual),
                    };
                    slot.error = error;
                    slot.set_state(SlotState::Complete);
                    if error.is_some() {
                        stats.failed += 1;
                    } else {
                        stats.completed += 1;
                        stats.bytes_completed += slot.size as u64;
                    }
                    found_mine = true;
                }
                SlotState::Empty | SlotState::Complete => {}
            }
        }

        if found_mine {
            if let Err(err) = st.ring.update_dequeue(trb.parameter) {
                warn!(%err, "transfer event outside the endpoint ring");
            }
        } else {
            warn!(
                slot = params.slot_id,
                dci = params.dci,
                trb = format_args!("{:#x}", trb.parameter),
                "transfer event for an unknown isochronous buffer"
            );
        }

        // Some controllers never report over/underrun; a pool with nothing in flight is one.
        if !found_incomplete {
            warn!(
                slot = params.slot_id,
                dci = params.dci,
                "detected isochronous ring {}",
                match params.direction {
                    Direction::In => "underrun",
                    Direction::Out => "overrun",
                }
            );
            shared.reset_locked(&mut st);
        }

        shared.avail.notify_all();
    }

    /// Drops every slot back to `Empty` and forgets the schedule.
    pub fn reset(&self) {
        let mut st = self.shared.lock();
        if st.closed {
            return;
        }
        self.shared.reset_locked(&mut st);
        self.shared.avail.notify_all();
    }

    /// Tears the scheduler down: the timer is stopped, the slot buffers are released and
    /// blocked callers return [`XhciError::EndpointGone`].
    pub fn fini(&self) {
        let (timer, slots) = {
            let mut st = self.shared.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            self.shared.clear_timer(&mut st);
            (st.timer.take(), std::mem::take(&mut st.slots))
        };
        self.shared.avail.notify_all();
        drop(timer);
        drop(slots);
        debug!(
            slot = self.shared.params.slot_id,
            dci = self.shared.params.dci,
            "isochronous endpoint torn down"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }

    pub fn stats(&self) -> IsochStats {
        self.shared.lock().stats
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.shared.lock().slots.iter().map(|s| s.state).collect()
    }

    pub fn snapshot(&self) -> IsochSnapshot {
        let st = self.shared.lock();
        IsochSnapshot {
            slots: st.slots.iter().map(|s| s.state).collect(),
            enqueue: st.enqueue,
            dequeue: st.dequeue,
            hw_enqueue: st.hw_enqueue,
            last_mfindex: st.last_mfindex,
            timer_armed: st.timer_armed,
        }
    }
}

impl IsochShared {
    fn lock(&self) -> MutexGuard<'_, IsochState> {
        self.guard.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, IsochState>) -> MutexGuard<'a, IsochState> {
        self.avail.wait(guard).unwrap_or_else(|e| e.into_inner())
    }

    fn on_timer(&self, token: u64) {
        let mut st = self.lock();
        if st.closed || !st.timer_armed || st.timer_token != token {
            return;
        }
        st.timer_armed = false;
        match self.params.direction {
            Direction::Out => self.feed_out(&mut st),
            Direction::In => self.feed_in(&mut st),
        }
        self.avail.notify_all();
    }

    fn arm_timer(&self, st: &mut IsochState, buffer: usize, offset: u32) {
        let delay = WindowDecision::delay(offset);
        trace!(
            buffer,
            offset,
            delay_us = delay.as_micros() as u64,
            "delaying feeding buffer"
        );
        st.timer_token += 1;
        st.timer_armed = true;
        st.stats.deferrals += 1;
        if let Some(timer) = &st.timer {
            timer.set(delay, st.timer_token);
        }
    }

    fn clear_timer(&self, st: &mut IsochState) {
        st.timer_token += 1;
        if st.timer_armed {
            st.timer_armed = false;
            if let Some(timer) = &st.timer {
                timer.clear();
            }
        }
    }

    fn reset_locked(&self, st: &mut IsochState) {
        st.enqueue = 0;
        st.dequeue = 0;
        st.hw_enqueue = 0;
        for slot in &mut st.slots {
            slot.state = SlotState::Empty;
            slot.error = None;
        }
        self.clear_timer(st);
        st.last_mfindex = None;
        st.late_streak = 0;
        st.stats.resets += 1;
        info!(
            slot = self.params.slot_id,
            dci = self.params.dci,
            "isochronous data flow reset"
        );
    }

    fn decide(&self, target: u32) -> WindowDecision {
        window_decide(
            target,
            self.hc.mfindex(),
            self.params.ist,
            self.params.window,
        )
    }

    /// Puts slot `idx` on the transfer ring. Returns `true` if a TRB was queued.
    fn submit(&self, st: &mut IsochState, idx: usize) -> bool {
        let slot = &st.slots[idx];
        trace!(buffer = idx, mfindex = slot.mfindex, "feeding buffer");
        let trb = window::isoch_trb(
            slot.buffer.phys(),
            slot.size,
            slot.mfindex,
            self.params.geometry.max_burst,
        );
        let queued = st.ring.enqueue(&trb);
        let slot = &mut st.slots[idx];
        match queued {
            Ok(phys) => {
                slot.trb_phys = phys;
                slot.set_state(SlotState::Fed);
                st.stats.fed += 1;
                true
            }
            Err(err) => {
                warn!(buffer = idx, %err, "isochronous buffer could not be queued");
                slot.size = 0;
                slot.error = Some(TransferError::RingFull);
                slot.set_state(SlotState::Complete);
                st.stats.failed += 1;
                false
            }
        }
    }

    fn ring_doorbell(&self) {
        trace!(slot = self.params.slot_id, dci = self.params.dci, "ringing doorbell");
        self.hc
            .ring_doorbell(self.params.slot_id, self.params.doorbell_target);
    }

    /// Feeds filled OUT slots in order until one is not due yet. One doorbell covers the pass.
    fn feed_out(&self, st: &mut IsochState) {
        let mut fed = false;
        for _ in 0..st.slots.len() {
            let idx = st.hw_enqueue;
            if st.slots[idx].state != SlotState::Filled {
                break;
            }
            let target = st.slots[idx].mfindex;
            match self.decide(target) {
                WindowDecision::TooSoon(offset) => {
                    self.arm_timer(st, idx, offset);
                    break;
                }
                WindowDecision::Inside => {
                    fed |= self.submit(st, idx);
                    st.hw_enqueue = st.next(idx);
                }
                WindowDecision::TooLate(offset) => {
                    trace!(buffer = idx, mfindex = target, offset, "missed feeding buffer");
                    let slot = &mut st.slots[idx];
                    slot.size = 0;
                    slot.error = None;
                    slot.set_state(SlotState::Complete);
                    st.stats.skipped += 1;
                    st.hw_enqueue = st.next(idx);
                }
            }
        }
        if fed {
            self.ring_doorbell();
        }
    }

    /// Prepares and feeds IN slots in order until one is not due yet or the pool is busy.
    fn feed_in(&self, st: &mut IsochState) {
        let params = self.params;
        let mut fed = false;
        for _ in 0..st.slots.len() {
            let idx = st.enqueue;
            match st.slots[idx].state {
                SlotState::Empty => {
                    let target = calc_next_mfindex(
                        st.last_mfindex,
                        self.hc.mfindex(),
                        params.geometry.buffer_count,
                        params.geometry.interval,
                        params.ist,
                    );
                    let slot = &mut st.slots[idx];
                    slot.size = params.geometry.max_size;
                    slot.mfindex = target;
                    slot.error = None;
                    slot.set_state(SlotState::Filled);
                }
                SlotState::Filled => {}
                SlotState::Fed | SlotState::Complete => break,
            }

            let target = st.slots[idx].mfindex;
            match self.decide(target) {
                WindowDecision::TooSoon(offset) => {
                    self.arm_timer(st, idx, offset);
                    break;
                }
                WindowDecision::TooLate(offset) => {
                    st.late_streak += 1;
                    if st.late_streak >= params.max_late_refeeds {
                        warn!(
                            buffer = idx,
                            mfindex = target,
                            streak = st.late_streak,
                            "isochronous IN stream starved, dropping buffer"
                        );
                        let slot = &mut st.slots[idx];
                        slot.size = 0;
                        slot.error = Some(TransferError::Starved);
                        slot.set_state(SlotState::Complete);
                        st.stats.failed += 1;
                        st.stats.starved += 1;
                        st.late_streak = 0;
                        st.last_mfindex = None;
                        st.enqueue = st.next(idx);
                        continue;
                    }
                    let retarget = late_target(target, offset, params.geometry.interval);
                    trace!(
                        buffer = idx,
                        mfindex = target,
                        offset,
                        retarget,
                        "missed feeding buffer, feeding as soon as possible"
                    );
                    st.slots[idx].mfindex = retarget;
                    st.stats.late_refeeds += 1;
                }
                WindowDecision::Inside => st.late_streak = 0,
            }

            st.enqueue = st.next(idx);
            st.last_mfindex = Some(st.slots[idx].mfindex);
            fed |= self.submit(st, idx);
        }
        if fed {
            self.ring_doorbell();
        }
    }
}
