//! Isochronous time-slot arithmetic.
//!
//! All times are MFINDEX values: microframe counts modulo [`MFINDEX_MAX`]. The controller accepts
//! an Isoch TRB only if its target microframe lies between `now + IST` and the end of the
//! admission window; [`window_decide`] classifies a target against that range.

use std::time::Duration;

use crate::xhci::regs::{
    FRAME_ID_MODULUS, MFINDEX_MASK, MFINDEX_MAX, MICROFRAMES_PER_FRAME, MICROFRAME_US,
};
use crate::xhci::trb::{Trb, TrbFlags, TrbType};

/// 895 ms worth of microframes.
pub const DEFAULT_WINDOW_UFRAMES: u32 = 895_000 / MICROFRAME_US as u32;

/// Bytes per burst packet used to derive the Isoch TRB burst fields.
pub const BURST_PACKET_BYTES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WindowDecision {
    /// Target lies beyond the window end; retry after `offset` microframes.
    TooSoon(u32),
    Inside,
    /// Target has passed; the next feasible start is `offset` microframes later.
    TooLate(u32),
}

impl WindowDecision {
    /// Real-time length of `uframes` microframes.
    pub fn delay(uframes: u32) -> Duration {
        Duration::from_micros(u64::from(uframes) * MICROFRAME_US)
    }
}

/// Classifies `target` against the window that opens IST microframes after `mfindex`.
///
/// The clock is rotated so the window starts at zero. Everything up to `window - ist` is inside;
/// the rest of the period is split in half between "in the future" and "already passed".
pub fn window_decide(target: u32, mfindex: u32, ist: u32, window: u32) -> WindowDecision {
    let current = (mfindex & MFINDEX_MASK) + 1;
    let rotated = target.wrapping_sub(current).wrapping_sub(ist) & MFINDEX_MASK;
    let end = window.saturating_sub(ist);
    let threshold = (MFINDEX_MAX + end) / 2;

    if rotated <= end {
        WindowDecision::Inside
    } else if rotated > threshold {
        WindowDecision::TooLate(MFINDEX_MAX - rotated)
    } else {
        WindowDecision::TooSoon(rotated - end)
    }
}

/// Rounds `value` up to a multiple of `interval` (a power of two).
pub fn align_up(value: u32, interval: u32) -> u32 {
    debug_assert!(interval.is_power_of_two());
    (value + interval - 1) & !(interval - 1)
}

/// Target microframe of the next buffer.
///
/// Without a previous target the schedule is anchored far enough ahead to cover the whole pool
/// plus the scheduling threshold, on a service-interval boundary. Otherwise it is strictly
/// periodic.
pub fn calc_next_mfindex(
    last: Option<u32>,
    mfindex: u32,
    buffer_count: usize,
    interval: u32,
    ist: u32,
) -> u32 {
    match last {
        Some(last) => (last + interval) % MFINDEX_MAX,
        None => {
            let lead = buffer_count as u32 * interval + ist;
            align_up((mfindex & MFINDEX_MASK) + 1 + lead, interval) % MFINDEX_MAX
        }
    }
}

/// New target for a late IN buffer: the first service-interval boundary at or after the window
/// start.
pub fn late_target(target: u32, offset: u32, interval: u32) -> u32 {
    align_up(target + offset, interval) % MFINDEX_MAX
}

/// Isoch TRB Frame ID for a target microframe.
pub fn frame_id(target: u32) -> u16 {
    ((target / MICROFRAMES_PER_FRAME) % FRAME_ID_MODULUS) as u16
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BurstFields {
    /// Transfer Burst Count, zero-based.
    pub tbc: u8,
    /// Transfer Last Burst Packet Count, zero-based.
    pub tlbpc: u8,
}

pub fn burst_fields(len: usize, max_burst: u8) -> BurstFields {
    let max_burst = usize::from(max_burst.max(1));
    let packets = len.div_ceil(BURST_PACKET_BYTES).max(1);
    let bursts = packets.div_ceil(max_burst);
    let last = match packets % max_burst {
        0 => max_burst,
        rem => rem,
    };
    BurstFields {
        tbc: (bursts - 1) as u8,
        tlbpc: (last - 1) as u8,
    }
}

/// Builds the Isoch TRB for one buffer.
pub fn isoch_trb(buffer: u64, len: usize, target: u32, max_burst: u8) -> Trb {
    let mut trb = Trb::new(buffer, 0, 0);
    trb.set_trb_type(TrbType::Isoch);
    trb.set_transfer_length(len as u32);
    trb.set_td_size(0);
    trb.set_flag(TrbFlags::IOC, true);

    let burst = burst_fields(len, max_burst);
    trb.set_isoch_tbc(burst.tbc);
    trb.set_isoch_tlbpc(burst.tlbpc);
    trb.set_isoch_frame_id(frame_id(target));
    trb
}

#[cfg(test)]
mod tests {
    use super::*;

    const IST: u32 = 8;
    const WINDOW: u32 = DEFAULT_WINDOW_UFRAMES;

    /// Target whose rotated distance from `now` is `r`.
    fn at(now: u32, r: u32) -> u32 {
        (now + 1 + IST + r) % MFINDEX_MAX
    }

    #[test]
    fn classification_boundaries() {
        let now = 100;
        let end = WINDOW - IST;
        let threshold = (MFINDEX_MAX + end) / 2;

        assert_eq!(window_decide(at(now, 0), now, IST, WINDOW), WindowDecision::Inside);
        assert_eq!(window_decide(at(now, end), now, IST, WINDOW), WindowDecision::Inside);
        assert_eq!(
            window_decide(at(now, end + 1), now, IST, WINDOW),
            WindowDecision::TooSoon(1)
        );
        assert_eq!(
            window_decide(at(now, threshold), now, IST, WINDOW),
            WindowDecision::TooSoon(threshold - end)
        );
        assert_eq!(
            window_decide(at(now, threshold + 1), now, IST, WINDOW),
            WindowDecision::TooLate(MFINDEX_MAX - threshold - 1)
        );
        assert_eq!(
            window_decide(at(now, MFINDEX_MAX - 1), now, IST, WINDOW),
            WindowDecision::TooLate(1)
        );
    }

    #[test]
    fn decisions_survive_counter_wrap() {
        let now = MFINDEX_MAX - 3;
        assert_eq!(window_decide(20, now, IST, WINDOW), WindowDecision::Inside);
        assert_eq!(
            window_decide(now - 10, now, IST, WINDOW),
            WindowDecision::TooLate(10 + 1 + IST)
        );
        // Register bits above 13 are ignored.
        assert_eq!(
            window_decide(20, now | 0xc000, IST, WINDOW),
            WindowDecision::Inside
        );
    }

    #[test]
    fn first_target_covers_pool_and_threshold() {
        let t = calc_next_mfindex(None, 1000, 4, 8, IST);
        assert_eq!(t % 8, 0);
        assert!(t >= 1000 + 1 + 4 * 8 + IST);
        assert!(t < 1000 + 1 + 4 * 8 + IST + 8);

        assert_eq!(calc_next_mfindex(Some(t), 0, 4, 8, IST), t + 8);
        assert_eq!(calc_next_mfindex(Some(MFINDEX_MAX - 8), 0, 4, 8, IST), 0);
    }

    #[test]
    fn first_target_wraps_like_every_other_target() {
        let t = calc_next_mfindex(None, MFINDEX_MAX - 2, 4, 4, 1);
        assert!(t < MFINDEX_MAX);
        assert_eq!(t, align_up(MFINDEX_MAX - 2 + 1 + 16 + 1, 4) % MFINDEX_MAX);
    }

    #[test]
    fn late_target_lands_on_an_interval_boundary() {
        let now = 4000;
        let target = 3000;
        let WindowDecision::TooLate(offset) = window_decide(target, now, IST, WINDOW) else {
            panic!("expected late");
        };
        let t = late_target(target, offset, 16);
        assert_eq!(t % 16, 0);
        assert_eq!(window_decide(t, now, IST, WINDOW), WindowDecision::Inside);
    }

    #[test]
    fn burst_fields_follow_packet_count() {
        // One packet, burst of one.
        assert_eq!(burst_fields(0, 1), BurstFields { tbc: 0, tlbpc: 0 });
        assert_eq!(burst_fields(1024, 1), BurstFields { tbc: 0, tlbpc: 0 });
        // Three packets in bursts of two: two bursts, last one holds one packet.
        assert_eq!(burst_fields(3000, 2), BurstFields { tbc: 1, tlbpc: 0 });
        // Four packets in bursts of two: last burst is full.
        assert_eq!(burst_fields(4096, 2), BurstFields { tbc: 1, tlbpc: 1 });
        // Three packets in one burst of up to four.
        assert_eq!(burst_fields(3 * 1024, 4), BurstFields { tbc: 0, tlbpc: 2 });
        // Two packets in bursts of one.
        assert_eq!(burst_fields(1025, 1), BurstFields { tbc: 1, tlbpc: 0 });
    }

    #[test]
    fn isoch_trb_layout() {
        let trb = isoch_trb(0x8000, 3000, 0x1238, 2);
        assert_eq!(trb.parameter, 0x8000);
        assert_eq!(trb.trb_type(), TrbType::Isoch);
        assert_eq!(trb.transfer_length(), 3000);
        assert!(trb.has_flag(TrbFlags::IOC));
        assert_eq!(trb.isoch_tbc(), 1);
        assert_eq!(trb.isoch_tlbpc(), 0);
        assert_eq!(trb.isoch_frame_id(), (0x1238 / 8) as u16);
        assert!(!trb.cycle());
    }

    #[test]
    fn delay_is_measured_in_microframes() {
        assert_eq!(WindowDecision::delay(8), Duration::from_millis(1));
    }
}
