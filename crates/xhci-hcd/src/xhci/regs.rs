//! xHCI register fields read by the transfer engine.
//!
//! This is not a model of the register file. It only decodes the capability fields and runtime
//! counters the rings, streams and isochronous scheduler depend on.

/// MFINDEX holds a 14-bit microframe counter.
pub const MFINDEX_MASK: u32 = 0x3fff;

/// Period of the MFINDEX counter in microframes (2.048 s).
pub const MFINDEX_MAX: u32 = MFINDEX_MASK + 1;

/// Length of one microframe in microseconds.
pub const MICROFRAME_US: u64 = 125;

/// Microframes per 1 ms frame.
pub const MICROFRAMES_PER_FRAME: u32 = 8;

/// Frame ID field of an Isoch TRB is 11 bits wide.
pub const FRAME_ID_MODULUS: u32 = 2048;

const HCSPARAMS2_IST_MASK: u32 = 0x7;
const HCSPARAMS2_IST_FRAMES: u32 = 1 << 3;

const HCCPARAMS1_MAX_PSA_SHIFT: u32 = 12;
const HCCPARAMS1_MAX_PSA_MASK: u32 = 0xf;

/// Decodes the Isochronous Scheduling Threshold into microframes.
///
/// When bit 3 is set the low three bits count whole frames, otherwise microframes.
pub fn hcsparams2_ist_uframes(hcsparams2: u32) -> u32 {
    let value = hcsparams2 & HCSPARAMS2_IST_MASK;
    if hcsparams2 & HCSPARAMS2_IST_FRAMES != 0 {
        value * MICROFRAMES_PER_FRAME
    } else {
        value
    }
}

/// Raw Maximum Primary Stream Array Size field (HCCPARAMS1 bits 15:12).
pub fn hccparams1_max_psa_size(hccparams1: u32) -> u8 {
    ((hccparams1 >> HCCPARAMS1_MAX_PSA_SHIFT) & HCCPARAMS1_MAX_PSA_MASK) as u8
}

/// Number of Primary Stream Array entries the controller supports, `2^(MaxPSASize + 1)`.
///
/// Returns `None` when MaxPSASize is 0 (no stream support).
pub fn max_primary_streams(max_psa_size: u8) -> Option<u32> {
    match max_psa_size & HCCPARAMS1_MAX_PSA_MASK as u8 {
        0 => None,
        n => Some(2u32 << n),
    }
}
