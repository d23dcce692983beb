//! xHCI transfer engine.
//!
//! The engine talks to the controller through [`HostController`] (a handful of register reads,
//! the doorbell array and the Configure Endpoint path) and to memory through
//! [`crate::dma::DmaMemory`]. Everything else (command ring processing, port handling,
//! enumeration) belongs to the embedding driver.

pub mod context;
pub mod endpoint;
pub mod event_ring;
pub mod isoch;
pub mod regs;
pub mod ring;
pub mod streams;
pub mod trb;

use serde::{Deserialize, Serialize};

use crate::{Result, XhciError};

use self::context::EndpointContext;

/// Controller operations the transfer engine depends on.
///
/// Implementations must be callable from any thread: the isochronous feed timer and the event
/// handler run concurrently with callers.
pub trait HostController: Send + Sync {
    /// Current value of the MFINDEX register (14 bits).
    fn mfindex(&self) -> u32;

    /// Structural Parameters 2 (capability offset 0x08).
    fn hcsparams2(&self) -> u32;

    /// Capability Parameters 1 (capability offset 0x10).
    fn hccparams1(&self) -> u32;

    /// Isochronous Scheduling Threshold in microframes.
    fn ist(&self) -> u32 {
        regs::hcsparams2_ist_uframes(self.hcsparams2())
    }

    /// Raw MaxPSASize capability field.
    fn max_psa_size(&self) -> u8 {
        regs::hccparams1_max_psa_size(self.hccparams1())
    }

    /// Rings doorbell `slot_id` with the given target (endpoint doorbells start at 1).
    fn ring_doorbell(&self, slot_id: u8, target: u8);

    /// Installs `ctx` as the context of endpoint `ep_index` of `slot_id` (Configure Endpoint).
    fn add_endpoint(&self, slot_id: u8, ep_index: u8, ctx: &EndpointContext) -> Result<()>;
}

/// Engine tunables.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct XhciConfig {
    /// Segments per transfer ring (including every stream ring).
    pub transfer_ring_segments: usize,
    /// Segments of the event ring.
    pub event_ring_segments: usize,
    /// TRBs per ring segment, Link TRB included.
    pub trbs_per_segment: usize,
    /// Smallest isochronous buffer pool.
    pub isoch_min_buffers: usize,
    /// Length of the isochronous admission window in microframes.
    pub isoch_window_uframes: u32,
    /// Consecutive late re-feeds an IN endpoint tolerates before reporting starvation.
    pub isoch_max_late_refeeds: u32,
}

impl Default for XhciConfig {
    fn default() -> Self {
        Self {
            transfer_ring_segments: 1,
            event_ring_segments: 1,
            trbs_per_segment: ring::DEFAULT_TRBS_PER_SEGMENT,
            isoch_min_buffers: isoch::DEFAULT_MIN_BUFFERS,
            isoch_window_uframes: isoch::window::DEFAULT_WINDOW_UFRAMES,
            isoch_max_late_refeeds: isoch::DEFAULT_MAX_LATE_REFEEDS,
        }
    }
}

impl XhciConfig {
    pub fn validate(&self) -> Result<()> {
        if self.transfer_ring_segments == 0 || self.event_ring_segments == 0 {
            return Err(XhciError::InvalidConfig("rings need at least one segment"));
        }
        if self.trbs_per_segment < 2 || self.trbs_per_segment > event_ring::MAX_EVENT_SEGMENT_TRBS {
            return Err(XhciError::InvalidConfig(
                "trbs_per_segment must be between 2 and 4096",
            ));
        }
        if self.isoch_min_buffers < 2 {
            return Err(XhciError::InvalidConfig(
                "isochronous pools need at least two buffers",
            ));
        }
        if self.isoch_window_uframes == 0 || self.isoch_window_uframes >= regs::MFINDEX_MAX {
            return Err(XhciError::InvalidConfig(
                "isochronous window must be shorter than the MFINDEX period",
            ));
        }
        if self.isoch_max_late_refeeds == 0 {
            return Err(XhciError::InvalidConfig(
                "isoch_max_late_refeeds must be at least 1",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Caps {
        hcsparams2: u32,
        hccparams1: u32,
    }

    impl HostController for Caps {
        fn mfindex(&self) -> u32 {
            0
        }

        fn hcsparams2(&self) -> u32 {
            self.hcsparams2
        }

        fn hccparams1(&self) -> u32 {
            self.hccparams1
        }

        fn ring_doorbell(&self, _: u8, _: u8) {}

        fn add_endpoint(&self, _: u8, _: u8, _: &EndpointContext) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn threshold_and_stream_limit_come_from_capability_registers() {
        let hc = Caps {
            hcsparams2: 0xfc00_0009,
            hccparams1: 0x0050_7f8d,
        };
        assert_eq!(hc.ist(), 8);
        assert_eq!(hc.max_psa_size(), 7);
        assert_eq!(regs::max_primary_streams(hc.max_psa_size()), Some(256));

        let hc = Caps {
            hcsparams2: 0x0000_0004,
            hccparams1: 0,
        };
        assert_eq!(hc.ist(), 4);
        assert_eq!(regs::max_primary_streams(hc.max_psa_size()), None);
    }

    #[test]
    fn defaults_are_valid() {
        let config = XhciConfig::default();
        config.validate().unwrap();
        assert_eq!(config.trbs_per_segment, 256);
        assert_eq!(config.isoch_window_uframes, 7160);
    }

    #[test]
    fn validate_rejects_degenerate_values() {
        let bad = [
            XhciConfig {
                transfer_ring_segments: 0,
                ..XhciConfig::default()
            },
            XhciConfig {
                trbs_per_segment: 1,
                ..XhciConfig::default()
            },
            XhciConfig {
                isoch_min_buffers: 1,
                ..XhciConfig::default()
            },
            XhciConfig {
                isoch_window_uframes: regs::MFINDEX_MAX,
                ..XhciConfig::default()
            },
            XhciConfig {
                isoch_max_late_refeeds: 0,
                ..XhciConfig::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(XhciError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }
}
