//! Endpoint metadata and the per-endpoint transfer state.
//!
//! An [`XhciEndpoint`] owns whatever the controller reads for one endpoint: a single transfer
//! ring, a set of stream rings behind a stream context array, or an isochronous scheduler.

use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::dma::SharedMemory;
use crate::{Result, XhciError};

use super::context::{EndpointContext, EndpointType, DEFAULT_ERROR_COUNT};
use super::isoch::IsochEndpoint;
use super::ring::TrbRing;
use super::streams::{validate_secondary_sizes, validate_stream_request, Streams};
use super::trb::Trb;
use super::{HostController, XhciConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl TransferType {
    pub fn is_periodic(self) -> bool {
        matches!(self, TransferType::Isochronous | TransferType::Interrupt)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Out,
    In,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UsbSpeed {
    Low,
    Full,
    High,
    Super,
    SuperPlus,
}

impl UsbSpeed {
    pub fn is_superspeed(self) -> bool {
        matches!(self, UsbSpeed::Super | UsbSpeed::SuperPlus)
    }
}

/// Endpoint as described by its descriptors (endpoint + SuperSpeed companion).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointDesc {
    /// Endpoint number (0..=15).
    pub number: u8,
    pub direction: Direction,
    pub transfer_type: TransferType,
    pub max_packet_size: u16,
    /// Packets per burst (1..=16).
    pub max_burst: u8,
    /// Streams supported by the endpoint; 0 or 1 means none.
    pub max_streams: u32,
    /// Service interval in microframes.
    pub interval: u32,
    /// SuperSpeed companion `wBytesPerInterval`; 0 if absent.
    pub bytes_per_interval: u32,
    /// Largest single transfer the function driver submits.
    pub max_transfer_size: usize,
}

impl EndpointDesc {
    pub fn new(
        number: u8,
        direction: Direction,
        transfer_type: TransferType,
        max_packet_size: u16,
    ) -> Self {
        Self {
            number,
            direction,
            transfer_type,
            max_packet_size,
            max_burst: 1,
            max_streams: 0,
            interval: 1,
            bytes_per_interval: 0,
            max_transfer_size: usize::from(max_packet_size),
        }
    }

    /// Device Context Index. Control endpoints use the OUT index for both directions.
    pub fn dci(&self) -> u8 {
        let base = self.number * 2;
        match (self.transfer_type, self.direction) {
            (TransferType::Control, _) => base + 1,
            (_, Direction::Out) => base,
            (_, Direction::In) => base + 1,
        }
    }

    /// Zero-based endpoint index used by Configure Endpoint.
    pub fn ep_index(&self) -> u8 {
        self.dci() - 1
    }

    /// Doorbell target value for this endpoint.
    pub fn doorbell_target(&self) -> u8 {
        self.dci()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub slot_id: u8,
    pub address: u8,
    pub speed: UsbSpeed,
}

/// Transfer rings of a non-isochronous endpoint.
#[derive(Debug)]
pub enum TransferRings {
    Single(TrbRing),
    Streams(Streams),
}

enum EndpointKind {
    Isoch(IsochEndpoint),
    Rings(Mutex<TransferRings>),
}

pub struct XhciEndpoint {
    device: DeviceInfo,
    desc: EndpointDesc,
    hc: Arc<dyn HostController>,
    mem: SharedMemory,
    config: XhciConfig,
    kind: EndpointKind,
}

impl XhciEndpoint {
    pub fn new(
        hc: Arc<dyn HostController>,
        mem: &SharedMemory,
        config: &XhciConfig,
        device: DeviceInfo,
        desc: EndpointDesc,
    ) -> Result<Self> {
        config.validate()?;
        let kind = match desc.transfer_type {
            TransferType::Isochronous => EndpointKind::Isoch(IsochEndpoint::new(
                Arc::clone(&hc),
                mem,
                config,
                &device,
                &desc,
            )?),
            _ => {
                let ring = TrbRing::with_geometry(
                    mem,
                    config.transfer_ring_segments,
                    config.trbs_per_segment,
                )?;
                EndpointKind::Rings(Mutex::new(TransferRings::Single(ring)))
            }
        };
        Ok(Self {
            device,
            desc,
            hc,
            mem: Arc::clone(mem),
            config: config.clone(),
            kind,
        })
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn desc(&self) -> &EndpointDesc {
        &self.desc
    }

    pub fn isoch(&self) -> Option<&IsochEndpoint> {
        match &self.kind {
            EndpointKind::Isoch(isoch) => Some(isoch),
            EndpointKind::Rings(_) => None,
        }
    }

    fn rings(&self) -> Option<MutexGuard<'_, TransferRings>> {
        match &self.kind {
            EndpointKind::Isoch(_) => None,
            EndpointKind::Rings(rings) => Some(rings.lock().unwrap_or_else(|e| e.into_inner())),
        }
    }

    /// Number of primary streams, if streams are configured.
    pub fn primary_streams(&self) -> Option<usize> {
        match &*self.rings()? {
            TransferRings::Streams(streams) => Some(streams.primary_count()),
            TransferRings::Single(_) => None,
        }
    }

    /// Endpoint Context describing the current transfer state.
    pub fn endpoint_context(&self) -> EndpointContext {
        let mut ctx = self.base_context();
        match &self.kind {
            EndpointKind::Isoch(isoch) => {
                let (ptr, dcs) = isoch.ring_dequeue();
                ctx.set_tr_dequeue_pointer(ptr, dcs);
            }
            EndpointKind::Rings(rings) => {
                let rings = rings.lock().unwrap_or_else(|e| e.into_inner());
                fill_ring_fields(&mut ctx, &rings);
            }
        }
        ctx
    }

    fn base_context(&self) -> EndpointContext {
        let desc = &self.desc;
        let mut ctx = EndpointContext::default();
        ctx.set_endpoint_type(EndpointType::new(desc.transfer_type, desc.direction));
        ctx.set_max_packet_size(desc.max_packet_size);
        ctx.set_max_burst_size(desc.max_burst.saturating_sub(1));
        if desc.transfer_type != TransferType::Isochronous {
            ctx.set_error_count(DEFAULT_ERROR_COUNT);
        }
        if desc.transfer_type.is_periodic() {
            ctx.set_interval(desc.interval.max(1).trailing_zeros() as u8);
        }
        ctx
    }

    /// Replaces the single transfer ring by `count` primary stream rings.
    pub fn request_primary_streams(&self, count: usize) -> Result<()> {
        validate_stream_request(&self.device, &self.desc, self.hc.max_psa_size(), count)?;
        let streams = Streams::primary(&self.mem, count, &self.config)?;
        self.install_streams(streams)
    }

    /// Replaces the single transfer ring by one primary entry per element of `sizes`, each with a
    /// secondary array of that size (0 for a primary leaf).
    pub fn request_secondary_streams(&self, sizes: &[usize]) -> Result<()> {
        validate_stream_request(&self.device, &self.desc, self.hc.max_psa_size(), sizes.len())?;
        validate_secondary_sizes(sizes)?;
        let streams = Streams::secondary(&self.mem, sizes, &self.config)?;
        self.install_streams(streams)
    }

    fn install_streams(&self, streams: Streams) -> Result<()> {
        let Some(mut rings) = self.rings() else {
            return Err(XhciError::NotSupported("streams on an isochronous endpoint"));
        };
        let mut ctx = self.base_context();
        ctx.set_max_primary_streams(streams.max_pstreams_field());
        ctx.set_linear_stream_array(streams.is_linear());
        ctx.set_tr_dequeue_pointer(streams.ctx_array_phys(), false);

        self.hc
            .add_endpoint(self.device.slot_id, self.desc.ep_index(), &ctx)?;
        debug!(
            slot = self.device.slot_id,
            dci = self.desc.dci(),
            primary = streams.primary_count(),
            rings = streams.ring_count(),
            "streams configured"
        );
        // The old rings are released here, after the controller switched over.
        *rings = TransferRings::Streams(streams);
        Ok(())
    }

    /// Runs `f` on the transfer ring selected by `stream_id`.
    ///
    /// Stream 0 addresses the endpoint's only ring when streams are not configured.
    pub fn with_stream_ring<R>(
        &self,
        stream_id: u32,
        f: impl FnOnce(&mut TrbRing) -> R,
    ) -> Result<R> {
        let Some(mut rings) = self.rings() else {
            return Err(XhciError::NotSupported("isochronous endpoints have no streams"));
        };
        match &mut *rings {
            TransferRings::Single(ring) if stream_id == 0 => Ok(f(ring)),
            TransferRings::Single(_) => Err(XhciError::InvalidStream(stream_id)),
            TransferRings::Streams(streams) => Ok(f(streams.resolve_mut(stream_id)?)),
        }
    }

    /// Processes a Transfer Event addressed to this endpoint.
    pub fn handle_transfer_event(&self, trb: &Trb) {
        match &self.kind {
            EndpointKind::Isoch(isoch) => isoch.handle_transfer_event(trb),
            EndpointKind::Rings(rings) => {
                let mut rings = rings.lock().unwrap_or_else(|e| e.into_inner());
                let ring = match &mut *rings {
                    TransferRings::Single(ring) => ring.contains(trb.parameter).then_some(ring),
                    TransferRings::Streams(streams) => streams.ring_containing_mut(trb.parameter),
                };
                match ring {
                    Some(ring) => {
                        // Membership was checked above.
                        let _ = ring.update_dequeue(trb.parameter);
                    }
                    None => warn!(
                        slot = self.device.slot_id,
                        dci = self.desc.dci(),
                        trb = format_args!("{:#x}", trb.parameter),
                        "transfer event outside every ring of the endpoint"
                    ),
                }
            }
        }
    }

    /// Stops the endpoint; blocked isochronous callers return [`XhciError::EndpointGone`].
    pub fn teardown(&self) {
        if let EndpointKind::Isoch(isoch) = &self.kind {
            isoch.fini();
        }
        debug!(slot = self.device.slot_id, dci = self.desc.dci(), "endpoint torn down");
    }
}

fn fill_ring_fields(ctx: &mut EndpointContext, rings: &TransferRings) {
    match rings {
        TransferRings::Single(ring) => ctx.set_tr_dequeue_pointer(ring.dequeue_ptr(), ring.pcs()),
        TransferRings::Streams(streams) => {
            ctx.set_max_primary_streams(streams.max_pstreams_field());
            ctx.set_linear_stream_array(streams.is_linear());
            ctx.set_tr_dequeue_pointer(streams.ctx_array_phys(), false);
        }
    }
}
