//! SuperSpeed bulk stream demultiplexing.
//!
//! A streams-capable bulk endpoint points its TR Dequeue Pointer at a Primary Stream Context
//! Array instead of a transfer ring. Each primary entry either points at a transfer ring directly
//! (a leaf) or at a Secondary Stream Context Array whose entries point at rings (a branch).
//!
//! A stream ID selects its primary entry with the low bits (`id & (primary_count - 1)`) and its
//! secondary entry with the next eight bits (`(id / primary_count) & 0xff`).

use tracing::{debug, error};

use crate::dma::{DmaBuffer, SharedMemory};
use crate::{Result, XhciError};

use super::context::{StreamContext, StreamContextType, STREAM_CONTEXT_SIZE};
use super::endpoint::{DeviceInfo, EndpointDesc, TransferType};
use super::regs;
use super::ring::TrbRing;
use super::XhciConfig;

/// Stream IDs from this value up are reserved (NO_STREAM / PRIME).
pub const RESERVED_STREAM_ID_BASE: u32 = 65534;

/// Secondary arrays hold between 8 and 256 entries.
pub const MIN_SECONDARY_STREAMS: usize = 8;
pub const MAX_SECONDARY_STREAMS: usize = 256;

/// Smallest primary array with a MaxPStreams encoding (MaxPStreams = 0 means "no streams").
pub const MIN_PRIMARY_STREAMS: usize = 4;

/// Primary array bound when secondary arrays are used (MaxPStreams <= 7 with LSA = 0).
pub const MAX_PRIMARY_STREAMS_WITH_SECONDARY: usize = 256;

const CONTEXT_ARRAY_ALIGN: usize = 64;

/// Secondary level of a branch primary entry.
#[derive(Debug)]
pub struct SecondaryStreams {
    rings: Vec<TrbRing>,
    ctx_array: DmaBuffer,
}

impl SecondaryStreams {
    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    pub fn ctx_array_phys(&self) -> u64 {
        self.ctx_array.phys()
    }
}

/// One Primary Stream Array entry.
#[derive(Debug)]
pub enum StreamData {
    Leaf(TrbRing),
    Branch(SecondaryStreams),
}

/// The stream rings and context arrays of one endpoint.
///
/// Rings are declared before the context arrays that reference them, so they are released
/// first on drop.
#[derive(Debug)]
pub struct Streams {
    primary: Vec<StreamData>,
    ctx_array: DmaBuffer,
}

impl Streams {
    /// Allocates a linear Primary Stream Array of `count` leaf rings.
    pub fn primary(mem: &SharedMemory, count: usize, config: &XhciConfig) -> Result<Self> {
        Self::build(mem, &vec![0; count], config)
    }

    /// Allocates one primary entry per element of `sizes`; a non-zero size gives that entry a
    /// Secondary Stream Array of that many rings, zero makes it a leaf.
    pub fn secondary(mem: &SharedMemory, sizes: &[usize], config: &XhciConfig) -> Result<Self> {
        validate_secondary_sizes(sizes)?;
        Self::build(mem, sizes, config)
    }

    fn build(mem: &SharedMemory, sizes: &[usize], config: &XhciConfig) -> Result<Self> {
        let count = sizes.len();
        debug!(count, "allocating primary stream context array");
        let ctx_array =
            DmaBuffer::alloc(mem, count * STREAM_CONTEXT_SIZE, CONTEXT_ARRAY_ALIGN)?;

        let mut primary = Vec::with_capacity(count);
        for (index, &size) in sizes.iter().enumerate() {
            let data = if size == 0 {
                let ring = new_ring(mem, config)?;
                StreamContext::new(ring.dequeue_ptr(), ring.pcs(), StreamContextType::PrimaryRing)
                    .write_entry(&ctx_array, index);
                StreamData::Leaf(ring)
            } else {
                let sct = StreamContextType::for_secondary_array(size)
                    .ok_or(XhciError::InvalidConfig("invalid secondary stream array size"))?;
                let secondary = SecondaryStreams::new(mem, size, config)?;
                StreamContext::new(secondary.ctx_array_phys(), false, sct)
                    .write_entry(&ctx_array, index);
                StreamData::Branch(secondary)
            };
            primary.push(data);
        }

        Ok(Self { primary, ctx_array })
    }

    pub fn primary_count(&self) -> usize {
        self.primary.len()
    }

    /// Physical address of the Primary Stream Context Array (the endpoint's TR Dequeue Pointer).
    pub fn ctx_array_phys(&self) -> u64 {
        self.ctx_array.phys()
    }

    /// `true` when no primary entry has a secondary array (LSA = 1).
    pub fn is_linear(&self) -> bool {
        self.primary
            .iter()
            .all(|data| matches!(data, StreamData::Leaf(_)))
    }

    /// MaxPStreams field value for the endpoint context.
    pub fn max_pstreams_field(&self) -> u8 {
        (self.primary.len().trailing_zeros() as u8).saturating_sub(1)
    }

    pub fn entry(&self, index: usize) -> Option<&StreamData> {
        self.primary.get(index)
    }

    /// Splits a stream ID into its primary and secondary indices.
    pub fn decompose(&self, stream_id: u32) -> (usize, usize) {
        decompose(stream_id, self.primary.len())
    }

    pub fn resolve(&self, stream_id: u32) -> Result<&TrbRing> {
        let (p, s) = self.checked_indices(stream_id)?;
        match &self.primary[p] {
            StreamData::Leaf(ring) => Ok(ring),
            StreamData::Branch(secondary) => Ok(&secondary.rings[s]),
        }
    }

    pub fn resolve_mut(&mut self, stream_id: u32) -> Result<&mut TrbRing> {
        let (p, s) = self.checked_indices(stream_id)?;
        match &mut self.primary[p] {
            StreamData::Leaf(ring) => Ok(ring),
            StreamData::Branch(secondary) => Ok(&mut secondary.rings[s]),
        }
    }

    fn checked_indices(&self, stream_id: u32) -> Result<(usize, usize)> {
        if stream_id == 0 || stream_id >= RESERVED_STREAM_ID_BASE || self.primary.is_empty() {
            return Err(XhciError::InvalidStream(stream_id));
        }
        let (p, s) = self.decompose(stream_id);
        let valid = match self.primary.get(p) {
            Some(StreamData::Leaf(_)) => s == 0,
            Some(StreamData::Branch(secondary)) => s < secondary.len(),
            None => false,
        };
        if valid {
            Ok((p, s))
        } else {
            Err(XhciError::InvalidStream(stream_id))
        }
    }

    /// Finds the ring that owns the TRB at `paddr`.
    pub fn ring_containing_mut(&mut self, paddr: u64) -> Option<&mut TrbRing> {
        self.primary.iter_mut().find_map(|data| match data {
            StreamData::Leaf(ring) => ring.contains(paddr).then_some(ring),
            StreamData::Branch(secondary) => {
                secondary.rings.iter_mut().find(|ring| ring.contains(paddr))
            }
        })
    }

    /// Number of transfer rings owned, across both levels.
    pub fn ring_count(&self) -> usize {
        self.primary
            .iter()
            .map(|data| match data {
                StreamData::Leaf(_) => 1,
                StreamData::Branch(secondary) => secondary.len(),
            })
            .sum()
    }
}

impl SecondaryStreams {
    fn new(mem: &SharedMemory, size: usize, config: &XhciConfig) -> Result<Self> {
        let ctx_array = DmaBuffer::alloc(mem, size * STREAM_CONTEXT_SIZE, CONTEXT_ARRAY_ALIGN)?;
        let mut rings = Vec::with_capacity(size);
        for index in 0..size {
            let ring = new_ring(mem, config)?;
            StreamContext::new(
                ring.dequeue_ptr(),
                ring.pcs(),
                StreamContextType::SecondaryRing,
            )
            .write_entry(&ctx_array, index);
            rings.push(ring);
        }
        Ok(Self { rings, ctx_array })
    }
}

fn new_ring(mem: &SharedMemory, config: &XhciConfig) -> Result<TrbRing> {
    TrbRing::with_geometry(mem, config.transfer_ring_segments, config.trbs_per_segment)
}

pub fn decompose(stream_id: u32, primary_count: usize) -> (usize, usize) {
    let count = primary_count.max(1) as u32;
    let primary = stream_id & (count - 1);
    let secondary = (stream_id / count) & 0xff;
    (primary as usize, secondary as usize)
}

/// Checks that `desc` on `device` may use `count` primary streams on a controller advertising
/// `max_psa_size`.
pub fn validate_stream_request(
    device: &DeviceInfo,
    desc: &EndpointDesc,
    max_psa_size: u8,
    count: usize,
) -> Result<()> {
    if desc.transfer_type != TransferType::Bulk || !device.speed.is_superspeed() {
        error!(
            slot = device.slot_id,
            endpoint = desc.number,
            "streams are only supported by SuperSpeed bulk endpoints"
        );
        return Err(XhciError::NotSupported(
            "streams require a SuperSpeed bulk endpoint",
        ));
    }

    if desc.max_streams <= 1 {
        error!(
            slot = device.slot_id,
            endpoint = desc.number,
            "endpoint does not support streams"
        );
        return Err(XhciError::NotSupported("endpoint does not support streams"));
    }

    let Some(hc_max) = regs::max_primary_streams(max_psa_size) else {
        error!("controller does not support streams");
        return Err(XhciError::NotSupported("controller does not support streams"));
    };

    if count > hc_max as usize {
        error!(count, hc_max, "host controller supports fewer primary streams");
        return Err(XhciError::InvalidConfig(
            "primary stream count exceeds the controller maximum",
        ));
    }

    if count > desc.max_streams as usize {
        error!(
            count,
            max = desc.max_streams,
            endpoint = desc.number,
            "endpoint supports fewer streams"
        );
        return Err(XhciError::InvalidConfig(
            "primary stream count exceeds the endpoint maximum",
        ));
    }

    if !count.is_power_of_two() || count < MIN_PRIMARY_STREAMS {
        error!(count, "primary stream count must be a power of two of at least 4");
        return Err(XhciError::InvalidConfig(
            "primary stream count must be a power of two of at least 4",
        ));
    }

    Ok(())
}

/// Checks every secondary array size before anything is allocated.
pub fn validate_secondary_sizes(sizes: &[usize]) -> Result<()> {
    if sizes.len() > MAX_PRIMARY_STREAMS_WITH_SECONDARY {
        error!(count = sizes.len(), "too many primary streams for secondary arrays");
        return Err(XhciError::InvalidConfig(
            "at most 256 primary streams can be used with secondary arrays",
        ));
    }
    for (index, &size) in sizes.iter().enumerate() {
        let ok = size == 0
            || (size.is_power_of_two()
                && (MIN_SECONDARY_STREAMS..=MAX_SECONDARY_STREAMS).contains(&size));
        if !ok {
            error!(
                index,
                size, "secondary stream array size must be a power of two between 8 and 256"
            );
            return Err(XhciError::InvalidConfig(
                "secondary stream array size must be 0 or a power of two between 8 and 256",
            ));
        }
    }
    Ok(())
}
