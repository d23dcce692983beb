//! Endpoint registry and batch submission.
//!
//! The [`Bus`] keeps every configured endpoint keyed by device address, endpoint number and
//! direction. Lookups hand out counted [`EndpointRef`]s; removal tears the endpoint down even
//! while references are outstanding, which makes blocked callers return
//! [`XhciError::EndpointGone`].

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use tracing::{debug, error, trace, warn};

use crate::dma::SharedMemory;
use crate::xhci::endpoint::{DeviceInfo, Direction, EndpointDesc, XhciEndpoint};
use crate::xhci::event_ring::EventRing;
use crate::xhci::isoch::IsochTransfer;
use crate::xhci::trb::{Trb, TrbType};
use crate::xhci::{HostController, XhciConfig};
use crate::{Result, XhciError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub address: u8,
    pub endpoint: u8,
    pub direction: Direction,
}

impl EndpointKey {
    pub fn new(address: u8, endpoint: u8, direction: Direction) -> Self {
        Self {
            address,
            endpoint,
            direction,
        }
    }
}

struct BusEndpoint {
    refs: AtomicUsize,
    ep: XhciEndpoint,
}

/// Counted handle to a registered endpoint. Dropping it releases the reference.
pub struct EndpointRef {
    inner: Arc<BusEndpoint>,
}

impl EndpointRef {
    fn acquire(inner: &Arc<BusEndpoint>) -> Self {
        inner.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            inner: Arc::clone(inner),
        }
    }

    pub fn release(self) {}
}

impl Deref for EndpointRef {
    type Target = XhciEndpoint;

    fn deref(&self) -> &XhciEndpoint {
        &self.inner.ep
    }
}

impl Drop for EndpointRef {
    fn drop(&mut self) {
        self.inner.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

/// What a batch callback is told: the bytes moved and the error, if any.
///
/// A transfer error does not void the byte count: an OUT batch can report bytes that completed
/// before the failed transfer together with that failure.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub transferred: usize,
    pub error: Option<XhciError>,
}

impl BatchResult {
    pub fn ok(transferred: usize) -> Self {
        Self {
            transferred,
            error: None,
        }
    }

    pub fn failed(error: XhciError) -> Self {
        Self {
            transferred: 0,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

impl From<IsochTransfer> for BatchResult {
    fn from(IsochTransfer { transferred, error }: IsochTransfer) -> Self {
        Self {
            transferred,
            error: error.map(XhciError::Transfer),
        }
    }
}

type BatchCallback = Box<dyn FnOnce(Vec<u8>, BatchResult) + Send>;

/// A buffer handed to [`Bus::send_batch`] together with its completion callback.
///
/// The callback receives the buffer back and the [`BatchResult`]. It runs exactly once: on
/// completion, or with [`XhciError::EndpointGone`] if the batch is dropped unfinished.
pub struct TransferBatch {
    direction: Direction,
    buffer: Vec<u8>,
    callback: Option<BatchCallback>,
}

impl TransferBatch {
    pub fn new<F>(direction: Direction, buffer: Vec<u8>, callback: F) -> Self
    where
        F: FnOnce(Vec<u8>, BatchResult) + Send + 'static,
    {
        Self {
            direction,
            buffer,
            callback: Some(Box::new(callback)),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    fn complete(mut self, result: BatchResult) {
        self.finish(result);
    }

    fn finish(&mut self, result: BatchResult) {
        if let Some(callback) = self.callback.take() {
            callback(std::mem::take(&mut self.buffer), result);
        }
    }
}

impl Drop for TransferBatch {
    fn drop(&mut self) {
        self.finish(BatchResult::failed(XhciError::EndpointGone));
    }
}

impl fmt::Debug for TransferBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferBatch")
            .field("direction", &self.direction)
            .field("len", &self.buffer.len())
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Registry {
    endpoints: HashMap<EndpointKey, Arc<BusEndpoint>>,
    /// Keys being set up outside the lock; a second add of the same key is refused.
    pending: HashSet<EndpointKey>,
}

pub struct Bus {
    hc: Arc<dyn HostController>,
    mem: SharedMemory,
    config: XhciConfig,
    registry: Mutex<Registry>,
}

impl Bus {
    pub fn new(hc: Arc<dyn HostController>, mem: SharedMemory, config: XhciConfig) -> Result<Self> {
        if let Err(err) = config.validate() {
            error!(%err, "rejecting transfer engine configuration");
            return Err(err);
        }
        Ok(Self {
            hc,
            mem,
            config,
            registry: Mutex::new(Registry::default()),
        })
    }

    pub fn config(&self) -> &XhciConfig {
        &self.config
    }

    /// Allocates an event ring laid out as the configuration asks.
    pub fn event_ring(&self) -> Result<EventRing> {
        EventRing::new(&self.mem, &self.config)
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sets up the transfer state of an endpoint and installs its context on the controller.
    pub fn add_endpoint(&self, device: DeviceInfo, desc: EndpointDesc) -> Result<()> {
        let key = EndpointKey::new(device.address, desc.number, desc.direction);
        {
            let mut registry = self.lock();
            if registry.endpoints.contains_key(&key) || !registry.pending.insert(key) {
                warn!(?key, "endpoint already configured");
                return Err(XhciError::InvalidConfig("endpoint already configured"));
            }
        }

        let installed = self.install(device, desc);
        let mut registry = self.lock();
        registry.pending.remove(&key);
        let ep = installed?;
        debug!(
            address = key.address,
            endpoint = key.endpoint,
            direction = ?key.direction,
            "endpoint added"
        );
        registry.endpoints.insert(
            key,
            Arc::new(BusEndpoint {
                refs: AtomicUsize::new(0),
                ep,
            }),
        );
        Ok(())
    }

    fn install(&self, device: DeviceInfo, desc: EndpointDesc) -> Result<XhciEndpoint> {
        let ep = XhciEndpoint::new(Arc::clone(&self.hc), &self.mem, &self.config, device, desc)?;
        if let Err(err) = self
            .hc
            .add_endpoint(device.slot_id, desc.ep_index(), &ep.endpoint_context())
        {
            ep.teardown();
            return Err(err);
        }
        Ok(ep)
    }

    pub fn find_endpoint(&self, address: u8, endpoint: u8, direction: Direction) -> Option<EndpointRef> {
        self.lock()
            .endpoints
            .get(&EndpointKey::new(address, endpoint, direction))
            .map(EndpointRef::acquire)
    }

    /// Outstanding references to an endpoint.
    pub fn ref_count(&self, key: EndpointKey) -> Option<usize> {
        self.lock()
            .endpoints
            .get(&key)
            .map(|entry| entry.refs.load(Ordering::Acquire))
    }

    /// Unregisters and tears down an endpoint.
    pub fn remove_endpoint(&self, key: EndpointKey) -> Result<()> {
        let entry = self
            .lock()
            .endpoints
            .remove(&key)
            .ok_or(XhciError::NoEndpoint)?;
        let refs = entry.refs.load(Ordering::Acquire);
        if refs != 0 {
            debug!(?key, refs, "removing endpoint with outstanding references");
        }
        entry.ep.teardown();
        Ok(())
    }

    /// Routes one event TRB to its endpoint. Non-transfer events are ignored.
    pub fn handle_event(&self, trb: &Trb) {
        if trb.trb_type() != TrbType::TransferEvent {
            trace!(ty = ?trb.trb_type(), "ignoring event");
            return;
        }
        let slot_id = trb.slot_id();
        let dci = trb.endpoint_id();
        let target = self
            .lock()
            .endpoints
            .values()
            .find(|entry| entry.ep.device().slot_id == slot_id && entry.ep.desc().dci() == dci)
            .map(EndpointRef::acquire);
        match target {
            Some(ep) => ep.handle_transfer_event(trb),
            None => warn!(slot = slot_id, dci, "transfer event for an unknown endpoint"),
        }
    }

    /// Drains the event ring, dispatching every event. Returns how many were consumed.
    pub fn process_events(&self, events: &mut EventRing) -> usize {
        events.drain(|trb| self.handle_event(&trb))
    }

    /// Submits a batch to an isochronous endpoint; other transfer types are not handled here.
    ///
    /// OUT batches report the bytes completed since the previous OUT batch, IN batches the bytes
    /// received into this one. A hardware-reported failure arrives as
    /// [`XhciError::Transfer`] next to the bytes completed before it.
    pub fn send_batch(&self, address: u8, endpoint: u8, mut batch: TransferBatch) {
        let Some(ep) = self.find_endpoint(address, endpoint, batch.direction) else {
            batch.complete(BatchResult::failed(XhciError::NoEndpoint));
            return;
        };
        let Some(isoch) = ep.isoch() else {
            batch.complete(BatchResult::failed(XhciError::NotSupported(
                "batches are only supported on isochronous endpoints",
            )));
            return;
        };

        let scheduled = match batch.direction {
            Direction::Out => isoch.schedule_out(&batch.buffer),
            Direction::In => isoch.schedule_in(&mut batch.buffer),
        };
        let result = match scheduled {
            Ok(transfer) => BatchResult::from(transfer),
            Err(err) => BatchResult::failed(err),
        };
        ep.release();
        batch.complete(result);
    }

    /// [`Bus::send_batch`] for callers that want to wait for the result.
    pub fn send_batch_sync(
        &self,
        address: u8,
        endpoint: u8,
        direction: Direction,
        buffer: &mut Vec<u8>,
    ) -> BatchResult {
        let done = Arc::new((Mutex::new(None), Condvar::new()));
        let signal = Arc::clone(&done);
        let batch = TransferBatch::new(direction, std::mem::take(buffer), move |buf, result| {
            let (slot, cv) = &*signal;
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some((buf, result));
            cv.notify_all();
        });
        self.send_batch(address, endpoint, batch);

        let (slot, cv) = &*done;
        let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some((buf, result)) = guard.take() {
                *buffer = buf;
                return result;
            }
            guard = cv.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        for (_, entry) in self.lock().endpoints.drain() {
            entry.ep.teardown();
        }
    }
}
