//! Message bus adapter.
//!
//! Outbound frames are encoded and handed straight to the transport. Inbound
//! frames are classified by their order token and buffered in a priority
//! queue; `poll` always yields the highest-priority, oldest entry, so a
//! safety message is never stuck behind a backlog of routine traffic,
//! whatever the arrival order.

use crate::error::BusError;
use crate::protocol::{BusMessage, Frame, Order, PriorityClass, QueuedMessage};
use crate::registry::{AddressRegistry, Token};
use crate::transport::{lock, FrameListener, LoopbackBus, Transport};
use core::cmp::Reverse;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, trace};

/// Process-wide enqueue counter. Strictly increasing, never reused.
static SEQUENCE: AtomicU64 = AtomicU64::new(0);

fn next_sequence() -> u64 {
    SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

pub struct BusAdapter {
    device_name: Token,
    registry: Arc<AddressRegistry>,
    transport: Arc<dyn Transport>,
    queue: Mutex<BinaryHeap<Reverse<QueuedMessage>>>,
    arrived: Notify,
    closed: AtomicBool,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
}

impl BusAdapter {
    /// `device_name` is this node's own device token and must be mapped.
    pub fn new(
        device_name: &str,
        registry: Arc<AddressRegistry>,
        transport: Arc<dyn Transport>,
    ) -> Result<Arc<Self>, BusError> {
        let own = registry
            .device_code(device_name)
            .map(|code| registry.decode_device(code))
            .ok_or_else(|| BusError::UnknownAddress {
                device: device_name.to_string(),
                order: String::new(),
            })?;

        Ok(Arc::new(Self {
            device_name: own,
            registry,
            transport,
            queue: Mutex::new(BinaryHeap::new()),
            arrived: Notify::new(),
            closed: AtomicBool::new(false),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
        }))
    }

    /// Adapter for a fresh node on a loopback bus, already receiving.
    pub fn on_loopback(
        device_name: &str,
        registry: Arc<AddressRegistry>,
        bus: &Arc<LoopbackBus>,
    ) -> Result<Arc<Self>, BusError> {
        let port = bus.connect();
        let adapter = Self::new(device_name, registry, port.clone())?;
        let weak = Arc::downgrade(&adapter);
        let listener: Weak<dyn FrameListener> = weak;
        port.attach(listener);
        Ok(adapter)
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn registry(&self) -> &AddressRegistry {
        &self.registry
    }

    /// Resolve, encode and transmit. No queuing on this path.
    pub fn send(&self, device: &str, order: &str, payload: Option<u64>) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::TransportClosed);
        }

        let address = self
            .registry
            .address(device, order)
            .ok_or_else(|| BusError::UnknownAddress {
                device: device.to_string(),
                order: order.to_string(),
            })?;

        let [device_code, order_code] = address.to_be_bytes();
        let frame = Frame::new(device_code, order_code, payload);
        trace!(device, order, payload = payload.unwrap_or(0), "tx");
        self.transport.transmit(&frame)?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn send_order(&self, device: &str, order: Order, payload: Option<u64>) -> Result<(), BusError> {
        self.send(device, order.as_token(), payload)
    }

    /// Pop the highest-priority, lowest-sequence entry.
    pub fn poll(&self) -> Option<QueuedMessage> {
        lock(&self.queue).pop().map(|Reverse(queued)| queued)
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn decode(&self, frame: &Frame) -> BusMessage {
        let (device, order) = self.registry.decode_address(frame.address);
        BusMessage {
            device,
            order,
            payload: frame.payload(),
        }
    }

    /// Resolves once a frame has been enqueued since the last wake-up.
    pub async fn frame_arrived(&self) {
        self.arrived.notified().await;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release the transport and drop anything still queued.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.shutdown();
        lock(&self.queue).clear();
        self.arrived.notify_waiters();
        self.arrived.notify_one();
        debug!(device = %self.device_name, "bus adapter released");
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }
}

impl FrameListener for BusAdapter {
    fn on_frame_received(&self, frame: Frame) {
        if self.is_closed() {
            return;
        }

        let order = self.registry.decode_order(frame.order_code());
        let priority = PriorityClass::classify(&order);
        let sequence = next_sequence();
        trace!(%order, ?priority, sequence, "rx enqueue");

        lock(&self.queue).push(Reverse(QueuedMessage { priority, sequence, frame }));
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.arrived.notify_one();
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    pub delivered: u64,
    pub duplicates_suppressed: u64,
    pub foreign_dropped: u64,
}

/// Consumer side of an adapter: own-device filter plus suppression of a
/// message identical to the one delivered immediately before it.
pub struct Dispatcher {
    bus: Arc<BusAdapter>,
    previous: Option<BusMessage>,
    stats: DispatchStats,
}

impl Dispatcher {
    pub fn new(bus: Arc<BusAdapter>) -> Self {
        Self {
            bus,
            previous: None,
            stats: DispatchStats::default(),
        }
    }

    pub fn bus(&self) -> &Arc<BusAdapter> {
        &self.bus
    }

    pub fn stats(&self) -> DispatchStats {
        self.stats
    }

    /// Next deliverable message without waiting.
    pub fn try_next(&mut self) -> Option<BusMessage> {
        while let Some(queued) = self.bus.poll() {
            let message = self.bus.decode(&queued.frame);

            if message.device != self.bus.device_name {
                self.stats.foreign_dropped += 1;
                continue;
            }
            if self.previous == Some(message) {
                self.stats.duplicates_suppressed += 1;
                trace!(order = %message.order, payload = message.payload, "duplicate suppressed");
                continue;
            }

            self.previous = Some(message);
            self.stats.delivered += 1;
            return Some(message);
        }
        None
    }

    /// Wait for the next deliverable message. `None` once the bus is shut down.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        loop {
            if let Some(message) = self.try_next() {
                return Some(message);
            }
            if self.bus.is_closed() {
                return None;
            }
            self.bus.frame_arrived().await;
        }
    }
}
