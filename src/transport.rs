//! Frame transport seam.
//!
//! The adapter only ever sees `Transport` (outbound) and implements
//! `FrameListener` (inbound). `LoopbackBus` is an in-process virtual bus used
//! by the simulator and the test-suite: every frame transmitted on one port is
//! delivered to every other attached port, never echoed to its sender.

use crate::error::BusError;
use crate::protocol::Frame;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::trace;

const TRAFFIC_LOG_CAPACITY: usize = 4096;

pub trait Transport: Send + Sync {
    fn transmit(&self, frame: &Frame) -> Result<(), BusError>;

    /// Release the underlying bus resource. Must be idempotent.
    fn shutdown(&self) {}
}

/// Receives every inbound frame, typically from the transport's receive context.
pub trait FrameListener: Send + Sync {
    fn on_frame_received(&self, frame: Frame);
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

struct PortSlot {
    id: usize,
    listener: Option<Weak<dyn FrameListener>>,
    open: bool,
}

#[derive(Default)]
pub struct LoopbackBus {
    ports: Mutex<Vec<PortSlot>>,
    traffic: Mutex<VecDeque<Frame>>,
    next_port: AtomicUsize,
}

impl LoopbackBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a new node to the bus.
    pub fn connect(self: &Arc<Self>) -> Arc<LoopbackPort> {
        let id = self.next_port.fetch_add(1, Ordering::Relaxed);
        lock(&self.ports).push(PortSlot { id, listener: None, open: true });
        Arc::new(LoopbackPort {
            id,
            bus: Arc::clone(self),
            closed: AtomicBool::new(false),
        })
    }

    /// Every frame transmitted so far, oldest first (bounded).
    pub fn traffic(&self) -> Vec<Frame> {
        lock(&self.traffic).iter().cloned().collect()
    }

    pub fn clear_traffic(&self) {
        lock(&self.traffic).clear();
    }

    fn deliver(&self, from: usize, frame: &Frame) {
        {
            let mut traffic = lock(&self.traffic);
            if traffic.len() == TRAFFIC_LOG_CAPACITY {
                traffic.pop_front();
            }
            traffic.push_back(frame.clone());
        }

        // Collect first so listeners run without the port table locked.
        let listeners: Vec<Arc<dyn FrameListener>> = lock(&self.ports)
            .iter()
            .filter(|slot| slot.open && slot.id != from)
            .filter_map(|slot| slot.listener.as_ref().and_then(Weak::upgrade))
            .collect();

        trace!(address = frame.address, receivers = listeners.len(), "loopback frame");
        for listener in listeners {
            listener.on_frame_received(frame.clone());
        }
    }

    fn set_listener(&self, port: usize, listener: Weak<dyn FrameListener>) {
        if let Some(slot) = lock(&self.ports).iter_mut().find(|slot| slot.id == port) {
            slot.listener = Some(listener);
        }
    }

    fn close(&self, port: usize) {
        if let Some(slot) = lock(&self.ports).iter_mut().find(|slot| slot.id == port) {
            slot.open = false;
            slot.listener = None;
        }
    }
}

pub struct LoopbackPort {
    id: usize,
    bus: Arc<LoopbackBus>,
    closed: AtomicBool,
}

impl LoopbackPort {
    /// Route inbound frames for this port to `listener`. Held weakly so the
    /// bus never keeps an adapter alive.
    pub fn attach(&self, listener: Weak<dyn FrameListener>) {
        self.bus.set_listener(self.id, listener);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for LoopbackPort {
    fn transmit(&self, frame: &Frame) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::TransportClosed);
        }
        self.bus.deliver(self.id, frame);
        Ok(())
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.bus.close(self.id);
        }
    }
}
