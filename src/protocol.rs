use crate::registry::Token;
use core::cmp::Ordering;
use core::str::FromStr;
use heapless::Vec;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;

pub const MAX_PAYLOAD_BYTES: usize = 8;

// Payloads are carried as a u64 end to end.
const_assert_eq!(MAX_PAYLOAD_BYTES, core::mem::size_of::<u64>());

pub type PayloadBuffer = Vec<u8, MAX_PAYLOAD_BYTES>;

/// Device tokens the supervisor talks to.
pub mod device {
    pub const OBU: &str = "OBU";
    pub const BRAKE: &str = "BRAKE";
    pub const STEER: &str = "STEER";
    pub const OPERATOR: &str = "OPERATOR";
}

/// A raw bus frame: 11-bit style arbitration address split into a device
/// byte and an order byte, plus up to eight payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub address: u16,
    pub data: PayloadBuffer,
}

impl Frame {
    pub fn new(device_code: u8, order_code: u8, payload: Option<u64>) -> Self {
        Self {
            address: u16::from(device_code) << 8 | u16::from(order_code),
            data: encode_payload(payload),
        }
    }

    pub fn device_code(&self) -> u8 {
        (self.address >> 8) as u8
    }

    pub fn order_code(&self) -> u8 {
        (self.address & 0xFF) as u8
    }

    pub fn payload(&self) -> u64 {
        decode_payload(&self.data)
    }
}

/// Minimal big-endian encoding. `None` and zero both encode to no bytes.
pub fn encode_payload(payload: Option<u64>) -> PayloadBuffer {
    let mut data = PayloadBuffer::new();
    let value = payload.unwrap_or(0);
    if value == 0 {
        return data;
    }

    let bytes = value.to_be_bytes();
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(MAX_PAYLOAD_BYTES);
    // At most eight bytes, always fits.
    let _ = data.extend_from_slice(&bytes[first..]);
    data
}

pub fn decode_payload(data: &[u8]) -> u64 {
    data.iter()
        .take(MAX_PAYLOAD_BYTES)
        .fold(0u64, |acc, b| acc << 8 | u64::from(*b))
}

/// Catalog of order tokens the supervisor consumes or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Order {
    BrakeRdy,
    SteerRdy,
    ReadyAck,
    Start,
    Stop,
    Restart,
    AccelPedal,
    BrakeEnable,
    BoutonPark,
    BoutonAutoManu,
    BoutonOnOff,
    BoutonReverse,
    SteerPosReal,
    SteerTarget,
    SteerPosSet,
    SteerEnable,
    BrakePosSet,
}

impl Order {
    pub const ALL: [Order; 17] = [
        Order::BrakeRdy,
        Order::SteerRdy,
        Order::ReadyAck,
        Order::Start,
        Order::Stop,
        Order::Restart,
        Order::AccelPedal,
        Order::BrakeEnable,
        Order::BoutonPark,
        Order::BoutonAutoManu,
        Order::BoutonOnOff,
        Order::BoutonReverse,
        Order::SteerPosReal,
        Order::SteerTarget,
        Order::SteerPosSet,
        Order::SteerEnable,
        Order::BrakePosSet,
    ];

    pub fn as_token(self) -> &'static str {
        match self {
            Order::BrakeRdy => "brake_rdy",
            Order::SteerRdy => "steer_rdy",
            Order::ReadyAck => "ready_ack",
            Order::Start => "start",
            Order::Stop => "stop",
            Order::Restart => "restart",
            Order::AccelPedal => "accel_pedal",
            Order::BrakeEnable => "brake_enable",
            Order::BoutonPark => "bouton_park",
            Order::BoutonAutoManu => "bouton_auto_manu",
            Order::BoutonOnOff => "bouton_on_off",
            Order::BoutonReverse => "bouton_reverse",
            Order::SteerPosReal => "steer_pos_real",
            Order::SteerTarget => "steer_target",
            Order::SteerPosSet => "steer_pos_set",
            Order::SteerEnable => "steer_enable",
            Order::BrakePosSet => "brake_pos_set",
        }
    }
}

impl FromStr for Order {
    type Err = UnknownOrder;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        Order::ALL
            .iter()
            .copied()
            .find(|order| order.as_token() == token)
            .ok_or(UnknownOrder)
    }
}

impl core::fmt::Display for Order {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_token())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownOrder;

/// Delivery class of an inbound message. Declaration order is delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PriorityClass {
    High,
    Medium,
    Default,
}

impl PriorityClass {
    /// Pure function of the decoded order token.
    pub fn classify(order: &str) -> Self {
        match order {
            "brake_enable" | "bouton_park" | "bouton_on_off" => PriorityClass::High,
            "accel_pedal" => PriorityClass::Medium,
            _ => PriorityClass::Default,
        }
    }
}

/// Decoded `(device, order, payload)` triple as delivered to handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusMessage {
    pub device: Token,
    pub order: Token,
    pub payload: u64,
}

impl BusMessage {
    /// The order as a catalog entry, `None` for tokens outside the catalog.
    pub fn order(&self) -> Option<Order> {
        self.order.parse().ok()
    }
}

/// Inbound frame waiting in the adapter's priority queue.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub priority: PriorityClass,
    pub sequence: u64,
    pub frame: Frame,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedMessage {}

impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then(self.sequence.cmp(&other.sequence))
    }
}
