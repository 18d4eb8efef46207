//! Wire contract shared by the warehouse relay and its dashboard clients.
//!
//! Every message on the push channel is a [`ServerEvent`] serialized as JSON
//! (`{"event": "...", "payload": {...}}`) and wrapped in a 4-byte little-endian
//! length prefix.

use std::collections::BTreeMap;
use std::io::{self, Read};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound accepted by [`read_frame`]; anything larger is treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Integer grid coordinate. `x` is the column, `y` the row.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridPos {
    pub x: i32,
    pub y: i32,
}

impl GridPos {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn from_pair(pair: [i32; 2]) -> Self {
        Self::new(pair[0], pair[1])
    }

    pub fn to_pair(self) -> [i32; 2] {
        [self.x, self.y]
    }

    pub fn offset(self, dx: i32, dy: i32) -> Self {
        Self::new(self.x.saturating_add(dx), self.y.saturating_add(dy))
    }

    /// True when `other` is reachable in one move (including waiting in place).
    pub fn is_step_from(self, other: GridPos) -> bool {
        u64::from(self.x.abs_diff(other.x)) + u64::from(self.y.abs_diff(other.y)) <= 1
    }
}

/// Static layout sent once per connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorldPayload {
    /// Row-major cell codes: 0 empty, 1 wall, 2 robot home, 3 item load, 4 station.
    pub grid: Vec<Vec<u8>>,
    pub item_load_positions: Vec<GridPos>,
    pub station_positions: Vec<GridPos>,
    pub robot_home_zones: Vec<GridPos>,
    pub item_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RobotUpdate {
    pub id: u32,
    pub pos: GridPos,
    pub held_item_id: Option<u32>,
    pub state: String,
    /// Absent when the path equals the previously sent path with its head removed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<[i32; 2]>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpdatePayload {
    pub t: i64,
    /// Seconds per tick; `null` until the relay has learned it from the store.
    pub dt_s: Option<f64>,
    pub robots: Vec<RobotUpdate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    InProgress,
    Complete,
    Error,
}

impl OrderStatus {
    pub fn parse_label(label: &str) -> Option<Self> {
        match label.trim() {
            "OPEN" => Some(Self::Open),
            "IN_PROGRESS" => Some(Self::InProgress),
            "COMPLETE" => Some(Self::Complete),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::InProgress => "IN_PROGRESS",
            Self::Complete => "COMPLETE",
            Self::Error => "ERROR",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error)
    }

    /// OPEN -> IN_PROGRESS -> COMPLETE, with ERROR reachable from anything
    /// that is not already terminal. Staying in place is always allowed.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        if self == next {
            return true;
        }
        match (self, next) {
            (Self::Complete | Self::Error, _) => false,
            (_, Self::Error) => true,
            (Self::Open, Self::InProgress | Self::Complete) => true,
            (Self::InProgress, Self::Complete) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderEntry {
    pub key: String,
    pub order_id: Option<u64>,
    pub status: OrderStatus,
    /// item_id -> quantity
    pub items: BTreeMap<u32, u32>,
    pub created: Option<f64>,
    pub assigned: Option<f64>,
    pub finished: Option<f64>,
    pub station: Option<String>,
    /// Why the entry carries the `ERROR` marker, when it does.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OrderEntry {
    pub fn malformed(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            order_id: None,
            status: OrderStatus::Error,
            items: BTreeMap::new(),
            created: None,
            assigned: None,
            finished: None,
            station: None,
            error: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StationEntry {
    pub key: String,
    pub station_id: Option<u64>,
    pub order: Option<OrderEntry>,
    /// Items already delivered to the station.
    pub delivered: BTreeMap<u32, u32>,
    /// Items the station's current order requires.
    pub required: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ImsAllOrders {
    pub new_orders: Vec<OrderEntry>,
    pub finished_orders: Vec<OrderEntry>,
    pub free_station_keys: Vec<String>,
    pub busy_stations: Vec<StationEntry>,
    pub station_count: u64,
    pub new_order_count: u64,
    pub finished_order_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    SetWorld(WorldPayload),
    Update(UpdatePayload),
    ImsAllOrders(ImsAllOrders),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::SetWorld(_) => "set_world",
            Self::Update(_) => "update",
            Self::ImsAllOrders(_) => "ims_all_orders",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("failed to encode/decode event: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("frame read failed: {0}")]
    Io(#[from] io::Error),
}

pub fn encode_event(event: &ServerEvent) -> Result<Vec<u8>, ProtoError> {
    Ok(serde_json::to_vec(event)?)
}

pub fn decode_event(bytes: &[u8]) -> Result<ServerEvent, ProtoError> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Prefix `payload` with its little-endian `u32` length.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u32;
    let mut buffer = Vec::with_capacity(4 + payload.len());
    buffer.extend_from_slice(&len.to_le_bytes());
    buffer.extend_from_slice(payload);
    buffer
}

/// Encode an event straight into a length-prefixed frame.
pub fn encode_event_frame(event: &ServerEvent) -> Result<Vec<u8>, ProtoError> {
    Ok(encode_frame(&encode_event(event)?))
}

/// Read one length-prefixed frame from a blocking reader.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>, ProtoError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtoError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}
