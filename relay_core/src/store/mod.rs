//! Read-only adapters over the backing stores.
//!
//! The relational snapshot database and the pub/sub key-value store are
//! reached through the [`SnapshotSource`] and [`PubSubSource`] traits so the
//! engine and aggregation code can run against fakes. Everything crossing
//! these traits uses explicit `Option`s for fields a store may omit.

use std::collections::{BTreeMap, HashMap};

use bitflags::bitflags;
use serde_json::Value;
use thiserror::Error;

pub mod link;
pub mod pubsub;
pub mod snapshot;

pub use link::{LinkState, RedisLink};
pub use pubsub::{RedisPubSub, TickTransport};
pub use snapshot::{CachedSnapshotStore, SqliteSnapshotStore};

bitflags! {
    /// Where the relay pulls each kind of data from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct SourceCapabilities: u32 {
        const TICK_STREAM = 1 << 0;
        const TICK_CHANNEL = 1 << 1;
        const ROBOTS_FROM_HASHES = 1 << 2;
        const ROBOTS_FROM_SNAPSHOT = 1 << 3;
        const ORDERS_FROM_PUBSUB = 1 << 4;
        const ORDERS_FROM_SNAPSHOT = 1 << 5;
        const DT_FROM_SNAPSHOT = 1 << 6;
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// Connection refused, reset or not yet established.
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store query failed: {0}")]
    Query(String),
    #[error("malformed record {key}: {reason}")]
    Malformed { key: String, reason: String },
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_connection_dropped() || err.is_io_error() {
            StoreError::Unavailable(err.to_string())
        } else {
            StoreError::Query(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if matches!(
                    code.code,
                    rusqlite::ErrorCode::CannotOpen
                        | rusqlite::ErrorCode::DatabaseBusy
                        | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                StoreError::Unavailable(err.to_string())
            }
            _ => StoreError::Query(err.to_string()),
        }
    }
}

/// Field map of a key-value hash.
pub type Hash = HashMap<String, String>;

/// A robot record exactly as the store delivered it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawRobotRow {
    pub id: Option<i64>,
    pub position: Option<Value>,
    pub path: Option<Value>,
    pub held_item_id: Option<Value>,
    pub state: Option<String>,
}

impl RawRobotRow {
    /// Build from a `robot:<id>` hash. The id falls back to the key suffix.
    pub fn from_hash(key: Option<&str>, hash: &Hash) -> Self {
        let id = hash
            .get("id")
            .or_else(|| hash.get("robot_id"))
            .and_then(|raw| raw.trim().parse().ok())
            .or_else(|| key.and_then(key_suffix_id));
        Self {
            id,
            position: hash
                .get("position")
                .or_else(|| hash.get("pos"))
                .map(|raw| parse_embedded(raw)),
            path: hash.get("path").map(|raw| Value::String(raw.clone())),
            held_item_id: hash
                .get("held_item_id")
                .map(|raw| Value::String(raw.clone())),
            state: hash.get("state").cloned(),
        }
    }

    /// Build from one element of a JSON robots array.
    pub fn from_json(value: &Value) -> Self {
        let field = |names: &[&str]| {
            names
                .iter()
                .find_map(|name| value.get(*name))
                .filter(|v| !v.is_null())
                .cloned()
        };
        Self {
            id: field(&["id", "robot_id"]).and_then(|v| match v {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            }),
            position: field(&["pos", "position"]),
            path: field(&["path"]),
            held_item_id: field(&["held_item_id"]),
            state: field(&["state"]).map(|v| match v {
                Value::String(s) => s,
                other => other.to_string(),
            }),
        }
    }

    /// Parse a JSON array of robot objects, e.g. the `robots` field of a tick.
    pub fn parse_array(raw: &str) -> Result<Vec<RawRobotRow>, StoreError> {
        let value: Value = serde_json::from_str(raw).map_err(|err| StoreError::Malformed {
            key: "robots".to_string(),
            reason: err.to_string(),
        })?;
        match value {
            Value::Array(items) => Ok(items.iter().map(RawRobotRow::from_json).collect()),
            _ => Err(StoreError::Malformed {
                key: "robots".to_string(),
                reason: "expected an array".to_string(),
            }),
        }
    }
}

fn parse_embedded(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// `robot:12` -> 12
pub fn key_suffix_id(key: &str) -> Option<i64> {
    key.rsplit(':').next().and_then(|tail| tail.parse().ok())
}

/// What a blocking tick read yields. `robots` is `None` when the
/// notification only carries the tick number.
#[derive(Debug, Clone, PartialEq)]
pub struct TickNotice {
    pub t: i64,
    pub robots: Option<Vec<RawRobotRow>>,
}

/// A tick with its robot rows resolved, ready for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct TickEvent {
    pub t: i64,
    pub robots: Vec<RawRobotRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Hash,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub new: u64,
    pub total: u64,
    pub stations: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OverviewLimits {
    pub new_orders: usize,
    pub finished_orders: usize,
    pub free_stations: usize,
    pub busy_stations: usize,
}

impl OverviewLimits {
    pub fn uniform(limit: usize) -> Self {
        Self {
            new_orders: limit,
            finished_orders: limit,
            free_stations: limit,
            busy_stations: limit,
        }
    }
}

/// First-stage result of an order/station aggregation cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderOverview {
    pub new_order_keys: Vec<String>,
    pub finished: Vec<StreamEntry>,
    pub free_station_keys: Vec<String>,
    pub busy_station_keys: Vec<String>,
    pub counts: StoreCounts,
}

pub trait PubSubSource: Send {
    /// Block until the next tick is published. No timeout.
    fn read_tick_blocking(&mut self) -> Result<TickNotice, StoreError>;

    fn get_robot_keys(&mut self) -> Result<Vec<String>, StoreError>;

    /// Fetch many hashes in one round-trip. Results align with `keys`;
    /// missing or empty hashes are `None`.
    fn batch_get(&mut self, keys: &[String]) -> Result<Vec<Option<Hash>>, StoreError>;

    fn get_new_order_keys(&mut self, limit: usize) -> Result<Vec<String>, StoreError>;

    /// Most recent entries first.
    fn get_recent_finished_orders(&mut self, limit: usize) -> Result<Vec<StreamEntry>, StoreError>;

    fn get_free_station_keys(&mut self, limit: usize) -> Result<Vec<String>, StoreError>;

    fn get_busy_station_sample(&mut self, limit: usize) -> Result<Vec<String>, StoreError>;

    fn get_counts(&mut self) -> Result<StoreCounts, StoreError>;

    fn get_dt_sec(&mut self) -> Result<Option<f64>, StoreError>;

    /// All first-stage aggregation reads. Implementations backed by a real
    /// server should override this with a single pipelined round-trip.
    fn fetch_overview(&mut self, limits: &OverviewLimits) -> Result<OrderOverview, StoreError> {
        Ok(OrderOverview {
            new_order_keys: self.get_new_order_keys(limits.new_orders)?,
            finished: self.get_recent_finished_orders(limits.finished_orders)?,
            free_station_keys: self.get_free_station_keys(limits.free_stations)?,
            busy_station_keys: self.get_busy_station_sample(limits.busy_stations)?,
            counts: self.get_counts()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRow {
    pub order_id: i64,
    pub status: Option<String>,
    pub created: Option<f64>,
    pub finished: Option<f64>,
    pub description: Option<String>,
    /// `None` when the order has no item rows at all.
    pub items: Option<BTreeMap<u32, u32>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StationRow {
    pub station_id: i64,
    pub order_id: Option<i64>,
    /// Order creation time, when a current order exists.
    pub order_created: Option<f64>,
    pub delivered: BTreeMap<u32, u32>,
    pub required: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderFilter {
    /// Not yet assigned to a station (OPEN or no status), oldest first.
    New,
    /// COMPLETE or ERROR, newest first.
    Finished,
}

pub trait SnapshotSource: Send {
    fn query_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError>;

    /// status label -> row count
    fn query_order_counts(&mut self) -> Result<BTreeMap<String, u64>, StoreError>;

    fn query_stations_and_orders(&mut self) -> Result<Vec<StationRow>, StoreError>;

    fn query_orders(&mut self, filter: OrderFilter, limit: usize)
        -> Result<Vec<OrderRow>, StoreError>;

    /// Value column of the `State` row with the given label.
    fn query_state_value(&mut self, label: &str) -> Result<Option<String>, StoreError>;
}

impl<T: SnapshotSource + ?Sized> SnapshotSource for Box<T> {
    fn query_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
        (**self).query_robots()
    }

    fn query_order_counts(&mut self) -> Result<BTreeMap<String, u64>, StoreError> {
        (**self).query_order_counts()
    }

    fn query_stations_and_orders(&mut self) -> Result<Vec<StationRow>, StoreError> {
        (**self).query_stations_and_orders()
    }

    fn query_orders(
        &mut self,
        filter: OrderFilter,
        limit: usize,
    ) -> Result<Vec<OrderRow>, StoreError> {
        (**self).query_orders(filter, limit)
    }

    fn query_state_value(&mut self, label: &str) -> Result<Option<String>, StoreError> {
        (**self).query_state_value(label)
    }
}
