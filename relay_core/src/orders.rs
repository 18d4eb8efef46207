//! Order and station records as the dashboard sees them.
//!
//! Store records arrive with numeric fields as strings and item maps as JSON
//! text. Everything here turns them into [`OrderEntry`] / [`StationEntry`]
//! values; records that cannot be interpreted become explicit `ERROR`
//! entries instead of being dropped.

use std::collections::{BTreeMap, HashMap, VecDeque};

use dash_proto::{OrderEntry, OrderStatus, StationEntry};
use serde_json::Value;
use tracing::warn;

use crate::store::{key_suffix_id, Hash, OrderRow, StationRow, StreamEntry};

const TARGET: &str = "warehouse_relay::orders";

/// Parse a numeric store field. Non-finite results are treated as absent.
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Parse an `{item_id: quantity}` JSON object. Keys are numeric strings;
/// quantities may be numbers or numeric strings.
pub fn parse_item_map(raw: &str) -> Result<BTreeMap<u32, u32>, String> {
    let value: Value = serde_json::from_str(raw).map_err(|err| err.to_string())?;
    let Value::Object(map) = value else {
        return Err("items is not an object".to_string());
    };
    let mut items = BTreeMap::new();
    for (item, qty) in map {
        let item: u32 = item
            .trim()
            .parse()
            .map_err(|_| format!("item id `{item}` is not an index"))?;
        let qty = match &qty {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        }
        .and_then(|q| u32::try_from(q).ok())
        .ok_or_else(|| format!("quantity for item {item} is not a count"))?;
        items.insert(item, qty);
    }
    Ok(items)
}

/// Build an order entry from an `order:<id>` hash. `status` applies when the
/// hash carries no explicit status of its own.
pub fn order_from_hash(key: &str, hash: Option<&Hash>, status: OrderStatus) -> OrderEntry {
    let Some(hash) = hash else {
        return OrderEntry::malformed(key, "order record missing");
    };
    let items = match hash.get("items") {
        None => return OrderEntry::malformed(key, "order has no items"),
        Some(raw) => match parse_item_map(raw) {
            Ok(items) => items,
            Err(reason) => return OrderEntry::malformed(key, reason),
        },
    };
    let status = match hash.get("status") {
        Some(label) => match OrderStatus::parse_label(label) {
            Some(status) => status,
            None => return OrderEntry::malformed(key, format!("unknown status `{label}`")),
        },
        None => status,
    };
    let number = |field: &str| hash.get(field).and_then(|raw| parse_number(raw));
    OrderEntry {
        key: key.to_string(),
        order_id: hash
            .get("order_id")
            .and_then(|raw| raw.trim().parse().ok())
            .or_else(|| key_suffix_id(key).and_then(|id| u64::try_from(id).ok())),
        status,
        items,
        created: number("created"),
        assigned: number("assigned"),
        finished: number("finished"),
        station: hash.get("station").filter(|s| !s.is_empty()).cloned(),
        error: None,
    }
}

/// Entries on the finished-orders stream are the order hash plus `station`.
/// When no `finished` time was recorded the stream id's millisecond prefix is used.
pub fn order_from_finished_entry(entry: &StreamEntry) -> OrderEntry {
    let key = entry
        .fields
        .get("order_id")
        .map(|id| format!("order:{}", id.trim()))
        .unwrap_or_else(|| entry.id.clone());
    let mut order = order_from_hash(&key, Some(&entry.fields), OrderStatus::Complete);
    if order.finished.is_none() {
        order.finished = stream_id_seconds(&entry.id);
    }
    order
}

/// `1700000000123-0` -> 1700000000.123
pub fn stream_id_seconds(id: &str) -> Option<f64> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<u64>().ok())
        .map(|ms| ms as f64 / 1000.0)
}

/// Build a busy station view from its `station:<id>` hash.
pub fn station_from_hash(key: &str, hash: Option<&Hash>) -> StationEntry {
    let station_id = key_suffix_id(key).and_then(|id| u64::try_from(id).ok());
    let Some(hash) = hash else {
        return StationEntry {
            key: key.to_string(),
            station_id,
            order: Some(OrderEntry::malformed(key, "station record missing")),
            delivered: BTreeMap::new(),
            required: BTreeMap::new(),
        };
    };
    let items = |field: &str| hash.get(field).map(|raw| parse_item_map(raw));
    let mut error = None;
    let required = match items("items_in_order") {
        Some(Ok(items)) => items,
        Some(Err(reason)) => {
            error = Some(reason);
            BTreeMap::new()
        }
        None => BTreeMap::new(),
    };
    let delivered = match items("items_in_station") {
        Some(Ok(items)) => items.into_iter().filter(|(_, qty)| *qty > 0).collect(),
        Some(Err(reason)) => {
            error = Some(reason);
            BTreeMap::new()
        }
        None => BTreeMap::new(),
    };
    let order = hash
        .get("order")
        .map(|order_key| order_key.trim())
        .filter(|order_key| !order_key.is_empty())
        .map(|order_key| match &error {
            Some(reason) => OrderEntry::malformed(order_key, reason.clone()),
            None => OrderEntry {
                key: order_key.to_string(),
                order_id: key_suffix_id(order_key).and_then(|id| u64::try_from(id).ok()),
                status: OrderStatus::InProgress,
                items: required.clone(),
                created: None,
                assigned: None,
                finished: None,
                station: Some(key.to_string()),
                error: None,
            },
        });
    StationEntry {
        key: key.to_string(),
        station_id,
        order,
        delivered,
        required,
    }
}

pub fn order_from_row(row: &OrderRow) -> OrderEntry {
    let key = format!("order:{}", row.order_id);
    let status = match row.status.as_deref() {
        None => OrderStatus::Open,
        Some(label) => match OrderStatus::parse_label(label) {
            Some(status) => status,
            None => return OrderEntry::malformed(key, format!("unknown status `{label}`")),
        },
    };
    let Some(items) = row.items.clone() else {
        return OrderEntry {
            order_id: u64::try_from(row.order_id).ok(),
            created: row.created,
            ..OrderEntry::malformed(key, "order has no items")
        };
    };
    OrderEntry {
        key,
        order_id: u64::try_from(row.order_id).ok(),
        status,
        items,
        created: row.created,
        assigned: None,
        finished: row.finished,
        station: None,
        error: None,
    }
}

pub fn station_from_row(row: &StationRow) -> StationEntry {
    let key = format!("station:{}", row.station_id);
    let order = row.order_id.map(|order_id| OrderEntry {
        key: format!("order:{order_id}"),
        order_id: u64::try_from(order_id).ok(),
        status: OrderStatus::InProgress,
        items: row.required.clone(),
        created: row.order_created,
        assigned: None,
        finished: None,
        station: Some(key.clone()),
        error: None,
    });
    StationEntry {
        key,
        station_id: u64::try_from(row.station_id).ok(),
        order,
        delivered: row.delivered.clone(),
        required: row.required.clone(),
    }
}

/// Remembers the furthest status seen per order so a stale snapshot can never
/// move an order back out of `COMPLETE` or `ERROR`.
#[derive(Debug)]
pub struct OrderLedger {
    capacity: usize,
    statuses: HashMap<String, OrderStatus>,
    insertion: VecDeque<String>,
    regressions: u64,
}

impl OrderLedger {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            statuses: HashMap::new(),
            insertion: VecDeque::new(),
            regressions: 0,
        }
    }

    /// Record `entry`'s status, or overwrite it with the remembered one when
    /// the move is not allowed.
    pub fn reconcile(&mut self, entry: &mut OrderEntry) {
        match self.statuses.get_mut(&entry.key) {
            Some(known) if known.can_transition_to(entry.status) => *known = entry.status,
            Some(known) => {
                self.regressions += 1;
                warn!(
                    target: TARGET,
                    order = %entry.key,
                    seen = %entry.status,
                    kept = %known,
                    "order.status_regressed"
                );
                entry.status = *known;
            }
            None => {
                if self.insertion.len() == self.capacity {
                    if let Some(evicted) = self.insertion.pop_front() {
                        self.statuses.remove(&evicted);
                    }
                }
                self.insertion.push_back(entry.key.clone());
                self.statuses.insert(entry.key.clone(), entry.status);
            }
        }
    }

    pub fn status_of(&self, key: &str) -> Option<OrderStatus> {
        self.statuses.get(key).copied()
    }

    pub fn regressions(&self) -> u64 {
        self.regressions
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }
}
