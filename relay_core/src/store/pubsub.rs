//! Pub/sub store adapter backed by redis.
//!
//! Ticks are read on a dedicated connection that blocks without a timeout.
//! Every multi-key read goes out as one pipeline on a second connection.

use std::collections::HashMap;
use std::time::Duration;

use redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use redis::{Commands, FromRedisValue};
use serde_json::Value;
use tracing::{debug, trace};

use super::{
    Hash, OrderOverview, OverviewLimits, PubSubSource, RawRobotRow, RedisLink, StoreCounts,
    StoreError, StreamEntry, TickNotice,
};

const TARGET: &str = "warehouse_relay::store";

pub const TICK_STREAM_KEY: &str = "world:state";
pub const TICK_CHANNEL: &str = "WORLD_T";
pub const ROBOT_KEYS: &str = "robots:all";
pub const NEW_ORDERS: &str = "orders:new";
pub const FINISHED_ORDERS: &str = "orders:finished";
pub const FREE_STATIONS: &str = "stations:free";
pub const BUSY_STATIONS: &str = "stations:busy";
pub const ORDER_COUNT: &str = "order:count";
pub const ORDER_ID_COUNTER: &str = "order:id";
pub const STATION_COUNT: &str = "station:count";
pub const STATES: &str = "states";

/// How tick notifications reach the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickTransport {
    /// Stream entries carrying `t` and a `robots` JSON array.
    Stream { key: String },
    /// Channel messages carrying the tick number only.
    Channel { channel: String },
}

impl TickTransport {
    pub fn stream() -> Self {
        TickTransport::Stream {
            key: TICK_STREAM_KEY.to_string(),
        }
    }

    pub fn channel() -> Self {
        TickTransport::Channel {
            channel: TICK_CHANNEL.to_string(),
        }
    }
}

pub struct RedisPubSub {
    url: String,
    retry: Duration,
    transport: TickTransport,
    queries: RedisLink,
    ticks: Option<RedisLink>,
    last_stream_id: String,
}

impl RedisPubSub {
    pub fn new(url: &str, transport: TickTransport, retry: Duration) -> Result<Self, StoreError> {
        Ok(Self {
            url: url.to_string(),
            retry,
            transport,
            queries: RedisLink::open("queries", url, retry)?,
            ticks: None,
            // `$` = only entries published after the first read.
            last_stream_id: "$".to_string(),
        })
    }

    fn tick_link(&mut self) -> Result<&mut RedisLink, StoreError> {
        if self.ticks.is_none() {
            let mut link = RedisLink::open("ticks", &self.url, self.retry)?;
            if let TickTransport::Channel { channel } = &self.transport {
                let channel = channel.clone();
                link.set_on_connect(move |conn| {
                    conn.send_packed_command(
                        &redis::cmd("SUBSCRIBE").arg(&channel).get_packed_command(),
                    )?;
                    conn.recv_response()?;
                    Ok(())
                });
            }
            self.ticks = Some(link);
        }
        self.ticks
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("tick link missing".to_string()))
    }

    fn read_stream_tick(&mut self, key: &str) -> Result<TickNotice, StoreError> {
        let last_id = self.last_stream_id.clone();
        let link = self.tick_link()?;
        link.wait_ready();
        let options = StreamReadOptions::default().block(0).count(1);
        let reply: StreamReadReply =
            link.with_connection(|conn| conn.xread_options(&[key], &[last_id.as_str()], &options))?;
        let entry = reply
            .keys
            .into_iter()
            .flat_map(|stream| stream.ids)
            .last()
            .ok_or_else(|| StoreError::Malformed {
                key: key.to_string(),
                reason: "empty blocking read".to_string(),
            })?;
        self.last_stream_id = entry.id.clone();
        trace!(target: TARGET, id = %entry.id, "store.stream_entry");
        tick_from_fields(&entry.id, &stream_fields(&entry))
    }

    fn read_channel_tick(&mut self) -> Result<TickNotice, StoreError> {
        let link = self.tick_link()?;
        loop {
            link.wait_ready();
            let value = link.with_connection(|conn| conn.recv_response())?;
            // Subscription confirmations carry no tick.
            let Some(msg) = redis::Msg::from_value(&value) else {
                continue;
            };
            let payload: String = msg.get_payload()?;
            return parse_channel_payload(msg.get_channel_name(), &payload);
        }
    }
}

impl PubSubSource for RedisPubSub {
    fn read_tick_blocking(&mut self) -> Result<TickNotice, StoreError> {
        match self.transport.clone() {
            TickTransport::Stream { key } => self.read_stream_tick(&key),
            TickTransport::Channel { .. } => self.read_channel_tick(),
        }
    }

    fn get_robot_keys(&mut self) -> Result<Vec<String>, StoreError> {
        self.queries
            .with_connection(|conn| conn.lrange(ROBOT_KEYS, 0, -1))
    }

    fn batch_get(&mut self, keys: &[String]) -> Result<Vec<Option<Hash>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.hgetall(key);
        }
        let hashes: Vec<Hash> = self.queries.with_connection(|conn| pipe.query(conn))?;
        debug!(target: TARGET, keys = keys.len(), "store.batch_get");
        Ok(hashes
            .into_iter()
            .map(|hash| if hash.is_empty() { None } else { Some(hash) })
            .collect())
    }

    fn get_new_order_keys(&mut self, limit: usize) -> Result<Vec<String>, StoreError> {
        let stop = range_stop(limit);
        self.queries
            .with_connection(|conn| conn.lrange(NEW_ORDERS, 0, stop))
    }

    fn get_recent_finished_orders(&mut self, limit: usize) -> Result<Vec<StreamEntry>, StoreError> {
        let reply: StreamRangeReply = self.queries.with_connection(|conn| {
            conn.xrevrange_count(FINISHED_ORDERS, "+", "-", limit.max(1))
        })?;
        Ok(reply.ids.iter().map(to_stream_entry).collect())
    }

    fn get_free_station_keys(&mut self, limit: usize) -> Result<Vec<String>, StoreError> {
        let stop = range_stop(limit);
        self.queries
            .with_connection(|conn| conn.lrange(FREE_STATIONS, 0, stop))
    }

    fn get_busy_station_sample(&mut self, limit: usize) -> Result<Vec<String>, StoreError> {
        self.queries
            .with_connection(|conn| conn.srandmember_multiple(BUSY_STATIONS, limit.max(1)))
    }

    fn get_counts(&mut self) -> Result<StoreCounts, StoreError> {
        let (new, order_count, order_id, stations): (
            u64,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = self.queries.with_connection(|conn| {
            redis::pipe()
                .llen(NEW_ORDERS)
                .get(ORDER_COUNT)
                .get(ORDER_ID_COUNTER)
                .get(STATION_COUNT)
                .query(conn)
        })?;
        Ok(counts_from_raw(new, order_count, order_id, stations))
    }

    fn get_dt_sec(&mut self) -> Result<Option<f64>, StoreError> {
        let raw: Option<String> = self
            .queries
            .with_connection(|conn| conn.hget(STATES, "dt_sec"))?;
        Ok(raw.and_then(|value| value.trim().parse::<f64>().ok()))
    }

    fn fetch_overview(&mut self, limits: &OverviewLimits) -> Result<OrderOverview, StoreError> {
        #[allow(clippy::type_complexity)]
        let (
            new_order_keys,
            finished,
            free_station_keys,
            busy_station_keys,
            new,
            order_count,
            order_id,
            stations,
        ): (
            Vec<String>,
            StreamRangeReply,
            Vec<String>,
            Vec<String>,
            u64,
            Option<String>,
            Option<String>,
            Option<String>,
        ) = self.queries.with_connection(|conn| {
            redis::pipe()
                .lrange(NEW_ORDERS, 0, range_stop(limits.new_orders))
                .xrevrange_count(FINISHED_ORDERS, "+", "-", limits.finished_orders.max(1))
                .lrange(FREE_STATIONS, 0, range_stop(limits.free_stations))
                .srandmember_multiple(BUSY_STATIONS, limits.busy_stations.max(1))
                .llen(NEW_ORDERS)
                .get(ORDER_COUNT)
                .get(ORDER_ID_COUNTER)
                .get(STATION_COUNT)
                .query(conn)
        })?;
        Ok(OrderOverview {
            new_order_keys,
            finished: finished.ids.iter().map(to_stream_entry).collect(),
            free_station_keys,
            busy_station_keys,
            counts: counts_from_raw(new, order_count, order_id, stations),
        })
    }
}

fn range_stop(limit: usize) -> isize {
    limit.max(1) as isize - 1
}

fn counts_from_raw(
    new: u64,
    order_count: Option<String>,
    order_id: Option<String>,
    stations: Option<String>,
) -> StoreCounts {
    let parse = |raw: Option<String>| raw.and_then(|value| value.trim().parse::<u64>().ok());
    StoreCounts {
        new,
        // `order:id` is the allocation counter, used when no explicit total exists.
        total: parse(order_count).or_else(|| parse(order_id)).unwrap_or(0),
        stations: parse(stations).unwrap_or(0),
    }
}

fn stream_fields(entry: &StreamId) -> Hash {
    entry
        .map
        .iter()
        .filter_map(|(field, value)| {
            String::from_redis_value(value)
                .ok()
                .map(|text| (field.clone(), text))
        })
        .collect()
}

fn to_stream_entry(entry: &StreamId) -> StreamEntry {
    StreamEntry {
        id: entry.id.clone(),
        fields: stream_fields(entry),
    }
}

/// Decode one `world:state` entry.
pub fn tick_from_fields(id: &str, fields: &HashMap<String, String>) -> Result<TickNotice, StoreError> {
    let t = fields
        .get("t")
        .and_then(|raw| parse_tick(raw))
        .ok_or_else(|| StoreError::Malformed {
            key: format!("{TICK_STREAM_KEY}/{id}"),
            reason: "missing or non-integer `t`".to_string(),
        })?;
    let robots = fields
        .get("robots")
        .map(|raw| RawRobotRow::parse_array(raw))
        .transpose()?;
    Ok(TickNotice { t, robots })
}

/// A channel message is either a bare tick number or `{"t": .., "robots": [..]}`.
pub fn parse_channel_payload(channel: &str, payload: &str) -> Result<TickNotice, StoreError> {
    if let Some(t) = parse_tick(payload) {
        return Ok(TickNotice { t, robots: None });
    }
    let malformed = |reason: &str| StoreError::Malformed {
        key: channel.to_string(),
        reason: reason.to_string(),
    };
    let value: Value =
        serde_json::from_str(payload).map_err(|_| malformed("payload is not a tick"))?;
    let t = value
        .get("t")
        .and_then(|t| t.as_i64().or_else(|| t.as_str().and_then(parse_tick)))
        .ok_or_else(|| malformed("missing `t`"))?;
    let robots = value
        .get("robots")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().map(RawRobotRow::from_json).collect());
    Ok(TickNotice { t, robots })
}

/// Accepts `12` and `12.0`; rejects fractional or non-finite values.
fn parse_tick(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>().ok().or_else(|| {
        raw.parse::<f64>()
            .ok()
            .filter(|v| v.is_finite() && v.fract() == 0.0)
            .map(|v| v as i64)
    })
}
