//! Snapshot store adapter over the simulator's sqlite database.
//!
//! The database is opened read-only and lazily; an open failure is retried no
//! more often than the configured interval. [`CachedSnapshotStore`] bounds the
//! query rate with one cache slot per accessor.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde_json::Value;
use tracing::{info, warn};

use super::{OrderFilter, OrderRow, RawRobotRow, SnapshotSource, StationRow, StoreError};
use crate::cache::{CacheSlot, Clock, SystemClock};

const TARGET: &str = "warehouse_relay::store";

pub struct SqliteSnapshotStore {
    path: PathBuf,
    conn: Option<Connection>,
    retry: Duration,
    last_attempt: Option<Instant>,
}

impl SqliteSnapshotStore {
    pub fn new(path: impl Into<PathBuf>, retry: Duration) -> Self {
        Self {
            path: path.into(),
            conn: None,
            retry,
            last_attempt: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn conn(&mut self) -> Result<&Connection, StoreError> {
        if self.conn.is_none() {
            if let Some(last) = self.last_attempt {
                if last.elapsed() < self.retry {
                    return Err(StoreError::Unavailable(format!(
                        "{} not open yet",
                        self.path.display()
                    )));
                }
            }
            self.last_attempt = Some(Instant::now());
            let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
            match Connection::open_with_flags(&self.path, flags) {
                Ok(conn) => {
                    conn.busy_timeout(Duration::from_millis(250))?;
                    info!(target: TARGET, path = %self.path.display(), "snapshot.opened");
                    self.conn = Some(conn);
                }
                Err(err) => {
                    warn!(
                        target: TARGET,
                        path = %self.path.display(),
                        error = %err,
                        "snapshot.open_failed"
                    );
                    return Err(StoreError::Unavailable(err.to_string()));
                }
            }
        }
        self.conn
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("snapshot connection missing".to_string()))
    }
}

impl SnapshotSource for SqliteSnapshotStore {
    fn query_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached("SELECT * FROM \"Robot\"")?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let mut rows = stmt.query([])?;
        let mut robots = Vec::new();
        while let Some(row) = rows.next()? {
            let mut record = serde_json::Map::new();
            for (idx, name) in columns.iter().enumerate() {
                let value: SqlValue = row.get(idx)?;
                record.insert(name.clone(), sql_to_json(value));
            }
            robots.push(robot_from_record(&record));
        }
        Ok(robots)
    }

    fn query_order_counts(&mut self) -> Result<BTreeMap<String, u64>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare_cached(
            "SELECT COALESCE(status, 'UNKNOWN'), COUNT(*) FROM \"Order\" GROUP BY status",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut by_status = BTreeMap::new();
        for (status, count) in counts {
            *by_status.entry(status).or_insert(0) += count.max(0) as u64;
        }
        Ok(by_status)
    }

    fn query_stations_and_orders(&mut self) -> Result<Vec<StationRow>, StoreError> {
        let conn = self.conn()?;
        let mut stations: Vec<StationRow> = conn
            .prepare_cached(
                "SELECT s.station_id, s.order_id, o.created
                 FROM \"Station\" s LEFT JOIN \"Order\" o ON o.order_id = s.order_id
                 ORDER BY s.station_id",
            )?
            .query_map([], |row| {
                Ok(StationRow {
                    station_id: row.get(0)?,
                    order_id: row.get(1)?,
                    order_created: sql_to_f64(row.get(2)?),
                    delivered: BTreeMap::new(),
                    required: BTreeMap::new(),
                })
            })?
            .collect::<Result<_, _>>()?;

        let required = item_rows(
            conn,
            "SELECT s.station_id, oi.item_id, SUM(oi.quantity)
             FROM \"Station\" s JOIN \"OrderItem\" oi ON oi.order_id = s.order_id
             GROUP BY s.station_id, oi.item_id",
        )?;
        // Task.quantity is what is still outstanding for that item.
        let remaining = item_rows(
            conn,
            "SELECT t.station_id, t.item_id, SUM(t.quantity)
             FROM \"Task\" t JOIN \"Station\" s
               ON s.station_id = t.station_id AND s.order_id = t.order_id
             WHERE t.status IN ('OPEN', 'IN_PROGRESS')
             GROUP BY t.station_id, t.item_id",
        )?;

        for station in &mut stations {
            if let Some(items) = required.get(&station.station_id) {
                station.required = items.clone();
            }
            let outstanding = remaining.get(&station.station_id);
            station.delivered = station
                .required
                .iter()
                .map(|(item, qty)| {
                    let left = outstanding
                        .and_then(|items| items.get(item))
                        .copied()
                        .unwrap_or(0);
                    (*item, qty.saturating_sub(left))
                })
                .filter(|(_, qty)| *qty > 0)
                .collect();
        }
        Ok(stations)
    }

    fn query_orders(
        &mut self,
        filter: OrderFilter,
        limit: usize,
    ) -> Result<Vec<OrderRow>, StoreError> {
        let conn = self.conn()?;
        let sql = match filter {
            OrderFilter::New => {
                "SELECT order_id, status, created, finished, description FROM \"Order\"
                 WHERE status IS NULL OR status = 'OPEN'
                 ORDER BY created ASC LIMIT ?1"
            }
            OrderFilter::Finished => {
                "SELECT order_id, status, created, finished, description FROM \"Order\"
                 WHERE status IN ('COMPLETE', 'ERROR')
                 ORDER BY finished DESC, created DESC LIMIT ?1"
            }
        };
        let mut orders: Vec<OrderRow> = conn
            .prepare_cached(sql)?
            .query_map(params![limit as i64], |row| {
                Ok(OrderRow {
                    order_id: row.get(0)?,
                    status: row.get(1)?,
                    created: sql_to_f64(row.get(2)?),
                    finished: sql_to_f64(row.get(3)?),
                    description: row.get(4)?,
                    items: None,
                })
            })?
            .collect::<Result<_, _>>()?;

        let mut items_stmt = conn.prepare_cached(
            "SELECT item_id, quantity FROM \"OrderItem\" WHERE order_id = ?1",
        )?;
        for order in &mut orders {
            let mut items = BTreeMap::new();
            let mut rows = items_stmt.query(params![order.order_id])?;
            while let Some(row) = rows.next()? {
                let item: i64 = row.get(0)?;
                let qty: i64 = row.get(1)?;
                if let (Ok(item), Ok(qty)) = (u32::try_from(item), u32::try_from(qty)) {
                    *items.entry(item).or_insert(0) += qty;
                }
            }
            order.items = (!items.is_empty()).then_some(items);
        }
        Ok(orders)
    }

    fn query_state_value(&mut self, label: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        let value: Option<SqlValue> = conn
            .prepare_cached("SELECT value FROM \"State\" WHERE label = ?1 LIMIT 1")?
            .query_row(params![label], |row| row.get(0))
            .optional()?;
        Ok(value.and_then(|value| match value {
            SqlValue::Null | SqlValue::Blob(_) => None,
            SqlValue::Integer(v) => Some(v.to_string()),
            SqlValue::Real(v) => Some(v.to_string()),
            SqlValue::Text(text) => Some(text),
        }))
    }
}

fn item_rows(conn: &Connection, sql: &str) -> Result<BTreeMap<i64, BTreeMap<u32, u32>>, StoreError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let mut rows = stmt.query([])?;
    let mut by_station: BTreeMap<i64, BTreeMap<u32, u32>> = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let station: i64 = row.get(0)?;
        let item: i64 = row.get(1)?;
        let qty: Option<i64> = row.get(2)?;
        if let (Ok(item), Ok(qty)) = (u32::try_from(item), u32::try_from(qty.unwrap_or(0))) {
            by_station.entry(station).or_default().insert(item, qty);
        }
    }
    Ok(by_station)
}

fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null | SqlValue::Blob(_) => Value::Null,
        SqlValue::Integer(v) => Value::from(v),
        SqlValue::Real(v) => serde_json::Number::from_f64(v).map_or(Value::Null, Value::Number),
        SqlValue::Text(text) => Value::String(text),
    }
}

/// Numeric column that may have been stored as text. NaN maps to `None`.
fn sql_to_f64(value: SqlValue) -> Option<f64> {
    let number = match value {
        SqlValue::Integer(v) => v as f64,
        SqlValue::Real(v) => v,
        SqlValue::Text(text) => text.trim().parse().ok()?,
        SqlValue::Null | SqlValue::Blob(_) => return None,
    };
    number.is_finite().then_some(number)
}

/// Column layouts differ between simulator versions: `position` as JSON text
/// or separate `x`/`y` columns, `robot_id` or `id`.
fn robot_from_record(record: &serde_json::Map<String, Value>) -> RawRobotRow {
    let position = match record.get("position").or_else(|| record.get("pos")) {
        Some(Value::String(text)) => {
            Some(serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.clone())))
        }
        Some(Value::Null) | None => match (record.get("x"), record.get("y")) {
            (Some(x), Some(y)) if !x.is_null() && !y.is_null() => {
                Some(Value::Array(vec![x.clone(), y.clone()]))
            }
            _ => None,
        },
        Some(other) => Some(other.clone()),
    };
    let mut row = RawRobotRow::from_json(&Value::Object(record.clone()));
    row.position = position;
    row
}

/// Per-accessor caching in front of a [`SnapshotSource`].
///
/// Each accessor owns an independent slot and timestamp. A call within the
/// TTL of the previous successful fetch returns the cached rows; accessors
/// taking a limit only hit when the limit matches.
pub struct CachedSnapshotStore<S, C = SystemClock> {
    source: S,
    clock: C,
    ttl: Duration,
    robots: CacheSlot<(), Vec<RawRobotRow>>,
    order_counts: CacheSlot<(), BTreeMap<String, u64>>,
    stations: CacheSlot<(), Vec<StationRow>>,
    new_orders: CacheSlot<usize, Vec<OrderRow>>,
    finished_orders: CacheSlot<usize, Vec<OrderRow>>,
    dt_sec: CacheSlot<(), Option<f64>>,
}

impl<S: SnapshotSource> CachedSnapshotStore<S, SystemClock> {
    pub fn new(source: S, ttl: Duration) -> Self {
        Self::with_clock(source, ttl, SystemClock)
    }
}

impl<S: SnapshotSource, C: Clock> CachedSnapshotStore<S, C> {
    pub fn with_clock(source: S, ttl: Duration, clock: C) -> Self {
        Self {
            source,
            clock,
            ttl,
            robots: CacheSlot::default(),
            order_counts: CacheSlot::default(),
            stations: CacheSlot::default(),
            new_orders: CacheSlot::default(),
            finished_orders: CacheSlot::default(),
            dt_sec: CacheSlot::default(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn get_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
        let now = self.clock.now();
        let source = &mut self.source;
        self.robots
            .get_or_fetch(now, self.ttl, (), || source.query_robots())
    }

    /// Reads robots straight from the source, bypassing the TTL slot. The
    /// tick loop needs every tick's positions, not the last cached ones.
    pub fn read_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
        self.source.query_robots()
    }

    pub fn get_order_counts(&mut self) -> Result<BTreeMap<String, u64>, StoreError> {
        let now = self.clock.now();
        let source = &mut self.source;
        self.order_counts
            .get_or_fetch(now, self.ttl, (), || source.query_order_counts())
    }

    pub fn get_stations_and_orders(&mut self) -> Result<Vec<StationRow>, StoreError> {
        let now = self.clock.now();
        let source = &mut self.source;
        self.stations
            .get_or_fetch(now, self.ttl, (), || source.query_stations_and_orders())
    }

    pub fn get_new_orders(&mut self, limit: usize) -> Result<Vec<OrderRow>, StoreError> {
        let now = self.clock.now();
        let source = &mut self.source;
        self.new_orders.get_or_fetch(now, self.ttl, limit, || {
            source.query_orders(OrderFilter::New, limit)
        })
    }

    pub fn get_finished_orders(&mut self, limit: usize) -> Result<Vec<OrderRow>, StoreError> {
        let now = self.clock.now();
        let source = &mut self.source;
        self.finished_orders.get_or_fetch(now, self.ttl, limit, || {
            source.query_orders(OrderFilter::Finished, limit)
        })
    }

    pub fn get_dt_sec(&mut self) -> Result<Option<f64>, StoreError> {
        let now = self.clock.now();
        let source = &mut self.source;
        self.dt_sec.get_or_fetch(now, self.ttl, (), || {
            Ok(source
                .query_state_value("dt_sec")?
                .and_then(|raw| raw.trim().parse::<f64>().ok())
                .filter(|dt| dt.is_finite() && *dt > 0.0))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingSource {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl SnapshotSource for CountingSource {
        fn query_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StoreError::Query("no such table: Robot".into()));
            }
            Ok(vec![RawRobotRow {
                id: Some(n as i64),
                ..RawRobotRow::default()
            }])
        }

        fn query_order_counts(&mut self) -> Result<BTreeMap<String, u64>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(BTreeMap::from([("OPEN".to_string(), 2)]))
        }

        fn query_stations_and_orders(&mut self) -> Result<Vec<StationRow>, StoreError> {
            Ok(Vec::new())
        }

        fn query_orders(
            &mut self,
            _filter: OrderFilter,
            limit: usize,
        ) -> Result<Vec<OrderRow>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..limit as i64)
                .map(|order_id| OrderRow {
                    order_id,
                    status: Some("OPEN".into()),
                    created: None,
                    finished: None,
                    description: None,
                    items: None,
                })
                .collect())
        }

        fn query_state_value(&mut self, _label: &str) -> Result<Option<String>, StoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some("0.25".into()))
        }
    }

    #[test]
    fn accessor_calls_inside_ttl_issue_one_query() {
        let clock = ManualClock::new();
        let source = CountingSource::default();
        let calls = source.calls.clone();
        let mut store = CachedSnapshotStore::with_clock(source, Duration::from_millis(1500), clock.clone());

        let first = store.get_robots().unwrap();
        clock.advance(Duration::from_millis(1499));
        let second = store.get_robots().unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_millis(1));
        let third = store.get_robots().unwrap();
        assert_ne!(first, third);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn direct_robot_reads_skip_the_cache() {
        let clock = ManualClock::new();
        let source = CountingSource::default();
        let calls = source.calls.clone();
        let mut store = CachedSnapshotStore::with_clock(source, Duration::from_secs(1), clock);

        store.get_robots().unwrap();
        let fresh = store.read_robots().unwrap();
        assert_eq!(fresh[0].id, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        // The cached slot is left alone.
        assert_eq!(store.get_robots().unwrap()[0].id, Some(0));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn accessors_keep_independent_timestamps() {
        let clock = ManualClock::new();
        let source = CountingSource::default();
        let calls = source.calls.clone();
        let mut store = CachedSnapshotStore::with_clock(source, Duration::from_secs(1), clock.clone());

        store.get_robots().unwrap();
        clock.advance(Duration::from_millis(600));
        store.get_order_counts().unwrap();
        clock.advance(Duration::from_millis(600));
        // robots expired, counts still fresh
        store.get_robots().unwrap();
        store.get_order_counts().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn different_limits_do_not_share_an_entry() {
        let clock = ManualClock::new();
        let mut store =
            CachedSnapshotStore::with_clock(CountingSource::default(), Duration::from_secs(5), clock);
        assert_eq!(store.get_new_orders(5).unwrap().len(), 5);
        assert_eq!(store.get_new_orders(2).unwrap().len(), 2);
        assert_eq!(store.get_finished_orders(2).unwrap().len(), 2);
    }

    #[test]
    fn query_errors_propagate() {
        let clock = ManualClock::new();
        let source = CountingSource {
            fail: true,
            ..CountingSource::default()
        };
        let mut store = CachedSnapshotStore::with_clock(source, Duration::from_secs(1), clock);
        assert!(matches!(store.get_robots(), Err(StoreError::Query(_))));
    }

    #[test]
    fn dt_is_parsed_from_state_rows() {
        let mut store = CachedSnapshotStore::with_clock(
            CountingSource::default(),
            Duration::from_secs(1),
            ManualClock::new(),
        );
        assert_eq!(store.get_dt_sec().unwrap(), Some(0.25));
    }

    #[test]
    fn robot_records_support_both_position_layouts() {
        let record = json!({"robot_id": 3, "position": "[4, 5]", "path": "[]", "state": "AVAILABLE"});
        let row = robot_from_record(record.as_object().unwrap());
        assert_eq!(row.id, Some(3));
        assert_eq!(row.position, Some(json!([4, 5])));

        let record = json!({"id": 1, "x": 2, "y": 6});
        let row = robot_from_record(record.as_object().unwrap());
        assert_eq!(row.position, Some(json!([2, 6])));
    }

    #[test]
    fn nan_and_text_numbers_are_normalised() {
        assert_eq!(sql_to_f64(SqlValue::Real(f64::NAN)), None);
        assert_eq!(sql_to_f64(SqlValue::Text(" 12 ".into())), Some(12.0));
        assert_eq!(sql_to_f64(SqlValue::Text("soon".into())), None);
        assert_eq!(sql_to_f64(SqlValue::Integer(7)), Some(7.0));
    }
}
