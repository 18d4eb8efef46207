//! Rate-limited order/station aggregation for the `ims_all_orders` event.

use std::collections::BTreeMap;
use std::time::Duration;

use dash_proto::{ImsAllOrders, OrderStatus};
use tracing::{debug, warn};

use crate::cache::{CacheSlot, Clock, SystemClock};
use crate::orders::{
    order_from_finished_entry, order_from_hash, order_from_row, station_from_hash,
    station_from_row, OrderLedger,
};
use crate::store::{
    CachedSnapshotStore, OverviewLimits, PubSubSource, SnapshotSource, StoreError,
};

const TARGET: &str = "warehouse_relay::orders";
const LEDGER_CAPACITY: usize = 4096;
/// Share of the poll interval shaved off the rate window, so a ticker that
/// fires a little early still finds the cached payload expired.
const GATE_SLACK_DIVISOR: u32 = 10;

/// Where order and station aggregates are read from.
pub enum OrderFeed {
    PubSub(Box<dyn PubSubSource>),
    Snapshot(CachedSnapshotStore<Box<dyn SnapshotSource>>),
}

pub struct OrderAggregator<C = SystemClock> {
    feed: OrderFeed,
    clock: C,
    gate_ttl: Duration,
    limit: usize,
    gate: CacheSlot<(), ImsAllOrders>,
    ledger: OrderLedger,
}

impl OrderAggregator<SystemClock> {
    pub fn new(feed: OrderFeed, interval: Duration, limit: usize) -> Self {
        Self::with_clock(feed, interval, limit, SystemClock)
    }
}

impl<C: Clock> OrderAggregator<C> {
    pub fn with_clock(feed: OrderFeed, interval: Duration, limit: usize, clock: C) -> Self {
        Self {
            feed,
            clock,
            gate_ttl: interval.saturating_sub(interval / GATE_SLACK_DIVISOR),
            limit: limit.max(1),
            gate: CacheSlot::default(),
            ledger: OrderLedger::with_capacity(LEDGER_CAPACITY),
        }
    }

    /// Payload to broadcast this cycle.
    ///
    /// `None` when nobody is connected or the stores could not be read;
    /// within the rate window the previous payload is returned unchanged.
    pub fn poll(&mut self, client_count: usize) -> Option<ImsAllOrders> {
        if client_count == 0 {
            debug!(target: TARGET, "orders.skipped_no_clients");
            return None;
        }
        let now = self.clock.now();
        let Self {
            feed,
            limit,
            gate,
            ledger,
            gate_ttl,
            ..
        } = self;
        let limit = *limit;
        let result = gate.get_or_fetch(now, *gate_ttl, (), || match feed {
            OrderFeed::PubSub(source) => collect_from_pubsub(&mut **source, limit, ledger),
            OrderFeed::Snapshot(store) => collect_from_snapshot(store, limit, ledger),
        });
        match result {
            Ok(payload) => Some(payload),
            Err(err) => {
                warn!(target: TARGET, error = %err, "orders.aggregate_failed");
                None
            }
        }
    }

    pub fn ledger(&self) -> &OrderLedger {
        &self.ledger
    }
}

/// Two round-trips: the overview pipeline, then every order and busy
/// station hash it referenced.
fn collect_from_pubsub(
    source: &mut dyn PubSubSource,
    limit: usize,
    ledger: &mut OrderLedger,
) -> Result<ImsAllOrders, StoreError> {
    let overview = source.fetch_overview(&OverviewLimits::uniform(limit))?;

    let mut keys = overview.new_order_keys.clone();
    keys.extend(overview.busy_station_keys.iter().cloned());
    let hashes = source.batch_get(&keys)?;
    if hashes.len() != keys.len() {
        return Err(StoreError::Malformed {
            key: "batch".to_string(),
            reason: format!("{} replies for {} keys", hashes.len(), keys.len()),
        });
    }
    let (order_hashes, station_hashes) = hashes.split_at(overview.new_order_keys.len());

    let mut new_orders: Vec<_> = overview
        .new_order_keys
        .iter()
        .zip(order_hashes)
        .map(|(key, hash)| order_from_hash(key, hash.as_ref(), OrderStatus::Open))
        .collect();
    let mut finished_orders: Vec<_> = overview
        .finished
        .iter()
        .map(order_from_finished_entry)
        .collect();
    let mut busy_stations: Vec<_> = overview
        .busy_station_keys
        .iter()
        .zip(station_hashes)
        .map(|(key, hash)| station_from_hash(key, hash.as_ref()))
        .collect();

    for order in new_orders.iter_mut().chain(finished_orders.iter_mut()) {
        ledger.reconcile(order);
    }
    for station in &mut busy_stations {
        if let Some(order) = station.order.as_mut() {
            ledger.reconcile(order);
        }
    }

    let counts = overview.counts;
    debug!(
        target: TARGET,
        new = counts.new,
        total = counts.total,
        stations = counts.stations,
        "orders.collected"
    );
    Ok(ImsAllOrders {
        new_orders,
        finished_orders,
        free_station_keys: overview.free_station_keys,
        busy_stations,
        station_count: counts.stations,
        new_order_count: counts.new,
        finished_order_count: counts.total.saturating_sub(counts.new),
    })
}

fn collect_from_snapshot(
    store: &mut CachedSnapshotStore<Box<dyn SnapshotSource>>,
    limit: usize,
    ledger: &mut OrderLedger,
) -> Result<ImsAllOrders, StoreError> {
    let counts = store.get_order_counts()?;
    let stations = store.get_stations_and_orders()?;
    let mut new_orders: Vec<_> = store
        .get_new_orders(limit)?
        .iter()
        .map(order_from_row)
        .collect();
    let mut finished_orders: Vec<_> = store
        .get_finished_orders(limit)?
        .iter()
        .map(order_from_row)
        .collect();

    let free_station_keys = stations
        .iter()
        .filter(|row| row.order_id.is_none())
        .take(limit)
        .map(|row| format!("station:{}", row.station_id))
        .collect();
    let mut busy_stations: Vec<_> = stations
        .iter()
        .filter(|row| row.order_id.is_some())
        .take(limit)
        .map(station_from_row)
        .collect();

    for order in new_orders.iter_mut().chain(finished_orders.iter_mut()) {
        ledger.reconcile(order);
    }
    for station in &mut busy_stations {
        if let Some(order) = station.order.as_mut() {
            ledger.reconcile(order);
        }
    }

    let (new, total) = snapshot_totals(&counts);
    Ok(ImsAllOrders {
        new_orders,
        finished_orders,
        free_station_keys,
        busy_stations,
        station_count: stations.len() as u64,
        new_order_count: new,
        finished_order_count: total.saturating_sub(new),
    })
}

/// Unassigned orders are `OPEN` or carry no status at all.
fn snapshot_totals(counts: &BTreeMap<String, u64>) -> (u64, u64) {
    let new: u64 = counts
        .iter()
        .filter(|(status, _)| status.as_str() == "OPEN" || status.as_str() == "UNKNOWN")
        .map(|(_, count)| *count)
        .sum();
    let total: u64 = counts.values().sum();
    (new, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ManualClock;
    use crate::store::{
        Hash, OrderFilter, OrderRow, RawRobotRow, StationRow, StoreCounts, StreamEntry,
        TickNotice,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn hash(pairs: &[(&str, &str)]) -> Hash {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[derive(Clone, Default)]
    struct FakeOrders {
        round_trips: Arc<AtomicUsize>,
        finished_status: Option<&'static str>,
    }

    impl PubSubSource for FakeOrders {
        fn read_tick_blocking(&mut self) -> Result<TickNotice, StoreError> {
            Err(StoreError::Unavailable("no ticks here".into()))
        }

        fn get_robot_keys(&mut self) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        fn batch_get(&mut self, keys: &[String]) -> Result<Vec<Option<Hash>>, StoreError> {
            self.round_trips.fetch_add(1, Ordering::SeqCst);
            Ok(keys
                .iter()
                .map(|key| match key.as_str() {
                    "order:3" => Some(hash(&[
                        ("order_id", "3"),
                        ("created", "100.5"),
                        ("items", r#"{"0": 2}"#),
                    ])),
                    "station:1" => Some(hash(&[
                        ("order", "order:2"),
                        ("items_in_station", r#"{"1": 1}"#),
                        ("items_in_order", r#"{"1": 1, "0": 1}"#),
                    ])),
                    _ => None,
                })
                .collect())
        }

        fn get_new_order_keys(&mut self, _limit: usize) -> Result<Vec<String>, StoreError> {
            Ok(vec!["order:3".into(), "order:4".into()])
        }

        fn get_recent_finished_orders(
            &mut self,
            _limit: usize,
        ) -> Result<Vec<StreamEntry>, StoreError> {
            let mut fields = hash(&[("order_id", "1"), ("items", r#"{"0": 1}"#)]);
            if let Some(status) = self.finished_status {
                fields.insert("status".into(), status.into());
            }
            Ok(vec![StreamEntry {
                id: "5000-0".into(),
                fields,
            }])
        }

        fn get_free_station_keys(&mut self, _limit: usize) -> Result<Vec<String>, StoreError> {
            Ok(vec!["station:0".into()])
        }

        fn get_busy_station_sample(&mut self, _limit: usize) -> Result<Vec<String>, StoreError> {
            Ok(vec!["station:1".into()])
        }

        fn get_counts(&mut self) -> Result<StoreCounts, StoreError> {
            self.round_trips.fetch_add(1, Ordering::SeqCst);
            Ok(StoreCounts {
                new: 2,
                total: 4,
                stations: 2,
            })
        }

        fn get_dt_sec(&mut self) -> Result<Option<f64>, StoreError> {
            Ok(None)
        }
    }

    fn aggregator(source: FakeOrders, clock: ManualClock) -> OrderAggregator<ManualClock> {
        OrderAggregator::with_clock(
            OrderFeed::PubSub(Box::new(source)),
            Duration::from_millis(1000),
            10,
            clock,
        )
    }

    #[test]
    fn zero_clients_skips_the_cycle() {
        let source = FakeOrders::default();
        let trips = source.round_trips.clone();
        let mut agg = aggregator(source, ManualClock::new());
        assert!(agg.poll(0).is_none());
        assert_eq!(trips.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pubsub_payload_is_reshaped() {
        let mut agg = aggregator(FakeOrders::default(), ManualClock::new());
        let payload = agg.poll(1).unwrap();

        assert_eq!(payload.new_order_count, 2);
        assert_eq!(payload.finished_order_count, 2);
        assert_eq!(payload.station_count, 2);
        assert_eq!(payload.free_station_keys, vec!["station:0".to_string()]);

        assert_eq!(payload.new_orders[0].created, Some(100.5));
        assert_eq!(payload.new_orders[0].items, BTreeMap::from([(0, 2)]));
        // order:4 vanished between the two round-trips
        assert_eq!(payload.new_orders[1].status, OrderStatus::Error);

        assert_eq!(payload.finished_orders[0].finished, Some(5.0));
        let station = &payload.busy_stations[0];
        assert_eq!(station.delivered, BTreeMap::from([(1, 1)]));
        assert_eq!(station.order.as_ref().unwrap().key, "order:2");
    }

    #[test]
    fn rate_window_reuses_the_cached_payload() {
        let clock = ManualClock::new();
        let source = FakeOrders::default();
        let trips = source.round_trips.clone();
        let mut agg = aggregator(source, clock.clone());

        let first = agg.poll(3).unwrap();
        clock.advance(Duration::from_millis(400));
        let second = agg.poll(3).unwrap();
        assert_eq!(first, second);
        // default overview issues get_counts once plus one batch
        assert_eq!(trips.load(Ordering::SeqCst), 2);

        clock.advance(Duration::from_millis(600));
        agg.poll(3).unwrap();
        assert_eq!(trips.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn early_ticker_still_refreshes() {
        let clock = ManualClock::new();
        let source = FakeOrders::default();
        let trips = source.round_trips.clone();
        let mut agg = aggregator(source, clock.clone());

        agg.poll(1).unwrap();
        assert_eq!(trips.load(Ordering::SeqCst), 2);
        // Ticker jitter: the next cycle lands 50ms before a full interval.
        clock.advance(Duration::from_millis(950));
        agg.poll(1).unwrap();
        assert_eq!(trips.load(Ordering::SeqCst), 4);

        clock.advance(Duration::from_millis(850));
        agg.poll(1).unwrap();
        assert_eq!(trips.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn ledger_pins_terminal_orders() {
        let clock = ManualClock::new();
        let mut agg = aggregator(FakeOrders::default(), clock.clone());
        agg.poll(1).unwrap();
        assert_eq!(agg.ledger().status_of("order:1"), Some(OrderStatus::Complete));

        let stale = FakeOrders {
            finished_status: Some("OPEN"),
            ..FakeOrders::default()
        };
        agg.feed = OrderFeed::PubSub(Box::new(stale));
        clock.advance(Duration::from_secs(2));
        let payload = agg.poll(1).unwrap();
        assert_eq!(payload.finished_orders[0].status, OrderStatus::Complete);
        assert_eq!(agg.ledger().regressions(), 1);
    }

    struct FakeSnapshot;

    impl SnapshotSource for FakeSnapshot {
        fn query_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
            Ok(Vec::new())
        }

        fn query_order_counts(&mut self) -> Result<BTreeMap<String, u64>, StoreError> {
            Ok(BTreeMap::from([
                ("OPEN".to_string(), 3),
                ("IN_PROGRESS".to_string(), 1),
                ("COMPLETE".to_string(), 5),
            ]))
        }

        fn query_stations_and_orders(&mut self) -> Result<Vec<StationRow>, StoreError> {
            Ok(vec![
                StationRow {
                    station_id: 1,
                    order_id: None,
                    order_created: None,
                    delivered: BTreeMap::new(),
                    required: BTreeMap::new(),
                },
                StationRow {
                    station_id: 2,
                    order_id: Some(7),
                    order_created: Some(12.0),
                    delivered: BTreeMap::from([(0, 1)]),
                    required: BTreeMap::from([(0, 2)]),
                },
            ])
        }

        fn query_orders(
            &mut self,
            filter: OrderFilter,
            _limit: usize,
        ) -> Result<Vec<OrderRow>, StoreError> {
            let (status, items) = match filter {
                OrderFilter::New => ("OPEN", Some(BTreeMap::from([(1, 1)]))),
                OrderFilter::Finished => ("COMPLETE", None),
            };
            Ok(vec![OrderRow {
                order_id: 9,
                status: Some(status.into()),
                created: Some(1.0),
                finished: None,
                description: None,
                items,
            }])
        }

        fn query_state_value(&mut self, _label: &str) -> Result<Option<String>, StoreError> {
            Ok(None)
        }
    }

    #[test]
    fn snapshot_feed_counts_total_minus_new() {
        let store = CachedSnapshotStore::new(
            Box::new(FakeSnapshot) as Box<dyn SnapshotSource>,
            Duration::from_millis(1500),
        );
        let mut agg = OrderAggregator::with_clock(
            OrderFeed::Snapshot(store),
            Duration::from_secs(1),
            10,
            ManualClock::new(),
        );
        let payload = agg.poll(1).unwrap();
        assert_eq!(payload.new_order_count, 3);
        assert_eq!(payload.finished_order_count, 6);
        assert_eq!(payload.station_count, 2);
        assert_eq!(payload.free_station_keys, vec!["station:1".to_string()]);
        assert_eq!(payload.busy_stations[0].order.as_ref().unwrap().key, "order:7");
        // a finished order without item rows is surfaced, not dropped
        assert_eq!(payload.finished_orders[0].status, OrderStatus::Error);
    }
}
