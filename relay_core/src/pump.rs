//! Tick loop: wait for a tick, resolve its robot rows, reconcile, publish.
//!
//! One tick is fully processed before the next blocking read starts, so
//! updates leave the relay in the order the store published them.

use dash_proto::UpdatePayload;
use tracing::{debug, trace, warn};

use crate::reconcile::ReconciliationEngine;
use crate::store::{
    CachedSnapshotStore, PubSubSource, RawRobotRow, SnapshotSource, SourceCapabilities,
    StoreError, TickEvent,
};
use crate::network::UpdatePublisher;

const TARGET: &str = "warehouse_relay::pump";

pub type BoxedSnapshot = CachedSnapshotStore<Box<dyn SnapshotSource>>;

pub struct TickPump {
    ticks: Box<dyn PubSubSource>,
    snapshot: Option<BoxedSnapshot>,
    capabilities: SourceCapabilities,
    engine: ReconciliationEngine,
}

impl TickPump {
    pub fn new(
        ticks: Box<dyn PubSubSource>,
        snapshot: Option<BoxedSnapshot>,
        capabilities: SourceCapabilities,
        engine: ReconciliationEngine,
    ) -> Self {
        Self {
            ticks,
            snapshot,
            capabilities,
            engine,
        }
    }

    pub fn engine(&self) -> &ReconciliationEngine {
        &self.engine
    }

    /// Process exactly one tick. Publishing failures are logged; only a
    /// failed tick read or robot fetch is returned.
    pub fn step<P>(&mut self, publisher: &P) -> Result<UpdatePayload, StoreError>
    where
        P: UpdatePublisher + ?Sized,
    {
        let notice = self.ticks.read_tick_blocking()?;
        self.refresh_dt();
        let robots = match notice.robots {
            Some(rows) => rows,
            None => self.fetch_robots()?,
        };
        let delta = self.engine.apply_tick(&TickEvent {
            t: notice.t,
            robots,
        });
        let baseline = self.engine.baseline();
        match publisher.publish_update(&delta, baseline.as_ref()) {
            Ok(clients) => trace!(target: TARGET, t = delta.t, clients, "tick.published"),
            Err(err) => warn!(target: TARGET, t = delta.t, error = %err, "tick.publish_failed"),
        }
        Ok(delta)
    }

    /// Runs until the process exits. Store errors never stop the loop.
    pub fn run<P>(&mut self, publisher: &P)
    where
        P: UpdatePublisher + ?Sized,
    {
        loop {
            if let Err(err) = self.step(publisher) {
                if err.is_unavailable() {
                    debug!(target: TARGET, error = %err, "tick.store_unavailable");
                } else {
                    warn!(target: TARGET, error = %err, "tick.skipped");
                }
            }
        }
    }

    fn fetch_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
        if self.capabilities.contains(SourceCapabilities::ROBOTS_FROM_SNAPSHOT) {
            if let Some(snapshot) = self.snapshot.as_mut() {
                return snapshot.read_robots();
            }
        }
        let keys = self.ticks.get_robot_keys()?;
        let hashes = self.ticks.batch_get(&keys)?;
        let mut rows = Vec::with_capacity(keys.len());
        for (key, hash) in keys.iter().zip(hashes) {
            match hash {
                Some(hash) => rows.push(RawRobotRow::from_hash(Some(key), &hash)),
                None => debug!(target: TARGET, key = %key, "robot.hash_missing"),
            }
        }
        Ok(rows)
    }

    /// dt is fixed for a run; keep asking until one answer lands.
    fn refresh_dt(&mut self) {
        if self.engine.world().dt_s().is_some() {
            return;
        }
        let fetched = match self.snapshot.as_mut() {
            Some(snapshot) if self.capabilities.contains(SourceCapabilities::DT_FROM_SNAPSHOT) => {
                snapshot.get_dt_sec()
            }
            _ => self.ticks.get_dt_sec(),
        };
        match fetched {
            Ok(Some(dt_s)) => {
                if self.engine.set_dt_once(dt_s) {
                    debug!(target: TARGET, dt_s, "dt.set");
                }
            }
            Ok(None) => trace!(target: TARGET, "dt.pending"),
            Err(err) => debug!(target: TARGET, error = %err, "dt.fetch_failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        Hash, OrderFilter, OrderRow, StationRow, StoreCounts, StreamEntry, TickNotice,
    };
    use crate::world::World;
    use dash_proto::ProtoError;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::{BTreeMap, VecDeque};
    use std::time::Duration;

    const WORLD: &str = r#"{"grid": [[0, 0, 0], [0, 0, 0]], "robot_home_zones": [[0, 0]], "item_load_zones": [], "station_zones": []}"#;

    #[derive(Default)]
    struct ScriptedTicks {
        notices: VecDeque<TickNotice>,
        hashes: Vec<(String, Option<Hash>)>,
        dt: Option<f64>,
        dt_calls: usize,
    }

    impl PubSubSource for ScriptedTicks {
        fn read_tick_blocking(&mut self) -> Result<TickNotice, StoreError> {
            self.notices
                .pop_front()
                .ok_or_else(|| StoreError::Unavailable("script exhausted".into()))
        }

        fn get_robot_keys(&mut self) -> Result<Vec<String>, StoreError> {
            Ok(self.hashes.iter().map(|(key, _)| key.clone()).collect())
        }

        fn batch_get(&mut self, keys: &[String]) -> Result<Vec<Option<Hash>>, StoreError> {
            Ok(keys
                .iter()
                .map(|key| {
                    self.hashes
                        .iter()
                        .find(|(k, _)| k == key)
                        .and_then(|(_, hash)| hash.clone())
                })
                .collect())
        }

        fn get_new_order_keys(&mut self, _limit: usize) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        fn get_recent_finished_orders(
            &mut self,
            _limit: usize,
        ) -> Result<Vec<StreamEntry>, StoreError> {
            Ok(Vec::new())
        }

        fn get_free_station_keys(&mut self, _limit: usize) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        fn get_busy_station_sample(&mut self, _limit: usize) -> Result<Vec<String>, StoreError> {
            Ok(Vec::new())
        }

        fn get_counts(&mut self) -> Result<StoreCounts, StoreError> {
            Ok(StoreCounts::default())
        }

        fn get_dt_sec(&mut self) -> Result<Option<f64>, StoreError> {
            self.dt_calls += 1;
            Ok(self.dt)
        }
    }

    #[derive(Default)]
    struct Collector {
        published: Mutex<Vec<(UpdatePayload, Option<UpdatePayload>)>>,
    }

    impl UpdatePublisher for Collector {
        fn publish_update(
            &self,
            delta: &UpdatePayload,
            baseline: Option<&UpdatePayload>,
        ) -> Result<usize, ProtoError> {
            self.published
                .lock()
                .push((delta.clone(), baseline.cloned()));
            Ok(1)
        }
    }

    fn pump(ticks: ScriptedTicks) -> TickPump {
        let world = World::from_json_str(WORLD).unwrap();
        TickPump::new(
            Box::new(ticks),
            None,
            SourceCapabilities::TICK_CHANNEL | SourceCapabilities::ROBOTS_FROM_HASHES,
            ReconciliationEngine::new(world),
        )
    }

    #[test]
    fn channel_ticks_resolve_robots_from_hashes() {
        let mut hash = Hash::new();
        hash.insert("position".into(), "[1, 0]".into());
        hash.insert("path".into(), "R".into());
        hash.insert("state".into(), "MOVING".into());
        let ticks = ScriptedTicks {
            notices: VecDeque::from(vec![TickNotice { t: 4, robots: None }]),
            hashes: vec![("robot:0".into(), Some(hash)), ("robot:9".into(), None)],
            dt: Some(0.25),
            ..ScriptedTicks::default()
        };
        let collector = Collector::default();
        let mut pump = pump(ticks);

        let delta = pump.step(&collector).unwrap();
        assert_eq!(delta.t, 4);
        assert_eq!(delta.dt_s, Some(0.25));
        assert_eq!(delta.robots.len(), 1);
        assert_eq!(delta.robots[0].pos.x, 1);

        let published = collector.published.lock();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].1.as_ref().map(|b| b.t), Some(4));
    }

    /// Robot table whose single robot moves one cell right per query.
    #[derive(Default)]
    struct WalkingRobotTable {
        queries: i32,
    }

    impl SnapshotSource for WalkingRobotTable {
        fn query_robots(&mut self) -> Result<Vec<RawRobotRow>, StoreError> {
            let x = self.queries;
            self.queries += 1;
            Ok(vec![RawRobotRow {
                id: Some(0),
                position: Some(json!([x, 0])),
                path: None,
                held_item_id: None,
                state: Some("MOVING".into()),
            }])
        }

        fn query_order_counts(&mut self) -> Result<BTreeMap<String, u64>, StoreError> {
            Ok(BTreeMap::new())
        }

        fn query_stations_and_orders(&mut self) -> Result<Vec<StationRow>, StoreError> {
            Ok(Vec::new())
        }

        fn query_orders(
            &mut self,
            _filter: OrderFilter,
            _limit: usize,
        ) -> Result<Vec<OrderRow>, StoreError> {
            Ok(Vec::new())
        }

        fn query_state_value(&mut self, _label: &str) -> Result<Option<String>, StoreError> {
            Ok(Some("0.5".into()))
        }
    }

    #[test]
    fn snapshot_robots_are_read_fresh_every_tick() {
        let ticks = ScriptedTicks {
            notices: (1..=3).map(|t| TickNotice { t, robots: None }).collect(),
            ..ScriptedTicks::default()
        };
        // A TTL far longer than the test; positions must still advance.
        let table: Box<dyn SnapshotSource> = Box::new(WalkingRobotTable::default());
        let snapshot: BoxedSnapshot = CachedSnapshotStore::new(table, Duration::from_secs(3600));
        let world = World::from_json_str(WORLD).unwrap();
        let mut pump = TickPump::new(
            Box::new(ticks),
            Some(snapshot),
            SourceCapabilities::TICK_CHANNEL
                | SourceCapabilities::ROBOTS_FROM_SNAPSHOT
                | SourceCapabilities::DT_FROM_SNAPSHOT,
            ReconciliationEngine::new(world),
        );
        let collector = Collector::default();

        for expected_x in 0..3 {
            let delta = pump.step(&collector).unwrap();
            assert_eq!(delta.robots.len(), 1);
            assert_eq!(delta.robots[0].pos.x, expected_x);
        }
        assert_eq!(pump.engine().world().dt_s(), Some(0.5));
    }

    #[test]
    fn dt_is_requested_until_known() {
        let ticks = ScriptedTicks {
            notices: VecDeque::from(vec![
                TickNotice { t: 1, robots: Some(Vec::new()) },
                TickNotice { t: 2, robots: Some(Vec::new()) },
            ]),
            dt: None,
            ..ScriptedTicks::default()
        };
        let collector = Collector::default();
        let mut pump = pump(ticks);
        pump.step(&collector).unwrap();
        pump.step(&collector).unwrap();
        assert!(pump.engine().world().dt_s().is_none());
        assert!(matches!(
            pump.step(&collector),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(collector.published.lock().len(), 2);
    }
}
