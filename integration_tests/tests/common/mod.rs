#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::net::TcpStream;
use std::sync::Arc;

use dash_proto::{decode_event, read_frame, ServerEvent};
use parking_lot::Mutex;
use relay_core::network::{Frame, SinkClosed};
use relay_core::store::{Hash, StoreCounts, StreamEntry};
use relay_core::{ClientSink, PubSubSource, RawRobotRow, StoreError, TickNotice, World};
use serde_json::{json, Value};

/// 4x3 floor, two robot homes on the bottom row, a wall in the middle.
pub const WORLD_JSON: &str = r#"{
    "grid": [[2, 0, 0, 2], [0, 1, 0, 0], [3, 0, 0, 4]],
    "item_names": ["bolt", "nut"]
}"#;

pub fn world() -> World {
    World::from_json_str(WORLD_JSON).expect("fixture world")
}

pub fn robot(id: i64, pos: [i32; 2], path: &str) -> RawRobotRow {
    RawRobotRow {
        id: Some(id),
        position: Some(json!(pos)),
        path: Some(Value::String(path.to_string())),
        held_item_id: None,
        state: Some("MOVING".to_string()),
    }
}

pub fn hash(pairs: &[(&str, &str)]) -> Hash {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// In-memory pub/sub store replaying a fixed tick script.
#[derive(Default)]
pub struct ScriptedStore {
    pub notices: VecDeque<TickNotice>,
    pub hashes: HashMap<String, Hash>,
    pub robot_keys: Vec<String>,
    pub new_order_keys: Vec<String>,
    pub finished: Vec<StreamEntry>,
    pub free_station_keys: Vec<String>,
    pub busy_station_keys: Vec<String>,
    pub counts: StoreCounts,
    pub dt_s: Option<f64>,
}

impl ScriptedStore {
    pub fn with_ticks(ticks: Vec<(i64, Vec<RawRobotRow>)>) -> Self {
        Self {
            notices: ticks
                .into_iter()
                .map(|(t, robots)| TickNotice {
                    t,
                    robots: Some(robots),
                })
                .collect(),
            dt_s: Some(0.5),
            ..Self::default()
        }
    }
}

impl PubSubSource for ScriptedStore {
    fn read_tick_blocking(&mut self) -> Result<TickNotice, StoreError> {
        self.notices
            .pop_front()
            .ok_or_else(|| StoreError::Unavailable("tick script exhausted".to_string()))
    }

    fn get_robot_keys(&mut self) -> Result<Vec<String>, StoreError> {
        Ok(self.robot_keys.clone())
    }

    fn batch_get(&mut self, keys: &[String]) -> Result<Vec<Option<Hash>>, StoreError> {
        Ok(keys.iter().map(|key| self.hashes.get(key).cloned()).collect())
    }

    fn get_new_order_keys(&mut self, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self.new_order_keys.iter().take(limit).cloned().collect())
    }

    fn get_recent_finished_orders(&mut self, limit: usize) -> Result<Vec<StreamEntry>, StoreError> {
        Ok(self.finished.iter().take(limit).cloned().collect())
    }

    fn get_free_station_keys(&mut self, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self.free_station_keys.iter().take(limit).cloned().collect())
    }

    fn get_busy_station_sample(&mut self, limit: usize) -> Result<Vec<String>, StoreError> {
        Ok(self.busy_station_keys.iter().take(limit).cloned().collect())
    }

    fn get_counts(&mut self) -> Result<StoreCounts, StoreError> {
        Ok(self.counts)
    }

    fn get_dt_sec(&mut self) -> Result<Option<f64>, StoreError> {
        Ok(self.dt_s)
    }
}

/// Client sink that keeps every frame it is handed.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub frames: Arc<Mutex<Vec<Frame>>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<ServerEvent> {
        self.frames.lock().iter().map(|frame| decode(frame)).collect()
    }
}

impl ClientSink for RecordingSink {
    fn deliver(&mut self, frame: &Frame) -> Result<(), SinkClosed> {
        self.frames.lock().push(frame.clone());
        Ok(())
    }

    fn label(&self) -> String {
        "recorder".to_string()
    }
}

pub fn decode(frame: &Frame) -> ServerEvent {
    let mut bytes: &[u8] = frame;
    let payload = read_frame(&mut bytes).expect("length-prefixed frame");
    decode_event(&payload).expect("valid event")
}

pub fn read_event(stream: &mut TcpStream) -> anyhow::Result<ServerEvent> {
    let payload = read_frame(stream)?;
    Ok(decode_event(&payload)?)
}
