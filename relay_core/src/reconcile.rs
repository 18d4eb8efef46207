//! Tick reconciliation.
//!
//! Each tick's raw robot rows are validated against the [`World`], applied to
//! it, and diffed against the paths derived on the previous tick. A robot's
//! `path` is left out of the outgoing update when it equals the previous path
//! with its head removed; clients advance their retained copy instead.

use std::collections::{HashMap, HashSet};

use dash_proto::{GridPos, RobotUpdate, UpdatePayload};
use serde_json::Value;
use tracing::{debug, warn};

use crate::metrics::RelayMetrics;
use crate::path::{decode_path_value, parse_point, starts_adjacent};
use crate::store::{RawRobotRow, TickEvent};
use crate::world::{RobotId, RobotState, World};

const TARGET: &str = "warehouse_relay::reconcile";

pub struct ReconciliationEngine {
    world: World,
    /// Last derived (not last transmitted) path per robot.
    previous_paths: HashMap<RobotId, Vec<GridPos>>,
    last_tick: Option<i64>,
    applied_tick: Option<i64>,
    metrics: RelayMetrics,
}

impl ReconciliationEngine {
    pub fn new(world: World) -> Self {
        Self {
            world,
            previous_paths: HashMap::new(),
            last_tick: None,
            applied_tick: None,
            metrics: RelayMetrics::default(),
        }
    }

    pub fn world(&self) -> &World {
        &self.world
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Highest tick seen so far; never moves backwards.
    pub fn last_tick(&self) -> Option<i64> {
        self.last_tick
    }

    pub fn set_dt_once(&mut self, dt_s: f64) -> bool {
        self.world.set_dt_once(dt_s)
    }

    /// Apply one tick and return the diffed update for connected clients.
    pub fn apply_tick(&mut self, tick: &TickEvent) -> UpdatePayload {
        if let Some(last) = self.last_tick {
            if tick.t <= last {
                self.metrics.ticks_regressed += 1;
                warn!(target: TARGET, t = tick.t, last, "tick.regressed");
            }
        }

        let robot_count = self.world.robots().len();
        let by_index = tick.robots.len() == robot_count;
        if !by_index {
            warn!(
                target: TARGET,
                t = tick.t,
                rows = tick.robots.len(),
                robots = robot_count,
                "tick.shape_mismatch"
            );
        }

        let mut seen = HashSet::with_capacity(tick.robots.len());
        let mut updates = Vec::with_capacity(tick.robots.len());
        for (index, row) in tick.robots.iter().enumerate() {
            let Some(idx) = self.resolve_row(index, row, by_index) else {
                self.skip_row(tick.t, index, "unknown robot");
                continue;
            };
            if !seen.insert(idx) {
                self.skip_row(tick.t, index, "duplicate robot");
                continue;
            }
            match self.apply_row(idx, row) {
                Ok(update) => updates.push(update),
                Err(reason) => self.skip_row(tick.t, index, reason),
            }
        }

        self.metrics.ticks_processed += 1;
        self.last_tick = Some(self.last_tick.map_or(tick.t, |last| last.max(tick.t)));
        self.metrics.last_tick = self.last_tick;
        self.applied_tick = Some(tick.t);
        debug!(
            target: TARGET,
            t = tick.t,
            robots = updates.len(),
            paths_sent = self.metrics.paths_sent,
            paths_omitted = self.metrics.paths_omitted,
            omission_ratio = self.metrics.omission_ratio(),
            "tick.reconciled"
        );

        UpdatePayload {
            t: tick.t,
            dt_s: self.world.dt_s(),
            robots: updates,
        }
    }

    /// Full, undiffed state for a client that has seen nothing yet.
    /// `None` until the first tick has been applied.
    pub fn baseline(&self) -> Option<UpdatePayload> {
        let t = self.applied_tick?;
        Some(UpdatePayload {
            t,
            dt_s: self.world.dt_s(),
            robots: self
                .world
                .robots()
                .iter()
                .map(|robot| robot_update(robot, true))
                .collect(),
        })
    }

    fn resolve_row(&self, index: usize, row: &RawRobotRow, by_index: bool) -> Option<usize> {
        match row.id {
            Some(id) => u32::try_from(id)
                .ok()
                .and_then(|id| self.world.robot_index(RobotId(id))),
            None if by_index => Some(index),
            None => None,
        }
    }

    fn skip_row(&mut self, t: i64, index: usize, reason: &str) {
        self.metrics.rows_skipped += 1;
        warn!(target: TARGET, t, row = index, reason, "tick.row_skipped");
    }

    fn apply_row(&mut self, idx: usize, row: &RawRobotRow) -> Result<RobotUpdate, &'static str> {
        let pos = row
            .position
            .as_ref()
            .and_then(parse_point)
            .ok_or("unparseable position")?;
        if !self.world.is_walkable(pos) {
            return Err("position outside walkable grid");
        }
        let held_item_id = row
            .held_item_id
            .as_ref()
            .and_then(parse_item_id)
            .filter(|item| self.world.is_known_item(*item));

        let path = match row.path.as_ref() {
            None => Vec::new(),
            Some(raw) => decode_path_value(pos, raw).unwrap_or_else(|err| {
                warn!(target: TARGET, row = idx, error = %err, "robot.path_invalid");
                Vec::new()
            }),
        };

        let Some(robot) = self.world.robot_mut(idx) else {
            return Err("robot index out of range");
        };
        if !starts_adjacent(pos, &path) {
            debug!(target: TARGET, robot = %robot.id, x = pos.x, y = pos.y, "robot.path_detached");
        }
        robot.pos = pos;
        robot.held_item_id = held_item_id;
        if let Some(state) = &row.state {
            robot.state = state.clone();
        }
        robot.path = path;
        let id = robot.id;

        let unchanged_tail = self
            .previous_paths
            .get(&id)
            .is_some_and(|prev| !prev.is_empty() && prev[1..] == robot.path[..]);
        let update = robot_update(robot, !unchanged_tail);
        if unchanged_tail {
            self.metrics.paths_omitted += 1;
        } else {
            self.metrics.paths_sent += 1;
        }
        self.previous_paths.insert(id, robot.path.clone());
        Ok(update)
    }
}

fn robot_update(robot: &RobotState, with_path: bool) -> RobotUpdate {
    RobotUpdate {
        id: robot.id.0,
        pos: robot.pos,
        held_item_id: robot.held_item_id,
        state: robot.state.clone(),
        path: with_path.then(|| robot.path.iter().map(|cell| cell.to_pair()).collect()),
    }
}

/// Item index from a loosely typed store field. Empty strings, NaN,
/// fractions and negatives all mean "nothing held".
pub fn parse_item_id(raw: &Value) -> Option<u32> {
    let number = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(text) => {
            let text = text.trim();
            if text.is_empty() || text.eq_ignore_ascii_case("none") || text == "null" {
                return None;
            }
            text.parse::<f64>().ok()?
        }
        _ => return None,
    };
    if !number.is_finite() || number < 0.0 || number.fract() != 0.0 || number > u32::MAX as f64 {
        return None;
    }
    Some(number as u32)
}
