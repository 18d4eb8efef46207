//! Client-side animation between received ticks.
//!
//! Positions tween from the previous tick to the latest one over `dt_s`
//! seconds of wall time. When the gap between the last two ticks is not
//! exactly one, or `dt_s` is unknown, the latest positions are shown at once.

use std::collections::BTreeMap;
use std::time::Instant;

use dash_proto::{GridPos, UpdatePayload};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    /// Nothing received since the last world reset.
    Idle,
    Tweening { arrived: Instant, snap: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RobotTrack {
    pub from: GridPos,
    pub to: GridPos,
    pub held_item_id: Option<u32>,
    pub state: String,
    /// Retained path; advanced locally when an update omits it.
    pub path: Vec<GridPos>,
}

/// One robot as it should be drawn in the current frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotFrame<'a> {
    pub id: u32,
    pub x: f64,
    pub y: f64,
    pub held_item_id: Option<u32>,
    pub state: &'a str,
    pub path: &'a [GridPos],
}

#[derive(Debug)]
pub struct Interpolator {
    phase: Phase,
    robots: BTreeMap<u32, RobotTrack>,
    last_t: Option<i64>,
    dt_s: Option<f64>,
}

impl Default for Interpolator {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            robots: BTreeMap::new(),
            last_t: None,
            dt_s: None,
        }
    }
}

impl Interpolator {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_tick(&self) -> Option<i64> {
        self.last_t
    }

    pub fn dt_s(&self) -> Option<f64> {
        self.dt_s
    }

    pub fn track(&self, id: u32) -> Option<&RobotTrack> {
        self.robots.get(&id)
    }

    /// Forget everything; the next update starts from scratch.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn apply(&mut self, update: &UpdatePayload, now: Instant) {
        let snap = self.last_t.map_or(true, |prev| update.t - prev != 1);
        self.last_t = Some(update.t);
        if let Some(dt_s) = update.dt_s.filter(|dt| dt.is_finite() && *dt > 0.0) {
            self.dt_s = Some(dt_s);
        }

        // Robots missing from this update stay where they are.
        for track in self.robots.values_mut() {
            track.from = track.to;
        }

        for robot in &update.robots {
            let track = self.robots.entry(robot.id).or_insert_with(|| RobotTrack {
                from: robot.pos,
                to: robot.pos,
                held_item_id: None,
                state: String::new(),
                path: Vec::new(),
            });
            track.from = track.to;
            track.to = robot.pos;
            track.held_item_id = robot.held_item_id;
            track.state.clone_from(&robot.state);
            match &robot.path {
                Some(cells) => {
                    track.path = cells.iter().copied().map(GridPos::from_pair).collect();
                }
                None => {
                    if !track.path.is_empty() {
                        track.path.remove(0);
                    }
                }
            }
        }

        self.phase = Phase::Tweening { arrived: now, snap };
    }

    /// Progress from the previous tick towards the latest, in `[0, 1]`.
    pub fn t_frac(&self, now: Instant) -> f64 {
        match self.phase {
            Phase::Idle => 1.0,
            Phase::Tweening { snap: true, .. } => 1.0,
            Phase::Tweening { arrived, snap: false } => match self.dt_s {
                Some(dt_s) => {
                    let elapsed = now.saturating_duration_since(arrived).as_secs_f64();
                    (elapsed / dt_s).clamp(0.0, 1.0)
                }
                None => 1.0,
            },
        }
    }

    pub fn frame(&self, now: Instant) -> Vec<RobotFrame<'_>> {
        let t_frac = self.t_frac(now);
        self.robots
            .iter()
            .map(|(id, track)| RobotFrame {
                id: *id,
                x: lerp(track.from.x, track.to.x, t_frac),
                y: lerp(track.from.y, track.to.y, t_frac),
                held_item_id: track.held_item_id,
                state: &track.state,
                path: &track.path,
            })
            .collect()
    }
}

fn lerp(from: i32, to: i32, t: f64) -> f64 {
    f64::from(from) + (f64::from(to) - f64::from(from)) * t
}

#[cfg(test)]
mod tests {
    use super::*;
    use dash_proto::RobotUpdate;
    use std::time::Duration;

    fn update(t: i64, x: i32, path: Option<Vec<[i32; 2]>>) -> UpdatePayload {
        UpdatePayload {
            t,
            dt_s: Some(1.0),
            robots: vec![RobotUpdate {
                id: 0,
                pos: GridPos::new(x, 0),
                held_item_id: None,
                state: "MOVING".into(),
                path,
            }],
        }
    }

    #[test]
    fn consecutive_ticks_tween_over_dt() {
        let start = Instant::now();
        let mut interp = Interpolator::default();
        interp.apply(&update(5, 0, None), start);
        interp.apply(&update(6, 2, None), start);

        let halfway = start + Duration::from_millis(500);
        assert!((interp.t_frac(halfway) - 0.5).abs() < 1e-9);
        let frame = interp.frame(halfway);
        assert!((frame[0].x - 1.0).abs() < 1e-9);

        let late = start + Duration::from_secs(3);
        assert_eq!(interp.t_frac(late), 1.0);
        assert_eq!(interp.frame(late)[0].x, 2.0);
    }

    #[test]
    fn skipped_ticks_snap_to_latest() {
        let start = Instant::now();
        let mut interp = Interpolator::default();
        interp.apply(&update(5, 0, None), start);
        interp.apply(&update(9, 4, None), start);
        assert_eq!(interp.t_frac(start), 1.0);
        assert_eq!(interp.frame(start)[0].x, 4.0);
    }

    #[test]
    fn first_update_and_regressions_snap() {
        let start = Instant::now();
        let mut interp = Interpolator::default();
        assert_eq!(interp.phase(), Phase::Idle);
        interp.apply(&update(3, 1, None), start);
        assert_eq!(interp.t_frac(start), 1.0);
        interp.apply(&update(3, 2, None), start);
        assert_eq!(interp.t_frac(start), 1.0);
    }

    #[test]
    fn unknown_dt_snaps() {
        let start = Instant::now();
        let mut interp = Interpolator::default();
        let mut first = update(1, 0, None);
        first.dt_s = None;
        let mut second = update(2, 1, None);
        second.dt_s = None;
        interp.apply(&first, start);
        interp.apply(&second, start);
        assert_eq!(interp.t_frac(start), 1.0);
    }

    #[test]
    fn omitted_path_pops_one_head() {
        let start = Instant::now();
        let mut interp = Interpolator::default();
        interp.apply(&update(1, 0, Some(vec![[1, 0], [2, 0], [3, 0]])), start);
        interp.apply(&update(2, 1, None), start);
        assert_eq!(
            interp.track(0).map(|t| t.path.clone()),
            Some(vec![GridPos::new(2, 0), GridPos::new(3, 0)])
        );
        interp.apply(&update(3, 2, Some(Vec::new())), start);
        interp.apply(&update(4, 2, None), start);
        assert!(interp.track(0).is_some_and(|t| t.path.is_empty()));
    }

    #[test]
    fn robots_missing_from_an_update_hold_still() {
        let start = Instant::now();
        let mut interp = Interpolator::default();
        interp.apply(&update(1, 0, None), start);
        interp.apply(&update(2, 3, None), start);
        let empty = UpdatePayload {
            t: 3,
            dt_s: Some(1.0),
            robots: Vec::new(),
        };
        interp.apply(&empty, start);
        let frame = interp.frame(start);
        assert_eq!(frame[0].x, 3.0);
    }

    #[test]
    fn reset_returns_to_idle() {
        let mut interp = Interpolator::default();
        interp.apply(&update(1, 0, None), Instant::now());
        interp.reset();
        assert_eq!(interp.phase(), Phase::Idle);
        assert!(interp.frame(Instant::now()).is_empty());
        assert_eq!(interp.last_tick(), None);
    }
}
