//! Robot path decoding.
//!
//! Upstream publishes paths either as absolute `[[x, y], ...]` arrays or as a
//! compact move string over `U`/`D`/`L`/`R`/`W`. Move strings are integrated
//! from the robot's current cell; the start cell itself is not part of the path.

use dash_proto::GridPos;
use serde_json::Value;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Move {
    Up,
    Down,
    Left,
    Right,
    Wait,
}

impl Move {
    pub fn from_char(c: char) -> Option<Self> {
        match c.to_ascii_uppercase() {
            'U' => Some(Move::Up),
            'D' => Some(Move::Down),
            'L' => Some(Move::Left),
            'R' => Some(Move::Right),
            'W' => Some(Move::Wait),
            _ => None,
        }
    }

    /// Unit grid delta. `Up` increases `y`.
    pub fn delta(self) -> (i32, i32) {
        match self {
            Move::Up => (0, 1),
            Move::Down => (0, -1),
            Move::Left => (-1, 0),
            Move::Right => (1, 0),
            Move::Wait => (0, 0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("unknown move `{ch}` at offset {offset}")]
    UnknownMove { ch: char, offset: usize },
    #[error("path element {index} is not an [x, y] integer pair")]
    BadPoint { index: usize },
    #[error("path is neither a move string nor an array of points")]
    Unsupported,
}

/// Integrate a move string starting from `start`.
pub fn decode_moves(start: GridPos, moves: &str) -> Result<Vec<GridPos>, PathError> {
    let mut current = start;
    let mut path = Vec::with_capacity(moves.len());
    for (offset, ch) in moves.chars().enumerate() {
        let step = Move::from_char(ch).ok_or(PathError::UnknownMove { ch, offset })?;
        let (dx, dy) = step.delta();
        current = current.offset(dx, dy);
        path.push(current);
    }
    Ok(path)
}

/// Decode a raw path field. `null` means no path.
pub fn decode_path_value(start: GridPos, raw: &Value) -> Result<Vec<GridPos>, PathError> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::Array(points) => points
            .iter()
            .enumerate()
            .map(|(index, point)| parse_point(point).ok_or(PathError::BadPoint { index }))
            .collect(),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.starts_with('[') {
                let parsed: Value =
                    serde_json::from_str(trimmed).map_err(|_| PathError::Unsupported)?;
                decode_path_value(start, &parsed)
            } else {
                decode_moves(start, trimmed)
            }
        }
        _ => Err(PathError::Unsupported),
    }
}

/// Accepts `[x, y]` or `{"x": .., "y": ..}`.
pub fn parse_point(value: &Value) -> Option<GridPos> {
    match value {
        Value::Array(pair) if pair.len() == 2 => {
            Some(GridPos::new(as_coord(&pair[0])?, as_coord(&pair[1])?))
        }
        Value::Object(map) => Some(GridPos::new(
            as_coord(map.get("x")?)?,
            as_coord(map.get("y")?)?,
        )),
        Value::String(text) => serde_json::from_str::<Value>(text)
            .ok()
            .filter(|inner| !inner.is_string())
            .and_then(|inner| parse_point(&inner)),
        _ => None,
    }
}

fn as_coord(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|v| i32::try_from(v).ok())
}

/// True when the first path cell is one move (or a wait) away from `pos`.
pub fn starts_adjacent(pos: GridPos, path: &[GridPos]) -> bool {
    path.first().map_or(true, |head| head.is_step_from(pos))
}
