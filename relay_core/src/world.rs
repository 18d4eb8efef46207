//! Static warehouse layout plus the current dynamic robot state.

use std::{
    fmt, fs, io,
    path::{Path, PathBuf},
};

use dash_proto::{GridPos, WorldPayload};
use serde::Deserialize;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RobotId(pub u32);

impl fmt::Display for RobotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CellKind {
    Empty = 0,
    Wall = 1,
    RobotHome = 2,
    ItemLoad = 3,
    Station = 4,
}

impl CellKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CellKind::Empty),
            1 => Some(CellKind::Wall),
            2 => Some(CellKind::RobotHome),
            3 => Some(CellKind::ItemLoad),
            4 => Some(CellKind::Station),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// On-disk world definition. Zone lists are `[row, col]` pairs.
#[derive(Debug, Clone, Deserialize)]
pub struct WorldDefinition {
    pub grid: Vec<Vec<u8>>,
    #[serde(default)]
    pub robot_home_zones: Option<Vec<[i32; 2]>>,
    #[serde(default)]
    pub item_load_zones: Option<Vec<[i32; 2]>>,
    #[serde(default)]
    pub station_zones: Option<Vec<[i32; 2]>>,
    #[serde(default)]
    pub item_names: Vec<String>,
}

#[derive(Debug, Error)]
pub enum WorldError {
    #[error("failed to read world definition from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse world definition: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("world grid is empty")]
    EmptyGrid,
    #[error("grid row {row} has {found} cells, expected {expected}")]
    RaggedGrid {
        row: usize,
        expected: usize,
        found: usize,
    },
    #[error("unknown cell code {code} at row {row}, col {col}")]
    UnknownCell { code: u8, row: usize, col: usize },
    #[error("grid encodes zones and explicit {0} were also given")]
    ZoneConflict(&'static str),
    #[error("grid has no zone codes and {0} are missing")]
    MissingZones(&'static str),
    #[error("{zone} position ({x}, {y}) is outside the grid or on a wall")]
    InvalidZone {
        zone: &'static str,
        x: i32,
        y: i32,
    },
}

/// Dynamic state for a single robot.
#[derive(Debug, Clone, PartialEq)]
pub struct RobotState {
    pub id: RobotId,
    pub pos: GridPos,
    pub held_item_id: Option<u32>,
    /// Future cells, nearest first.
    pub path: Vec<GridPos>,
    pub state: String,
}

impl RobotState {
    pub fn at_home(id: RobotId, pos: GridPos) -> Self {
        Self {
            id,
            pos,
            held_item_id: None,
            path: Vec::new(),
            state: "AVAILABLE".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct World {
    grid: Vec<Vec<CellKind>>,
    width: usize,
    height: usize,
    robot_home_zones: Vec<GridPos>,
    item_load_positions: Vec<GridPos>,
    station_positions: Vec<GridPos>,
    item_names: Vec<String>,
    dt_s: Option<f64>,
    robots: Vec<RobotState>,
}

impl World {
    pub fn from_file(path: &Path) -> Result<Self, WorldError> {
        let contents = fs::read_to_string(path).map_err(|source| WorldError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&contents)
    }

    pub fn from_json_str(json: &str) -> Result<Self, WorldError> {
        let definition: WorldDefinition = serde_json::from_str(json)?;
        Self::from_definition(definition)
    }

    pub fn from_definition(definition: WorldDefinition) -> Result<Self, WorldError> {
        let height = definition.grid.len();
        let width = definition.grid.first().map(Vec::len).unwrap_or(0);
        if height == 0 || width == 0 {
            return Err(WorldError::EmptyGrid);
        }

        let mut grid = Vec::with_capacity(height);
        let mut encodes_zones = false;
        for (row, cells) in definition.grid.iter().enumerate() {
            if cells.len() != width {
                return Err(WorldError::RaggedGrid {
                    row,
                    expected: width,
                    found: cells.len(),
                });
            }
            let mut kinds = Vec::with_capacity(width);
            for (col, &code) in cells.iter().enumerate() {
                let kind =
                    CellKind::from_code(code).ok_or(WorldError::UnknownCell { code, row, col })?;
                encodes_zones |= code > CellKind::Wall.code();
                kinds.push(kind);
            }
            grid.push(kinds);
        }

        let mut world = World {
            grid,
            width,
            height,
            robot_home_zones: Vec::new(),
            item_load_positions: Vec::new(),
            station_positions: Vec::new(),
            item_names: definition.item_names,
            dt_s: None,
            robots: Vec::new(),
        };

        let explicit = [
            ("robot_home_zones", definition.robot_home_zones),
            ("item_load_zones", definition.item_load_zones),
            ("station_zones", definition.station_zones),
        ];

        if encodes_zones {
            if let Some((name, _)) = explicit.iter().find(|(_, zones)| zones.is_some()) {
                return Err(WorldError::ZoneConflict(*name));
            }
            world.robot_home_zones = world.cells_of(CellKind::RobotHome);
            world.item_load_positions = world.cells_of(CellKind::ItemLoad);
            world.station_positions = world.cells_of(CellKind::Station);
        } else {
            let [(_, homes), (_, loads), (_, stations)] = explicit;
            world.robot_home_zones = world.place_zones(
                "robot_home_zones",
                homes.ok_or(WorldError::MissingZones("robot_home_zones"))?,
                CellKind::RobotHome,
            )?;
            world.item_load_positions = world.place_zones(
                "item_load_zones",
                loads.ok_or(WorldError::MissingZones("item_load_zones"))?,
                CellKind::ItemLoad,
            )?;
            world.station_positions = world.place_zones(
                "station_zones",
                stations.ok_or(WorldError::MissingZones("station_zones"))?,
                CellKind::Station,
            )?;
        }

        world.robots = world
            .robot_home_zones
            .iter()
            .enumerate()
            .map(|(idx, pos)| RobotState::at_home(RobotId(idx as u32), *pos))
            .collect();

        Ok(world)
    }

    fn cells_of(&self, kind: CellKind) -> Vec<GridPos> {
        let mut found = Vec::new();
        for (row, cells) in self.grid.iter().enumerate() {
            for (col, cell) in cells.iter().enumerate() {
                if *cell == kind {
                    found.push(GridPos::new(col as i32, row as i32));
                }
            }
        }
        found
    }

    fn place_zones(
        &mut self,
        zone: &'static str,
        row_cols: Vec<[i32; 2]>,
        kind: CellKind,
    ) -> Result<Vec<GridPos>, WorldError> {
        let mut positions = Vec::with_capacity(row_cols.len());
        for [row, col] in row_cols {
            let pos = GridPos::new(col, row);
            if !self.is_walkable(pos) {
                return Err(WorldError::InvalidZone {
                    zone,
                    x: pos.x,
                    y: pos.y,
                });
            }
            self.grid[row as usize][col as usize] = kind;
            positions.push(pos);
        }
        Ok(positions)
    }

    /// Replace the item catalog with a newline-separated list of names.
    pub fn load_item_names(&mut self, path: &Path) -> Result<(), WorldError> {
        let contents = fs::read_to_string(path).map_err(|source| WorldError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        self.item_names = contents
            .lines()
            .map(|line| line.trim_end_matches('\r').to_string())
            .filter(|line| !line.is_empty())
            .collect();
        Ok(())
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn cell(&self, pos: GridPos) -> Option<CellKind> {
        if pos.x < 0 || pos.y < 0 {
            return None;
        }
        self.grid
            .get(pos.y as usize)
            .and_then(|row| row.get(pos.x as usize))
            .copied()
    }

    /// In bounds and not a wall.
    pub fn is_walkable(&self, pos: GridPos) -> bool {
        matches!(self.cell(pos), Some(kind) if kind != CellKind::Wall)
    }

    pub fn item_names(&self) -> &[String] {
        &self.item_names
    }

    /// A catalog-less world accepts any non-negative item index.
    pub fn is_known_item(&self, item_id: u32) -> bool {
        self.item_names.is_empty() || (item_id as usize) < self.item_names.len()
    }

    pub fn dt_s(&self) -> Option<f64> {
        self.dt_s
    }

    /// Record the tick duration. Only the first valid value is kept.
    pub fn set_dt_once(&mut self, dt_s: f64) -> bool {
        if self.dt_s.is_some() || !dt_s.is_finite() || dt_s <= 0.0 {
            return false;
        }
        self.dt_s = Some(dt_s);
        true
    }

    pub fn robots(&self) -> &[RobotState] {
        &self.robots
    }

    pub fn robot_index(&self, id: RobotId) -> Option<usize> {
        let idx = id.0 as usize;
        match self.robots.get(idx) {
            Some(robot) if robot.id == id => Some(idx),
            _ => self.robots.iter().position(|robot| robot.id == id),
        }
    }

    pub fn robot_mut(&mut self, idx: usize) -> Option<&mut RobotState> {
        self.robots.get_mut(idx)
    }

    pub fn payload(&self) -> WorldPayload {
        WorldPayload {
            grid: self
                .grid
                .iter()
                .map(|row| row.iter().map(|cell| cell.code()).collect())
                .collect(),
            item_load_positions: self.item_load_positions.clone(),
            station_positions: self.station_positions.clone(),
            robot_home_zones: self.robot_home_zones.clone(),
            item_names: self.item_names.clone(),
        }
    }
}
