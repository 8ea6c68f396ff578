use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::{AppError, AppResult};

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;
/// Places API nearby search rejects circles larger than this.
pub const MAX_SEARCH_RADIUS_M: f64 = 50_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Region {
    pub lat_low: f64,
    pub lat_high: f64,
    pub lon_low: f64,
    pub lon_high: f64,
    pub rows: u32,
    pub columns: u32,
}

impl Region {
    pub fn new(
        lat_low: f64,
        lat_high: f64,
        lon_low: f64,
        lon_high: f64,
        rows: u32,
        columns: u32,
    ) -> AppResult<Self> {
        if rows == 0 || columns == 0 {
            return Err(AppError::Config(format!(
                "grid resolution must be positive, got {rows}x{columns}"
            )));
        }
        let coords = [lat_low, lat_high, lon_low, lon_high];
        if coords.iter().any(|v| !v.is_finite()) {
            return Err(AppError::Config("region bounds must be finite".into()));
        }
        if !(-90.0..=90.0).contains(&lat_low) || !(-90.0..=90.0).contains(&lat_high) {
            return Err(AppError::Config(format!(
                "latitude out of range: {lat_low}..{lat_high}"
            )));
        }
        if !(-180.0..=180.0).contains(&lon_low) || !(-180.0..=180.0).contains(&lon_high) {
            return Err(AppError::Config(format!(
                "longitude out of range: {lon_low}..{lon_high}"
            )));
        }
        if lat_low >= lat_high || lon_low >= lon_high {
            return Err(AppError::Config(format!(
                "region is empty or inverted: lat {lat_low}..{lat_high}, lon {lon_low}..{lon_high}"
            )));
        }
        Ok(Self {
            lat_low,
            lat_high,
            lon_low,
            lon_high,
            rows,
            columns,
        })
    }

    pub fn cell_count(&self) -> usize {
        self.rows as usize * self.columns as usize
    }

    pub fn area_deg2(&self) -> f64 {
        (self.lat_high - self.lat_low) * (self.lon_high - self.lon_low)
    }

    fn lat_edge(&self, row: u32) -> f64 {
        if row >= self.rows {
            return self.lat_high;
        }
        let step = (self.lat_high - self.lat_low) / self.rows as f64;
        self.lat_low + row as f64 * step
    }

    fn lon_edge(&self, column: u32) -> f64 {
        if column >= self.columns {
            return self.lon_high;
        }
        let step = (self.lon_high - self.lon_low) / self.columns as f64;
        self.lon_low + column as f64 * step
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellIndex {
    pub row: u32,
    pub column: u32,
}

impl CellIndex {
    pub fn new(row: u32, column: u32) -> Self {
        Self { row, column }
    }

    /// File-safe cache key, e.g. `r3_c17`.
    pub fn cache_key(&self) -> String {
        format!("r{}_c{}", self.row, self.column)
    }
}

impl fmt::Display for CellIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}_c{}", self.row, self.column)
    }
}

impl FromStr for CellIndex {
    type Err = AppError;

    fn from_str(value: &str) -> AppResult<Self> {
        let invalid = || AppError::Geo(format!("invalid cell key: {value}"));
        let (row, column) = value.split_once('_').ok_or_else(invalid)?;
        let row = row
            .strip_prefix('r')
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        let column = column
            .strip_prefix('c')
            .and_then(|v| v.parse().ok())
            .ok_or_else(invalid)?;
        Ok(Self { row, column })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub index: CellIndex,
    pub lat_low: f64,
    pub lat_high: f64,
    pub lon_low: f64,
    pub lon_high: f64,
    pub center_lat: f64,
    pub center_lon: f64,
    pub radius_m: f64,
}

impl Cell {
    pub fn key(&self) -> String {
        self.index.cache_key()
    }

    pub fn area_deg2(&self) -> f64 {
        (self.lat_high - self.lat_low) * (self.lon_high - self.lon_low)
    }

    pub fn corners(&self) -> [(f64, f64); 4] {
        [
            (self.lat_low, self.lon_low),
            (self.lat_low, self.lon_high),
            (self.lat_high, self.lon_high),
            (self.lat_high, self.lon_low),
        ]
    }

    /// Inclusive on every edge; neighbouring cells both claim shared edges.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        lat >= self.lat_low && lat <= self.lat_high && lon >= self.lon_low && lon <= self.lon_high
    }

    /// Largest center-to-corner distance. The southern and northern corners
    /// span different ground widths, so all four are measured.
    pub fn half_diagonal_m(&self) -> f64 {
        self.corners()
            .iter()
            .map(|(lat, lon)| haversine_m(self.center_lat, self.center_lon, *lat, *lon))
            .fold(0.0, f64::max)
    }
}

pub struct RegionGrid;

impl RegionGrid {
    /// Row-major decomposition of `region`. Row 0 is the southern edge,
    /// column 0 the western edge. The last row and column are snapped to the
    /// region's high bounds so the cells tile it without gaps.
    pub fn build(region: &Region, overlap_margin_m: f64) -> Vec<Cell> {
        let margin = if overlap_margin_m.is_finite() {
            overlap_margin_m.max(0.0)
        } else {
            0.0
        };
        let mut cells = Vec::with_capacity(region.cell_count());
        for row in 0..region.rows {
            let lat_low = region.lat_edge(row);
            let lat_high = region.lat_edge(row + 1);
            for column in 0..region.columns {
                let lon_low = region.lon_edge(column);
                let lon_high = region.lon_edge(column + 1);
                let mut cell = Cell {
                    index: CellIndex::new(row, column),
                    lat_low,
                    lat_high,
                    lon_low,
                    lon_high,
                    center_lat: (lat_low + lat_high) / 2.0,
                    center_lon: (lon_low + lon_high) / 2.0,
                    radius_m: 0.0,
                };
                cell.radius_m = (cell.half_diagonal_m() + margin).min(MAX_SEARCH_RADIUS_M);
                cells.push(cell);
            }
        }
        cells
    }
}

/// Great-circle distance in meters.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_METERS * c
}
