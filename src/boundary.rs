use std::fs;
use std::path::Path;

use geo::{Area, Contains, Intersects, LineString, Point, Polygon, Rect};
use serde_json::Value;
use tracing::info;

use crate::errors::{AppError, AppResult};
use crate::grid::Cell;

/// Outer ring of an area of interest in `(lon, lat)` order, like GeoJSON.
/// Holes are ignored; the filter only decides which cells are worth a query.
#[derive(Debug, Clone, PartialEq)]
pub struct Boundary {
    polygon: Polygon<f64>,
}

impl Boundary {
    pub fn new(mut ring: Vec<(f64, f64)>) -> AppResult<Self> {
        if ring.len() > 1 && ring.first() == ring.last() {
            ring.pop();
        }
        if ring.len() < 3 {
            return Err(AppError::Geo("boundary ring needs at least 3 points".into()));
        }
        if ring.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
            return Err(AppError::Geo("boundary ring has non-finite coordinates".into()));
        }
        Ok(Self {
            polygon: Polygon::new(LineString::from(ring), Vec::new()),
        })
    }

    pub fn load(path: &Path) -> AppResult<Self> {
        let contents = fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&contents)?;
        let boundary = Self::from_geojson(&value)?;
        info!(
            path = %path.display(),
            points = boundary.polygon.exterior().0.len(),
            "loaded boundary polygon"
        );
        Ok(boundary)
    }

    /// Accepts a FeatureCollection, Feature or bare geometry. The first
    /// Polygon/MultiPolygon wins; for a MultiPolygon the largest part is used.
    pub fn from_geojson(value: &Value) -> AppResult<Self> {
        match value.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => value
                .get("features")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .find_map(|feature| Self::from_geojson(feature).ok())
                .ok_or_else(|| AppError::Geo("no polygon feature in collection".into())),
            Some("Feature") => value
                .get("geometry")
                .ok_or_else(|| AppError::Geo("feature has no geometry".into()))
                .and_then(Self::from_geojson),
            Some("Polygon") => {
                let rings = value
                    .get("coordinates")
                    .and_then(Value::as_array)
                    .ok_or_else(|| AppError::Geo("polygon missing coordinates".into()))?;
                let outer = rings
                    .first()
                    .ok_or_else(|| AppError::Geo("polygon has no rings".into()))?;
                Self::new(parse_ring(outer)?)
            }
            Some("MultiPolygon") => {
                let polygons = value
                    .get("coordinates")
                    .and_then(Value::as_array)
                    .ok_or_else(|| AppError::Geo("multipolygon missing coordinates".into()))?;
                let mut best: Option<Boundary> = None;
                for polygon in polygons {
                    let Some(outer) = polygon.as_array().and_then(|rings| rings.first()) else {
                        continue;
                    };
                    let candidate = Self::new(parse_ring(outer)?)?;
                    if best
                        .as_ref()
                        .map(|b| candidate.area() > b.area())
                        .unwrap_or(true)
                    {
                        best = Some(candidate);
                    }
                }
                best.ok_or_else(|| AppError::Geo("multipolygon has no parts".into()))
            }
            other => Err(AppError::Geo(format!(
                "unsupported GeoJSON type: {}",
                other.unwrap_or("<missing>")
            ))),
        }
    }

    /// Planar area in square degrees.
    pub fn area(&self) -> f64 {
        self.polygon.unsigned_area()
    }

    /// Strictly inside the ring; points on an edge are not contained.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        self.polygon.contains(&Point::new(lon, lat))
    }

    /// True when the cell rectangle shares any point with the polygon,
    /// including an edge or corner it only touches.
    pub fn overlaps(&self, cell: &Cell) -> bool {
        let rect = Rect::new(
            (cell.lon_low, cell.lat_low),
            (cell.lon_high, cell.lat_high),
        );
        self.polygon.intersects(&rect.to_polygon())
    }

    /// Keeps grid order; logs how many cells were dropped.
    pub fn filter_cells(&self, cells: Vec<Cell>) -> Vec<Cell> {
        let total = cells.len();
        let kept: Vec<Cell> = cells.into_iter().filter(|cell| self.overlaps(cell)).collect();
        info!(kept = kept.len(), total, "filtered grid cells by boundary");
        kept
    }
}

fn parse_ring(value: &Value) -> AppResult<Vec<(f64, f64)>> {
    let points = value
        .as_array()
        .ok_or_else(|| AppError::Geo("ring is not an array".into()))?;
    points
        .iter()
        .map(|point| {
            let pair = point.as_array();
            let lon = pair.and_then(|p| p.first()).and_then(Value::as_f64);
            let lat = pair.and_then(|p| p.get(1)).and_then(Value::as_f64);
            match (lon, lat) {
                (Some(lon), Some(lat)) => Ok((lon, lat)),
                _ => Err(AppError::Geo(format!("invalid position: {point}"))),
            }
        })
        .collect()
}
