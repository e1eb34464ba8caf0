//! Minimal GeoJSON model for loading static reference data.
//!
//! Only the geometry types the reference data uses are modelled; anything
//! else deserializes to [`Geometry::Unsupported`] and is skipped by loaders.

use geo::{Coord, LineString, MultiLineString, MultiPolygon, Polygon};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::error::{Result, UnveilError};

#[derive(Debug, Deserialize)]
pub(crate) struct FeatureCollection {
    pub features: Vec<Feature>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Feature {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
    #[serde(default)]
    pub geometry: Option<Geometry>,
}

type Position = Vec<f64>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub(crate) enum Geometry {
    LineString { coordinates: Vec<Position> },
    MultiLineString { coordinates: Vec<Vec<Position>> },
    Polygon { coordinates: Vec<Vec<Position>> },
    MultiPolygon { coordinates: Vec<Vec<Vec<Position>>> },
    #[serde(other)]
    Unsupported,
}

impl Feature {
    /// First present string property among `keys`.
    pub fn string_property(&self, keys: &[&str]) -> Option<String> {
        let props = self.properties.as_ref()?;
        keys.iter().find_map(|key| match props.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
    }

    pub fn number_property(&self, keys: &[&str]) -> Option<f64> {
        let props = self.properties.as_ref()?;
        keys.iter().find_map(|key| match props.get(*key) {
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => s.parse().ok(),
            _ => None,
        })
    }

    /// Feature-level id, falling back to an `id` property.
    pub fn identifier(&self) -> Option<String> {
        match &self.id {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => self.string_property(&["id"]),
        }
    }
}

pub(crate) fn parse_feature_collection(json: &str) -> Result<FeatureCollection> {
    Ok(serde_json::from_str(json)?)
}

fn coord(position: &[f64]) -> Result<Coord<f64>> {
    match position {
        [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Coord { x: *x, y: *y }),
        _ => Err(UnveilError::reference(format!("invalid position {:?}", position))),
    }
}

fn line(positions: &[Position]) -> Result<LineString<f64>> {
    positions
        .iter()
        .map(|p| coord(p))
        .collect::<Result<Vec<_>>>()
        .map(LineString::new)
}

fn polygon(rings: &[Vec<Position>]) -> Result<Polygon<f64>> {
    let mut rings = rings.iter().map(|r| line(r));
    let exterior = rings
        .next()
        .ok_or_else(|| UnveilError::reference("polygon without exterior ring"))??;
    let interiors = rings.collect::<Result<Vec<_>>>()?;
    Ok(Polygon::new(exterior, interiors))
}

impl Geometry {
    /// Polygonal geometry as a multi-polygon, `None` for other types.
    pub fn to_multi_polygon(&self) -> Option<Result<MultiPolygon<f64>>> {
        match self {
            Geometry::Polygon { coordinates } => {
                Some(polygon(coordinates).map(|p| MultiPolygon::new(vec![p])))
            }
            Geometry::MultiPolygon { coordinates } => Some(
                coordinates
                    .iter()
                    .map(|rings| polygon(rings))
                    .collect::<Result<Vec<_>>>()
                    .map(MultiPolygon::new),
            ),
            _ => None,
        }
    }

    /// Lineal geometry as a multi-line-string, `None` for other types.
    pub fn to_multi_line_string(&self) -> Option<Result<MultiLineString<f64>>> {
        match self {
            Geometry::LineString { coordinates } => {
                Some(line(coordinates).map(|l| MultiLineString::new(vec![l])))
            }
            Geometry::MultiLineString { coordinates } => Some(
                coordinates
                    .iter()
                    .map(|l| line(l))
                    .collect::<Result<Vec<_>>>()
                    .map(MultiLineString::new),
            ),
            _ => None,
        }
    }
}

/// Encode a geographic multi-polygon (`x = lng`, `y = lat`) as a GeoJSON geometry.
pub fn multi_polygon_to_geojson(geometry: &MultiPolygon<f64>) -> Value {
    let ring = |ls: &LineString<f64>| -> Vec<[f64; 2]> { ls.coords().map(|c| [c.x, c.y]).collect() };
    let polygons: Vec<Vec<Vec<[f64; 2]>>> = geometry
        .0
        .iter()
        .map(|p| {
            std::iter::once(p.exterior())
                .chain(p.interiors())
                .map(ring)
                .collect()
        })
        .collect();
    json!({ "type": "MultiPolygon", "coordinates": polygons })
}
