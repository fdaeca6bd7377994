//! Static route geometry, fetched once per race and never mutated.

use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RouteError {
    #[error("Failed to read route file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Route is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Unsupported route geometry: {0}")]
    Unsupported(String),
    #[error("Invalid coordinate at index {index}")]
    InvalidCoordinate { index: usize },
}

/// Axis-aligned bounds in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bounds {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

/// Ordered `(lng, lat)` pairs describing the course line.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouteGeometry {
    coordinates: Vec<[f64; 2]>,
}

impl RouteGeometry {
    pub fn new(coordinates: Vec<[f64; 2]>) -> Self {
        Self { coordinates }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Parse a bare `[[lng, lat], …]` array, a GeoJSON `LineString`, or a
    /// `Feature`/`FeatureCollection` whose first line geometry is used.
    pub fn from_json(text: &str) -> Result<Self, RouteError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Load from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RouteError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn from_value(value: &Value) -> Result<Self, RouteError> {
        match value {
            Value::Array(points) => parse_coordinates(points),
            Value::Object(map) => match map.get("type").and_then(Value::as_str) {
                Some("LineString") => match map.get("coordinates") {
                    Some(Value::Array(points)) => parse_coordinates(points),
                    _ => Err(RouteError::Unsupported("LineString without coordinates".into())),
                },
                Some("Feature") => map
                    .get("geometry")
                    .ok_or_else(|| RouteError::Unsupported("Feature without geometry".into()))
                    .and_then(Self::from_value),
                Some("FeatureCollection") => map
                    .get("features")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .find_map(|feature| Self::from_value(feature).ok())
                    .ok_or_else(|| RouteError::Unsupported("no LineString feature".into())),
                Some(other) => Err(RouteError::Unsupported(other.to_string())),
                None => Err(RouteError::Unsupported("object without type".into())),
            },
            other => Err(RouteError::Unsupported(format!("{other}"))),
        }
    }

    pub fn coordinates(&self) -> &[[f64; 2]] {
        &self.coordinates
    }

    pub fn len(&self) -> usize {
        self.coordinates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.coordinates.is_empty()
    }

    pub fn bounds(&self) -> Option<Bounds> {
        let (first, rest) = self.coordinates.split_first()?;
        let init = Bounds {
            min_lng: first[0],
            min_lat: first[1],
            max_lng: first[0],
            max_lat: first[1],
        };
        Some(rest.iter().fold(init, |b, [lng, lat]| Bounds {
            min_lng: b.min_lng.min(*lng),
            min_lat: b.min_lat.min(*lat),
            max_lng: b.max_lng.max(*lng),
            max_lat: b.max_lat.max(*lat),
        }))
    }

    /// GeoJSON `LineString` geometry.
    pub fn to_geojson(&self) -> Value {
        serde_json::json!({
            "type": "LineString",
            "coordinates": self.coordinates,
        })
    }
}

fn parse_coordinates(points: &[Value]) -> Result<RouteGeometry, RouteError> {
    points
        .iter()
        .enumerate()
        .map(|(index, point)| {
            let pair = point.as_array().filter(|p| p.len() >= 2);
            let lng = pair.and_then(|p| p[0].as_f64());
            let lat = pair.and_then(|p| p[1].as_f64());
            match (lng, lat) {
                (Some(lng), Some(lat))
                    if (-180.0..=180.0).contains(&lng) && (-90.0..=90.0).contains(&lat) =>
                {
                    Ok([lng, lat])
                }
                _ => Err(RouteError::InvalidCoordinate { index }),
            }
        })
        .collect::<Result<Vec<_>, _>>()
        .map(RouteGeometry::new)
}
