//! # Tract Boundaries
//!
//! Loads a GeoJSON `FeatureCollection` of census tract polygons and answers
//! "which tract contains this coordinate?".
//!
//! - Query points are built as `(x = longitude, y = latitude)`; callers pass
//!   `(lat, lng)` as geocoders report them. See [`query_point`].
//! - Resolution is a linear scan in file order. The first tract whose
//!   interior *or boundary* contains the point wins; overlaps are not
//!   reported. Cost is O(polygons) per lookup, fine for one state's ~1,500
//!   tracts; a bounding-box check skips most polygons cheaply.
//! - A point outside every tract resolves to `None`. That is a normal
//!   outcome, logged for coverage auditing.

use std::path::{Path, PathBuf};

use geo::{BoundingRect, Coord, Intersects, LineString, MultiPolygon, Point, Polygon, Rect};
use metrics::counter;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::error::{PipelineError, Result};

pub const ENV_BOUNDARY_PATH: &str = "CENSUS_TRACT_BOUNDARY_PATH";
pub const DEFAULT_BOUNDARY_PATH: &str = "data/geojsons/Washington_2016.geojson";

pub const PROP_GEOID: &str = "GEOID";
pub const PROP_STATE_FIPS: &str = "STATEFP";
pub const PROP_COUNTY_FIPS: &str = "COUNTYFP";
pub const PROP_NAME: &str = "NAME";

/// Geometric query point for a geocoder coordinate.
pub fn query_point(lat: f64, lng: f64) -> Point<f64> {
    Point::new(lng, lat)
}

/// One tract: immutable shape plus its feature properties.
#[derive(Debug, Clone)]
pub struct TractPolygon {
    geoid: String,
    properties: Map<String, Value>,
    shape: MultiPolygon<f64>,
    bbox: Option<Rect<f64>>,
}

impl TractPolygon {
    pub fn new(geoid: impl Into<String>, properties: Map<String, Value>, shape: MultiPolygon<f64>) -> Self {
        let bbox = shape.bounding_rect();
        Self {
            geoid: geoid.into(),
            properties,
            shape,
            bbox,
        }
    }

    pub fn geoid(&self) -> &str {
        &self.geoid
    }

    pub fn state_fips(&self) -> Option<&str> {
        self.properties.get(PROP_STATE_FIPS).and_then(Value::as_str)
    }

    pub fn county_fips(&self) -> Option<&str> {
        self.properties.get(PROP_COUNTY_FIPS).and_then(Value::as_str)
    }

    pub fn name(&self) -> Option<&str> {
        self.properties.get(PROP_NAME).and_then(Value::as_str)
    }

    pub fn properties(&self) -> &Map<String, Value> {
        &self.properties
    }

    pub fn shape(&self) -> &MultiPolygon<f64> {
        &self.shape
    }

    /// Interior or boundary.
    pub fn contains(&self, point: &Point<f64>) -> bool {
        if let Some(bbox) = self.bbox {
            if !point.intersects(&bbox) {
                return false;
            }
        }
        self.shape.0.iter().any(|poly| point.intersects(poly))
    }
}

#[derive(Debug, Clone, Default)]
pub struct BoundaryIndex {
    tracts: Vec<TractPolygon>,
}

impl BoundaryIndex {
    pub fn from_tracts(tracts: Vec<TractPolygon>) -> Self {
        Self { tracts }
    }

    /// Read and parse a boundary file. Any malformed feature fails the load.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| PipelineError::BoundaryLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let index = Self::parse(&raw).map_err(|reason| PipelineError::BoundaryLoad {
            path: path.to_path_buf(),
            reason,
        })?;
        info!(target: "boundary", tracts = index.len(), path = %path.display(), "boundaries loaded");
        Ok(index)
    }

    pub fn from_geojson_str(raw: &str) -> Result<Self> {
        Self::parse(raw).map_err(|reason| PipelineError::BoundaryLoad {
            path: PathBuf::from("<inline>"),
            reason,
        })
    }

    fn parse(raw: &str) -> std::result::Result<Self, String> {
        let fc: RawFeatureCollection =
            serde_json::from_str(raw).map_err(|e| format!("invalid GeoJSON: {e}"))?;
        if fc.kind != "FeatureCollection" {
            return Err(format!("expected a FeatureCollection, found '{}'", fc.kind));
        }

        let mut tracts = Vec::with_capacity(fc.features.len());
        for (i, feature) in fc.features.into_iter().enumerate() {
            let properties = feature.properties.unwrap_or_default();
            let geoid = match properties.get(PROP_GEOID) {
                Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => return Err(format!("feature {i} has no {PROP_GEOID} property")),
            };
            let geometry = feature
                .geometry
                .ok_or_else(|| format!("feature {i} ({geoid}) has no geometry"))?;
            let shape = geometry
                .into_multi_polygon()
                .map_err(|e| format!("feature {i} ({geoid}): {e}"))?;
            tracts.push(TractPolygon::new(geoid, properties, shape));
        }
        Ok(Self { tracts })
    }

    pub fn len(&self) -> usize {
        self.tracts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracts.is_empty()
    }

    pub fn tracts(&self) -> &[TractPolygon] {
        &self.tracts
    }

    /// First tract in file order containing `(lat, lng)`.
    pub fn locate(&self, lat: f64, lng: f64) -> Option<&TractPolygon> {
        let point = query_point(lat, lng);
        self.tracts.iter().find(|t| t.contains(&point))
    }

    /// GEOID of the tract containing `(lat, lng)`.
    pub fn resolve(&self, lat: f64, lng: f64) -> Option<&str> {
        match self.locate(lat, lng) {
            Some(t) => Some(t.geoid()),
            None => {
                warn!(target: "boundary", lat, lng, "failed to find tract for coordinate");
                counter!("tract_polygon_misses_total").increment(1);
                None
            }
        }
    }
}

// --- GeoJSON wire format ---

#[derive(Debug, Deserialize)]
struct RawFeatureCollection {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    features: Vec<RawFeature>,
}

#[derive(Debug, Deserialize)]
struct RawFeature {
    geometry: Option<RawGeometry>,
    #[serde(default)]
    properties: Option<Map<String, Value>>,
}

type RawRing = Vec<Vec<f64>>;

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum RawGeometry {
    Polygon { coordinates: Vec<RawRing> },
    MultiPolygon { coordinates: Vec<Vec<RawRing>> },
}

impl RawGeometry {
    fn into_multi_polygon(self) -> std::result::Result<MultiPolygon<f64>, String> {
        let polys = match self {
            RawGeometry::Polygon { coordinates } => vec![polygon(coordinates)?],
            RawGeometry::MultiPolygon { coordinates } => coordinates
                .into_iter()
                .map(polygon)
                .collect::<std::result::Result<Vec<_>, _>>()?,
        };
        if polys.is_empty() {
            return Err("geometry has no polygons".into());
        }
        Ok(MultiPolygon::new(polys))
    }
}

fn polygon(rings: Vec<RawRing>) -> std::result::Result<Polygon<f64>, String> {
    let mut rings = rings.into_iter().map(ring);
    let exterior = rings.next().ok_or("polygon has no exterior ring")??;
    let interiors = rings.collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Polygon::new(exterior, interiors))
}

fn ring(positions: RawRing) -> std::result::Result<LineString<f64>, String> {
    if positions.len() < 4 {
        return Err(format!("ring has {} positions; at least 4 required", positions.len()));
    }
    positions
        .into_iter()
        .map(|p| match p.as_slice() {
            // GeoJSON positions are [longitude, latitude, (altitude)]
            [x, y, ..] if x.is_finite() && y.is_finite() => Ok(Coord { x: *x, y: *y }),
            _ => Err(format!("invalid position {p:?}")),
        })
        .collect::<std::result::Result<Vec<_>, _>>()
        .map(LineString::new)
}
