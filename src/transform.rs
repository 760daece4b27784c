use std::collections::HashMap;
use std::sync::LazyLock;

use geo::{Coord, Geometry, MultiPolygon, Point};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::{CountryCode, OsmType, RowKey};
use crate::geometry::{Feature, multipolygon_geojson, point_geojson, to_features};
use crate::overpass::elements;

static TRAILING_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)$").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundaryRow {
    pub country_code: CountryCode,
    pub admin_level: Option<u32>,
    pub osm_type: OsmType,
    pub osm_id: i64,
    pub name: String,
    pub tags: Map<String, Value>,
    pub geom_point: Value,
    pub geom_multipolygon: Value,
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub raw_element: Option<Value>,
}

impl BoundaryRow {
    pub fn key(&self) -> RowKey {
        RowKey {
            osm_type: self.osm_type,
            osm_id: self.osm_id,
        }
    }
}

/// Rows keyed by `(osm_type, osm_id)`. A later insert with the same key
/// replaces the earlier row in place, so output order is first-seen order.
#[derive(Debug, Clone, Default)]
pub struct RowSet {
    rows: Vec<BoundaryRow>,
    index: HashMap<RowKey, usize>,
}

impl RowSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, row: BoundaryRow) -> bool {
        let key = row.key();
        match self.index.get(&key) {
            Some(&position) => {
                self.rows[position] = row;
                true
            }
            None => {
                self.index.insert(key, self.rows.len());
                self.rows.push(row);
                false
            }
        }
    }

    pub fn merge<I>(&mut self, rows: I) -> usize
    where
        I: IntoIterator<Item = BoundaryRow>,
    {
        rows.into_iter()
            .map(|row| self.insert(row))
            .filter(|replaced| *replaced)
            .count()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[BoundaryRow] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<BoundaryRow> {
        self.rows
    }
}

pub fn to_rows(country: &CountryCode, level: u32, payload: &Value) -> Vec<BoundaryRow> {
    let raw_index = elements(payload)
        .iter()
        .filter_map(|element| {
            let kind = element.get("type")?.as_str()?;
            let id = element.get("id")?.as_i64()?;
            Some((format!("{kind}/{id}"), element))
        })
        .collect::<HashMap<_, _>>();

    let features = to_features(payload);
    let total = features.len();
    let mut rows = RowSet::new();
    for feature in features {
        if let Some(mut row) = feature_to_row(country, level, feature) {
            row.raw_element = raw_index.get(&row.key().to_string()).map(|value| (*value).clone());
            rows.insert(row);
        }
    }
    debug!(
        country = %country,
        level,
        features = total,
        rows = rows.len(),
        "transformed payload"
    );
    rows.into_rows()
}

fn feature_to_row(country: &CountryCode, level: u32, feature: Feature) -> Option<BoundaryRow> {
    let Feature {
        id: feature_id,
        geometry,
        properties,
    } = feature;
    let tags = properties
        .get("tags")
        .and_then(|value| value.as_object())
        .cloned()
        .unwrap_or_default();

    let name = tags
        .get("name")
        .and_then(|value| value.as_str())?
        .trim()
        .to_string();
    if name.is_empty() {
        return None;
    }
    if let Some(boundary) = tags.get("boundary") {
        if boundary.as_str() != Some("administrative") {
            return None;
        }
    }

    let multi = to_multipolygon(geometry?)?;
    let osm_id = resolve_id(&feature_id, &properties)?;
    let osm_type = match properties.get("type").and_then(|value| value.as_str()) {
        Some("way") => OsmType::Way,
        _ => OsmType::Relation,
    };
    let center = resolve_center(&properties, &multi)?;
    let admin_level = tags
        .get("admin_level")
        .and_then(|value| value.as_str())
        .and_then(|value| value.trim().parse::<u32>().ok())
        .or(Some(level));

    Some(BoundaryRow {
        country_code: country.clone(),
        admin_level,
        osm_type,
        osm_id,
        name,
        geom_point: point_geojson(&center),
        geom_multipolygon: multipolygon_geojson(&multi),
        tags,
        properties,
        raw_element: None,
    })
}

pub fn to_multipolygon(geometry: Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(polygon) => Some(MultiPolygon::new(vec![polygon])),
        Geometry::MultiPolygon(multi) if !multi.0.is_empty() => Some(multi),
        _ => None,
    }
}

fn resolve_id(feature_id: &str, properties: &Map<String, Value>) -> Option<i64> {
    if let Some(value) = properties.get("id") {
        if let Some(id) = value.as_i64() {
            return Some(id);
        }
        if let Some(id) = value.as_str().and_then(trailing_digits) {
            return Some(id);
        }
    }
    properties
        .get("@id")
        .and_then(|value| value.as_str())
        .and_then(trailing_digits)
        .or_else(|| trailing_digits(feature_id))
}

fn trailing_digits(value: &str) -> Option<i64> {
    TRAILING_DIGITS
        .captures(value.trim())
        .and_then(|caps| caps.get(1))
        .and_then(|digits| digits.as_str().parse().ok())
}

fn number(value: Option<&Value>) -> Option<f64> {
    let value = value?;
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|text| text.trim().parse().ok()))
}

fn resolve_center(properties: &Map<String, Value>, multi: &MultiPolygon<f64>) -> Option<Point<f64>> {
    if let Some(center) = properties.get("center") {
        let from_geojson = center
            .get("coordinates")
            .and_then(|coords| coords.as_array())
            .and_then(|coords| Some((number(coords.first())?, number(coords.get(1))?)));
        let from_object = || Some((number(center.get("lon"))?, number(center.get("lat"))?));
        if let Some((lon, lat)) = from_geojson.or_else(from_object) {
            return Some(Point::new(lon, lat));
        }
    }
    if let (Some(lon), Some(lat)) = (
        number(properties.get("center_lon")),
        number(properties.get("center_lat")),
    ) {
        return Some(Point::new(lon, lat));
    }
    ring_average(multi)
}

fn ring_average(multi: &MultiPolygon<f64>) -> Option<Point<f64>> {
    let ring = multi.0.first()?.exterior();
    if ring.0.is_empty() {
        return None;
    }
    let sum = ring.coords().fold(Coord { x: 0.0, y: 0.0 }, |acc, coord| Coord {
        x: acc.x + coord.x,
        y: acc.y + coord.y,
    });
    let count = ring.0.len() as f64;
    Some(Point::new(sum.x / count, sum.y / count))
}
