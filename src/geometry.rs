use geo::{Contains, Coord, Geometry, LineString, MultiLineString, MultiPolygon, Point, Polygon};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::overpass::elements;

#[derive(Debug, Clone)]
pub struct Feature {
    pub id: String,
    pub geometry: Option<Geometry<f64>>,
    pub properties: Map<String, Value>,
}

pub fn to_features(payload: &Value) -> Vec<Feature> {
    elements(payload).iter().filter_map(to_feature).collect()
}

fn to_feature(element: &Value) -> Option<Feature> {
    let kind = element.get("type")?.as_str()?;
    let id = element.get("id")?.as_i64()?;
    let geometry = match kind {
        "relation" => relation_geometry(element),
        "way" => way_geometry(element),
        "node" => coord_of(element).map(|coord| Geometry::Point(Point::from(coord))),
        _ => return None,
    };

    let mut properties = Map::new();
    properties.insert("type".to_string(), json!(kind));
    properties.insert("id".to_string(), json!(id));
    properties.insert(
        "tags".to_string(),
        element
            .get("tags")
            .cloned()
            .unwrap_or_else(|| Value::Object(Map::new())),
    );
    if let Some(center) = element.get("center").and_then(coord_of) {
        properties.insert("center".to_string(), point_geojson(&Point::from(center)));
    }
    if let Some(label) = label_member(element) {
        properties.insert("center_lon".to_string(), json!(label.x));
        properties.insert("center_lat".to_string(), json!(label.y));
    }

    Some(Feature {
        id: format!("{kind}/{id}"),
        geometry,
        properties,
    })
}

fn coord_of(value: &Value) -> Option<Coord<f64>> {
    let lon = value.get("lon")?.as_f64()?;
    let lat = value.get("lat")?.as_f64()?;
    Some(Coord { x: lon, y: lat })
}

fn vertex_list(value: &Value) -> Vec<Coord<f64>> {
    value
        .get("geometry")
        .and_then(|geometry| geometry.as_array())
        .map(|points| points.iter().filter_map(coord_of).collect())
        .unwrap_or_default()
}

fn label_member(element: &Value) -> Option<Coord<f64>> {
    let members = element.get("members")?.as_array()?;
    let by_role = |role: &str| {
        members
            .iter()
            .filter(|member| member.get("type").and_then(|v| v.as_str()) == Some("node"))
            .filter(|member| member.get("role").and_then(|v| v.as_str()) == Some(role))
            .find_map(coord_of)
    };
    by_role("label").or_else(|| by_role("admin_centre"))
}

fn way_geometry(element: &Value) -> Option<Geometry<f64>> {
    let coords = vertex_list(element);
    if coords.len() < 2 {
        return None;
    }
    let line = LineString::new(coords);
    if line.is_closed() && line.0.len() >= 4 {
        Some(Geometry::Polygon(Polygon::new(line, vec![])))
    } else {
        Some(Geometry::LineString(line))
    }
}

fn relation_geometry(element: &Value) -> Option<Geometry<f64>> {
    let members = element.get("members")?.as_array()?;
    let mut outer = Vec::new();
    let mut inner = Vec::new();
    for member in members {
        if member.get("type").and_then(|v| v.as_str()) != Some("way") {
            continue;
        }
        let coords = vertex_list(member);
        if coords.len() < 2 {
            continue;
        }
        match member.get("role").and_then(|v| v.as_str()).unwrap_or("") {
            "inner" => inner.push(coords),
            "outer" | "" => outer.push(coords),
            _ => {}
        }
    }

    let open_segments = outer.clone();
    let (outer_rings, closed) = stitch_rings(outer);
    if !closed {
        debug!(
            id = element.get("id").and_then(|v| v.as_i64()).unwrap_or_default(),
            "relation has outer members that do not close into a ring"
        );
    }
    let (inner_rings, _) = stitch_rings(inner);

    if outer_rings.is_empty() {
        if open_segments.is_empty() {
            return None;
        }
        let lines = open_segments.into_iter().map(LineString::new).collect();
        return Some(Geometry::MultiLineString(MultiLineString::new(lines)));
    }

    let shells = outer_rings
        .into_iter()
        .map(|ring| Polygon::new(ring, vec![]))
        .collect::<Vec<_>>();
    let mut polygons = shells.clone();
    for ring in inner_rings {
        let Some(probe) = ring.0.first().copied() else {
            continue;
        };
        if let Some(index) = shells.iter().position(|shell| shell.contains(&probe)) {
            polygons[index].interiors_push(ring);
        }
    }

    if polygons.len() == 1 {
        polygons.pop().map(Geometry::Polygon)
    } else {
        Some(Geometry::MultiPolygon(MultiPolygon::new(polygons)))
    }
}

/// Segments shorter than two vertices are ignored and mark the result incomplete.
pub fn stitch_rings(segments: Vec<Vec<Coord<f64>>>) -> (Vec<LineString<f64>>, bool) {
    let mut complete = true;
    let mut remaining = Vec::with_capacity(segments.len());
    for segment in segments {
        if segment.len() < 2 {
            complete = false;
        } else {
            remaining.push(segment);
        }
    }
    let mut rings = Vec::new();

    while !remaining.is_empty() {
        let mut ring = remaining.remove(0);
        loop {
            let (Some(&start), Some(&end)) = (ring.first(), ring.last()) else {
                break;
            };
            if start == end && ring.len() >= 4 {
                rings.push(LineString::new(ring));
                break;
            }
            let next = remaining.iter().position(|segment| {
                let (first, last) = (segment[0], segment[segment.len() - 1]);
                first == end || last == end || first == start || last == start
            });
            let Some(index) = next else {
                complete = false;
                break;
            };
            let mut segment = remaining.remove(index);
            let (first, last) = (segment[0], segment[segment.len() - 1]);
            if first == end {
                ring.extend(segment.into_iter().skip(1));
            } else if last == end {
                segment.reverse();
                ring.extend(segment.into_iter().skip(1));
            } else if last == start {
                segment.pop();
                segment.extend(ring);
                ring = segment;
            } else {
                segment.reverse();
                segment.pop();
                segment.extend(ring);
                ring = segment;
            }
        }
    }

    (rings, complete)
}

pub fn point_geojson(point: &Point<f64>) -> Value {
    json!({
        "type": "Point",
        "coordinates": [point.x(), point.y()],
    })
}

fn ring_coordinates(ring: &LineString<f64>) -> Value {
    Value::Array(ring.coords().map(|coord| json!([coord.x, coord.y])).collect())
}

pub fn multipolygon_geojson(multi: &MultiPolygon<f64>) -> Value {
    let polygons = multi
        .0
        .iter()
        .map(|polygon| {
            let mut rings = vec![ring_coordinates(polygon.exterior())];
            rings.extend(polygon.interiors().iter().map(ring_coordinates));
            Value::Array(rings)
        })
        .collect::<Vec<_>>();
    json!({
        "type": "MultiPolygon",
        "coordinates": polygons,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(x: f64, y: f64) -> Coord<f64> {
        Coord { x, y }
    }

    #[test]
    fn stitches_reversed_segments_into_one_ring() {
        let segments = vec![
            vec![c(0.0, 0.0), c(1.0, 0.0), c(1.0, 1.0)],
            vec![c(0.0, 0.0), c(0.0, 1.0), c(1.0, 1.0)],
        ];
        let (rings, complete) = stitch_rings(segments);
        assert!(complete);
        assert_eq!(rings.len(), 1);
        assert!(rings[0].is_closed());
        assert_eq!(rings[0].0.len(), 5);
    }

    #[test]
    fn open_segment_is_reported_incomplete() {
        let segments = vec![vec![c(0.0, 0.0), c(1.0, 0.0), c(1.0, 1.0)]];
        let (rings, complete) = stitch_rings(segments);
        assert!(rings.is_empty());
        assert!(!complete);
    }

    #[test]
    fn degenerate_segments_are_skipped() {
        let segments = vec![
            vec![],
            vec![c(5.0, 5.0)],
            vec![c(0.0, 0.0), c(1.0, 0.0), c(1.0, 1.0), c(0.0, 0.0)],
        ];
        let (rings, complete) = stitch_rings(segments);
        assert_eq!(rings.len(), 1);
        assert!(!complete);
    }

    #[test]
    fn closed_way_becomes_polygon() {
        let payload = json!({
            "elements": [{
                "type": "way",
                "id": 7,
                "tags": {"name": "Island"},
                "geometry": [
                    {"lat": 0.0, "lon": 0.0},
                    {"lat": 0.0, "lon": 1.0},
                    {"lat": 1.0, "lon": 1.0},
                    {"lat": 0.0, "lon": 0.0}
                ]
            }]
        });
        let features = to_features(&payload);
        assert_eq!(features.len(), 1);
        assert_eq!(features[0].id, "way/7");
        assert!(matches!(features[0].geometry, Some(Geometry::Polygon(_))));
    }

    #[test]
    fn inner_ring_becomes_hole() {
        let square = |min: f64, max: f64| {
            json!([
                {"lat": min, "lon": min},
                {"lat": min, "lon": max},
                {"lat": max, "lon": max},
                {"lat": max, "lon": min},
                {"lat": min, "lon": min}
            ])
        };
        let payload = json!({
            "elements": [{
                "type": "relation",
                "id": 1,
                "members": [
                    {"type": "way", "ref": 10, "role": "outer", "geometry": square(0.0, 10.0)},
                    {"type": "way", "ref": 11, "role": "inner", "geometry": square(4.0, 6.0)},
                    {"type": "node", "ref": 12, "role": "label", "lat": 5.0, "lon": 2.0}
                ],
                "tags": {"name": "Ring"}
            }]
        });
        let features = to_features(&payload);
        let Some(Geometry::Polygon(polygon)) = &features[0].geometry else {
            panic!("expected polygon");
        };
        assert_eq!(polygon.interiors().len(), 1);
        assert_eq!(features[0].properties["center_lon"], json!(2.0));
        assert_eq!(features[0].properties["center_lat"], json!(5.0));
    }

    #[test]
    fn multipolygon_serializes_lon_lat() {
        let ring = LineString::new(vec![c(1.0, 2.0), c(3.0, 2.0), c(3.0, 4.0), c(1.0, 2.0)]);
        let multi = MultiPolygon::new(vec![Polygon::new(ring, vec![])]);
        let value = multipolygon_geojson(&multi);
        assert_eq!(value["type"], "MultiPolygon");
        assert_eq!(value["coordinates"][0][0][0], json!([1.0, 2.0]));
    }
}
