//! Translation between wire geometries (GML, GeoJSON) and the store-native
//! forms handed to PostGIS.
//!
//! Coordinate order differs across the boundary: GML under
//! `urn:ogc:def:crs:EPSG::4326` is `lat lon`, while GeoJSON and PostGIS WKT
//! are `lon lat`. Every conversion in this module performs the swap.

use geojson::GeoJson;

use crate::errors::LostError;
use crate::xml::Element;
use crate::{GML_NAMESPACE, SRS_URN};

/// A request geometry, validated and ready for a spatial predicate.
///
/// Points become WKT for `ST_GeomFromText`; polygons and multi-polygons are
/// carried as GML fragments (prefix preserved) for `ST_GeomFromGML`.
#[derive(Debug, Clone, PartialEq)]
pub enum LocationGeometry {
    Point { lat: f64, lon: f64 },
    Region(Element),
}

impl LocationGeometry {
    /// Extract and validate the geometry of a `location` or `interest`
    /// element.
    pub fn from_location(location: &Element) -> Result<Self, LostError> {
        if location.children.len() != 1 {
            return Err(LostError::BadRequest(
                "Location must contain exactly one geometry".to_string(),
            ));
        }
        let geometry = &location.children[0];
        if geometry.ns.as_deref() != Some(GML_NAMESPACE) {
            return Err(LostError::BadRequest(format!(
                "Geometry element \"{}\" is not in the GML namespace",
                geometry.name
            )));
        }
        match geometry.get_attr("srsName") {
            Some(srs) if srs == SRS_URN => {}
            Some(srs) => {
                return Err(LostError::SrsInvalid(format!(
                    "Unsupported SRS \"{}\"",
                    srs
                )))
            }
            None => {
                return Err(LostError::SrsInvalid(
                    "Missing srsName attribute on geometry".to_string(),
                ))
            }
        }

        match geometry.name.as_str() {
            "Point" => {
                let (lat, lon) = parse_pos(geometry)?;
                if !(-90.0..=90.0).contains(&lat) {
                    return Err(LostError::LocationInvalid(format!(
                        "Latitude {} is outside [-90, 90]",
                        lat
                    )));
                }
                if !(-180.0..=180.0).contains(&lon) {
                    return Err(LostError::LocationInvalid(format!(
                        "Longitude {} is outside [-180, 180]",
                        lon
                    )));
                }
                Ok(LocationGeometry::Point { lat, lon })
            }
            "Polygon" | "MultiPolygon" => Ok(LocationGeometry::Region(geometry.clone())),
            other => Err(LostError::GeometryNotImplemented(format!(
                "Geometry type \"{}\" is not implemented",
                other
            ))),
        }
    }

    /// SQL expression converting the bound parameter into a geometry.
    pub fn sql_expr(&self, placeholder: &str) -> String {
        match self {
            LocationGeometry::Point { .. } => {
                format!("ST_GeomFromText({}, 4326)", placeholder)
            }
            LocationGeometry::Region(_) => format!("ST_GeomFromGML({})", placeholder),
        }
    }

    /// The parameter value matching [`LocationGeometry::sql_expr`].
    pub fn sql_param(&self) -> String {
        match self {
            LocationGeometry::Point { lat, lon } => format!("POINT({} {})", lon, lat),
            LocationGeometry::Region(geometry) => geometry.to_fragment(),
        }
    }
}

/// Build a `gml:Point` for the given WGS-84 coordinates.
pub fn gml_point(lat: f64, lon: f64) -> Element {
    Element::new(GML_NAMESPACE, "Point")
        .attr("srsName", SRS_URN)
        .child(Element::new(GML_NAMESPACE, "pos").with_text(&format!("{} {}", lat, lon)))
}

fn parse_pos(point: &Element) -> Result<(f64, f64), LostError> {
    let pos = point
        .find(GML_NAMESPACE, "pos")
        .ok_or_else(|| LostError::BadRequest("Missing gml:pos in gml:Point".to_string()))?;
    let coords: Vec<&str> = pos.text.split_whitespace().collect();
    if coords.len() != 2 {
        return Err(LostError::BadRequest(format!(
            "Expected two coordinates in gml:pos, found {}",
            coords.len()
        )));
    }
    let lat = coords[0]
        .parse::<f64>()
        .map_err(|_| LostError::BadRequest(format!("Invalid latitude \"{}\"", coords[0])))?;
    let lon = coords[1]
        .parse::<f64>()
        .map_err(|_| LostError::BadRequest(format!("Invalid longitude \"{}\"", coords[1])))?;
    Ok((lat, lon))
}

/// Convert a GeoJSON object to a GML geometry element.
///
/// A FeatureCollection contributes its first Feature, a Feature its
/// geometry. Only Point, Polygon and MultiPolygon are supported, matching
/// the request path.
pub fn gml_from_geojson(input: &GeoJson) -> Result<Element, LostError> {
    let value = match input {
        GeoJson::Geometry(geometry) => &geometry.value,
        GeoJson::Feature(feature) => feature_value(feature)?,
        GeoJson::FeatureCollection(collection) => {
            let feature = collection.features.first().ok_or_else(|| {
                LostError::BadRequest("FeatureCollection contains no features".to_string())
            })?;
            feature_value(feature)?
        }
    };
    gml_from_value(value)
}

fn feature_value(feature: &geojson::Feature) -> Result<&geojson::Value, LostError> {
    feature
        .geometry
        .as_ref()
        .map(|g| &g.value)
        .ok_or_else(|| LostError::BadRequest("Feature has no geometry".to_string()))
}

pub fn gml_from_value(value: &geojson::Value) -> Result<Element, LostError> {
    let element = match value {
        geojson::Value::Point(coordinates) => Element::new(GML_NAMESPACE, "Point")
            .child(Element::new(GML_NAMESPACE, "pos").with_text(&swapped_pair(coordinates)?)),
        geojson::Value::Polygon(rings) => polygon_element(rings)?,
        geojson::Value::MultiPolygon(polygons) => {
            let mut multi = Element::new(GML_NAMESPACE, "MultiPolygon");
            for polygon in polygons {
                multi = multi
                    .child(Element::new(GML_NAMESPACE, "polygonMember").child(polygon_element(polygon)?));
            }
            multi
        }
        other => {
            let name = match other {
                geojson::Value::MultiPoint(_) => "MultiPoint",
                geojson::Value::LineString(_) => "LineString",
                geojson::Value::MultiLineString(_) => "MultiLineString",
                geojson::Value::GeometryCollection(_) => "GeometryCollection",
                _ => "unknown",
            };
            return Err(LostError::GeometryNotImplemented(format!(
                "GeoJSON geometry \"{}\" is not implemented",
                name
            )));
        }
    };
    Ok(element.attr("srsName", SRS_URN))
}

fn polygon_element(rings: &[Vec<Vec<f64>>]) -> Result<Element, LostError> {
    let exterior = rings
        .first()
        .ok_or_else(|| LostError::BadRequest("Polygon has no exterior ring".to_string()))?;
    let mut polygon = Element::new(GML_NAMESPACE, "Polygon")
        .child(Element::new(GML_NAMESPACE, "exterior").child(linear_ring(exterior)?));
    for interior in &rings[1..] {
        polygon =
            polygon.child(Element::new(GML_NAMESPACE, "interior").child(linear_ring(interior)?));
    }
    Ok(polygon)
}

fn linear_ring(ring: &[Vec<f64>]) -> Result<Element, LostError> {
    let mut positions = Vec::with_capacity(ring.len());
    for coordinates in ring {
        positions.push(swapped_pair(coordinates)?);
    }
    Ok(Element::new(GML_NAMESPACE, "LinearRing")
        .child(Element::new(GML_NAMESPACE, "posList").with_text(&positions.join(" "))))
}

fn swapped_pair(coordinates: &[f64]) -> Result<String, LostError> {
    if coordinates.len() < 2 {
        return Err(LostError::BadRequest(
            "Coordinate with fewer than two values".to_string(),
        ));
    }
    Ok(format!("{} {}", coordinates[1], coordinates[0]))
}

/// Convert a GML geometry element back to a GeoJSON value, swapping the
/// axis order back to `lon lat`.
pub fn geojson_from_gml(geometry: &Element) -> Result<geojson::Value, LostError> {
    match geometry.name.as_str() {
        "Point" => {
            let (lat, lon) = parse_pos(geometry)?;
            Ok(geojson::Value::Point(vec![lon, lat]))
        }
        "Polygon" => Ok(geojson::Value::Polygon(polygon_rings(geometry)?)),
        "MultiPolygon" => {
            let mut polygons = Vec::new();
            for member in geometry.find_all(GML_NAMESPACE, "polygonMember") {
                let polygon = member.find(GML_NAMESPACE, "Polygon").ok_or_else(|| {
                    LostError::BadRequest("polygonMember without gml:Polygon".to_string())
                })?;
                polygons.push(polygon_rings(polygon)?);
            }
            Ok(geojson::Value::MultiPolygon(polygons))
        }
        other => Err(LostError::GeometryNotImplemented(format!(
            "Geometry type \"{}\" is not implemented",
            other
        ))),
    }
}

fn polygon_rings(polygon: &Element) -> Result<Vec<Vec<Vec<f64>>>, LostError> {
    let mut rings = Vec::new();
    for boundary in ["exterior", "interior"] {
        for ring in polygon.find_all(GML_NAMESPACE, boundary) {
            let linear_ring = ring.find(GML_NAMESPACE, "LinearRing").ok_or_else(|| {
                LostError::BadRequest(format!("gml:{} without gml:LinearRing", boundary))
            })?;
            let pos_list = linear_ring.find(GML_NAMESPACE, "posList").ok_or_else(|| {
                LostError::BadRequest("gml:LinearRing without gml:posList".to_string())
            })?;
            rings.push(parse_pos_list(&pos_list.text)?);
        }
    }
    if rings.is_empty() {
        return Err(LostError::BadRequest(
            "Polygon has no exterior ring".to_string(),
        ));
    }
    Ok(rings)
}

fn parse_pos_list(text: &str) -> Result<Vec<Vec<f64>>, LostError> {
    let mut numbers = Vec::new();
    for token in text.split_whitespace() {
        numbers.push(token.parse::<f64>().map_err(|_| {
            LostError::BadRequest(format!("Invalid coordinate \"{}\" in gml:posList", token))
        })?);
    }
    if numbers.len() < 2 || numbers.len() % 2 != 0 {
        return Err(LostError::BadRequest(format!(
            "gml:posList holds {} values, expected an even number",
            numbers.len()
        )));
    }
    Ok(numbers.chunks(2).map(|pair| vec![pair[1], pair[0]]).collect())
}
