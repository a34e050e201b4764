pub mod errors;
pub mod geometry;
pub mod model;
pub mod xml;

/// MIME type shared by LoST requests and responses.
pub const MIME_TYPE: &str = "application/lost+xml";

pub const LOST_NAMESPACE: &str = "urn:ietf:params:xml:ns:lost1";
pub const GML_NAMESPACE: &str = "http://www.opengis.net/gml";
pub const XML_NAMESPACE: &str = "http://www.w3.org/XML/1998/namespace";

/// The only spatial reference system accepted on the wire. GML coordinate
/// order under this SRS is `lat lon`; PostGIS WKT order is `lon lat`.
pub const SRS_URN: &str = "urn:ogc:def:crs:EPSG::4326";

/// Marker stored in `mapping.srv` for rows whose `attrs.uri` points at
/// another LoST server rather than a service provider.
pub const PEER_SERVICE: &str = "lost";
