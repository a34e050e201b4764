//! Typed request and response documents.
//!
//! Incoming documents are parsed into tagged variants instead of navigating
//! the element tree at every use site; outgoing documents are assembled from
//! small builders so that the server and the client share one wire format.

use crate::errors::LostError;
use crate::xml::{self, Element};
use crate::{GML_NAMESPACE, LOST_NAMESPACE};

/// Whether a mapping should carry its boundary inline or by reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryMode {
    Value,
    Reference,
}

impl BoundaryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BoundaryMode::Value => "value",
            BoundaryMode::Reference => "reference",
        }
    }

    fn from_attr(value: Option<&str>) -> BoundaryMode {
        match value {
            Some("reference") => BoundaryMode::Reference,
            _ => BoundaryMode::Value,
        }
    }
}

/// Common body of the location-bearing operations.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceQuery {
    pub service: Option<String>,
    pub profile: String,
    /// The `location` (or `interest`) element with its geometry children.
    pub location: Element,
    pub recursive: bool,
    pub boundary: BoundaryMode,
    /// `source` attributes of the request `<path>`, used for loop refusal.
    pub path: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    FindService(ServiceQuery),
    FindIntersect(ServiceQuery),
    GetServiceBoundary { key: String },
    ListServices { service: Option<String> },
    ListServicesByLocation(ServiceQuery),
}

impl Request {
    pub fn from_xml(root: &Element) -> Result<Request, LostError> {
        if root.ns.as_deref() != Some(LOST_NAMESPACE) {
            return Err(LostError::BadRequest(
                "Unsupported XML namespace".to_string(),
            ));
        }
        match root.name.as_str() {
            "findService" => Ok(Request::FindService(ServiceQuery::from_xml(root)?)),
            "findIntersect" => Ok(Request::FindIntersect(ServiceQuery::from_xml(root)?)),
            "getServiceBoundary" => match root.get_attr("key") {
                Some(key) if !key.is_empty() => Ok(Request::GetServiceBoundary {
                    key: key.to_string(),
                }),
                _ => Err(LostError::BadRequest(
                    "Missing key attribute on getServiceBoundary".to_string(),
                )),
            },
            "listServices" => Ok(Request::ListServices {
                service: child_text(root, "service"),
            }),
            "listServicesByLocation" => {
                Ok(Request::ListServicesByLocation(ServiceQuery::from_xml(root)?))
            }
            other => Err(LostError::BadRequest(format!(
                "Unsupported request type \"{}\"",
                other
            ))),
        }
    }

    /// The root element name this request serializes to.
    pub fn operation(&self) -> &'static str {
        match self {
            Request::FindService(_) => "findService",
            Request::FindIntersect(_) => "findIntersect",
            Request::GetServiceBoundary { .. } => "getServiceBoundary",
            Request::ListServices { .. } => "listServices",
            Request::ListServicesByLocation(_) => "listServicesByLocation",
        }
    }

    pub fn to_xml(&self) -> Element {
        match self {
            Request::FindService(query) | Request::FindIntersect(query) => {
                query.to_xml(self.operation())
            }
            Request::GetServiceBoundary { key } => {
                Element::new(LOST_NAMESPACE, "getServiceBoundary").attr("key", key)
            }
            Request::ListServices { service } => {
                let mut root = Element::new(LOST_NAMESPACE, "listServices");
                if let Some(service) = service {
                    root = root.child(Element::new(LOST_NAMESPACE, "service").with_text(service));
                }
                root
            }
            Request::ListServicesByLocation(query) => query.to_xml(self.operation()),
        }
    }
}

impl ServiceQuery {
    fn from_xml(root: &Element) -> Result<ServiceQuery, LostError> {
        let location = root
            .find(LOST_NAMESPACE, "interest")
            .or_else(|| root.find(LOST_NAMESPACE, "location"))
            .ok_or_else(|| LostError::BadRequest("Missing location element".to_string()))?;
        let profile = location
            .get_attr("profile")
            .ok_or_else(|| {
                LostError::BadRequest("Missing profile attribute on location".to_string())
            })?
            .to_string();

        Ok(ServiceQuery {
            service: child_text(root, "service"),
            profile,
            location: location.clone(),
            recursive: root.get_attr("recursive") == Some("true"),
            boundary: BoundaryMode::from_attr(root.get_attr("serviceBoundary")),
            path: request_path(root),
        })
    }

    fn to_xml(&self, operation: &str) -> Element {
        let mut root = Element::new(LOST_NAMESPACE, operation)
            .attr("recursive", if self.recursive { "true" } else { "false" })
            .attr("serviceBoundary", self.boundary.as_str())
            .child(self.location.clone());
        if let Some(service) = &self.service {
            root = root.child(Element::new(LOST_NAMESPACE, "service").with_text(service));
        }
        if !self.path.is_empty() {
            root = root.child(path_element(&self.path));
        }
        root
    }

    /// The service URN, mandatory for `findService` and `findIntersect`.
    pub fn required_service(&self) -> Result<&str, LostError> {
        self.service
            .as_deref()
            .ok_or_else(|| LostError::BadRequest("Missing service element".to_string()))
    }
}

fn child_text(root: &Element, name: &str) -> Option<String> {
    root.find(LOST_NAMESPACE, name).and_then(|child| {
        let text = child.text.trim();
        if text.is_empty() {
            None
        } else {
            Some(text.to_string())
        }
    })
}

fn request_path(root: &Element) -> Vec<String> {
    match root.find(LOST_NAMESPACE, "path") {
        Some(path) => path
            .find_all(LOST_NAMESPACE, "via")
            .filter_map(|via| via.get_attr("source"))
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    }
}

/// `<path><via source=…/>…</path>` from an ordered list of server ids.
pub fn path_element(entries: &[String]) -> Element {
    let mut path = Element::new(LOST_NAMESPACE, "path");
    for entry in entries {
        path = path.child(Element::new(LOST_NAMESPACE, "via").attr("source", entry));
    }
    path
}

/// The `source` entries of a response `<path>`, in order.
pub fn response_path(response: &Element) -> Vec<String> {
    request_path(response)
}

/// Prepend a `<via>` entry to the response path, creating the path when the
/// upstream answer carried none.
pub fn prepend_via(response: &mut Element, server_id: &str) {
    let via = Element::new(LOST_NAMESPACE, "via").attr("source", server_id);
    match response
        .children
        .iter_mut()
        .find(|child| child.is(LOST_NAMESPACE, "path"))
    {
        Some(path) => path.children.insert(0, via),
        None => response
            .children
            .push(Element::new(LOST_NAMESPACE, "path").child(via)),
    }
}

/// Boundary representation carried by a mapping element.
#[derive(Debug, Clone, PartialEq)]
pub enum Boundary {
    /// Inline `<serviceBoundary>` wrapping a parsed GML fragment.
    Value(Element),
    /// `<serviceBoundaryReference>` with an opaque key.
    Reference { key: String },
}

/// Everything needed to render one `<mapping>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct MappingData {
    pub source: String,
    pub source_id: String,
    pub last_updated: String,
    pub expires: String,
    pub service: String,
    pub display_name: Option<String>,
    pub uris: Vec<String>,
    pub boundary: Boundary,
}

impl MappingData {
    pub fn to_xml(&self) -> Element {
        let mut mapping = Element::new(LOST_NAMESPACE, "mapping")
            .attr("source", &self.source)
            .attr("sourceId", &self.source_id)
            .attr("lastUpdated", &self.last_updated)
            .attr("expires", &self.expires);

        if let Some(display_name) = &self.display_name {
            mapping = mapping.child(
                Element::new(LOST_NAMESPACE, "displayName")
                    .attr("xml:lang", "en")
                    .with_text(display_name),
            );
        }
        mapping = mapping.child(Element::new(LOST_NAMESPACE, "service").with_text(&self.service));
        mapping = match &self.boundary {
            Boundary::Value(boundary) => mapping.child(boundary.clone()),
            Boundary::Reference { key } => mapping.child(
                Element::new(LOST_NAMESPACE, "serviceBoundaryReference")
                    .attr("source", &self.source)
                    .attr("key", key),
            ),
        };
        for uri in &self.uris {
            mapping = mapping.child(Element::new(LOST_NAMESPACE, "uri").with_text(uri));
        }
        mapping
    }
}

/// Wrap `ST_AsGML` output into a `<serviceBoundary>` element.
///
/// `ST_AsGML` does not declare the `gml` namespace, so the fragment is parsed
/// inside a wrapper that declares it; the wrapper then becomes the boundary
/// element of the response.
pub fn service_boundary(gml: &str, profile: &str) -> Result<Element, LostError> {
    let wrapped = format!(
        "<serviceBoundary profile=\"{}\" xmlns:gml=\"{}\">{}</serviceBoundary>",
        profile, GML_NAMESPACE, gml
    );
    let mut boundary = xml::parse(&wrapped)
        .map_err(|e| LostError::InternalError(format!("Stored boundary is not valid GML: {}", e)))?;
    boundary.ns = Some(LOST_NAMESPACE.to_string());
    Ok(boundary)
}

pub fn find_service_response(mapping: &MappingData, path: &[String]) -> Element {
    Element::new(LOST_NAMESPACE, "findServiceResponse")
        .child(mapping.to_xml())
        .child(path_element(path))
}

pub fn find_intersect_response(mapping: &MappingData, path: &[String]) -> Element {
    Element::new(LOST_NAMESPACE, "findIntersectResponse")
        .child(mapping.to_xml())
        .child(path_element(path))
}

/// Aggregate container used when `findIntersect` matches several regions.
pub fn find_intersect_responses(children: Vec<Element>) -> Element {
    let mut root = Element::new(LOST_NAMESPACE, "findIntersectResponses");
    for child in children {
        root = root.child(child);
    }
    root
}

pub fn redirect(target: &str, source: &str, message: &str) -> Element {
    Element::new(LOST_NAMESPACE, "redirect")
        .attr("target", target)
        .attr("source", source)
        .attr("message", message)
}

pub fn get_service_boundary_response(boundary: Element, path: &[String]) -> Element {
    Element::new(LOST_NAMESPACE, "getServiceBoundaryResponse")
        .child(boundary)
        .child(path_element(path))
}

pub fn list_services_response(services: &[String], path: &[String]) -> Element {
    Element::new(LOST_NAMESPACE, "listServicesResponse")
        .child(Element::new(LOST_NAMESPACE, "serviceList").with_text(&services.join(" ")))
        .child(path_element(path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SRS_URN;

    fn find_service_doc(extra: &str) -> String {
        format!(
            r#"<findService xmlns="{}" xmlns:gml="{}" recursive="true" serviceBoundary="reference">
                 <location profile="geodetic-2d">
                   <gml:Point srsName="{}"><gml:pos>40.5 -73.5</gml:pos></gml:Point>
                 </location>
                 <service>urn:service:sos</service>
                 {}
               </findService>"#,
            LOST_NAMESPACE, GML_NAMESPACE, SRS_URN, extra
        )
    }

    #[test]
    fn parses_find_service() {
        let root = xml::parse(&find_service_doc("")).unwrap();
        let request = Request::from_xml(&root).unwrap();
        let query = match &request {
            Request::FindService(query) => query,
            other => panic!("expected findService, got {:?}", other),
        };
        assert_eq!(query.service.as_deref(), Some("urn:service:sos"));
        assert_eq!(query.profile, "geodetic-2d");
        assert!(query.recursive);
        assert_eq!(query.boundary, BoundaryMode::Reference);
        assert!(query.path.is_empty());
    }

    #[test]
    fn parses_the_request_path() {
        let doc = find_service_doc(
            r#"<path><via source="lost-root"/><via source="lost-us"/></path>"#,
        );
        let root = xml::parse(&doc).unwrap();
        match Request::from_xml(&root).unwrap() {
            Request::FindService(query) => {
                assert_eq!(query.path, vec!["lost-root", "lost-us"]);
            }
            other => panic!("expected findService, got {:?}", other),
        }
    }

    #[test]
    fn absent_modifiers_use_the_defaults() {
        let doc = format!(
            r#"<findIntersect xmlns="{}" xmlns:gml="{}">
                 <interest profile="geodetic-2d">
                   <gml:Point srsName="{}"><gml:pos>1 2</gml:pos></gml:Point>
                 </interest>
                 <service>urn:service:sos</service>
               </findIntersect>"#,
            LOST_NAMESPACE, GML_NAMESPACE, SRS_URN
        );
        let root = xml::parse(&doc).unwrap();
        match Request::from_xml(&root).unwrap() {
            Request::FindIntersect(query) => {
                assert!(!query.recursive);
                assert_eq!(query.boundary, BoundaryMode::Value);
                assert_eq!(query.location.name, "interest");
            }
            other => panic!("expected findIntersect, got {:?}", other),
        }
    }

    #[test]
    fn rejects_foreign_namespaces_and_unknown_operations() {
        let foreign = r#"<findService xmlns="urn:example:other"/>"#;
        let root = xml::parse(foreign).unwrap();
        assert!(matches!(
            Request::from_xml(&root),
            Err(LostError::BadRequest(_))
        ));

        let unknown = format!(r#"<findMapping xmlns="{}"/>"#, LOST_NAMESPACE);
        let root = xml::parse(&unknown).unwrap();
        match Request::from_xml(&root) {
            Err(LostError::BadRequest(message)) => {
                assert!(message.contains("findMapping"));
            }
            other => panic!("expected badRequest, got {:?}", other),
        }
    }

    #[test]
    fn requests_round_trip_through_serialization() {
        let root = xml::parse(&find_service_doc(
            r#"<path><via source="lost-root"/></path>"#,
        ))
        .unwrap();
        let request = Request::from_xml(&root).unwrap();
        let reparsed = xml::parse(&request.to_xml().to_xml()).unwrap();
        assert_eq!(Request::from_xml(&reparsed).unwrap(), request);
    }

    #[test]
    fn mapping_elements_carry_the_full_contract() {
        let boundary = service_boundary(
            r#"<gml:Polygon><gml:exterior><gml:LinearRing>
                 <gml:posList>40 -74 40 -73 41 -73 41 -74 40 -74</gml:posList>
               </gml:LinearRing></gml:exterior></gml:Polygon>"#,
            "geodetic-2d",
        )
        .unwrap();
        let mapping = MappingData {
            source: "lost-server".to_string(),
            source_id: "5ce1ae".to_string(),
            last_updated: "2026-07-01T00:00:00+00:00".to_string(),
            expires: "2026-07-02T00:00:00+00:00".to_string(),
            service: "urn:service:sos".to_string(),
            display_name: Some("New York".to_string()),
            uris: vec!["sip:psap@example".to_string(), "xmpp:psap@example".to_string()],
            boundary: Boundary::Value(boundary),
        };
        let response = find_service_response(&mapping, &["lost-server".to_string()]);

        let element = response.find(LOST_NAMESPACE, "mapping").unwrap();
        assert_eq!(element.get_attr("source"), Some("lost-server"));
        let uris: Vec<_> = element
            .find_all(LOST_NAMESPACE, "uri")
            .map(|uri| uri.text.as_str())
            .collect();
        assert_eq!(uris, vec!["sip:psap@example", "xmpp:psap@example"]);
        let boundary = element.find(LOST_NAMESPACE, "serviceBoundary").unwrap();
        assert!(boundary
            .find(GML_NAMESPACE, "Polygon")
            .is_some());
        assert_eq!(response_path(&response), vec!["lost-server"]);
    }

    #[test]
    fn reference_boundaries_carry_the_key() {
        let mapping = MappingData {
            source: "lost-server".to_string(),
            source_id: "id".to_string(),
            last_updated: "2026-07-01T00:00:00+00:00".to_string(),
            expires: "2026-07-02T00:00:00+00:00".to_string(),
            service: "urn:service:sos".to_string(),
            display_name: None,
            uris: vec!["sip:psap@example".to_string()],
            boundary: Boundary::Reference {
                key: "8f9a0b1c".to_string(),
            },
        };
        let element = mapping.to_xml();
        let reference = element
            .find(LOST_NAMESPACE, "serviceBoundaryReference")
            .unwrap();
        assert_eq!(reference.get_attr("key"), Some("8f9a0b1c"));
        assert!(element.find(LOST_NAMESPACE, "serviceBoundary").is_none());
    }

    #[test]
    fn prepending_a_via_builds_the_proxy_path() {
        let mapping = MappingData {
            source: "peer-ny".to_string(),
            source_id: "id".to_string(),
            last_updated: "2026-07-01T00:00:00+00:00".to_string(),
            expires: "2026-07-02T00:00:00+00:00".to_string(),
            service: "urn:service:sos".to_string(),
            display_name: None,
            uris: vec!["sip:psap@example".to_string()],
            boundary: Boundary::Reference { key: "k".to_string() },
        };
        let mut response = find_service_response(&mapping, &["peer-ny".to_string()]);
        prepend_via(&mut response, "lost-server");
        assert_eq!(response_path(&response), vec!["lost-server", "peer-ny"]);

        let mut bare = Element::new(LOST_NAMESPACE, "findServiceResponse");
        prepend_via(&mut bare, "lost-server");
        assert_eq!(response_path(&bare), vec!["lost-server"]);
    }

    #[test]
    fn redirects_carry_target_and_source() {
        let element = redirect("http://peer-ny:5000", "lost-server", "Not a leaf mapping");
        assert_eq!(element.get_attr("target"), Some("http://peer-ny:5000"));
        assert_eq!(element.get_attr("source"), Some("lost-server"));
        assert!(element.find(LOST_NAMESPACE, "path").is_none());
    }
}
