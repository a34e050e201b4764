//! LoST client: builds query documents, validates responses, and drives the
//! redirect iteration on behalf of applications.
//!
//! The same exchange primitive, [`post_document`], is used by servers when
//! they proxy a recursive request to a peer.

use std::collections::HashSet;
use std::time::Duration;

use lost_protocol::errors::LostError;
use lost_protocol::model::{BoundaryMode, Request, ServiceQuery};
use lost_protocol::xml::{self, Element};
use lost_protocol::{LOST_NAMESPACE, MIME_TYPE};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_HOPS: usize = 8;

fn transport_error(e: reqwest::Error) -> LostError {
    if e.is_timeout() {
        LostError::ServerTimeout(format!("LoST request timed out: {}", e))
    } else {
        LostError::ServerError(format!("LoST request failed: {}", e))
    }
}

/// POST a document to a LoST server and validate the answer.
///
/// Checks the HTTP status, the content type, and the root namespace, and
/// lifts an `<errors>` body into the matching [`LostError`]. Redirects are
/// returned to the caller, not followed.
pub async fn post_document(
    http: &reqwest::Client,
    url: &str,
    doc: &Element,
) -> Result<Element, LostError> {
    let response = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, MIME_TYPE)
        .body(doc.to_xml())
        .send()
        .await
        .map_err(transport_error)?;

    let status = response.status();
    if !status.is_success() {
        return Err(LostError::ServerError(format!(
            "Unsupported HTTP status code: {}",
            status.as_u16()
        )));
    }

    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    if content_type != MIME_TYPE {
        return Err(LostError::ServerError(format!(
            "Unsupported Content-Type: \"{}\"",
            content_type
        )));
    }

    let body = response.text().await.map_err(transport_error)?;
    let doc = xml::parse(&body)
        .map_err(|e| LostError::ServerError(format!("Unparseable response: {}", e)))?;

    if let Some(error) = LostError::from_response(&doc) {
        return Err(error);
    }
    if doc.ns.as_deref() != Some(LOST_NAMESPACE) {
        return Err(LostError::ServerError(
            "Unsupported XML namespace in response".to_string(),
        ));
    }
    Ok(doc)
}

/// A resolver bound to one LoST server.
pub struct LostClient {
    http: reqwest::Client,
    server_url: String,
    max_hops: usize,
}

impl LostClient {
    pub fn new(server_url: impl Into<String>) -> Result<LostClient, LostError> {
        LostClient::with_limits(server_url, DEFAULT_TIMEOUT, DEFAULT_MAX_HOPS)
    }

    pub fn with_limits(
        server_url: impl Into<String>,
        timeout: Duration,
        max_hops: usize,
    ) -> Result<LostClient, LostError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LostError::InternalError(format!("Cannot build HTTP client: {}", e)))?;
        Ok(LostClient {
            http,
            server_url: server_url.into(),
            max_hops,
        })
    }

    /// Resolve a service URN for a geometry and return the mapping URIs.
    ///
    /// In non-recursive mode the redirect iteration runs here: each
    /// `<redirect>` target is followed, a revisited target raises `loop`,
    /// and the hop limit bounds the walk.
    #[tracing::instrument(skip(self, geometry))]
    pub async fn find_service(
        &self,
        service: &str,
        geometry: Element,
        recursive: bool,
        reference: bool,
    ) -> Result<Vec<String>, LostError> {
        let request = Request::FindService(self.query(service, geometry, recursive, reference, "location"));
        let response = self.resolve(&request).await?;
        if !response.is(LOST_NAMESPACE, "findServiceResponse") {
            return Err(LostError::ServerError(format!(
                "Unexpected response type \"{}\"",
                response.name
            )));
        }
        Ok(mapping_uris(&response))
    }

    /// Resolve the mappings whose boundary intersects the geometry.
    #[tracing::instrument(skip(self, geometry))]
    pub async fn find_intersect(
        &self,
        service: &str,
        geometry: Element,
        recursive: bool,
        reference: bool,
    ) -> Result<Vec<String>, LostError> {
        let request =
            Request::FindIntersect(self.query(service, geometry, recursive, reference, "interest"));
        let response = self.resolve(&request).await?;
        if !response.is(LOST_NAMESPACE, "findIntersectResponse")
            && !response.is(LOST_NAMESPACE, "findIntersectResponses")
        {
            return Err(LostError::ServerError(format!(
                "Unexpected response type \"{}\"",
                response.name
            )));
        }
        Ok(mapping_uris(&response))
    }

    fn query(
        &self,
        service: &str,
        geometry: Element,
        recursive: bool,
        reference: bool,
        location_name: &str,
    ) -> ServiceQuery {
        ServiceQuery {
            service: Some(service.to_string()),
            profile: "geodetic-2d".to_string(),
            location: Element::new(LOST_NAMESPACE, location_name)
                .attr("profile", "geodetic-2d")
                .child(geometry),
            recursive,
            boundary: if reference {
                BoundaryMode::Reference
            } else {
                BoundaryMode::Value
            },
            path: Vec::new(),
        }
    }

    async fn resolve(&self, request: &Request) -> Result<Element, LostError> {
        let doc = request.to_xml();
        let mut url = self.server_url.clone();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(url.clone());

        for _ in 0..self.max_hops {
            let response = post_document(&self.http, &url, &doc).await?;
            if !response.is(LOST_NAMESPACE, "redirect") {
                return Ok(response);
            }
            let target = response
                .get_attr("target")
                .filter(|target| !target.is_empty())
                .ok_or_else(|| {
                    LostError::ServerError("Redirect without a target".to_string())
                })?;
            if !visited.insert(target.to_string()) {
                return Err(LostError::Loop(format!(
                    "Redirect loop via \"{}\"",
                    target
                )));
            }
            tracing::debug!(redirect_target = target, "following LoST redirect");
            url = target.to_string();
        }
        Err(LostError::ServerError(format!(
            "Redirect limit of {} hops exceeded",
            self.max_hops
        )))
    }
}

/// The `<uri>` texts of every mapping in the response, in document order.
fn mapping_uris(response: &Element) -> Vec<String> {
    let mut uris = Vec::new();
    collect_uris(response, &mut uris);
    uris
}

fn collect_uris(element: &Element, uris: &mut Vec<String>) {
    if element.is(LOST_NAMESPACE, "mapping") {
        for uri in element.find_all(LOST_NAMESPACE, "uri") {
            uris.push(uri.text.clone());
        }
        return;
    }
    for child in &element.children {
        collect_uris(child, uris);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lost_protocol::geometry::gml_point;
    use lost_protocol::model::{self, Boundary, MappingData};

    fn leaf_response(op: &str, uri: &str) -> String {
        let mapping = MappingData {
            source: "peer".to_string(),
            source_id: "id".to_string(),
            last_updated: "2026-07-01T00:00:00+00:00".to_string(),
            expires: "2026-07-02T00:00:00+00:00".to_string(),
            service: "urn:service:sos".to_string(),
            display_name: None,
            uris: vec![uri.to_string()],
            boundary: Boundary::Reference {
                key: "k".to_string(),
            },
        };
        match op {
            "findServiceResponse" => {
                model::find_service_response(&mapping, &["peer".to_string()]).to_xml()
            }
            _ => model::find_intersect_response(&mapping, &["peer".to_string()]).to_xml(),
        }
    }

    #[tokio::test]
    async fn returns_the_mapping_uris() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", MIME_TYPE)
            .with_body(leaf_response("findServiceResponse", "sip:psap@example"))
            .create_async()
            .await;

        let client = LostClient::new(server.url()).unwrap();
        let uris = client
            .find_service("urn:service:sos", gml_point(40.5, -73.5), true, false)
            .await
            .unwrap();
        assert_eq!(uris, vec!["sip:psap@example"]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn follows_redirects_to_the_leaf_server() {
        let mut peer = mockito::Server::new_async().await;
        let _leaf = peer
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", MIME_TYPE)
            .with_body(leaf_response("findServiceResponse", "sip:psap@example"))
            .create_async()
            .await;

        let mut root = mockito::Server::new_async().await;
        let _redirect = root
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", MIME_TYPE)
            .with_body(model::redirect(&peer.url(), "lost-root", "not a leaf").to_xml())
            .create_async()
            .await;

        let client = LostClient::new(root.url()).unwrap();
        let uris = client
            .find_service("urn:service:sos", gml_point(40.5, -73.5), false, false)
            .await
            .unwrap();
        assert_eq!(uris, vec!["sip:psap@example"]);
    }

    #[tokio::test]
    async fn refuses_redirect_loops() {
        let mut root = mockito::Server::new_async().await;
        let url = root.url();
        let _redirect = root
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", MIME_TYPE)
            .with_body(model::redirect(&url, "lost-root", "loop").to_xml())
            .create_async()
            .await;

        let client = LostClient::new(root.url()).unwrap();
        let result = client
            .find_service("urn:service:sos", gml_point(40.5, -73.5), false, false)
            .await;
        assert!(matches!(result, Err(LostError::Loop(_))));
    }

    #[tokio::test]
    async fn lifts_error_documents_into_typed_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", MIME_TYPE)
            .with_body(
                LostError::NotFound("No mapping matches the location".to_string())
                    .to_xml(Some("peer"))
                    .to_xml(),
            )
            .create_async()
            .await;

        let client = LostClient::new(server.url()).unwrap();
        let result = client
            .find_service("urn:service:sos", gml_point(0.0, 0.0), true, false)
            .await;
        match result {
            Err(LostError::NotFound(message)) => {
                assert_eq!(message, "No mapping matches the location");
            }
            other => panic!("expected notFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn rejects_wrong_content_types_and_statuses() {
        let mut html = mockito::Server::new_async().await;
        let _mock = html
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body("<html></html>")
            .create_async()
            .await;
        let client = LostClient::new(html.url()).unwrap();
        let result = client
            .find_service("urn:service:sos", gml_point(0.0, 0.0), true, false)
            .await;
        assert!(matches!(result, Err(LostError::ServerError(_))));

        let mut broken = mockito::Server::new_async().await;
        let _mock = broken
            .mock("POST", "/")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;
        let client = LostClient::new(broken.url()).unwrap();
        let result = client
            .find_service("urn:service:sos", gml_point(0.0, 0.0), true, false)
            .await;
        assert!(matches!(result, Err(LostError::ServerError(_))));
    }

    #[tokio::test]
    async fn rejects_foreign_namespaces() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", MIME_TYPE)
            .with_body(r#"<findServiceResponse xmlns="urn:example:other"/>"#)
            .create_async()
            .await;

        let client = LostClient::new(server.url()).unwrap();
        let result = client
            .find_service("urn:service:sos", gml_point(0.0, 0.0), true, false)
            .await;
        assert!(matches!(result, Err(LostError::ServerError(_))));
    }

    #[tokio::test]
    async fn aggregates_intersect_responses() {
        let children = vec![
            lost_protocol::xml::parse(&leaf_response("findIntersectResponse", "sip:a@example"))
                .unwrap(),
            lost_protocol::xml::parse(&leaf_response("findIntersectResponse", "sip:b@example"))
                .unwrap(),
        ];
        let body = model::find_intersect_responses(children).to_xml();

        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/")
            .with_status(200)
            .with_header("content-type", MIME_TYPE)
            .with_body(body)
            .create_async()
            .await;

        let client = LostClient::new(server.url()).unwrap();
        let uris = client
            .find_intersect("urn:service:sos", gml_point(40.5, -73.5), true, false)
            .await
            .unwrap();
        assert_eq!(uris, vec!["sip:a@example", "sip:b@example"]);
    }
}
