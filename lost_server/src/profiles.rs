//! Per-profile resolution handlers.
//!
//! A request is dispatched to the handler registered for its
//! `location/@profile`. The geodetic handler owns the whole pipeline:
//! authority check, mapping lookup, and the leaf / non-leaf branch with its
//! redirect, proxy, and loop rules. The civic handler is a recognized stub.

use async_trait::async_trait;
use chrono::{Duration, Utc};

use lost_protocol::errors::LostError;
use lost_protocol::geometry::LocationGeometry;
use lost_protocol::model::{self, Boundary, BoundaryMode, MappingData, Request, ServiceQuery};
use lost_protocol::xml::Element;
use lost_protocol::LOST_NAMESPACE;

use crate::context::ServerContext;
use crate::mapping_store::{MappingRow, MappingStore, Predicate};
use crate::shape_store::ShapeStore;

pub const GEODETIC_PROFILE: &str = "geodetic-2d";

#[async_trait]
pub trait LocationProfile: Send + Sync {
    fn name(&self) -> &'static str;

    /// Verify that this server may answer for the request geometry.
    async fn check_authority(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<(), LostError>;

    async fn find_service(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<Element, LostError>;

    async fn find_intersect(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<Element, LostError>;

    async fn list_services_by_location(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<Element, LostError>;
}

/// Refuse to forward a request that has already passed through this server.
pub(crate) fn ensure_not_looping(path: &[String], server_id: &str) -> Result<(), LostError> {
    if path.iter().any(|via| via == server_id) {
        return Err(LostError::Loop(format!(
            "Server \"{}\" already appears in the request path",
            server_id
        )));
    }
    Ok(())
}

/// Render a leaf mapping row into the response contract.
pub(crate) fn leaf_mapping(
    server_id: &str,
    row: &MappingRow,
    mode: BoundaryMode,
) -> Result<MappingData, LostError> {
    let boundary = match mode {
        BoundaryMode::Value => Boundary::Value(model::service_boundary(
            &row.boundary_gml,
            GEODETIC_PROFILE,
        )?),
        BoundaryMode::Reference => Boundary::Reference {
            key: row.shape_id.to_string(),
        },
    };
    Ok(MappingData {
        source: server_id.to_string(),
        source_id: row.id.to_string(),
        last_updated: row.updated.to_rfc3339(),
        expires: (Utc::now() + Duration::days(1)).to_rfc3339(),
        service: row.srv.clone(),
        display_name: row.display_name(),
        uris: row.uris(),
        boundary,
    })
}

fn peer_target(row: &MappingRow) -> Result<String, LostError> {
    row.primary_uri().ok_or_else(|| {
        LostError::InternalError("Peer mapping row carries no uri attribute".to_string())
    })
}

/// Attach this server's `via` to a proxied upstream answer.
///
/// An aggregate gets the entry on every sub-response path, never on the
/// container; redirects carry no path at all.
fn absorb_upstream_response(mut response: Element, server_id: &str) -> Element {
    if response.is(LOST_NAMESPACE, "findIntersectResponses") {
        for child in &mut response.children {
            if child.is(LOST_NAMESPACE, "findIntersectResponse") {
                model::prepend_via(child, server_id);
            }
        }
    } else if !response.is(LOST_NAMESPACE, "redirect") {
        model::prepend_via(&mut response, server_id);
    }
    response
}

/// The geographic profile, backed by one mapping table.
pub struct GeodeticProfile {
    table: String,
}

impl GeodeticProfile {
    pub fn new(table: String) -> Self {
        GeodeticProfile { table }
    }

    /// Forward the request to the peer named by a non-leaf row, or answer
    /// with a redirect when recursion is off or the server runs in redirect
    /// mode.
    async fn resolve_through_peer(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
        row: &MappingRow,
        intersect: bool,
    ) -> Result<Element, LostError> {
        let target = peer_target(row)?;
        let server_id = &ctx.settings.server_id;

        if !query.recursive || ctx.settings.redirect {
            return Ok(model::redirect(
                &target,
                server_id,
                "Another server is authoritative for the location",
            ));
        }

        ensure_not_looping(&query.path, server_id)?;
        let mut forwarded = query.clone();
        forwarded.path.push(server_id.clone());
        let request = if intersect {
            Request::FindIntersect(forwarded)
        } else {
            Request::FindService(forwarded)
        };

        let response =
            lost_client::post_document(&ctx.http, &target, &request.to_xml()).await?;
        Ok(absorb_upstream_response(response, server_id))
    }
}

#[async_trait]
impl LocationProfile for GeodeticProfile {
    fn name(&self) -> &'static str {
        GEODETIC_PROFILE
    }

    async fn check_authority(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<(), LostError> {
        let uri = match &ctx.settings.authoritative {
            Some(uri) if !uri.is_empty() => uri,
            _ => return Ok(()),
        };
        let geometry = LocationGeometry::from_location(&query.location)?;
        if ShapeStore::new(&ctx.pool)
            .uri_intersects(uri, &geometry)
            .await?
        {
            Ok(())
        } else {
            Err(LostError::NotAuthoritative(format!(
                "The location is outside the area served by \"{}\"",
                ctx.settings.server_id
            )))
        }
    }

    async fn find_service(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<Element, LostError> {
        let service = query.required_service()?;
        let geometry = LocationGeometry::from_location(&query.location)?;

        let store = MappingStore::new(&ctx.pool, &self.table)?;
        let row = store
            .lookup(service, Predicate::Contains, &geometry)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                LostError::NotFound("No mapping matches the location".to_string())
            })?;

        if row.is_peer() {
            return self.resolve_through_peer(ctx, query, &row, false).await;
        }

        let mapping = leaf_mapping(&ctx.settings.server_id, &row, query.boundary)?;
        Ok(model::find_service_response(
            &mapping,
            &[ctx.settings.server_id.clone()],
        ))
    }

    async fn find_intersect(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<Element, LostError> {
        let service = query.required_service()?;
        let geometry = LocationGeometry::from_location(&query.location)?;
        let server_id = &ctx.settings.server_id;

        let store = MappingStore::new(&ctx.pool, &self.table)?;
        let rows = store
            .lookup(service, Predicate::Intersects, &geometry)
            .await?;

        if rows.is_empty() {
            return Err(LostError::NotFound(
                "No service boundary intersects the geometry".to_string(),
            ));
        }

        if rows.len() == 1 {
            let row = &rows[0];
            if row.is_peer() {
                return self.resolve_through_peer(ctx, query, row, true).await;
            }
            let mapping = leaf_mapping(server_id, row, query.boundary)?;
            return Ok(model::find_intersect_response(
                &mapping,
                &[server_id.clone()],
            ));
        }

        let mut children = Vec::new();
        for row in &rows {
            if !row.is_peer() {
                let mapping = leaf_mapping(server_id, row, query.boundary)?;
                children.push(model::find_intersect_response(
                    &mapping,
                    &[server_id.clone()],
                ));
                continue;
            }

            let target = peer_target(row)?;
            if !query.recursive || ctx.settings.redirect {
                children.push(model::redirect(
                    &target,
                    server_id,
                    "Another server is authoritative for this region",
                ));
                continue;
            }

            ensure_not_looping(&query.path, server_id)?;
            let mut forwarded = query.clone();
            forwarded.path.push(server_id.clone());
            let response = lost_client::post_document(
                &ctx.http,
                &target,
                &Request::FindIntersect(forwarded).to_xml(),
            )
            .await?;

            let response = absorb_upstream_response(response, server_id);
            if response.is(LOST_NAMESPACE, "findIntersectResponses") {
                children.extend(response.children);
            } else {
                children.push(response);
            }
        }
        Ok(model::find_intersect_responses(children))
    }

    async fn list_services_by_location(
        &self,
        ctx: &ServerContext,
        query: &ServiceQuery,
    ) -> Result<Element, LostError> {
        let geometry = LocationGeometry::from_location(&query.location)?;
        let store = MappingStore::new(&ctx.pool, &self.table)?;
        let services = store.services_at(&geometry).await?;
        Ok(model::list_services_response(
            &services,
            &[ctx.settings.server_id.clone()],
        ))
    }
}

/// Recognized stub: the profile is registered so that civic requests get the
/// profile error instead of a generic one, but no resolution is offered.
pub struct CivicProfile;

fn civic_unsupported() -> LostError {
    LostError::LocationProfileUnrecognized(
        "The civic location profile is not supported".to_string(),
    )
}

#[async_trait]
impl LocationProfile for CivicProfile {
    fn name(&self) -> &'static str {
        "civic"
    }

    async fn check_authority(
        &self,
        _ctx: &ServerContext,
        _query: &ServiceQuery,
    ) -> Result<(), LostError> {
        Err(civic_unsupported())
    }

    async fn find_service(
        &self,
        _ctx: &ServerContext,
        _query: &ServiceQuery,
    ) -> Result<Element, LostError> {
        Err(civic_unsupported())
    }

    async fn find_intersect(
        &self,
        _ctx: &ServerContext,
        _query: &ServiceQuery,
    ) -> Result<Element, LostError> {
        Err(civic_unsupported())
    }

    async fn list_services_by_location(
        &self,
        _ctx: &ServerContext,
        _query: &ServiceQuery,
    ) -> Result<Element, LostError> {
        Err(civic_unsupported())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use lost_protocol::model::response_path;
    use lost_protocol::GML_NAMESPACE;
    use sqlx::types::Uuid;

    // The shape of ST_AsGML(3, geometries, 5, 17) output.
    const BOUNDARY_GML: &str = "<gml:Polygon srsName=\"urn:ogc:def:crs:EPSG::4326\">\
         <gml:exterior><gml:LinearRing>\
         <gml:posList>40 -74 40 -73 41 -73 41 -74 40 -74</gml:posList>\
         </gml:LinearRing></gml:exterior></gml:Polygon>";

    fn leaf_row() -> MappingRow {
        MappingRow {
            id: Uuid::parse_str("6f2c1e58-6c36-4f12-9f6b-1a2b3c4d5e6f").unwrap(),
            shape_id: Uuid::parse_str("0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d").unwrap(),
            srv: "urn:service:sos".to_string(),
            updated: Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap(),
            attrs: serde_json::json!({ "uri": "sip:psap@example", "displayName": "New York" }),
            boundary_gml: BOUNDARY_GML.to_string(),
        }
    }

    #[test]
    fn loop_refusal_matches_only_this_server() {
        let path = vec!["lost-root".to_string(), "lost-us".to_string()];
        assert!(ensure_not_looping(&path, "lost-server").is_ok());
        assert!(matches!(
            ensure_not_looping(&path, "lost-us"),
            Err(LostError::Loop(_))
        ));
        assert!(ensure_not_looping(&[], "lost-server").is_ok());
    }

    #[test]
    fn leaf_hit_renders_the_full_mapping() {
        let mapping = leaf_mapping("lost-server", &leaf_row(), BoundaryMode::Value).unwrap();
        let response = model::find_service_response(&mapping, &["lost-server".to_string()]);

        let element = response.find(LOST_NAMESPACE, "mapping").unwrap();
        assert_eq!(element.get_attr("source"), Some("lost-server"));
        assert_eq!(
            element.get_attr("sourceId"),
            Some("6f2c1e58-6c36-4f12-9f6b-1a2b3c4d5e6f")
        );
        assert_eq!(
            element.get_attr("lastUpdated"),
            Some("2026-07-01T00:00:00+00:00")
        );
        assert_eq!(
            element.find(LOST_NAMESPACE, "service").unwrap().text,
            "urn:service:sos"
        );
        assert_eq!(
            element.find(LOST_NAMESPACE, "uri").unwrap().text,
            "sip:psap@example"
        );
        assert_eq!(
            element.find(LOST_NAMESPACE, "displayName").unwrap().text,
            "New York"
        );

        // The boundary wraps the re-parsed ST_AsGML fragment.
        let boundary = element.find(LOST_NAMESPACE, "serviceBoundary").unwrap();
        assert_eq!(boundary.get_attr("profile"), Some(GEODETIC_PROFILE));
        assert!(boundary.find(GML_NAMESPACE, "Polygon").is_some());

        // This server appears in the path exactly once.
        let path = response_path(&response);
        assert_eq!(path, vec!["lost-server"]);
    }

    #[test]
    fn reference_mode_uses_the_shape_id_as_key() {
        let mapping = leaf_mapping("lost-server", &leaf_row(), BoundaryMode::Reference).unwrap();
        match &mapping.boundary {
            Boundary::Reference { key } => {
                assert_eq!(key, "0a1b2c3d-4e5f-4a6b-8c7d-9e0f1a2b3c4d");
            }
            other => panic!("expected a reference boundary, got {:?}", other),
        }
    }

    #[test]
    fn proxied_aggregates_get_the_via_on_every_sub_response() {
        let mapping = leaf_mapping("peer-ny", &leaf_row(), BoundaryMode::Reference).unwrap();
        let aggregate = model::find_intersect_responses(vec![
            model::find_intersect_response(&mapping, &["peer-ny".to_string()]),
            model::find_intersect_response(&mapping, &["peer-nj".to_string()]),
        ]);

        let absorbed = absorb_upstream_response(aggregate, "lost-us");
        assert!(absorbed.is(LOST_NAMESPACE, "findIntersectResponses"));
        // The container itself carries no path; each sub-response chain does.
        assert!(response_path(&absorbed).is_empty());
        let paths: Vec<Vec<String>> =
            absorbed.children.iter().map(response_path).collect();
        assert_eq!(paths[0], vec!["lost-us", "peer-ny"]);
        assert_eq!(paths[1], vec!["lost-us", "peer-nj"]);
    }

    #[test]
    fn proxied_singular_responses_and_redirects_keep_their_shape() {
        let mapping = leaf_mapping("peer-ny", &leaf_row(), BoundaryMode::Reference).unwrap();
        let singular = model::find_intersect_response(&mapping, &["peer-ny".to_string()]);
        let absorbed = absorb_upstream_response(singular, "lost-us");
        assert_eq!(response_path(&absorbed), vec!["lost-us", "peer-ny"]);

        let redirect = model::redirect("http://peer-ny:5000", "peer-ny", "elsewhere");
        let absorbed = absorb_upstream_response(redirect, "lost-us");
        assert!(absorbed.find(LOST_NAMESPACE, "path").is_none());
    }

    #[test]
    fn corrupt_stored_boundaries_become_internal_errors() {
        let mut row = leaf_row();
        row.boundary_gml = "<gml:Polygon".to_string();
        assert!(matches!(
            leaf_mapping("lost-server", &row, BoundaryMode::Value),
            Err(LostError::InternalError(_))
        ));
    }
}
