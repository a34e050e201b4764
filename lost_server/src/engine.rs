//! Request dispatch: body → element tree → typed request → profile handler.
//!
//! Everything here returns `Result<Element, LostError>`; the transport layer
//! serializes either outcome into an HTTP 200 with the LoST content type.

use std::sync::Arc;

use sqlx::types::Uuid;

use lost_protocol::errors::LostError;
use lost_protocol::model::{self, Request};
use lost_protocol::xml::{self, Element};

use crate::context::ServerContext;
use crate::mapping_store::MappingStore;
use crate::profiles::{LocationProfile, GEODETIC_PROFILE};
use crate::shape_store::ShapeStore;

pub async fn handle(ctx: &ServerContext, body: &str) -> Result<Element, LostError> {
    let doc = xml::parse(body)?;
    let request = Request::from_xml(&doc)?;

    match &request {
        Request::FindService(query) => {
            let handler = profile_handler(ctx, &query.profile)?;
            handler.check_authority(ctx, query).await?;
            handler.find_service(ctx, query).await
        }
        Request::FindIntersect(query) => {
            let handler = profile_handler(ctx, &query.profile)?;
            handler.check_authority(ctx, query).await?;
            handler.find_intersect(ctx, query).await
        }
        Request::ListServicesByLocation(query) => {
            let handler = profile_handler(ctx, &query.profile)?;
            handler.check_authority(ctx, query).await?;
            handler.list_services_by_location(ctx, query).await
        }
        Request::GetServiceBoundary { key } => get_service_boundary(ctx, key).await,
        Request::ListServices { service } => list_services(ctx, service.as_deref()).await,
    }
}

fn profile_handler<'a>(
    ctx: &'a ServerContext,
    profile: &str,
) -> Result<&'a Arc<dyn LocationProfile>, LostError> {
    ctx.profiles.get(profile).ok_or_else(|| {
        LostError::LocationProfileUnrecognized(format!(
            "Unsupported location profile \"{}\"",
            profile
        ))
    })
}

/// Dereference a `serviceBoundaryReference` key: the key is the shape id
/// handed out by the reference mode of `findService`.
async fn get_service_boundary(ctx: &ServerContext, key: &str) -> Result<Element, LostError> {
    let id = Uuid::parse_str(key)
        .map_err(|_| LostError::BadRequest(format!("Malformed boundary key \"{}\"", key)))?;
    let gml = ShapeStore::new(&ctx.pool)
        .as_gml(id)
        .await?
        .ok_or_else(|| {
            LostError::NotFound("No service boundary with the given key".to_string())
        })?;
    let boundary = model::service_boundary(&gml, GEODETIC_PROFILE)?;
    Ok(model::get_service_boundary_response(
        boundary,
        &[ctx.settings.server_id.clone()],
    ))
}

async fn list_services(ctx: &ServerContext, parent: Option<&str>) -> Result<Element, LostError> {
    let store = MappingStore::new(&ctx.pool, &ctx.settings.geo_table)?;
    let services = store.services(parent).await?;
    Ok(model::list_services_response(
        &services,
        &[ctx.settings.server_id.clone()],
    ))
}
