use actix_web::{web, HttpMessage, HttpRequest, HttpResponse};
use chrono::{DateTime, Utc};
use sqlx::Row;

use lost_protocol::errors::LostError;
use lost_protocol::MIME_TYPE;

use crate::context::ServerContext;
use crate::engine;

/// Liveness probe: one round trip to the store.
#[tracing::instrument(name = "Ping", skip(ctx))]
pub async fn ping(ctx: web::Data<ServerContext>) -> HttpResponse {
    let result = sqlx::query("SELECT NOW() AS now").fetch_one(&ctx.pool).await;
    match result {
        Ok(row) => match row.try_get::<DateTime<Utc>, _>("now") {
            Ok(now) => HttpResponse::Ok().body(format!("Database says: {}", now)),
            Err(e) => HttpResponse::InternalServerError().body(format!("{}", e)),
        },
        Err(e) => HttpResponse::InternalServerError().body(format!("{}", e)),
    }
}

/// The single protocol endpoint.
///
/// This is the only place HTTP status codes appear: protocol errors are
/// serialized into an `<errors>` body and still delivered as 200 with the
/// LoST content type. Clients must inspect the body root to tell transport
/// problems from protocol ones.
#[tracing::instrument(name = "LoST request", skip(req, body, ctx))]
pub async fn submit(
    req: HttpRequest,
    body: web::Bytes,
    ctx: web::Data<ServerContext>,
) -> HttpResponse {
    let doc = match dispatch(&req, &body, ctx.get_ref()).await {
        Ok(doc) => doc,
        Err(error) => {
            tracing::warn!(kind = error.kind(), "LoST error: {}", error.message());
            error.to_xml(Some(&ctx.settings.server_id))
        }
    };
    HttpResponse::Ok().content_type(MIME_TYPE).body(doc.to_xml())
}

async fn dispatch(
    req: &HttpRequest,
    body: &web::Bytes,
    ctx: &ServerContext,
) -> Result<lost_protocol::xml::Element, LostError> {
    if req.content_type() != MIME_TYPE {
        return Err(LostError::BadRequest(format!(
            "Unsupported content type \"{}\"",
            req.content_type()
        )));
    }
    let body = std::str::from_utf8(body)
        .map_err(|_| LostError::BadRequest("Request body is not valid UTF-8".to_string()))?;
    engine::handle(ctx, body).await
}
