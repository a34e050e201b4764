//! Read-only façade over the `shape` table.
//!
//! Every call acquires a pooled connection for its own duration and releases
//! it on all exit paths; handlers never see the pool directly. Geometries
//! stay inside PostGIS: predicates run on the server, boundaries come back
//! as GML 3 text ready for embedding. The containment and intersection
//! lookups of the serving path live in the mapping store's join.

use sqlx::types::Uuid;
use sqlx::{PgPool, Row};

use lost_protocol::errors::LostError;
use lost_protocol::geometry::LocationGeometry;

/// Fold store failures into the protocol taxonomy. An exhausted pool is a
/// deadline problem, everything else is internal.
pub(crate) fn db_error(e: sqlx::Error) -> LostError {
    match e {
        sqlx::Error::PoolTimedOut => LostError::ServerTimeout(
            "Timed out waiting for a database connection".to_string(),
        ),
        other => LostError::InternalError(format!("Database error: {}", other)),
    }
}

pub struct ShapeStore<'a> {
    pool: &'a PgPool,
}

impl<'a> ShapeStore<'a> {
    pub fn new(pool: &'a PgPool) -> Self {
        ShapeStore { pool }
    }

    /// Whether the shape with the given URI intersects the geometry. Backs
    /// the authority check.
    pub async fn uri_intersects(
        &self,
        uri: &str,
        geometry: &LocationGeometry,
    ) -> Result<bool, LostError> {
        let sql = format!(
            "SELECT EXISTS( \
                 SELECT 1 FROM shape \
                 WHERE uri = $1 AND ST_Intersects(geometries, {geom}) \
             ) AS found",
            geom = geometry.sql_expr("$2"),
        );
        let row = sqlx::query(&sql)
            .bind(uri)
            .bind(geometry.sql_param())
            .fetch_one(self.pool)
            .await
            .map_err(db_error)?;
        row.try_get("found").map_err(db_error)
    }

    /// The shape's boundary as GML 3, suitable for a `serviceBoundary`.
    pub async fn as_gml(&self, id: Uuid) -> Result<Option<String>, LostError> {
        let row = sqlx::query(
            "SELECT ST_AsGML(3, geometries, 5, 17) AS boundary FROM shape WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await
        .map_err(db_error)?;
        match row {
            Some(row) => row.try_get("boundary").map(Some).map_err(db_error),
            None => Ok(None),
        }
    }
}
