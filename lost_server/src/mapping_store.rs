//! Read-only façade over a mapping table joined with its shapes.

use chrono::{DateTime, Utc};
use sqlx::types::Uuid;
use sqlx::{PgPool, Row};

use lost_protocol::errors::LostError;
use lost_protocol::geometry::LocationGeometry;
use lost_protocol::PEER_SERVICE;

use crate::config::validate_identifier;
use crate::shape_store::db_error;

/// Geometric predicate used by the lookup: `findService` asks which regions
/// contain the location, `findIntersect` which regions intersect it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Predicate {
    Contains,
    Intersects,
}

impl Predicate {
    fn sql(&self) -> &'static str {
        match self {
            Predicate::Contains => "ST_Contains",
            Predicate::Intersects => "ST_Intersects",
        }
    }
}

/// One mapping row joined with its shape, fetched in a single round trip.
#[derive(Debug, Clone)]
pub struct MappingRow {
    pub id: Uuid,
    pub shape_id: Uuid,
    pub srv: String,
    pub updated: DateTime<Utc>,
    pub attrs: serde_json::Value,
    pub boundary_gml: String,
}

impl MappingRow {
    /// A row whose `srv` carries the peer marker points at another LoST
    /// server instead of a service provider.
    pub fn is_peer(&self) -> bool {
        self.srv == PEER_SERVICE
    }

    /// `attrs.uri` as a list; the attribute may be a string or an array.
    pub fn uris(&self) -> Vec<String> {
        match self.attrs.get("uri") {
            Some(serde_json::Value::String(uri)) => vec![uri.clone()],
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    pub fn primary_uri(&self) -> Option<String> {
        self.uris().into_iter().next()
    }

    pub fn display_name(&self) -> Option<String> {
        self.attrs
            .get("displayName")
            .and_then(|value| value.as_str())
            .map(str::to_string)
    }
}

pub struct MappingStore<'a> {
    pool: &'a PgPool,
    table: &'a str,
}

impl<'a> MappingStore<'a> {
    pub fn new(pool: &'a PgPool, table: &'a str) -> Result<Self, LostError> {
        validate_identifier(table)?;
        Ok(MappingStore { pool, table })
    }

    /// Mappings whose shape satisfies the predicate for the geometry,
    /// restricted to the requested service URN plus peer rows, smallest
    /// region first.
    pub async fn lookup(
        &self,
        service: &str,
        predicate: Predicate,
        geometry: &LocationGeometry,
    ) -> Result<Vec<MappingRow>, LostError> {
        let sql = format!(
            "SELECT m.id, m.srv, m.updated, m.attrs, s.id AS shape_id, \
                    ST_AsGML(3, s.geometries, 5, 17) AS boundary \
             FROM {table} AS m JOIN shape AS s ON m.shape = s.id \
             WHERE (m.srv = $1 OR m.srv = '{peer}') \
               AND {predicate}(s.geometries, {geom}) \
             ORDER BY ST_Area(s.geometries) ASC",
            table = self.table,
            peer = PEER_SERVICE,
            predicate = predicate.sql(),
            geom = geometry.sql_expr("$2"),
        );
        let rows = sqlx::query(&sql)
            .bind(service)
            .bind(geometry.sql_param())
            .fetch_all(self.pool)
            .await
            .map_err(db_error)?;

        rows.iter()
            .map(|row| {
                Ok(MappingRow {
                    id: row.try_get("id").map_err(db_error)?,
                    shape_id: row.try_get("shape_id").map_err(db_error)?,
                    srv: row.try_get("srv").map_err(db_error)?,
                    updated: row.try_get("updated").map_err(db_error)?,
                    attrs: row.try_get("attrs").map_err(db_error)?,
                    boundary_gml: row.try_get("boundary").map_err(db_error)?,
                })
            })
            .collect()
    }

    /// Distinct leaf service URNs, optionally restricted to sub-services of
    /// the given URN.
    pub async fn services(&self, parent: Option<&str>) -> Result<Vec<String>, LostError> {
        let mut sql = format!(
            "SELECT DISTINCT srv FROM {table} WHERE srv <> '{peer}'",
            table = self.table,
            peer = PEER_SERVICE,
        );
        let query = match parent {
            Some(parent) => {
                sql.push_str(" AND srv LIKE $1 ORDER BY srv");
                sqlx::query(&sql).bind(format!("{}.%", parent))
            }
            None => {
                sql.push_str(" ORDER BY srv");
                sqlx::query(&sql)
            }
        };
        let rows = query.fetch_all(self.pool).await.map_err(db_error)?;
        rows.iter()
            .map(|row| row.try_get("srv").map_err(db_error))
            .collect()
    }

    /// Distinct leaf service URNs available at the location.
    pub async fn services_at(
        &self,
        geometry: &LocationGeometry,
    ) -> Result<Vec<String>, LostError> {
        let sql = format!(
            "SELECT DISTINCT m.srv \
             FROM {table} AS m JOIN shape AS s ON m.shape = s.id \
             WHERE m.srv <> '{peer}' AND ST_Contains(s.geometries, {geom}) \
             ORDER BY m.srv",
            table = self.table,
            peer = PEER_SERVICE,
            geom = geometry.sql_expr("$1"),
        );
        let rows = sqlx::query(&sql)
            .bind(geometry.sql_param())
            .fetch_all(self.pool)
            .await
            .map_err(db_error)?;
        rows.iter()
            .map(|row| row.try_get("srv").map_err(db_error))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row_with_attrs(attrs: serde_json::Value) -> MappingRow {
        MappingRow {
            id: Uuid::nil(),
            shape_id: Uuid::nil(),
            srv: "urn:service:sos".to_string(),
            updated: Utc::now(),
            attrs,
            boundary_gml: String::new(),
        }
    }

    #[test]
    fn uri_attribute_may_be_string_or_list() {
        let single = row_with_attrs(json!({ "uri": "sip:psap@example" }));
        assert_eq!(single.uris(), vec!["sip:psap@example"]);

        let list = row_with_attrs(json!({ "uri": ["sip:psap@example", "xmpp:psap@example"] }));
        assert_eq!(list.uris(), vec!["sip:psap@example", "xmpp:psap@example"]);
        assert_eq!(list.primary_uri().as_deref(), Some("sip:psap@example"));

        let missing = row_with_attrs(json!({ "name": "New York" }));
        assert!(missing.uris().is_empty());
        assert!(missing.primary_uri().is_none());
    }

    #[test]
    fn peer_rows_are_detected_by_the_marker() {
        let mut row = row_with_attrs(json!({ "uri": "http://peer-ny:5000" }));
        assert!(!row.is_peer());
        row.srv = PEER_SERVICE.to_string();
        assert!(row.is_peer());
    }

    #[test]
    fn display_name_comes_from_attrs() {
        let row = row_with_attrs(json!({ "displayName": "New York" }));
        assert_eq!(row.display_name().as_deref(), Some("New York"));
    }
}
