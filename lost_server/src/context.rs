use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

use lost_protocol::errors::LostError;

use crate::config::{validate_identifier, Settings};
use crate::profiles::{CivicProfile, GeodeticProfile, LocationProfile};

/// Everything a request handler needs, passed explicitly instead of living
/// in globals: the connection pool, the process configuration, the outbound
/// HTTP client used for peer proxying, and the profile handler registry.
pub struct ServerContext {
    pub pool: PgPool,
    pub settings: Settings,
    pub http: reqwest::Client,
    pub profiles: HashMap<String, Arc<dyn LocationProfile>>,
}

impl ServerContext {
    pub fn new(pool: PgPool, settings: Settings) -> Result<ServerContext, LostError> {
        validate_identifier(&settings.geo_table)?;
        if let Some(civic_table) = &settings.civic_table {
            validate_identifier(civic_table)?;
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.peer_timeout))
            .build()
            .map_err(|e| {
                LostError::InternalError(format!("Cannot build the peer HTTP client: {}", e))
            })?;

        let mut profiles: HashMap<String, Arc<dyn LocationProfile>> = HashMap::new();
        profiles.insert(
            "geodetic-2d".to_string(),
            Arc::new(GeodeticProfile::new(settings.geo_table.clone())),
        );
        if settings.civic_table.is_some() {
            profiles.insert("civic".to_string(), Arc::new(CivicProfile));
        }

        Ok(ServerContext {
            pool,
            settings,
            http,
            profiles,
        })
    }
}
