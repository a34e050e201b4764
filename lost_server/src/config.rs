use clap::Parser;

use lost_protocol::errors::LostError;

/// Server configuration, from command line arguments with environment
/// fallbacks. A `.env` file is honored when present.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about = "LoST protocol server", long_about = None)]
pub struct Settings {
    /// PostgreSQL database URL.
    #[clap(long, short = 'd', env = "DB_URL")]
    pub db_url: String,

    /// Minimum number of free database connections.
    #[clap(long, env = "MIN_CON", default_value_t = database::DEFAULT_MIN_CON)]
    pub min_con: u32,

    /// Maximum number of database connections.
    #[clap(long, env = "MAX_CON", default_value_t = database::DEFAULT_MAX_CON)]
    pub max_con: u32,

    /// Address to bind.
    #[clap(long, env = "IP", default_value = "127.0.0.1")]
    pub ip: String,

    /// Port number to listen on.
    #[clap(long, short = 'p', env = "PORT", default_value_t = 5000)]
    pub port: u16,

    /// Unique id of this LoST server, emitted as the `source` attribute and
    /// in `path` entries.
    #[clap(long, env = "SERVER_ID", default_value = "lost-server")]
    pub server_id: String,

    /// URI of the shape this server is authoritative for. Unset disables the
    /// authority check.
    #[clap(long, env = "AUTHORITATIVE")]
    pub authoritative: Option<String>,

    /// Answer non-leaf mappings with redirects even when the client asked
    /// for recursion.
    #[clap(long)]
    pub redirect: bool,

    /// Name of the geographic mapping table.
    #[clap(long, env = "GEO_TABLE", default_value = "mapping")]
    pub geo_table: String,

    /// Name of the civic mapping table. Setting it registers the civic
    /// profile handler.
    #[clap(long, env = "CIVIC_TABLE")]
    pub civic_table: Option<String>,

    /// Deadline in seconds for peer requests and pool acquisition.
    #[clap(long, env = "PEER_TIMEOUT", default_value_t = 10)]
    pub peer_timeout: u64,
}

/// Table names are interpolated into SQL, so they must be plain
/// identifiers.
pub fn validate_identifier(name: &str) -> Result<(), LostError> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if valid_start && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(LostError::InternalError(format!(
            "Invalid table name \"{}\"",
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_identifiers() {
        for name in ["mapping", "geo", "civic_mappings", "_t2"] {
            assert!(validate_identifier(name).is_ok());
        }
    }

    #[test]
    fn rejects_sql_metacharacters() {
        for name in ["", "1mapping", "mapping; drop table shape", "geo-table", "a.b"] {
            assert!(validate_identifier(name).is_err());
        }
    }
}
