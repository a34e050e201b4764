use std::collections::HashMap;
use std::convert::TryInto;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use geojson::{Feature, FeatureCollection};
use geozero::wkb;
use glob::glob;
use regex::Regex;
use serde_json::{json, Value};
use sqlx::types::Uuid;
use sqlx::{PgPool, Postgres, Row, Transaction};

use lost_protocol::PEER_SERVICE;

const OSM_URI_PREFIX: &str = "https://www.openstreetmap.org";

#[derive(Parser, Debug)]
#[clap(author, version, about = "Load service boundaries into the LoST stores", long_about = None)]
struct Args {
    /// PostgreSQL database URL.
    #[clap(long, short = 'd', env = "DB_URL")]
    db_url: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the shape and mapping tables.
    InitDb {
        /// Drop existing tables first.
        #[clap(long, short = 'D')]
        drop: bool,
    },

    /// Ingest GeoJSON boundary files matching a glob pattern.
    Load {
        /// Glob pattern naming the GeoJSON files, e.g. "world/**/*.geojson".
        pattern: String,

        /// JSON file mapping shape URIs (or file paths) to peer server URLs.
        #[clap(long)]
        url_map: Option<String>,
    },

    /// Register a leaf mapping for an already loaded shape.
    AddMapping {
        /// URI of the shape the mapping attaches to.
        shape_uri: String,

        /// Service URN, e.g. urn:service:sos.
        service: String,

        /// Service provider URIs, e.g. sip:psap@example.
        #[clap(required = true)]
        uris: Vec<String>,
    },
}

/// Read a GeoJSON file into a feature collection.
fn read_features(path: &Path) -> anyhow::Result<FeatureCollection> {
    let mut file =
        File::open(path).with_context(|| format!("Cannot open \"{}\"", path.display()))?;
    let mut content = String::new();
    file.read_to_string(&mut content)
        .with_context(|| format!("Cannot read \"{}\"", path.display()))?;
    FeatureCollection::from_str(&content)
        .with_context(|| format!("\"{}\" is not a GeoJSON FeatureCollection", path.display()))
}

/// Reject files whose `crs` member names a coordinate system other than
/// WGS-84. Files without a `crs` member are WGS-84 by the GeoJSON spec.
fn check_crs(fc: &FeatureCollection) -> anyhow::Result<()> {
    let name = fc
        .foreign_members
        .as_ref()
        .and_then(|members| members.get("crs"))
        .and_then(|crs| crs.get("properties"))
        .and_then(|properties| properties.get("name"))
        .and_then(Value::as_str);
    let name = match name {
        Some(name) => name,
        None => return Ok(()),
    };

    let re = Regex::new(r"urn:ogc:def:crs:EPSG::(\d+)").expect("static regex");
    match re.captures(name).and_then(|c| c.get(1)).map(|m| m.as_str()) {
        Some("4326") => Ok(()),
        Some(code) => bail!("Unsupported EPSG code {} (expected 4326)", code),
        None if name == "urn:ogc:def:crs:OGC:1.3:CRS84" => Ok(()),
        None => bail!("Unsupported CRS \"{}\"", name),
    }
}

/// The attribute bag and URI of the first boundary feature.
///
/// osm2geojson output tags each feature with its OSM object type; only
/// `relation` and `way` features describe boundaries. The shape URI is the
/// `uri` property when present, the OSM object URL otherwise, or a generated
/// identifier as the last resort.
fn extract_boundary(fc: &FeatureCollection) -> anyhow::Result<(&Feature, Value, String)> {
    for feature in &fc.features {
        let props = match feature.properties.as_ref() {
            Some(props) => props,
            None => continue,
        };
        let feature_type = match props.get("type").and_then(Value::as_str) {
            Some("relation") => "relation",
            Some("way") => "way",
            _ => continue,
        };
        let empty = json!({});
        let tags = props.get("tags").unwrap_or(&empty);

        let mut attrs = serde_json::Map::new();
        if let Some(id) = props.get("id") {
            attrs.insert("id".to_string(), id.clone());
        }
        if let Some(timestamp) = props.get("timestamp") {
            attrs.insert("timestamp".to_string(), timestamp.clone());
        }
        if let Some(country) = tags.get("ISO3166-1") {
            attrs.insert("country".to_string(), country.clone());
        }
        if let Some(state) = tags.get("ISO3166-2") {
            attrs.insert("state".to_string(), state.clone());
        }
        if let Some(name) = tags.get("name:en").or_else(|| tags.get("name")) {
            attrs.insert("name".to_string(), name.clone());
        }

        let uri = match props.get("uri").and_then(Value::as_str) {
            Some(uri) => uri.to_string(),
            None => match props.get("id") {
                Some(id) => format!("{}/{}/{}", OSM_URI_PREFIX, feature_type, id),
                None => format!("urn:uuid:{}", uuid::Uuid::new_v4()),
            },
        };

        return Ok((feature, Value::Object(attrs), uri));
    }
    bail!("No Feature with type relation or way found")
}

fn feature_timestamp(attrs: &Value) -> DateTime<Utc> {
    attrs
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// Insert the shape unless an equal geometry is already stored; idempotent
/// on the URI.
async fn upsert_shape(
    tx: &mut Transaction<'_, Postgres>,
    uri: &str,
    geometry: geo_types::Geometry<f64>,
    updated: DateTime<Utc>,
    attrs: &Value,
) -> anyhow::Result<Uuid> {
    let existing = sqlx::query(
        "SELECT id FROM shape \
         WHERE ST_Equals(geometries, ST_ForceCollection(ST_SetSRID($1::geometry, 4326)))",
    )
    .bind(wkb::Encode(geometry.clone()))
    .fetch_optional(&mut *tx)
    .await
    .context("Checking for an equal geometry failed")?;
    if let Some(row) = existing {
        return Ok(row.try_get("id")?);
    }

    let row = sqlx::query(
        "INSERT INTO shape (uri, geometries, updated, attrs) \
         VALUES ($1, ST_ForceCollection(ST_SetSRID($2::geometry, 4326)), $3, $4) \
         ON CONFLICT (uri) DO UPDATE SET \
             geometries = EXCLUDED.geometries, \
             updated = EXCLUDED.updated, \
             attrs = EXCLUDED.attrs \
         RETURNING id",
    )
    .bind(uri)
    .bind(wkb::Encode(geometry))
    .bind(updated)
    .bind(attrs.clone())
    .fetch_one(&mut *tx)
    .await
    .context("Inserting the shape failed")?;
    Ok(row.try_get("id")?)
}

/// Point the shape at a peer LoST server, replacing a previous peer row.
async fn replace_peer_mapping(
    tx: &mut Transaction<'_, Postgres>,
    shape_id: Uuid,
    peer_url: &str,
) -> anyhow::Result<()> {
    sqlx::query("DELETE FROM mapping WHERE shape = $1 AND srv = $2")
        .bind(shape_id)
        .bind(PEER_SERVICE)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO mapping (srv, shape, updated, attrs) VALUES ($1, $2, now(), $3)")
        .bind(PEER_SERVICE)
        .bind(shape_id)
        .bind(json!({ "uri": peer_url }))
        .execute(&mut *tx)
        .await?;
    Ok(())
}

async fn load_file(
    pool: &PgPool,
    path: &Path,
    url_map: &HashMap<String, String>,
) -> anyhow::Result<String> {
    let fc = read_features(path)?;
    check_crs(&fc)?;
    let (feature, attrs, uri) = extract_boundary(&fc)?;

    let geometry: geo_types::Geometry<f64> = feature
        .geometry
        .clone()
        .ok_or_else(|| anyhow!("Boundary feature has no geometry"))?
        .value
        .try_into()
        .map_err(|e| anyhow!("Unsupported geometry: {}", e))?;
    let updated = feature_timestamp(&attrs);

    let mut tx = pool.begin().await?;
    let shape_id = upsert_shape(&mut tx, &uri, geometry, updated, &attrs).await?;

    let key = path.display().to_string();
    if let Some(peer_url) = url_map.get(&key).or_else(|| url_map.get(&uri)) {
        replace_peer_mapping(&mut tx, shape_id, peer_url).await?;
    }
    tx.commit().await?;
    Ok(uri)
}

async fn load(pool: &PgPool, pattern: &str, url_map_file: Option<&str>) -> anyhow::Result<()> {
    let url_map: HashMap<String, String> = match url_map_file {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read URL map \"{}\"", path))?;
            serde_json::from_str(&content)
                .with_context(|| format!("\"{}\" is not a JSON object of strings", path))?
        }
        None => HashMap::new(),
    };

    let mut loaded = 0usize;
    for entry in glob(pattern).context("Invalid glob pattern")? {
        let path = entry?;
        match load_file(pool, &path, &url_map).await {
            Ok(uri) => {
                println!("Loaded {} as {}", path.display(), uri);
                loaded += 1;
            }
            Err(e) => {
                eprintln!("Skipping {}: {}", path.display(), e);
            }
        }
    }
    if loaded == 0 {
        bail!("No files matched \"{}\"", pattern);
    }
    println!("Loaded {} boundary files", loaded);
    Ok(())
}

async fn add_mapping(
    pool: &PgPool,
    shape_uri: &str,
    service: &str,
    uris: &[String],
) -> anyhow::Result<()> {
    let row = sqlx::query("SELECT id FROM shape WHERE uri = $1")
        .bind(shape_uri)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| anyhow!("No shape with uri \"{}\"", shape_uri))?;
    let shape_id: Uuid = row.try_get("id")?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM mapping WHERE shape = $1 AND srv = $2")
        .bind(shape_id)
        .bind(service)
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO mapping (srv, shape, updated, attrs) VALUES ($1, $2, now(), $3)")
        .bind(service)
        .bind(shape_id)
        .bind(json!({ "uri": uris }))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    println!("Registered {} for shape {}", service, shape_uri);
    Ok(())
}

async fn init_db(pool: &PgPool, drop: bool) -> anyhow::Result<()> {
    if drop {
        println!("Dropping table mapping");
        sqlx::query("DROP TABLE IF EXISTS mapping").execute(pool).await?;
        println!("Dropping table shape");
        sqlx::query("DROP TABLE IF EXISTS shape").execute(pool).await?;
    }

    sqlx::query("CREATE EXTENSION IF NOT EXISTS postgis")
        .execute(pool)
        .await?;

    println!("Creating table shape");
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS shape ( \
             id         uuid        PRIMARY KEY DEFAULT gen_random_uuid(), \
             uri        text        UNIQUE NOT NULL, \
             geometries geometry(GEOMETRYCOLLECTION, 4326) NOT NULL, \
             updated    timestamptz NOT NULL DEFAULT now(), \
             attrs      jsonb       NOT NULL DEFAULT '{}'::jsonb \
         )",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS shape_geometries_idx ON shape USING GIST (geometries)",
    )
    .execute(pool)
    .await?;

    println!("Creating table mapping");
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS mapping ( \
             id      uuid        PRIMARY KEY DEFAULT gen_random_uuid(), \
             srv     text        NOT NULL, \
             shape   uuid        REFERENCES shape(id) ON DELETE CASCADE, \
             updated timestamptz NOT NULL DEFAULT now(), \
             attrs   jsonb       NOT NULL DEFAULT '{}'::jsonb \
         )",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS mapping_srv_idx ON mapping (srv)")
        .execute(pool)
        .await?;
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let pool = database::connect_to_database(
        &args.db_url,
        database::DEFAULT_MIN_CON,
        4,
        Duration::from_secs(10),
    )
    .await
    .with_context(|| format!("Error while connecting to database \"{}\"", args.db_url))?;

    match &args.command {
        Command::InitDb { drop } => init_db(&pool, *drop).await,
        Command::Load { pattern, url_map } => load(&pool, pattern, url_map.as_deref()).await,
        Command::AddMapping {
            shape_uri,
            service,
            uris,
        } => add_mapping(&pool, shape_uri, service, uris).await,
    }
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
