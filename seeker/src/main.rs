use std::str::FromStr;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use geojson::GeoJson;

use lost_client::LostClient;
use lost_protocol::geometry::{gml_from_geojson, gml_point};
use lost_protocol::xml::{self, Element};

#[derive(Parser, Debug)]
#[clap(author, version, about = "Query a LoST server", long_about = None)]
struct Args {
    /// LoST server URL.
    #[clap(short, long, env = "SERVER_URL", default_value = "http://localhost:5000")]
    server_url: String,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a service URN for a location.
    FindService {
        /// Service URN, e.g. urn:service:sos.
        service: String,

        /// LON LAT coordinates, or the path of a file holding a GML
        /// geometry or a GeoJSON object.
        #[clap(required = true)]
        location: Vec<String>,

        /// Ask for iterative resolution and follow redirects locally.
        #[clap(long)]
        redirect: bool,

        /// Receive the service boundary by reference instead of by value.
        #[clap(long)]
        reference: bool,
    },

    /// List the mappings whose service boundary intersects a geometry.
    FindIntersect {
        /// Service URN, e.g. urn:service:sos.
        service: String,

        /// LON LAT coordinates, or the path of a file holding a GML
        /// geometry or a GeoJSON object.
        #[clap(required = true)]
        location: Vec<String>,

        #[clap(long)]
        redirect: bool,

        #[clap(long)]
        reference: bool,
    },
}

/// Interpret the location arguments: two values are LON LAT coordinates of
/// a point, a single value is a file tried first as GML, then as GeoJSON.
fn parse_location(location: &[String]) -> anyhow::Result<Element> {
    match location {
        [lon, lat] => {
            let lon: f64 = lon.parse().with_context(|| format!("Invalid longitude \"{}\"", lon))?;
            let lat: f64 = lat.parse().with_context(|| format!("Invalid latitude \"{}\"", lat))?;
            Ok(gml_point(lat, lon))
        }
        [file] => {
            let text = std::fs::read_to_string(file)
                .with_context(|| format!("Cannot read location file \"{}\"", file))?;
            if let Ok(element) = xml::parse(&text) {
                return Ok(element);
            }
            match GeoJson::from_str(&text) {
                Ok(geojson) => Ok(gml_from_geojson(&geojson)?),
                Err(_) => bail!("Unknown location file format (tried GML and GeoJSON)"),
            }
        }
        _ => bail!("Pass LON LAT coordinates or a single location file"),
    }
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let client = LostClient::new(&args.server_url)?;

    let uris = match &args.command {
        Command::FindService {
            service,
            location,
            redirect,
            reference,
        } => {
            let geometry = parse_location(location)?;
            client
                .find_service(service, geometry, !redirect, *reference)
                .await?
        }
        Command::FindIntersect {
            service,
            location,
            redirect,
            reference,
        } => {
            let geometry = parse_location(location)?;
            client
                .find_intersect(service, geometry, !redirect, *reference)
                .await?
        }
    };

    for uri in uris {
        println!("{}", uri);
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
