use std::time::Duration;

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{web, App, HttpServer};
use clap::Parser;
use dotenvy::dotenv;

use lost_server::config::Settings;
use lost_server::context::ServerContext;
use lost_server::handlers;
use lost_server::telemetries::{get_subscriber, init_subscriber};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    let settings = Settings::parse();

    let subscriber = get_subscriber("lost_server".into(), "info".into(), std::io::stdout);
    init_subscriber(subscriber);

    tracing::info!("Connecting to the geospatial store");
    let pool = match database::connect_to_database(
        &settings.db_url,
        settings.min_con,
        settings.max_con,
        Duration::from_secs(settings.peer_timeout),
    )
    .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Error while connecting to database: {}", e);
            std::process::exit(1);
        }
    };

    let ip = settings.ip.clone();
    let port = settings.port;
    let server_id = settings.server_id.clone();

    let context = match ServerContext::new(pool, settings) {
        Ok(context) => context,
        Err(e) => {
            tracing::error!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };
    let context = web::Data::new(context);

    tracing::info!("Starting LoST server \"{}\" on {}:{}", server_id, ip, port);
    HttpServer::new(move || {
        App::new()
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allowed_methods(["GET", "POST"])
                    .allowed_header(header::CONTENT_TYPE),
            )
            .route("/", web::get().to(handlers::ping))
            .route("/", web::post().to(handlers::submit))
            .app_data(context.clone())
    })
    .bind((ip.as_str(), port))?
    .run()
    .await
}
