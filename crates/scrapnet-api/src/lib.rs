//! # scrapnet api
//!
//! The externally visible half of a scrapnet node. The ring itself lives
//! in `scrapnet-ring`; this crate only asks it who owns a key.
//!
//! ## Components
//!
//! - **HTTP API**: the external scrape/auth routes and the internal
//!   replication endpoints
//! - **Scrape collaborator**: fetches a page and builds the zip artifact
//! - **Storage**: per-node artifact store and user directory
//! - **Replication**: mirrors owned records onto both ring neighbors

pub mod config;
pub mod error;
pub mod handlers;
pub mod jwt;
pub mod replication;
pub mod scrape;
pub mod storage;
pub mod users;

use actix_web::dev::Server;
use actix_web::http::header;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use tracing::info;

pub use config::{HttpConfig, NodeConfig};
pub use error::{ApiError, ApiResult};
pub use handlers::AppState;
pub use jwt::JwtService;
pub use replication::Replicator;
pub use scrape::Scraper;
pub use storage::ArtifactStore;
pub use users::UserDirectory;

/// Build the HTTP server without awaiting it, so the caller keeps the
/// handle for graceful shutdown.
pub fn build_server(state: AppState, config: &HttpConfig) -> std::io::Result<Server> {
    info!(
        host = %config.host,
        port = config.port,
        workers = config.workers,
        "Starting HTTP API"
    );

    let data = web::Data::new(state);

    let server = HttpServer::new(move || {
        let cors = actix_cors::Cors::default()
            .allow_any_origin()
            .allowed_methods(vec!["GET", "POST"])
            .allowed_headers(vec![header::AUTHORIZATION, header::CONTENT_TYPE])
            .max_age(3600);

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(Logger::default())
            .configure(handlers::configure)
    })
    .bind((config.host.as_str(), config.port))?
    .workers(config.workers)
    .run();

    Ok(server)
}
