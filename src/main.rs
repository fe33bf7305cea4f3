use actix_cors::Cors;
use anyhow::Context;
use actix_web::middleware::{from_fn, DefaultHeaders};
use actix_web::{http::header, web, App, HttpServer};
use dotenv::dotenv;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vpn_control_plane::auth::{InMemoryOtpStore, LogDelivery, OtpStore};
use vpn_control_plane::config::OtpStoreKind;
use vpn_control_plane::db::DbOperations;
use vpn_control_plane::fleet::HttpNodeSync;
use vpn_control_plane::{configure_routes, health_check, rate_limit, AppState, Backends, Settings};

/// How often idle rate-limit windows are dropped.
const LIMITER_SWEEP: Duration = Duration::from_secs(300);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // A missing or weak signing secret stops the process here
    let config = Settings::load()?;
    info!("Configuration loaded successfully ({})", config.environment);

    let db = DbOperations::new_with_options(
        &config.database.url,
        config.database.max_connections,
        Duration::from_secs(config.database.acquire_timeout_secs),
    )
    .await
    .context("connecting to the database")?;
    db.migrate().await.context("running migrations")?;
    info!("Database ready");

    let node_sync = HttpNodeSync::new(Duration::from_secs(config.fleet.sync_timeout_secs))?;
    let mut backends = Backends::postgres(&db, Arc::new(LogDelivery), Arc::new(node_sync));
    backends.otp_store = match config.otp.store {
        OtpStoreKind::Database => Arc::new(db.clone()) as Arc<dyn OtpStore>,
        OtpStoreKind::Memory => {
            warn!("OTP challenges are kept in memory and will not survive a restart");
            Arc::new(InMemoryOtpStore::new())
        }
    };

    let state = web::Data::new(AppState::new(config.clone(), backends)?);

    let sweeper = state.limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LIMITER_SWEEP);
        loop {
            interval.tick().await;
            sweeper.cleanup().await;
        }
    });

    let address = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&address).with_context(|| format!("binding {}", address))?;
    info!("Starting server at {}:{}", config.server.host, config.server.port);

    let origins = config.cors_origins();
    let max_age = config.cors.max_age as usize;

    HttpServer::new(move || {
        let cors = origins
            .iter()
            .fold(Cors::default(), |cors, origin| cors.allowed_origin(origin))
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .allowed_headers(vec![header::AUTHORIZATION, header::CONTENT_TYPE])
            .max_age(max_age);

        let security_headers = DefaultHeaders::new()
            .add((header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
            .add((header::X_FRAME_OPTIONS, "DENY"))
            .add((header::STRICT_TRANSPORT_SECURITY, "max-age=31536000; includeSubDomains"))
            .add((header::CONTENT_SECURITY_POLICY, "default-src 'self'"));

        App::new()
            .wrap(from_fn(rate_limit))
            .wrap(security_headers)
            .wrap(cors)
            .app_data(state.clone())
            .route("/health", web::get().to(health_check))
            .configure(configure_routes)
    })
    .listen(listener)?
    .workers(config.server.workers as usize)
    .run()
    .await?;

    db.close().await;
    Ok(())
}
