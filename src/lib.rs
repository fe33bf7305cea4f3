pub mod audit;
pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod fleet;
pub mod proxy;
pub mod response;
pub mod stats;

use actix_web::body::{BoxBody, MessageBody};
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::middleware::Next;
use actix_web::error::{JsonPayloadError, QueryPayloadError};
use actix_web::{web, HttpRequest, HttpResponse, ResponseError};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub use error::AppError;
pub type Result<T> = std::result::Result<T, AppError>;
pub use crate::config::Settings;

use audit::AuditLog;
use auth::{AuthGateway, InMemoryOtpStore, OtpDelivery, OtpService, OtpStore, RateLimiter, TokenService, API_BUCKET};
use db::{AccountStore, AuditSink, DbOperations, FleetStore, MemoryStore, UsageStore};
use fleet::{FleetRegistry, NodeCredentialCipher, NodeSync};
use proxy::ConfigProxy;
use stats::UsageService;

/// Health check endpoint handler
/// Returns a JSON response with server status and timestamp
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// Storage and outbound collaborators the application is assembled from.
#[derive(Clone)]
pub struct Backends {
    pub accounts: Arc<dyn AccountStore>,
    pub fleet: Arc<dyn FleetStore>,
    pub usage: Arc<dyn UsageStore>,
    pub audit: Arc<dyn AuditSink>,
    pub otp_store: Arc<dyn OtpStore>,
    pub otp_delivery: Arc<dyn OtpDelivery>,
    pub node_sync: Arc<dyn NodeSync>,
}

impl Backends {
    /// Everything kept in process. Used by tests and local tooling.
    pub fn in_memory(store: &MemoryStore, otp_delivery: Arc<dyn OtpDelivery>, node_sync: Arc<dyn NodeSync>) -> Self {
        let store = Arc::new(store.clone());
        Self {
            accounts: store.clone(),
            fleet: store.clone(),
            usage: store.clone(),
            audit: store,
            otp_store: Arc::new(InMemoryOtpStore::new()),
            otp_delivery,
            node_sync,
        }
    }

    /// PostgreSQL for durable records. OTP challenges stay in process unless
    /// `otp_store` is swapped for the database.
    pub fn postgres(db: &DbOperations, otp_delivery: Arc<dyn OtpDelivery>, node_sync: Arc<dyn NodeSync>) -> Self {
        let db = Arc::new(db.clone());
        Self {
            accounts: db.clone(),
            fleet: db.clone(),
            usage: db.clone(),
            audit: db,
            otp_store: Arc::new(InMemoryOtpStore::new()),
            otp_delivery,
            node_sync,
        }
    }
}

/// Application state shared across all components
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    pub auth: Arc<AuthGateway>,
    pub fleet: Arc<FleetRegistry>,
    pub proxy: Arc<ConfigProxy>,
    pub usage: Arc<UsageService>,
    pub audit: AuditLog,
    pub limiter: RateLimiter,
}

impl AppState {
    /// Wires the services together and starts the reconciliation worker, so
    /// it must be called from within a Tokio runtime.
    pub fn new(config: Settings, backends: Backends) -> Result<Self> {
        let config = Arc::new(config);
        let audit = AuditLog::new(backends.audit, config.audit.server_id.clone());
        let limiter = RateLimiter::new();

        let tokens = TokenService::new(&config.auth.jwt_secret)?;
        let otp = OtpService::new(
            backends.otp_store,
            backends.otp_delivery,
            limiter.clone(),
            &config.otp,
        );
        let auth = AuthGateway::new(tokens, otp, backends.accounts, audit.clone(), &config.otp);

        let cipher = Arc::new(NodeCredentialCipher::from_secret(&config.auth.jwt_secret));
        let (fleet, tasks) = FleetRegistry::new(
            backends.fleet,
            backends.node_sync,
            cipher,
            audit.clone(),
            config.fleet.node_scheme.clone(),
        );
        let fleet = Arc::new(fleet);
        fleet::reconcile::spawn_worker(fleet.clone(), tasks);

        let proxy = ConfigProxy::new(
            fleet.clone(),
            Duration::from_secs(config.fleet.upstream_timeout_secs),
        )?;
        let usage = UsageService::new(backends.usage, audit.clone());

        Ok(Self {
            config,
            auth: Arc::new(auth),
            fleet,
            proxy: Arc::new(proxy),
            usage: Arc::new(usage),
            audit,
            limiter,
        })
    }
}

/// Malformed bodies and query strings get the same JSON envelope as every other error.
fn json_error(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::ValidationError(format!("Invalid request body: {}", err)).into()
}

fn query_error(err: QueryPayloadError, _req: &HttpRequest) -> actix_web::Error {
    AppError::ValidationError(format!("Invalid query string: {}", err)).into()
}

/// Every route except `/health`.
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(json_error))
        .app_data(web::QueryConfig::default().error_handler(query_error));

    cfg.service(
        web::scope("/auth")
            .route("/register", web::post().to(auth::handlers::register))
            .route("/login", web::post().to(auth::handlers::login))
            .route("/refresh", web::post().to(auth::handlers::refresh))
            .route("/logout", web::post().to(auth::handlers::logout))
            .route("/send-otp", web::post().to(auth::handlers::send_otp)),
    )
    .service(
        web::scope("/api")
            .route(
                "/accounts/{phone_number}/active",
                web::put().to(auth::handlers::set_account_status),
            )
            .route("/endnodes", web::get().to(fleet::handlers::list_nodes))
            .route("/endnodes/register", web::post().to(fleet::handlers::register_node))
            .service(
                web::resource("/endnodes/{id}")
                    .route(web::get().to(fleet::handlers::get_node))
                    .route(web::delete().to(fleet::handlers::deregister_node)),
            )
            .route("/endnodes/{id}/health", web::post().to(fleet::handlers::report_health))
            .route("/endnodes/{id}/deregister", web::post().to(fleet::handlers::deregister_node))
            .service(
                web::resource("/users")
                    .route(web::get().to(fleet::handlers::list_users))
                    .route(web::post().to(fleet::handlers::create_user)),
            )
            .service(
                web::resource("/users/{username}")
                    .route(web::get().to(fleet::handlers::get_user))
                    .route(web::delete().to(fleet::handlers::delete_user)),
            )
            .route("/ovpn/{username}/{server_id}", web::get().to(proxy::handlers::download_config))
            .route("/logs", web::get().to(audit::handlers::recent_logs)),
    )
    .service(
        web::scope("/vpn")
            .route("/status", web::post().to(stats::handlers::update_status))
            .route("/stats", web::post().to(stats::handlers::upload_stats))
            .route("/stats/{username}", web::get().to(stats::handlers::user_stats))
            .route("/locations", web::get().to(fleet::handlers::list_locations))
            .route("/locations/{id}/servers", web::get().to(fleet::handlers::location_servers)),
    );
}

/// Per-origin request throttle on the `api_request` bucket.
pub async fn rate_limit(
    req: ServiceRequest,
    next: Next<impl MessageBody + 'static>,
) -> std::result::Result<ServiceResponse<BoxBody>, actix_web::Error> {
    if req.path() != "/health" {
        if let Some(state) = req.app_data::<web::Data<AppState>>().cloned() {
            let limits = &state.config.rate_limit;
            let origin = auth::origin_from(
                req.peer_addr(),
                req.connection_info().realip_remote_addr(),
                &limits.trusted_proxies,
            );
            let allowed = state
                .limiter
                .check_rate_limit(&origin, API_BUCKET, limits.requests, limits.window_secs)
                .await;
            if !allowed {
                warn!("Rate limit exceeded for {} on {}", origin, req.path());
                let response = AppError::RateLimited.error_response();
                return Ok(req.into_response(response));
            }
        }
    }

    next.call(req).await.map(ServiceResponse::map_into_boxed_body)
}
