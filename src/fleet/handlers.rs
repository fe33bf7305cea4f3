use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::auth::{client_origin, AdminOnly, Authenticated};
use crate::error::AppError;
use crate::fleet::{BindingRequest, NodeRegistration};
use crate::response::ApiResponse;
use crate::AppState;

pub async fn register_node(
    req: HttpRequest,
    AdminOnly(identity): AdminOnly,
    body: web::Json<NodeRegistration>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let summary = state
        .fleet
        .register(&identity.phone_number, body.into_inner(), &client_origin(&req))
        .await?;

    Ok(HttpResponse::Created().json(ApiResponse::ok("End-node registered", summary)))
}

pub async fn list_nodes(
    _caller: Authenticated,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let nodes = state.fleet.list().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        format!("{} end-node(s)", nodes.len()),
        nodes,
    )))
}

pub async fn get_node(
    _caller: Authenticated,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let node = state.fleet.get(&path).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("End-node found", node)))
}

#[derive(Debug, Deserialize)]
pub struct HealthReport {
    pub status: String,
    #[serde(default)]
    pub response_time_ms: Option<i32>,
}

pub async fn report_health(
    req: HttpRequest,
    AdminOnly(identity): AdminOnly,
    path: web::Path<String>,
    body: web::Json<HealthReport>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let node = state
        .fleet
        .record_health(
            &identity.phone_number,
            &path,
            &body.status,
            body.response_time_ms,
            &client_origin(&req),
        )
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Health recorded", node)))
}

pub async fn deregister_node(
    req: HttpRequest,
    AdminOnly(identity): AdminOnly,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let node_id = path.into_inner();
    let removed = state
        .fleet
        .deregister(&identity.phone_number, &node_id, &client_origin(&req))
        .await?;
    info!("Deregistration of {} by {} (removed: {})", node_id, identity.phone_number, removed);

    let message = if removed {
        "End-node deregistered"
    } else {
        "End-node was not registered"
    };
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        message,
        json!({ "server_id": node_id, "removed": removed }),
    )))
}

pub async fn list_users(
    _admin: AdminOnly,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let bindings = state.fleet.list_bindings().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        format!("{} binding(s)", bindings.len()),
        bindings,
    )))
}

pub async fn create_user(
    req: HttpRequest,
    AdminOnly(identity): AdminOnly,
    body: web::Json<BindingRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let report = state
        .fleet
        .create_binding(&identity.phone_number, body.into_inner(), &client_origin(&req))
        .await?;
    Ok(HttpResponse::Created().json(ApiResponse::ok("User created", report)))
}

pub async fn get_user(
    _admin: AdminOnly,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let bindings = state.fleet.user_bindings(&path).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("User found", bindings)))
}

pub async fn delete_user(
    req: HttpRequest,
    AdminOnly(identity): AdminOnly,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let username = path.into_inner();
    let removed = state
        .fleet
        .delete_user(&identity.phone_number, &username, &client_origin(&req))
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "User deleted",
        json!({ "username": username, "bindings_removed": removed }),
    )))
}

pub async fn list_locations(
    _caller: Authenticated,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let locations = state.fleet.location_overview().await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Locations", locations)))
}

pub async fn location_servers(
    _caller: Authenticated,
    path: web::Path<i32>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let servers = state.fleet.location_servers(path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Location servers", servers)))
}
