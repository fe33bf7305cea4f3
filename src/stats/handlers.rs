use actix_web::{web, HttpRequest, HttpResponse};

use crate::auth::{client_origin, Authenticated};
use crate::error::AppError;
use crate::response::ApiResponse;
use crate::stats::{StatusUpdate, TrafficReport};
use crate::AppState;

pub async fn update_status(
    req: HttpRequest,
    Authenticated(identity): Authenticated,
    body: web::Json<StatusUpdate>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let event = state
        .usage
        .update_status(&identity, body.into_inner(), &client_origin(&req))
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Status updated", event)))
}

pub async fn upload_stats(
    req: HttpRequest,
    Authenticated(identity): Authenticated,
    body: web::Json<TrafficReport>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let sample = state
        .usage
        .upload_stats(&identity, body.into_inner(), &client_origin(&req))
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Statistics recorded", sample)))
}

pub async fn user_stats(
    req: HttpRequest,
    Authenticated(identity): Authenticated,
    path: web::Path<String>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let view = state
        .usage
        .user_stats(&identity, &path, &client_origin(&req))
        .await?;
    Ok(HttpResponse::Ok().json(ApiResponse::ok("Usage statistics", view)))
}
