use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use crate::auth::{client_origin, Authenticated};
use crate::error::AppError;
use crate::response::ApiResponse;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub phone_number: String,
    pub password: String,
    pub otp: String,
}

pub async fn register(
    req: HttpRequest,
    body: web::Json<RegisterRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    info!("Received registration request for {}", body.phone_number);
    let origin = client_origin(&req);

    let session = state
        .auth
        .register(&body.phone_number, &body.password, &body.otp, &origin)
        .await
        .map_err(|e| {
            error!("Registration failed for {}: {}", body.phone_number, e);
            e
        })?;

    Ok(HttpResponse::Created().json(json!({
        "success": true,
        "message": "User registered successfully",
        "token": session.token,
        "data": {
            "user_id": session.account.id,
            "phone_number": session.account.phone_number,
            "created_at": session.account.created_at,
        }
    })))
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub phone_number: String,
    pub password: String,
}

pub async fn login(
    req: HttpRequest,
    body: web::Json<LoginRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let origin = client_origin(&req);
    let session = state.auth.login(&body.phone_number, &body.password, &origin).await?;
    info!("Login successful for {}", session.account.phone_number);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Login successful",
        "token": session.token,
        "data": {
            "user_id": session.account.id,
            "phone_number": session.account.phone_number,
            "login_time": session.account.last_login,
        }
    })))
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub token: String,
}

pub async fn refresh(
    req: HttpRequest,
    body: web::Json<RefreshRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let refreshed = state.auth.refresh(&body.token, &client_origin(&req)).await?;

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "message": "Token refreshed successfully",
        "token": refreshed.token,
        "data": {
            "refreshed_at": refreshed.refreshed_at,
        }
    })))
}

pub async fn logout(req: HttpRequest, state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());
    let logout_time = state.auth.logout(authorization, &client_origin(&req)).await?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "Logout successful",
        json!({ "logout_time": logout_time }),
    )))
}

#[derive(Debug, Deserialize)]
pub struct SendOtpRequest {
    pub phone_number: String,
}

pub async fn send_otp(
    req: HttpRequest,
    body: web::Json<SendOtpRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let dispatch = state.auth.send_otp(&body.phone_number, &client_origin(&req)).await?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        "OTP sent successfully",
        json!({
            "phone_number": dispatch.phone_number,
            "expires_in": dispatch.expires_in,
        }),
    )))
}

#[derive(Debug, Deserialize)]
pub struct AccountStatusRequest {
    pub active: bool,
}

pub async fn set_account_status(
    req: HttpRequest,
    Authenticated(identity): Authenticated,
    path: web::Path<String>,
    body: web::Json<AccountStatusRequest>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let phone_number = path.into_inner();
    state
        .auth
        .set_account_active(&identity, &phone_number, body.active, &client_origin(&req))
        .await?;

    let message = if body.active {
        "Account activated"
    } else {
        "Account deactivated"
    };
    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        message,
        json!({ "phone_number": phone_number, "active": body.active }),
    )))
}
