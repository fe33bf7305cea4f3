use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::audit::AuditFilter;
use crate::auth::AdminOnly;
use crate::error::AppError;
use crate::response::ApiResponse;
use crate::AppState;

const DEFAULT_LIMIT: i64 = 50;

#[derive(Debug, Deserialize)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub server_id: Option<String>,
    pub username: Option<String>,
}

/// `GET /api/logs`, newest first.
pub async fn recent_logs(
    _admin: AdminOnly,
    query: web::Query<LogQuery>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let query = query.into_inner();
    let filter = AuditFilter {
        server_id: query.server_id.filter(|s| !s.is_empty()),
        username: query.username.filter(|u| !u.is_empty()),
    };
    let events = state
        .audit
        .recent(&filter, query.limit.unwrap_or(DEFAULT_LIMIT))
        .await?;

    Ok(HttpResponse::Ok().json(ApiResponse::ok(
        format!("{} audit event(s)", events.len()),
        events,
    )))
}
