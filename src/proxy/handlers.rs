use actix_web::http::header::{ContentDisposition, DispositionParam, DispositionType};
use actix_web::{web, HttpResponse};

use crate::auth::Authenticated;
use crate::error::AppError;
use crate::AppState;

/// `GET /api/ovpn/{username}/{server_id}`
pub async fn download_config(
    Authenticated(identity): Authenticated,
    path: web::Path<(String, String)>,
    state: web::Data<AppState>,
) -> Result<HttpResponse, AppError> {
    let (username, server_id) = path.into_inner();
    tracing::debug!("{} requested config for {} on {}", identity.phone_number, username, server_id);

    let artifact = state.proxy.fetch_user_config(&username, &server_id).await?;

    Ok(HttpResponse::Ok()
        .content_type(artifact.content_type)
        .insert_header(ContentDisposition {
            disposition: DispositionType::Attachment,
            parameters: vec![DispositionParam::Filename(artifact.filename)],
        })
        .streaming(artifact.body))
}
