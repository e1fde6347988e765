use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, State,
    },
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use tracing::{instrument, warn};

use crate::{
    auth::{
        dto::{
            AvatarResponse, LoginRequest, LoginResponse, PublicUser, RegisterRequest,
            RegisterResponse, ValidatedJson,
        },
        extractors::CurrentUser,
        services,
    },
    avatars::TempUpload,
    error::{AppError, AppResult},
    state::AppState,
};

pub const AVATAR_FIELD: &str = "avatar";
pub(crate) const AVATAR_BODY_LIMIT: usize = 5 * 1024 * 1024;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/current", get(current))
        .route("/logout", post(logout))
        .route(
            "/avatars",
            patch(update_avatar).layer(DefaultBodyLimit::max(AVATAR_BODY_LIMIT)),
        )
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<RegisterRequest>,
) -> AppResult<(StatusCode, Json<RegisterResponse>)> {
    let user = services::register(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(RegisterResponse { user })))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    ValidatedJson(payload): ValidatedJson<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    Ok(Json(services::login(&state, payload).await?))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn current(CurrentUser(user): CurrentUser) -> AppResult<Json<PublicUser>> {
    Ok(Json(services::current(&user)?))
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn logout(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> AppResult<StatusCode> {
    services::logout(&state, &user).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, fields(user_id = %user.id))]
pub async fn update_avatar(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    multipart: Result<Multipart, MultipartRejection>,
) -> AppResult<Json<AvatarResponse>> {
    // a body that is not multipart carries no file
    let upload = match multipart {
        Ok(mut multipart) => staged_avatar(&state, &mut multipart).await?,
        Err(_) => None,
    };

    let avatar_url = services::update_avatar(&state, &user, upload).await?;
    Ok(Json(AvatarResponse { avatar_url }))
}

/// Stages the last non-empty `avatar` field of the form.
async fn staged_avatar(
    state: &AppState,
    multipart: &mut Multipart,
) -> AppResult<Option<TempUpload>> {
    let mut upload = None;
    while let Some(field) = multipart.next_field().await.map_err(upload_error)? {
        if field.name() != Some(AVATAR_FIELD) {
            continue;
        }
        let original_name = field.file_name().unwrap_or_default().to_string();
        let body = field.bytes().await.map_err(upload_error)?;
        if body.is_empty() {
            continue;
        }
        upload = Some(TempUpload::stage(&state.config.tmp_dir, &original_name, &body).await?);
    }
    Ok(upload)
}

/// Over-limit bodies keep their 413; anything else is a bad upload.
fn upload_error(e: MultipartError) -> AppError {
    warn!(error = %e, "malformed multipart body");
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::Upload(e.body_text())
    }
}
