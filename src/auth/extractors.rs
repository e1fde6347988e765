use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::warn;

use super::{jwt::JwtKeys, repo_types::User};
use crate::{error::AppError, state::AppState};

/// The authenticated user behind a `Bearer` token.
///
/// A token is accepted only if it verifies, its subject still exists, and it is
/// exactly the session token currently stored for that user. Logging out or
/// logging in again therefore revokes every earlier token.
pub struct CurrentUser(pub User);

pub async fn authenticate(state: &AppState, token: &str) -> Result<User, AppError> {
    let claims = JwtKeys::from_ref(state).verify(token).map_err(|e| {
        warn!(error = %e, "invalid or expired token");
        AppError::not_authorized()
    })?;

    let Some(user) = state.users.find_by_id(claims.sub).await? else {
        warn!(user_id = %claims.sub, "token subject no longer exists");
        return Err(AppError::not_authorized());
    };

    if !user.holds_session(token) {
        warn!(user_id = %user.id, "token does not match stored session");
        return Err(AppError::not_authorized());
    }
    Ok(user)
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    let header = parts
        .headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

#[async_trait]
impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or_else(AppError::not_authorized)?;
        authenticate(state, token).await.map(CurrentUser)
    }
}
