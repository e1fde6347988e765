use anyhow::Context;
use axum::extract::FromRef;
use tracing::{error, info, warn};

use crate::{
    auth::{
        dto::{LoginRequest, LoginResponse, PublicUser, RegisterRequest},
        jwt::JwtKeys,
        password::{hash_password, reject_unknown, verify_password},
        repo_types::{NewUser, User, UserPatch},
    },
    avatars::{default_avatar_for, TempUpload},
    error::{AppError, AppResult, INVALID_CREDENTIALS},
    state::AppState,
};

fn invalid_credentials() -> AppError {
    AppError::Unauthorized(INVALID_CREDENTIALS.into())
}

/// Creates the account. Email is expected normalized.
pub async fn register(st: &AppState, req: RegisterRequest) -> AppResult<PublicUser> {
    if st.users.find_by_email(&req.email).await?.is_some() {
        warn!(email = %req.email, "email already registered");
        return Err(crate::auth::repo::email_in_use());
    }

    let cfg = st.config.password;
    let password = req.password;
    let password_hash = tokio::task::spawn_blocking(move || hash_password(&cfg, &password))
        .await
        .context("hash task")??;

    let user = st
        .users
        .create(NewUser {
            avatar_url: default_avatar_for(&req.email),
            email: req.email,
            password_hash,
            subscription: req.subscription.unwrap_or_default(),
        })
        .await?;

    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok(PublicUser::from(&user))
}

/// Unknown email and wrong password fail identically.
pub async fn login(st: &AppState, req: LoginRequest) -> AppResult<LoginResponse> {
    let Some(user) = st.users.find_by_email(&req.email).await? else {
        // same Argon2 cost as a wrong password
        let cfg = st.config.password;
        let password = req.password;
        tokio::task::spawn_blocking(move || reject_unknown(&cfg, &password))
            .await
            .context("verify task")?;
        warn!(email = %req.email, "login unknown email");
        return Err(invalid_credentials());
    };

    let password = req.password;
    let hash = user.password_hash.clone();
    let ok = tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .context("verify task")?;
    if !ok {
        warn!(user_id = %user.id, "login invalid password");
        return Err(invalid_credentials());
    }

    let token = JwtKeys::from_ref(st).issue(user.id)?;
    // Overwriting the stored token revokes whatever session was there before.
    let user = st
        .users
        .update_by_id(user.id, UserPatch::session(token.clone()))
        .await?
        .ok_or_else(invalid_credentials)?;

    info!(user_id = %user.id, "user logged in");
    Ok(LoginResponse {
        token,
        user: PublicUser::from(&user),
    })
}

pub fn current(user: &User) -> AppResult<PublicUser> {
    if user.email.is_empty() {
        return Err(AppError::not_authorized());
    }
    Ok(PublicUser::from(user))
}

pub async fn logout(st: &AppState, user: &User) -> AppResult<()> {
    st.users
        .update_by_id(user.id, UserPatch::clear_session())
        .await?;
    info!(user_id = %user.id, "user logged out");
    Ok(())
}

/// Stores the upload and points the user at it. The record is untouched if storing fails.
pub async fn update_avatar(
    st: &AppState,
    user: &User,
    upload: Option<TempUpload>,
) -> AppResult<String> {
    let upload = upload.ok_or_else(AppError::not_authorized)?;
    let avatar_url = st.avatars.store(user.id, upload).await?;

    let updated = st
        .users
        .update_by_id(user.id, UserPatch::avatar(avatar_url.clone()))
        .await;
    match updated {
        Ok(Some(_)) => {
            info!(user_id = %user.id, %avatar_url, "avatar updated");
            Ok(avatar_url)
        }
        Ok(None) => {
            discard(st, &avatar_url).await;
            Err(AppError::not_authorized())
        }
        Err(e) => {
            discard(st, &avatar_url).await;
            Err(e.into())
        }
    }
}

async fn discard(st: &AppState, avatar_url: &str) {
    if let Err(e) = st.avatars.remove(avatar_url).await {
        error!(error = %e, %avatar_url, "failed to remove orphaned avatar");
    }
}
