//! Auth endpoints: sign-up, password grant, logout and the current user.

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;

use super::AppState;
use crate::auth::{bearer_token, hash_password, resolve_session, verify_password, CurrentUser};
use crate::errors::AppError;
use crate::models::{AuthUser, AuthUserUpdate, PasswordCredentials, Session, SignUpRequest};

#[derive(Debug, Deserialize)]
pub struct GrantQuery {
    grant_type: String,
}

fn normalize_email(email: &str) -> Result<String, AppError> {
    let email = email.trim().to_lowercase();
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(AppError::Validation("A valid email is required".to_string())),
    }
}

async fn open_session(state: &AppState, user: AuthUser) -> Result<Session, AppError> {
    let access_token = state.repo.create_session(&user.id).await?;
    Ok(Session {
        access_token,
        token_type: "bearer".to_string(),
        user,
    })
}

/// POST /auth/v1/signup - Register and sign in.
pub async fn sign_up(
    State(state): State<AppState>,
    Json(request): Json<SignUpRequest>,
) -> Result<(StatusCode, Json<Session>), AppError> {
    let email = normalize_email(&request.email)?;
    if request.data.full_name.trim().is_empty() {
        return Err(AppError::Validation("Full name is required".to_string()));
    }
    let password_hash = hash_password(&request.password)?;

    let user = state
        .repo
        .create_account(&email, &password_hash, &request.data)
        .await?;
    let session = open_session(&state, user).await?;

    Ok((StatusCode::CREATED, Json(session)))
}

/// POST /auth/v1/token?grant_type=password - Sign in.
pub async fn token(
    State(state): State<AppState>,
    Query(query): Query<GrantQuery>,
    Json(credentials): Json<PasswordCredentials>,
) -> Result<Json<Session>, AppError> {
    if query.grant_type != "password" {
        return Err(AppError::BadRequest(format!(
            "Unsupported grant_type: {}",
            query.grant_type
        )));
    }

    let invalid = || AppError::Unauthorized("Invalid email or password".to_string());
    let email = normalize_email(&credentials.email).map_err(|_| invalid())?;
    let (user, stored_hash) = state
        .repo
        .find_credentials(&email)
        .await?
        .ok_or_else(invalid)?;
    if !verify_password(&credentials.password, &stored_hash) {
        tracing::info!("Failed sign-in for {}", user.id);
        return Err(invalid());
    }

    Ok(Json(open_session(&state, user).await?))
}

/// POST /auth/v1/logout - End the presented session.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<StatusCode, AppError> {
    let token = bearer_token(&headers);
    if resolve_session(&state, token).await?.is_none() {
        return Err(AppError::Unauthorized("No session to end".to_string()));
    }
    if let Some(token) = token {
        state.repo.delete_session(token).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

/// GET /auth/v1/user - The identity behind the session.
pub async fn get_user(CurrentUser(user): CurrentUser) -> Json<AuthUser> {
    Json(user)
}

/// PUT /auth/v1/user - Change the password.
pub async fn update_user(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
    Json(update): Json<AuthUserUpdate>,
) -> Result<Json<AuthUser>, AppError> {
    if let Some(password) = &update.password {
        let password_hash = hash_password(password)?;
        state.repo.update_password(&user.id, &password_hash).await?;
        tracing::info!("Password changed for {}", user.id);
    }
    Ok(Json(user))
}
