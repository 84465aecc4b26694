//! Session provider: sign-up, sign-in and the signed-in user's profile.
//!
//! Realtime subscriptions watch [`AuthProvider::session_changes`] and stop
//! on their own when the session ends.

use tokio::sync::{watch, RwLock};

use super::backend::BackendClient;
use crate::auth::MIN_PASSWORD_LEN;
use crate::errors::AppError;
use crate::models::{AuthUser, AuthUserUpdate, Session, SignUpMetadata, SignUpRequest, User, UserUpdate};

pub struct AuthProvider {
    backend: BackendClient,
    profile: RwLock<Option<User>>,
}

impl AuthProvider {
    pub fn new(backend: BackendClient) -> Self {
        Self {
            backend,
            profile: RwLock::new(None),
        }
    }

    pub async fn sign_up(
        &self,
        email: &str,
        password: &str,
        metadata: SignUpMetadata,
    ) -> Result<Session, AppError> {
        check_password(password)?;
        if metadata.full_name.trim().is_empty() {
            return Err(AppError::Validation("Full name is required".to_string()));
        }

        let request = SignUpRequest {
            email: email.trim().to_string(),
            password: password.to_string(),
            data: metadata,
        };
        let session = self.backend.sign_up(&request).await?;
        self.load_profile(&session.user.id).await;
        Ok(session)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<Session, AppError> {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AppError::Validation(
                "Email and password are required".to_string(),
            ));
        }
        let session = self
            .backend
            .sign_in_with_password(email.trim(), password)
            .await?;
        self.load_profile(&session.user.id).await;
        Ok(session)
    }

    /// End the session locally and on the server.
    pub async fn sign_out(&self) -> Result<(), AppError> {
        *self.profile.write().await = None;
        self.backend.sign_out().await
    }

    pub async fn current_user(&self) -> Option<AuthUser> {
        self.backend.current_user().await
    }

    pub async fn is_signed_in(&self) -> bool {
        self.backend.current_user().await.is_some()
    }

    /// Cached profile of the signed-in user.
    pub async fn profile(&self) -> Option<User> {
        self.profile.read().await.clone()
    }

    pub async fn refresh_profile(&self) -> Result<User, AppError> {
        let user = self.backend.require_user().await?;
        let profile: User = self
            .backend
            .from("users")
            .eq("id", &user.id)
            .fetch_optional()
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Profile {} not found", user.id)))?;
        *self.profile.write().await = Some(profile.clone());
        Ok(profile)
    }

    pub async fn update_profile(&self, update: &UserUpdate) -> Result<User, AppError> {
        if update.is_empty() {
            return Err(AppError::Validation("Nothing to update".to_string()));
        }
        if update
            .full_name
            .as_deref()
            .is_some_and(|name| name.trim().is_empty())
        {
            return Err(AppError::Validation("Full name cannot be empty".to_string()));
        }

        let user = self.backend.require_user().await?;
        let rows: Vec<User> = self
            .backend
            .from("users")
            .eq("id", &user.id)
            .update(update)
            .await?;
        let profile = rows
            .into_iter()
            .next()
            .ok_or_else(|| AppError::NotFound(format!("Profile {} not found", user.id)))?;
        *self.profile.write().await = Some(profile.clone());
        Ok(profile)
    }

    pub async fn change_password(&self, new_password: &str) -> Result<(), AppError> {
        check_password(new_password)?;
        self.backend.require_user().await?;
        let update = AuthUserUpdate {
            password: Some(new_password.to_string()),
        };
        self.backend.update_user(&update).await?;
        Ok(())
    }

    pub fn session_changes(&self) -> watch::Receiver<Option<AuthUser>> {
        self.backend.session_changes()
    }

    /// Profile load after sign-in is best effort.
    async fn load_profile(&self, user_id: &str) {
        if let Err(e) = self.refresh_profile().await {
            tracing::warn!("Profile for {} not loaded: {}", user_id, e);
        }
    }
}

fn check_password(password: &str) -> Result<(), AppError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::Validation(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }
    Ok(())
}
