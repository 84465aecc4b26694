//! Identities and bearer sessions. These tables are never exposed through `/rest`.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use uuid::Uuid;

use super::Repository;
use crate::errors::AppError;
use crate::models::{AuthUser, SignUpMetadata};

impl Repository {
    /// Create the identity, its public profile and default preferences together.
    pub async fn create_account(
        &self,
        email: &str,
        password_hash: &str,
        metadata: &SignUpMetadata,
    ) -> Result<AuthUser, AppError> {
        let id = Uuid::new_v4().to_string();
        let created_at = Utc::now();
        let now = created_at.to_rfc3339_opts(SecondsFormat::Micros, true);

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO auth_users (id, email, password_hash, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(email)
        .bind(password_hash)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(|e| match AppError::from(e) {
            AppError::Conflict(_) => AppError::Conflict("Email is already registered".to_string()),
            other => other,
        })?;

        sqlx::query(
            r#"
            INSERT INTO users (id, email, full_name, university, phone, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(email)
        .bind(&metadata.full_name)
        .bind(&metadata.university)
        .bind(&metadata.phone)
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO user_preferences (id, user_id, updated_at) VALUES (?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(&id)
            .bind(&now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        tracing::info!("Created account {}", id);
        Ok(AuthUser {
            id,
            email: email.to_string(),
            created_at,
        })
    }

    /// Identity and stored password hash for an email, if registered.
    pub async fn find_credentials(
        &self,
        email: &str,
    ) -> Result<Option<(AuthUser, String)>, AppError> {
        let row = sqlx::query(
            "SELECT id, email, password_hash, created_at FROM auth_users WHERE email = ?",
        )
        .bind(email)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            let user = AuthUser {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            };
            Ok((user, row.try_get("password_hash")?))
        })
        .transpose()
    }

    /// Issue a new opaque bearer token.
    pub async fn create_session(&self, user_id: &str) -> Result<String, AppError> {
        let token = format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple());
        sqlx::query("INSERT INTO sessions (token, user_id, created_at) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(user_id)
            .bind(super::now_timestamp())
            .execute(self.pool())
            .await?;
        Ok(token)
    }

    /// Resolve a bearer token to its identity.
    pub async fn session_user(&self, token: &str) -> Result<Option<AuthUser>, AppError> {
        let row = sqlx::query(
            r#"
            SELECT a.id, a.email, a.created_at
            FROM sessions s
            JOIN auth_users a ON a.id = s.user_id
            WHERE s.token = ?
            "#,
        )
        .bind(token)
        .fetch_optional(self.pool())
        .await?;

        row.map(|row| {
            Ok(AuthUser {
                id: row.try_get("id")?,
                email: row.try_get("email")?,
                created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            })
        })
        .transpose()
    }

    pub async fn delete_session(&self, token: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM sessions WHERE token = ?")
            .bind(token)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn update_password(&self, user_id: &str, password_hash: &str) -> Result<(), AppError> {
        let result = sqlx::query("UPDATE auth_users SET password_hash = ? WHERE id = ?")
            .bind(password_hash)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("User {} not found", user_id)));
        }
        Ok(())
    }
}
