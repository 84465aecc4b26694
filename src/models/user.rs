//! User, profile and auth session models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public profile row in the `users` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct User {
    pub id: String,
    pub email: String,
    pub full_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub university: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub rating: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Partial update of a profile row.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub university: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
}

impl UserUpdate {
    pub fn is_empty(&self) -> bool {
        self.full_name.is_none()
            && self.avatar_url.is_none()
            && self.university.is_none()
            && self.phone.is_none()
            && self.bio.is_none()
    }
}

/// Result of the `get_user_profile` procedure: the profile plus seller statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    #[serde(flatten)]
    pub user: User,
    pub products_count: i64,
    pub active_listings: i64,
    pub sold_count: i64,
    pub reviews_count: i64,
    #[serde(default)]
    pub average_rating: Option<f64>,
}

/// Identity as known to the auth service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuthUser {
    pub id: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

/// A signed-in session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub token_type: String,
    pub user: AuthUser,
}

/// Profile data captured at sign-up.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignUpMetadata {
    pub full_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub university: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Request body for `POST /auth/v1/signup`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignUpRequest {
    pub email: String,
    pub password: String,
    #[serde(default)]
    pub data: SignUpMetadata,
}

/// Request body for the password grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordCredentials {
    pub email: String,
    pub password: String,
}

/// Request body for `PUT /auth/v1/user`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthUserUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}
