//! Per-user app preferences.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPreferences {
    pub user_id: String,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
    #[serde(default = "default_true")]
    pub push_notifications: bool,
    #[serde(default)]
    pub email_notifications: bool,
    #[serde(default)]
    pub dark_mode: bool,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en".to_string()
}

fn default_currency() -> String {
    "USD".to_string()
}

impl UserPreferences {
    /// Preferences used when none are stored or they cannot be fetched.
    pub fn defaults_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            notifications_enabled: true,
            push_notifications: true,
            email_notifications: false,
            dark_mode: false,
            language: default_language(),
            currency: default_currency(),
        }
    }
}
