use serde_json::json;

use super::{require_text, single, Database};
use crate::client::backend::ConflictMode;
use crate::errors::{log_ignored, AppError};
use crate::models::{
    Address, AddressUpdate, NewAddress, NewVerificationRequest, User, UserPreferences, UserProfile,
    UserUpdate, VerificationRequest, VerificationStatus,
};
use crate::query::Direction;

impl Database {
    // Users

    pub async fn get_user(&self, user_id: &str) -> Result<Option<User>, AppError> {
        self.backend
            .from("users")
            .eq("id", user_id)
            .fetch_optional()
            .await
    }

    /// Profile with seller statistics.
    pub async fn get_user_profile(&self, user_id: &str) -> Result<UserProfile, AppError> {
        self.backend
            .rpc("get_user_profile", &json!({ "user_id": user_id }))
            .await
    }

    pub async fn update_user(&self, update: &UserUpdate) -> Result<User, AppError> {
        if update.is_empty() {
            return Err(AppError::Validation("Nothing to update".to_string()));
        }
        let me = self.backend.require_user().await?;
        let rows = self
            .backend
            .from("users")
            .eq("id", &me.id)
            .update(update)
            .await?;
        single(rows, "Profile")
    }

    // Addresses

    /// The user's addresses, default first.
    pub async fn addresses(&self) -> Result<Vec<Address>, AppError> {
        let me = self.backend.require_user().await?;
        self.backend
            .from("user_addresses")
            .eq("user_id", &me.id)
            .order("is_default", Direction::Desc)
            .order("created_at", Direction::Asc)
            .fetch()
            .await
    }

    /// Add an address. The first address becomes the default.
    pub async fn add_address(&self, address: &NewAddress) -> Result<Address, AppError> {
        require_text(&address.street, "Street")?;
        require_text(&address.city, "City")?;
        require_text(&address.full_name, "Full name")?;

        let existing = self.addresses().await?;
        let make_default = address.is_default || existing.is_empty();
        if make_default && !existing.is_empty() {
            self.clear_default_address().await?;
        }

        let mut body = serde_json::to_value(address)?;
        body["is_default"] = json!(make_default);
        let rows = self.backend.from("user_addresses").insert(&body).await?;
        single(rows, "Address")
    }

    pub async fn update_address(
        &self,
        address_id: &str,
        update: &AddressUpdate,
    ) -> Result<Address, AppError> {
        self.backend.require_user().await?;
        let rows = self
            .backend
            .from("user_addresses")
            .eq("id", address_id)
            .update(update)
            .await?;
        single(rows, "Address")
    }

    pub async fn delete_address(&self, address_id: &str) -> Result<(), AppError> {
        self.backend.require_user().await?;
        let deleted: Vec<Address> = self
            .backend
            .from("user_addresses")
            .eq("id", address_id)
            .delete()
            .await?;
        if deleted.is_empty() {
            return Err(AppError::NotFound(format!("Address {} not found", address_id)));
        }
        Ok(())
    }

    /// Make one address the default and clear the flag on the others.
    pub async fn set_default_address(&self, address_id: &str) -> Result<Address, AppError> {
        self.clear_default_address().await?;
        let rows = self
            .backend
            .from("user_addresses")
            .eq("id", address_id)
            .update(&json!({ "is_default": true }))
            .await?;
        single(rows, "Address")
    }

    async fn clear_default_address(&self) -> Result<(), AppError> {
        let me = self.backend.require_user().await?;
        let _: Vec<Address> = self
            .backend
            .from("user_addresses")
            .eq("user_id", &me.id)
            .eq("is_default", true)
            .update(&json!({ "is_default": false }))
            .await?;
        Ok(())
    }

    // Preferences

    /// Stored preferences, or defaults when none exist or they cannot be read.
    pub async fn preferences(&self) -> Result<UserPreferences, AppError> {
        let me = self.backend.require_user().await?;
        let stored = log_ignored(
            "Preferences",
            self.backend
                .from("user_preferences")
                .eq("user_id", &me.id)
                .fetch_optional::<UserPreferences>()
                .await,
        )
        .flatten();
        Ok(stored.unwrap_or_else(|| UserPreferences::defaults_for(&me.id)))
    }

    pub async fn save_preferences(
        &self,
        preferences: &UserPreferences,
    ) -> Result<UserPreferences, AppError> {
        let me = self.backend.require_user().await?;
        if preferences.user_id != me.id {
            return Err(AppError::Unauthorized(
                "Preferences belong to another user".to_string(),
            ));
        }
        let rows = self
            .backend
            .from("user_preferences")
            .upsert(preferences, &["user_id"], ConflictMode::MergeDuplicates)
            .await?;
        single(rows, "Preferences")
    }

    // Verification

    pub async fn submit_verification(
        &self,
        request: &NewVerificationRequest,
    ) -> Result<VerificationRequest, AppError> {
        require_text(&request.document_type, "Document type")?;
        require_text(&request.document_url, "Document")?;

        if let Some(latest) = self.latest_verification().await? {
            match latest.status {
                VerificationStatus::Pending => {
                    return Err(AppError::Conflict(
                        "A verification request is already pending".to_string(),
                    ))
                }
                VerificationStatus::Approved => {
                    return Err(AppError::Conflict("You are already verified".to_string()))
                }
                VerificationStatus::Rejected => {}
            }
        }

        let rows = self
            .backend
            .from("verification_requests")
            .insert(request)
            .await?;
        single(rows, "Verification request")
    }

    pub async fn latest_verification(&self) -> Result<Option<VerificationRequest>, AppError> {
        let me = self.backend.require_user().await?;
        self.backend
            .from("verification_requests")
            .eq("user_id", &me.id)
            .order("created_at", Direction::Desc)
            .fetch_optional()
            .await
    }
}
