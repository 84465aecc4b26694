//! Client side of the marketplace: session, typed tables, chat and
//! notification inboxes.

pub mod auth;
pub mod backend;
pub mod cache;
pub mod database;
pub mod inbox;
pub mod messaging;
pub mod notifications;
pub mod optimistic;
pub mod push;
pub mod realtime;

use std::sync::Arc;

pub use auth::AuthProvider;
pub use backend::{BackendClient, ConflictMode, TableQuery};
pub use cache::KvCache;
pub use database::Database;
pub use inbox::{Inbox, InboxEvent, InboxSource};
pub use messaging::Messaging;
pub use notifications::Notifications;
pub use optimistic::Optimistic;
pub use push::{PushRouter, Route};
pub use realtime::RealtimeChannel;

use crate::config::Config;
use crate::errors::AppError;

/// Everything an app screen needs, sharing one backend session.
pub struct MarketClient {
    pub backend: BackendClient,
    pub auth: AuthProvider,
    pub database: Database,
    pub messaging: Messaging,
    pub notifications: Notifications,
    pub cache: Arc<KvCache>,
}

impl MarketClient {
    /// Build from configuration, loading the cache file.
    pub async fn connect(config: &Config) -> Result<Self, AppError> {
        let backend = BackendClient::from_config(config)?;
        let cache = KvCache::open(&config.cache_path).await?;
        Ok(Self::with_cache(backend, Arc::new(cache)))
    }

    pub fn with_cache(backend: BackendClient, cache: Arc<KvCache>) -> Self {
        Self {
            auth: AuthProvider::new(backend.clone()),
            database: Database::new(backend.clone()),
            messaging: Messaging::new(backend.clone(), Arc::clone(&cache)),
            notifications: Notifications::new(backend.clone(), Arc::clone(&cache)),
            backend,
            cache,
        }
    }

    /// Stop both inboxes, then end the session.
    pub async fn sign_out(&self) -> Result<(), AppError> {
        self.messaging.unsubscribe().await;
        self.notifications.unsubscribe().await;
        self.auth.sign_out().await
    }
}
