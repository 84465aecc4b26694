//! A counted inbox: a list of items with an unread total, kept current by
//! one realtime subscription.
//!
//! Chats and notifications both work this way. What differs between them is
//! described by an [`InboxSource`]; the [`Inbox`] owns the local list, the
//! cached counter and the subscription task.

use std::future::Future;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use super::backend::BackendClient;
use super::cache::KvCache;
use crate::errors::AppError;
use crate::query::Filter;

/// The entity-specific half of an inbox.
pub trait InboxSource: Send + Sync + 'static {
    type Item: Clone + Send + Sync + 'static;

    /// Table whose inserts drive the realtime subscription.
    fn table(&self) -> &'static str;

    /// Cache key for the user's unread total.
    fn cache_key(&self, user_id: &str) -> String;

    fn item_key(&self, item: &Self::Item) -> String;

    /// Unread units this item contributes to the total.
    fn unread_of(&self, item: &Self::Item) -> i64;

    fn clear_unread(&self, item: &mut Self::Item);

    /// Row filter for the subscription. `None` subscribes to the whole table.
    fn realtime_filter(&self, user_id: &str) -> Option<Filter>;

    /// Most items kept locally. Items sorted past it are dropped.
    fn capacity(&self) -> Option<usize> {
        None
    }

    /// Which item an inserted record belongs to.
    fn key_for_record(&self, record: &Value) -> Option<String>;

    fn sort(&self, items: &mut [Self::Item]);

    fn fetch_items(
        &self,
        backend: &BackendClient,
        user_id: &str,
    ) -> impl Future<Output = Result<Vec<Self::Item>, AppError>> + Send;

    fn fetch_one(
        &self,
        backend: &BackendClient,
        user_id: &str,
        key: &str,
    ) -> impl Future<Output = Result<Option<Self::Item>, AppError>> + Send;

    fn fetch_unread_count(
        &self,
        backend: &BackendClient,
        user_id: &str,
    ) -> impl Future<Output = Result<i64, AppError>> + Send;
}

/// Change notifications for UI observers.
#[derive(Debug, Clone)]
pub enum InboxEvent<T> {
    Updated(T),
    UnreadCount(i64),
}

struct Shared<S: InboxSource> {
    source: S,
    backend: BackendClient,
    cache: Arc<KvCache>,
    items: RwLock<Vec<S::Item>>,
    events: broadcast::Sender<InboxEvent<S::Item>>,
}

pub struct Inbox<S: InboxSource> {
    shared: Arc<Shared<S>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: InboxSource> Inbox<S> {
    pub fn new(source: S, backend: BackendClient, cache: Arc<KvCache>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(Shared {
                source,
                backend,
                cache,
                items: RwLock::new(Vec::new()),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    pub fn source(&self) -> &S {
        &self.shared.source
    }

    pub fn backend(&self) -> &BackendClient {
        &self.shared.backend
    }

    pub fn events(&self) -> broadcast::Receiver<InboxEvent<S::Item>> {
        self.shared.events.subscribe()
    }

    /// Local copy of the list.
    pub async fn items(&self) -> Vec<S::Item> {
        self.shared.items.read().await.clone()
    }

    /// Fetch the list from the server and replace the local copy.
    pub async fn refresh(&self) -> Result<Vec<S::Item>, AppError> {
        let user = self.shared.backend.require_user().await?;
        let mut items = self
            .shared
            .source
            .fetch_items(&self.shared.backend, &user.id)
            .await?;
        self.shared.source.sort(&mut items);
        *self.shared.items.write().await = items.clone();
        Ok(items)
    }

    /// Server unread total. Falls back to the cached value, then to 0.
    pub async fn unread_count(&self) -> i64 {
        let Some(user) = self.shared.backend.current_user().await else {
            return 0;
        };
        let key = self.shared.source.cache_key(&user.id);

        match self
            .shared
            .source
            .fetch_unread_count(&self.shared.backend, &user.id)
            .await
        {
            Ok(count) => {
                self.shared.cache.set_i64(&key, count).await;
                let _ = self.shared.events.send(InboxEvent::UnreadCount(count));
                count
            }
            Err(e) => {
                tracing::warn!("Unread count for {} unavailable: {}", self.shared.source.table(), e);
                self.shared.cache.get_i64(&key).await.unwrap_or(0)
            }
        }
    }

    /// Last known unread total without asking the server.
    pub async fn cached_unread_count(&self) -> i64 {
        match self.shared.backend.current_user().await {
            Some(user) => self
                .shared
                .cache
                .get_i64(&self.shared.source.cache_key(&user.id))
                .await
                .unwrap_or(0),
            None => 0,
        }
    }

    /// Clear the unread state of the given items (all items for `None`)
    /// after the server reported `marked` rows as read.
    pub async fn mark_read(&self, keys: Option<&[String]>, marked: i64) {
        {
            let mut items = self.shared.items.write().await;
            for item in items.iter_mut() {
                let selected = match keys {
                    Some(keys) => keys.contains(&self.shared.source.item_key(item)),
                    None => true,
                };
                if selected {
                    self.shared.source.clear_unread(item);
                }
            }
        }
        if let Some(user) = self.shared.backend.current_user().await {
            self.shared.adjust_unread(&user.id, -marked).await;
        }
    }

    /// Mirror a local write into the list.
    pub async fn update_local(&self, key: &str, update: impl FnOnce(&mut S::Item)) {
        let mut items = self.shared.items.write().await;
        if let Some(item) = items
            .iter_mut()
            .find(|item| self.shared.source.item_key(item) == key)
        {
            update(item);
        }
        self.shared.source.sort(&mut items);
    }

    /// Start the realtime subscription, replacing any previous one. The
    /// list is refreshed first so events land on current state.
    pub async fn subscribe(&self) -> Result<(), AppError> {
        let user = self.shared.backend.require_user().await?;
        self.unsubscribe().await;

        self.refresh().await?;
        let table = self.shared.source.table();
        let filter = self.shared.source.realtime_filter(&user.id);
        let topic = format!("{}:{}", table, user.id);
        let mut channel = self
            .shared
            .backend
            .subscribe(&topic, table, filter.as_ref())
            .await?;

        let mut session = self.shared.backend.session_changes();
        let shared = Arc::clone(&self.shared);

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    record = channel.recv() => {
                        let Some(record) = record else {
                            tracing::warn!("Realtime channel {} closed", channel.topic());
                            break;
                        };
                        if let Err(e) = shared.apply_record(&user.id, &record).await {
                            tracing::warn!("Failed to apply {} change: {}", table, e);
                        }
                    }
                    changed = session.changed() => {
                        let same_user = changed.is_ok()
                            && session.borrow().as_ref().is_some_and(|u| u.id == user.id);
                        if !same_user {
                            tracing::info!("Session ended, stopping {} subscription", table);
                            shared.items.write().await.clear();
                            break;
                        }
                    }
                }
            }
            channel.unsubscribe().await;
        });

        *self.task.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    pub async fn unsubscribe(&self) {
        let task = self.task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

impl<S: InboxSource> Shared<S> {
    /// Re-fetch the item a record belongs to and reconcile the total.
    async fn apply_record(&self, user_id: &str, record: &Value) -> Result<(), AppError> {
        let Some(key) = self.source.key_for_record(record) else {
            return Ok(());
        };
        let Some(item) = self.source.fetch_one(&self.backend, user_id, &key).await? else {
            return Ok(());
        };

        let previous = {
            let mut items = self.items.write().await;
            let previous = match items.iter().position(|i| self.source.item_key(i) == key) {
                Some(index) => Some(std::mem::replace(&mut items[index], item.clone())),
                None => {
                    items.push(item.clone());
                    None
                }
            };
            self.source.sort(&mut items);
            if let Some(capacity) = self.source.capacity() {
                items.truncate(capacity);
            }
            previous
        };

        let delta =
            self.source.unread_of(&item) - previous.map_or(0, |p| self.source.unread_of(&p));
        let _ = self.events.send(InboxEvent::Updated(item));
        if delta != 0 {
            self.adjust_unread(user_id, delta).await;
        }
        Ok(())
    }

    async fn adjust_unread(&self, user_id: &str, delta: i64) {
        let key = self.source.cache_key(user_id);
        let current = self.cache.get_i64(&key).await.unwrap_or(0);
        let updated = (current + delta).max(0);
        self.cache.set_i64(&key, updated).await;
        let _ = self.events.send(InboxEvent::UnreadCount(updated));
    }
}

impl<S: InboxSource> Drop for Inbox<S> {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().unwrap_or_else(|e| e.into_inner()).take() {
            task.abort();
        }
    }
}
