//! Integration tests: the reference backend on a random port, driven
//! through the client.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use reqwest::Client;
use tempfile::TempDir;

use crate::api::{create_router, AppState};
use crate::client::{BackendClient, KvCache, MarketClient, Messaging};
use crate::config::{Config, DEV_ANON_KEY};
use crate::db::{init_database, Repository};
use crate::errors::AppError;
use crate::models::{
    MessageType, NewAddress, NewOrder, NewProduct, NotificationType, OrderStatus, Product,
    ProductCondition, ProductStatus, ProductUpdate, SearchParams, SignUpMetadata, SortBy,
};
use crate::search::ProductIndex;

/// Poll an async condition for up to five seconds.
macro_rules! wait_until {
    ($cond:expr, $what:expr) => {{
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if $cond {
                break;
            }
            assert!(Instant::now() < deadline, "Timed out waiting for {}", $what);
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }};
}

/// Test fixture for integration tests.
struct TestFixture {
    http: Client,
    base_url: String,
    _temp_dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.sqlite");
        let index_path = temp_dir.path().join("index");

        // Initialize database
        let pool = init_database(&db_path).await.expect("Failed to init DB");
        let repo = Repository::new(pool);

        // Initialize search index
        let search = ProductIndex::open(&index_path).expect("Failed to init search");

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);

        let config = Config {
            backend_url: base_url.clone(),
            anon_key: DEV_ANON_KEY.to_string(),
            db_path,
            index_path,
            bind_addr: addr,
            cache_path: temp_dir.path().join("cache.json"),
            log_level: "warn".to_string(),
        };

        let app = create_router(AppState::new(repo, search, config));

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(Duration::from_millis(100)).await;

        TestFixture {
            http: Client::new(),
            base_url,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// A signed-out client with an in-memory cache.
    fn client(&self) -> MarketClient {
        let backend = BackendClient::new(&self.base_url, DEV_ANON_KEY).unwrap();
        MarketClient::with_cache(backend, Arc::new(KvCache::in_memory()))
    }

    /// A freshly registered, signed-in user.
    async fn user(&self, name: &str) -> MarketClient {
        let client = self.client();
        client
            .auth
            .sign_up(
                &format!("{}@campus.edu", name.to_lowercase()),
                "password123",
                SignUpMetadata {
                    full_name: name.to_string(),
                    university: Some("State University".to_string()),
                    phone: None,
                },
            )
            .await
            .expect("Failed to sign up");
        client
    }
}

fn listing(title: &str, category: &str, description: &str, price: f64) -> NewProduct {
    NewProduct {
        seller_id: None,
        title: title.to_string(),
        description: description.to_string(),
        price,
        original_price: None,
        category: category.to_string(),
        condition: ProductCondition::Good,
        images: vec![format!("https://img.example/{}.jpg", title.replace(' ', "-"))],
        location: Some("North Campus".to_string()),
        is_flash_deal: false,
        flash_deal_ends_at: None,
    }
}

async fn list_product(seller: &MarketClient, title: &str, price: f64) -> Product {
    seller
        .database
        .create_product(&listing(title, "books", "", price))
        .await
        .expect("Failed to create product")
}

async fn user_id(client: &MarketClient) -> String {
    client.auth.current_user().await.expect("signed in").id
}

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new().await;

    let resp = fixture.http.get(fixture.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_api_key_required() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .http
        .get(fixture.url("/rest/v1/products"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = fixture
        .http
        .get(fixture.url("/rest/v1/products"))
        .header("apikey", "wrong-key")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = fixture
        .http
        .get(fixture.url("/rest/v1/products"))
        .header("apikey", DEV_ANON_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_sign_up_sign_in_sign_out() {
    let fixture = TestFixture::new().await;
    let ada = fixture.user("Ada").await;

    let profile = ada.auth.profile().await.expect("profile loaded");
    assert_eq!(profile.full_name, "Ada");
    assert_eq!(profile.email, "ada@campus.edu");
    assert_eq!(profile.university.as_deref(), Some("State University"));

    ada.sign_out().await.unwrap();
    assert!(ada.auth.current_user().await.is_none());
    assert!(ada.auth.profile().await.is_none());

    let err = ada.auth.sign_in("ada@campus.edu", "wrong-password").await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    ada.auth.sign_in("ADA@campus.edu", "password123").await.unwrap();
    assert!(ada.auth.is_signed_in().await);

    let again = fixture.client();
    let err = again
        .auth
        .sign_up(
            "ada@campus.edu",
            "password123",
            SignUpMetadata {
                full_name: "Other Ada".to_string(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
}

#[tokio::test]
async fn test_profile_and_password_updates() {
    let fixture = TestFixture::new().await;
    let ada = fixture.user("Ada").await;

    let updated = ada
        .auth
        .update_profile(&crate::models::UserUpdate {
            bio: Some("Selling my old books".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(updated.bio.as_deref(), Some("Selling my old books"));

    ada.auth.change_password("new-password").await.unwrap();
    ada.auth.sign_out().await.unwrap();
    assert!(ada.auth.sign_in("ada@campus.edu", "password123").await.is_err());
    ada.auth.sign_in("ada@campus.edu", "new-password").await.unwrap();
}

#[tokio::test]
async fn test_products_are_owned_by_their_seller() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let other = fixture.user("Olly").await;

    let product = list_product(&seller, "Chemistry notes", 12.0).await;
    assert_eq!(product.seller_id, user_id(&seller).await);
    assert_eq!(product.status, ProductStatus::Active);

    let update = ProductUpdate {
        price: Some(1.0),
        ..Default::default()
    };
    let err = other.database.update_product(&product.id, &update).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let err = other.database.delete_product(&product.id).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));

    let changed = seller.database.update_product(&product.id, &update).await.unwrap();
    assert_eq!(changed.price, 1.0);

    let mine = seller.database.seller_products(&product.seller_id).await.unwrap();
    assert_eq!(mine.len(), 1);

    seller.database.delete_product(&product.id).await.unwrap();
    assert!(seller.database.get_product(&product.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_chat_list_ordering_is_stable() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;

    let lamp = list_product(&seller, "Desk lamp", 15.0).await;
    let chair = list_product(&seller, "Office chair", 40.0).await;
    let kettle = list_product(&seller, "Kettle", 8.0).await;

    let lamp_chat = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();
    let chair_chat = buyer.messaging.get_or_create_chat(&chair.seller_id, &chair.id).await.unwrap();
    let kettle_chat = buyer.messaging.get_or_create_chat(&kettle.seller_id, &kettle.id).await.unwrap();

    buyer
        .messaging
        .send_message(&lamp_chat.id, "Is the lamp still available?", MessageType::Text)
        .await
        .unwrap();
    buyer
        .messaging
        .send_message(&chair_chat.id, "Would you take 35?", MessageType::Offer)
        .await
        .unwrap();

    let first = buyer.messaging.fetch_chats().await.unwrap();
    let second = buyer.messaging.fetch_chats().await.unwrap();
    let ids = |chats: &[crate::models::ChatSummary]| -> Vec<String> {
        chats.iter().map(|c| c.id.clone()).collect()
    };
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(ids(&first), [chair_chat.id.clone(), lamp_chat.id.clone(), kettle_chat.id.clone()]);

    // Chats without messages sort last
    assert!(first[2].last_message_at.is_none());
    assert_eq!(first[0].last_message.as_deref(), Some("Would you take 35?"));
    assert_eq!(first[0].other_user_name.as_deref(), Some("Sam"));
    assert_eq!(first[0].product_title.as_deref(), Some("Office chair"));
}

#[tokio::test]
async fn test_chat_is_unique_per_buyer_and_product() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;

    let first = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();
    let second = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();
    assert_eq!(first.id, second.id);

    let err = seller
        .messaging
        .get_or_create_chat(&lamp.seller_id, &lamp.id)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_sent_message_appears_once() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;
    let chat = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();

    buyer.messaging.send_message(&chat.id, "first", MessageType::Text).await.unwrap();
    let sent = buyer.messaging.send_message(&chat.id, "second", MessageType::Text).await.unwrap();

    let messages = buyer.messaging.fetch_messages(&chat.id).await.unwrap();
    assert_eq!(messages.iter().filter(|m| m.id == sent.id).count(), 1);
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, "first");
    assert_eq!(messages[1].content, "second");

    let err = buyer.messaging.send_message(&chat.id, "   ", MessageType::Text).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Outsiders can neither read nor write the chat
    let outsider = fixture.user("Olly").await;
    assert!(outsider.messaging.send_message(&chat.id, "hi", MessageType::Text).await.is_err());
}

#[tokio::test]
async fn test_mark_chat_read_drops_total_exactly() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;
    let chair = list_product(&seller, "Office chair", 40.0).await;

    let lamp_chat = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();
    let chair_chat = buyer.messaging.get_or_create_chat(&chair.seller_id, &chair.id).await.unwrap();
    for text in ["one", "two", "three"] {
        buyer.messaging.send_message(&lamp_chat.id, text, MessageType::Text).await.unwrap();
    }
    buyer.messaging.send_message(&chair_chat.id, "four", MessageType::Text).await.unwrap();

    assert_eq!(seller.messaging.unread_count().await, 4);
    let chats = seller.messaging.fetch_chats().await.unwrap();
    let lamp_unread = chats.iter().find(|c| c.id == lamp_chat.id).unwrap().unread_count;
    assert_eq!(lamp_unread, 3);

    let marked = seller.messaging.mark_chat_read(&lamp_chat.id).await.unwrap();
    assert_eq!(marked, 3);
    assert_eq!(seller.messaging.cached_unread_count().await, 1);
    let local = seller.messaging.chats().await;
    assert_eq!(local.iter().find(|c| c.id == lamp_chat.id).unwrap().unread_count, 0);
    assert_eq!(seller.messaging.unread_count().await, 1);

    // Nothing left to mark
    assert_eq!(seller.messaging.mark_chat_read(&lamp_chat.id).await.unwrap(), 0);
    assert_eq!(seller.messaging.cached_unread_count().await, 1);
}

#[tokio::test]
async fn test_unread_count_falls_back_to_cache() {
    let fixture = TestFixture::new().await;
    let bea = fixture.user("Bea").await;
    let session = bea.backend.session().await.unwrap();
    let key = format!("unread_messages:{}", session.user.id);

    // Nothing listens on port 9
    let offline = BackendClient::new("http://127.0.0.1:9", DEV_ANON_KEY).unwrap();
    offline.restore_session(session).await;

    let empty = Messaging::new(offline.clone(), Arc::new(KvCache::in_memory()));
    assert_eq!(empty.unread_count().await, 0);

    let cache = Arc::new(KvCache::in_memory());
    cache.set_i64(&key, 5).await;
    let cached = Messaging::new(offline, cache);
    assert_eq!(cached.unread_count().await, 5);

    // Signed out
    let signed_out = fixture.client();
    assert_eq!(signed_out.messaging.unread_count().await, 0);
}

#[tokio::test]
async fn test_saving_is_idempotent() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;
    let chair = list_product(&seller, "Office chair", 40.0).await;

    buyer.database.save_product(&lamp.id).await.unwrap();
    buyer.database.save_product(&lamp.id).await.unwrap();
    let saved = buyer.database.saved_products().await.unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(seller.database.get_product(&lamp.id).await.unwrap().unwrap().save_count, 1);

    buyer.database.unsave_product(&chair.id).await.unwrap();
    buyer.database.unsave_product(&lamp.id).await.unwrap();
    buyer.database.unsave_product(&lamp.id).await.unwrap();
    assert!(!buyer.database.is_saved(&lamp.id).await.unwrap());
    assert!(buyer.database.saved_products().await.unwrap().is_empty());

    assert!(buyer.database.toggle_saved(&chair.id).await.unwrap());
    assert_eq!(buyer.database.saved_flag(&chair.id).await, Some(true));
    assert!(buyer.database.is_saved(&chair.id).await.unwrap());
    assert!(!buyer.database.toggle_saved(&chair.id).await.unwrap());
    assert_eq!(buyer.database.saved_flag(&chair.id).await, Some(false));
    assert!(!buyer.database.is_saved(&chair.id).await.unwrap());
}

#[tokio::test]
async fn test_order_lifecycle() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;

    let new_order = NewOrder {
        buyer_id: None,
        seller_id: lamp.seller_id.clone(),
        product_id: lamp.id.clone(),
        quantity: 1,
        total_amount: 15.0,
        shipping_address_id: None,
        payment_method: Some("cash".to_string()),
        notes: None,
    };
    let order = buyer.database.create_order(&new_order).await.unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
    assert_eq!(seller.database.seller_orders().await.unwrap().len(), 1);
    assert_eq!(buyer.database.buyer_orders().await.unwrap().len(), 1);

    // Only the seller moves an order forward
    let err = buyer
        .database
        .update_order_status(&order.id, OrderStatus::Confirmed)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    let confirmed = seller
        .database
        .update_order_status(&order.id, OrderStatus::Confirmed)
        .await
        .unwrap();
    assert_eq!(confirmed.status, OrderStatus::Confirmed);
    let reserved = seller.database.get_product(&lamp.id).await.unwrap().unwrap();
    assert_eq!(reserved.status, ProductStatus::Reserved);

    let err = seller
        .database
        .update_order_status(&order.id, OrderStatus::Delivered)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    seller.database.update_order_status(&order.id, OrderStatus::Shipped).await.unwrap();
    seller.database.update_order_status(&order.id, OrderStatus::Delivered).await.unwrap();
    let sold = seller.database.get_product(&lamp.id).await.unwrap().unwrap();
    assert_eq!(sold.status, ProductStatus::Sold);

    let err = buyer.database.cancel_order(&order.id).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    // Seller hears about the order, buyer about each status change
    let seller_notes = seller.notifications.fetch_notifications(None).await.unwrap();
    assert!(seller_notes
        .iter()
        .any(|n| n.notification_type == NotificationType::Order));
    let buyer_notes = buyer.notifications.fetch_notifications(None).await.unwrap();
    assert_eq!(buyer_notes.len(), 3);
}

#[tokio::test]
async fn test_cancelled_order_releases_product() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;

    let order = buyer
        .database
        .create_order(&NewOrder {
            buyer_id: None,
            seller_id: lamp.seller_id.clone(),
            product_id: lamp.id.clone(),
            quantity: 1,
            total_amount: 15.0,
            shipping_address_id: None,
            payment_method: None,
            notes: Some("Pick up after class".to_string()),
        })
        .await
        .unwrap();
    seller.database.update_order_status(&order.id, OrderStatus::Confirmed).await.unwrap();

    let cancelled = buyer.database.cancel_order(&order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    let product = buyer.database.get_product(&lamp.id).await.unwrap().unwrap();
    assert_eq!(product.status, ProductStatus::Active);

    let err = seller
        .database
        .create_order(&NewOrder {
            buyer_id: None,
            seller_id: lamp.seller_id.clone(),
            product_id: lamp.id.clone(),
            quantity: 1,
            total_amount: 15.0,
            shipping_address_id: None,
            payment_method: None,
            notes: None,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_realtime_refetches_chat_and_notification() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;
    let chat = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();

    seller.messaging.subscribe().await.unwrap();
    seller.notifications.subscribe().await.unwrap();
    assert!(seller.messaging.is_subscribed());
    assert_eq!(seller.messaging.chats().await.len(), 1);

    buyer
        .messaging
        .send_message(&chat.id, "Still available?", MessageType::Text)
        .await
        .unwrap();

    wait_until!(
        seller.messaging.cached_unread_count().await == 1,
        "message unread count"
    );
    let chats = seller.messaging.chats().await;
    assert_eq!(chats[0].unread_count, 1);
    assert_eq!(chats[0].last_message.as_deref(), Some("Still available?"));

    wait_until!(
        seller.notifications.cached_unread_count().await == 1,
        "notification unread count"
    );
    let notes = seller.notifications.notifications().await;
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].notification_type, NotificationType::Message);

    // The buyer's own realtime view is unaffected by the seller's feed
    assert_eq!(buyer.notifications.unread_count().await, 0);

    seller.messaging.unsubscribe().await;
    assert!(!seller.messaging.is_subscribed());
}

#[tokio::test]
async fn test_chat_opened_after_subscribing_reaches_seller() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let first_buyer = fixture.user("Bea").await;
    let second_buyer = fixture.user("Ben").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;

    first_buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();
    seller.messaging.subscribe().await.unwrap();
    assert_eq!(seller.messaging.chats().await.len(), 1);
    assert_eq!(seller.messaging.cached_unread_count().await, 0);

    let chat = second_buyer
        .messaging
        .get_or_create_chat(&lamp.seller_id, &lamp.id)
        .await
        .unwrap();
    for text in ["Hi!", "Can I pick it up today?"] {
        second_buyer.messaging.send_message(&chat.id, text, MessageType::Text).await.unwrap();
    }

    wait_until!(
        seller.messaging.cached_unread_count().await == 2,
        "unread count of the new chat"
    );
    let chats = seller.messaging.chats().await;
    assert_eq!(chats.len(), 2);
    assert_eq!(chats[0].id, chat.id);
    assert_eq!(chats[0].unread_count, 2);
    assert_eq!(seller.messaging.unread_count().await, 2);

    // The first buyer is not a member and hears nothing
    assert_eq!(first_buyer.messaging.unread_count().await, 0);
}

#[tokio::test]
async fn test_conversations_hidden_from_outsiders() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let outsider = fixture.user("Olly").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;

    let chat = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();
    buyer
        .messaging
        .send_message(&chat.id, "my phone is 555-0100", MessageType::Text)
        .await
        .unwrap();
    let order = buyer
        .database
        .create_order(&NewOrder {
            buyer_id: None,
            seller_id: lamp.seller_id.clone(),
            product_id: lamp.id.clone(),
            quantity: 1,
            total_amount: 15.0,
            shipping_address_id: None,
            payment_method: None,
            notes: None,
        })
        .await
        .unwrap();

    assert_eq!(seller.messaging.fetch_messages(&chat.id).await.unwrap().len(), 1);
    assert!(seller.database.get_order(&order.id).await.unwrap().is_some());

    assert!(outsider.messaging.fetch_messages(&chat.id).await.unwrap().is_empty());
    assert!(outsider.database.get_order(&order.id).await.unwrap().is_none());
    assert!(outsider.messaging.fetch_chats().await.unwrap().is_empty());

    let anonymous = fixture.client();
    let err = anonymous.messaging.fetch_messages(&chat.id).await.unwrap_err();
    assert!(matches!(err, AppError::Unauthorized(_)));

    for table in ["messages", "chats", "orders"] {
        let resp = fixture
            .http
            .get(fixture.url(&format!("/rest/v1/{}", table)))
            .header("apikey", DEV_ANON_KEY)
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 401, "anonymous read of {}", table);
    }
}

#[tokio::test]
async fn test_sign_out_stops_subscriptions() {
    let fixture = TestFixture::new().await;
    let bea = fixture.user("Bea").await;

    bea.notifications.subscribe().await.unwrap();
    assert!(bea.notifications.is_subscribed());

    bea.auth.sign_out().await.unwrap();
    wait_until!(!bea.notifications.is_subscribed(), "subscription teardown");
    assert!(bea.notifications.notifications().await.is_empty());
}

#[tokio::test]
async fn test_notifications_mark_read() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;
    let chat = buyer.messaging.get_or_create_chat(&lamp.seller_id, &lamp.id).await.unwrap();
    for text in ["a", "b", "c"] {
        buyer.messaging.send_message(&chat.id, text, MessageType::Text).await.unwrap();
    }

    assert_eq!(seller.notifications.unread_count().await, 3);
    let notes = seller.notifications.fetch_notifications(None).await.unwrap();
    assert_eq!(notes.len(), 3);
    assert_eq!(seller.notifications.fetch_notifications(Some(2)).await.unwrap().len(), 2);

    let marked = seller.notifications.mark_as_read(&[notes[0].id.clone()]).await.unwrap();
    assert_eq!(marked, 1);
    assert_eq!(seller.notifications.cached_unread_count().await, 2);

    let marked = seller.notifications.mark_all_as_read().await.unwrap();
    assert_eq!(marked, 2);
    assert_eq!(seller.notifications.cached_unread_count().await, 0);
    assert!(seller.notifications.notifications().await.iter().all(|n| n.is_read));
    assert_eq!(seller.notifications.unread_count().await, 0);
}

#[tokio::test]
async fn test_push_token_registration() {
    let fixture = TestFixture::new().await;
    let sam = fixture.user("Sam").await;
    let bea = fixture.user("Bea").await;

    let first = sam.notifications.register_push_token("device-token-1", "ios").await.unwrap();
    let again = sam.notifications.register_push_token("device-token-1", "ios").await.unwrap();
    assert_eq!(first.id, again.id);

    // The device changed hands
    let moved = bea.notifications.register_push_token("device-token-1", "android").await.unwrap();
    assert_eq!(moved.id, first.id);
    assert_eq!(moved.user_id, user_id(&bea).await);
    assert_eq!(moved.platform, "android");

    sam.notifications.unregister_push_token("device-token-1").await.unwrap();
    let still: Vec<crate::models::PushToken> = bea.backend.from("push_tokens").fetch().await.unwrap();
    assert_eq!(still.len(), 1);

    bea.notifications.unregister_push_token("device-token-1").await.unwrap();
    let gone: Vec<crate::models::PushToken> = bea.backend.from("push_tokens").fetch().await.unwrap();
    assert!(gone.is_empty());
}

#[tokio::test]
async fn test_search_ranking_and_filters() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;

    let textbook = seller
        .database
        .create_product(&listing("Calculus textbook", "books", "Eighth edition", 30.0))
        .await
        .unwrap();
    let lamp = seller
        .database
        .create_product(&listing("Desk lamp", "furniture", "Bright enough for textbook reading", 12.0))
        .await
        .unwrap();
    seller
        .database
        .create_product(&listing("Bike", "transport", "Road bike", 90.0))
        .await
        .unwrap();

    let hits = seller.database.search_products(&SearchParams::new("textbook")).await.unwrap();
    let ids: Vec<&str> = hits.iter().map(|p| p.id.as_str()).collect();
    assert_eq!(ids, [textbook.id.as_str(), lamp.id.as_str()]);

    let mut cheap = SearchParams::new("textbook");
    cheap.max_price = Some(20.0);
    let hits = seller.database.search_products(&cheap).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, lamp.id);

    let mut by_price = SearchParams::new("textbook");
    by_price.sort_by = SortBy::PriceAsc;
    let hits = seller.database.search_products(&by_price).await.unwrap();
    assert_eq!(hits[0].id, lamp.id);

    let mut invalid = SearchParams::new("textbook");
    invalid.min_price = Some(50.0);
    invalid.max_price = Some(10.0);
    let err = seller.database.search_products(&invalid).await.unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));
}

#[tokio::test]
async fn test_home_feed() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;

    let mut deal = listing("Mini fridge", "appliances", "Dorm sized", 45.0);
    deal.is_flash_deal = true;
    deal.original_price = Some(80.0);
    deal.flash_deal_ends_at = Some(Utc::now() + chrono::Duration::days(1));
    let deal = seller.database.create_product(&deal).await.unwrap();
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;

    seller.database.increment_view_count(&lamp.id).await;
    seller.database.increment_view_count(&lamp.id).await;
    // Unknown ids are ignored
    seller.database.increment_view_count("missing").await;

    let feed = seller.database.load_home_feed().await.unwrap();
    assert!(feed.featured.is_empty());
    assert_eq!(feed.flash_deals.len(), 1);
    assert_eq!(feed.flash_deals[0].id, deal.id);
    assert_eq!(feed.trending[0].id, lamp.id);
    assert_eq!(feed.recent.len(), 2);

    let profile = seller.database.get_user_profile(&lamp.seller_id).await.unwrap();
    assert_eq!(profile.active_listings, 2);
}

#[tokio::test]
async fn test_addresses_and_preferences() {
    let fixture = TestFixture::new().await;
    let bea = fixture.user("Bea").await;

    let address = |label: &str| NewAddress {
        user_id: None,
        label: label.to_string(),
        full_name: "Bea".to_string(),
        phone: None,
        street: "1 College Rd".to_string(),
        city: "Springfield".to_string(),
        state: None,
        postal_code: None,
        country: "US".to_string(),
        is_default: false,
    };
    let dorm = bea.database.add_address(&address("Dorm")).await.unwrap();
    assert!(dorm.is_default);
    let home = bea.database.add_address(&address("Home")).await.unwrap();
    assert!(!home.is_default);

    bea.database.set_default_address(&home.id).await.unwrap();
    let addresses = bea.database.addresses().await.unwrap();
    assert_eq!(addresses[0].id, home.id);
    assert_eq!(addresses.iter().filter(|a| a.is_default).count(), 1);

    bea.database.delete_address(&dorm.id).await.unwrap();
    assert_eq!(bea.database.addresses().await.unwrap().len(), 1);

    let mut prefs = bea.database.preferences().await.unwrap();
    assert!(prefs.notifications_enabled);
    prefs.dark_mode = true;
    prefs.language = "es".to_string();
    bea.database.save_preferences(&prefs).await.unwrap();
    let stored = bea.database.preferences().await.unwrap();
    assert!(stored.dark_mode);
    assert_eq!(stored.language, "es");
}

#[tokio::test]
async fn test_verification_requests() {
    let fixture = TestFixture::new().await;
    let bea = fixture.user("Bea").await;

    assert!(bea.database.latest_verification().await.unwrap().is_none());
    let request = crate::models::NewVerificationRequest {
        user_id: None,
        document_type: "student_id".to_string(),
        document_url: "https://files.example/id.png".to_string(),
        student_id: Some("S123".to_string()),
    };
    let submitted = bea.database.submit_verification(&request).await.unwrap();
    assert_eq!(submitted.status, crate::models::VerificationStatus::Pending);

    let err = bea.database.submit_verification(&request).await.unwrap_err();
    assert!(matches!(err, AppError::Conflict(_)));
    assert_eq!(
        bea.database.latest_verification().await.unwrap().map(|r| r.id),
        Some(submitted.id)
    );
}

#[tokio::test]
async fn test_reviews() {
    let fixture = TestFixture::new().await;
    let seller = fixture.user("Sam").await;
    let buyer = fixture.user("Bea").await;
    let lamp = list_product(&seller, "Desk lamp", 15.0).await;

    let review = crate::models::NewReview {
        product_id: lamp.id.clone(),
        reviewer_id: None,
        seller_id: lamp.seller_id.clone(),
        rating: 5,
        comment: Some("Works great".to_string()),
    };
    buyer.database.create_review(&review).await.unwrap();

    let err = buyer
        .database
        .create_review(&crate::models::NewReview { rating: 6, ..review.clone() })
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    assert_eq!(buyer.database.product_reviews(&lamp.id).await.unwrap().len(), 1);
    assert_eq!(buyer.database.seller_reviews(&lamp.seller_id).await.unwrap().len(), 1);

    let profile = buyer.database.get_user_profile(&lamp.seller_id).await.unwrap();
    assert_eq!(profile.reviews_count, 1);
    assert_eq!(profile.average_rating, Some(5.0));
}
