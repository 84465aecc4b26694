//! HTTP surface of the reference backend.
//!
//! Table endpoints, stored procedures, auth endpoints and the realtime
//! websocket, all behind the API-key gate. Success bodies are plain JSON;
//! failures use the error envelope from [`crate::errors`].

mod auth;
mod realtime;
mod rest;
mod rpc;

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::Repository;
use crate::realtime::RealtimeHub;
use crate::search::ProductIndex;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<Repository>,
    pub search: Arc<ProductIndex>,
    pub hub: RealtimeHub,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(repo: Repository, search: ProductIndex, config: Config) -> Self {
        Self {
            repo: Arc::new(repo),
            search: Arc::new(search),
            hub: RealtimeHub::default(),
            config: Arc::new(config),
        }
    }
}

/// Create the application router with all routes.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_key = state.config.anon_key.clone();

    let api_routes = Router::new()
        // Tables and procedures
        .route("/rest/v1/rpc/{name}", post(rpc::call))
        .route(
            "/rest/v1/{table}",
            get(rest::select)
                .post(rest::insert)
                .patch(rest::update)
                .delete(rest::delete),
        )
        // Auth
        .route("/auth/v1/signup", post(auth::sign_up))
        .route("/auth/v1/token", post(auth::token))
        .route("/auth/v1/logout", post(auth::logout))
        .route("/auth/v1/user", get(auth::get_user).put(auth::update_user))
        // Realtime
        .route("/realtime/v1/websocket", get(realtime::websocket))
        .layer(middleware::from_fn(move |req, next| {
            crate::auth::api_key_layer(api_key.clone(), req, next)
        }));

    // Health check (no key required)
    let health_routes = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(api_routes)
        .merge(health_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
