//! Campus Market reference backend
//!
//! Serves the marketplace REST, RPC, auth and realtime endpoints from SQLite
//! with Tantivy product search.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use campus_market::api::{create_router, AppState};
use campus_market::config::Config;
use campus_market::db::{self, schema, Repository};
use campus_market::models::Product;
use campus_market::query::RowQuery;
use campus_market::search::ProductIndex;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Campus Market backend");
    tracing::info!("Database path: {:?}", config.db_path);
    tracing::info!("Index path: {:?}", config.index_path);
    tracing::info!("Bind address: {}", config.bind_addr);

    if config.uses_dev_key() {
        tracing::warn!("Using the development anon key. Set MARKET_ANON_KEY outside local testing!");
    }

    // Initialize database
    let pool = db::init_database(&config.db_path).await?;
    let repo = Repository::new(pool);

    // Initialize search index
    let search = ProductIndex::open(&config.index_path)?;

    // Build initial search index from database
    tracing::info!("Building search index...");
    let products: Vec<Product> = repo
        .select_as(&schema::PRODUCTS, &RowQuery::default())
        .await?;
    search.rebuild(&products).await?;
    tracing::info!("Search index built with {} products", products.len());

    let bind_addr = config.bind_addr;
    let state = AppState::new(repo, search, config);
    let app = create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server listening on {}", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
