//! Product listing models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Physical condition of a listed item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProductCondition {
    New,
    LikeNew,
    Good,
    Fair,
    Poor,
}

impl ProductCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductCondition::New => "new",
            ProductCondition::LikeNew => "like_new",
            ProductCondition::Good => "good",
            ProductCondition::Fair => "fair",
            ProductCondition::Poor => "poor",
        }
    }
}

/// Listing availability. Only the backend moves a product between states.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Reserved,
    Sold,
}

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProductStatus::Active => "active",
            ProductStatus::Reserved => "reserved",
            ProductStatus::Sold => "sold",
        }
    }
}

/// A listing in the `products` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub id: String,
    pub seller_id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub price: f64,
    #[serde(default)]
    pub original_price: Option<f64>,
    pub category: String,
    pub condition: ProductCondition,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub status: ProductStatus,
    #[serde(default)]
    pub is_featured: bool,
    #[serde(default)]
    pub is_flash_deal: bool,
    #[serde(default)]
    pub flash_deal_ends_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub view_count: i64,
    #[serde(default)]
    pub save_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    /// Popularity used by trending and the `popular` sort.
    pub fn popularity(&self) -> i64 {
        self.view_count + 2 * self.save_count
    }
}

/// Insert payload for a new listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProduct {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seller_id: Option<String>,
    pub title: String,
    pub description: String,
    pub price: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    pub category: String,
    pub condition: ProductCondition,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub is_flash_deal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flash_deal_ends_at: Option<DateTime<Utc>>,
}

/// Partial update of a listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<ProductCondition>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

/// Client-side filter for plain listing queries.
#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
    pub category: Option<String>,
    pub seller_id: Option<String>,
    pub condition: Option<ProductCondition>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub include_unavailable: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// Ordering accepted by `search_products`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SortBy {
    #[default]
    Relevance,
    PriceAsc,
    PriceDesc,
    Newest,
    Popular,
}

/// Arguments of the `search_products` procedure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub search_query: String,
    #[serde(default)]
    pub category_filter: Option<String>,
    #[serde(default)]
    pub min_price: Option<f64>,
    #[serde(default)]
    pub max_price: Option<f64>,
    #[serde(default)]
    pub condition_filter: Option<ProductCondition>,
    #[serde(default)]
    pub sort_by: SortBy,
    #[serde(default = "default_limit")]
    pub limit_count: i64,
    #[serde(default)]
    pub offset_count: i64,
}

fn default_limit() -> i64 {
    20
}

impl SearchParams {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            search_query: query.into(),
            category_filter: None,
            min_price: None,
            max_price: None,
            condition_filter: None,
            sort_by: SortBy::Relevance,
            limit_count: default_limit(),
            offset_count: 0,
        }
    }
}

/// A user's bookmark on a listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SavedProduct {
    pub id: String,
    pub user_id: String,
    pub product_id: String,
    pub created_at: DateTime<Utc>,
}

/// The lists shown on the home screen, loaded together.
#[derive(Debug, Clone, Default)]
pub struct HomeFeed {
    pub featured: Vec<Product>,
    pub trending: Vec<Product>,
    pub flash_deals: Vec<Product>,
    pub recent: Vec<Product>,
}
