//! Tantivy-based product search index.
//!
//! Ranks active listings for `search_products`; filtering and sorting by
//! price, condition or recency happen against SQLite afterwards.

use std::path::Path;
use std::sync::Arc;
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, BoostQuery, Occur, Query, QueryParser};
use tantivy::schema::{Field, Schema, Value, STORED, STRING, TEXT};
use tantivy::{doc, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tokio::sync::RwLock;

use crate::errors::AppError;
use crate::models::Product;

const BOOST_TITLE: f32 = 10.0;
const BOOST_CATEGORY: f32 = 6.0;
const BOOST_DESCRIPTION: f32 = 4.0;
const BOOST_LOCATION: f32 = 2.0;

/// A matching product id and its relevance score.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub product_id: String,
    pub score: f32,
}

struct ProductFields {
    product_id: Field,
    title: Field,
    category: Field,
    description: Field,
    location: Field,
}

/// Full-text index over product listings.
pub struct ProductIndex {
    index: Index,
    reader: IndexReader,
    writer: Arc<RwLock<IndexWriter>>,
    fields: ProductFields,
}

impl ProductIndex {
    /// Create or open an index at the specified path.
    pub fn open(index_path: &Path) -> Result<Self, AppError> {
        std::fs::create_dir_all(index_path)
            .map_err(|e| AppError::Search(format!("Failed to create index directory: {}", e)))?;

        let mut schema_builder = Schema::builder();
        let product_id = schema_builder.add_text_field("product_id", STRING | STORED);
        let title = schema_builder.add_text_field("title", TEXT);
        let category = schema_builder.add_text_field("category", TEXT);
        let description = schema_builder.add_text_field("description", TEXT);
        let location = schema_builder.add_text_field("location", TEXT);
        let schema = schema_builder.build();

        let fields = ProductFields {
            product_id,
            title,
            category,
            description,
            location,
        };

        let index = Index::open_in_dir(index_path)
            .or_else(|_| Index::create_in_dir(index_path, schema))
            .map_err(|e| AppError::Search(format!("Failed to open/create index: {}", e)))?;

        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .map_err(|e| AppError::Search(format!("Failed to create reader: {}", e)))?;

        let writer = index
            .writer(50_000_000)
            .map_err(|e| AppError::Search(format!("Failed to create writer: {}", e)))?;

        Ok(Self {
            index,
            reader,
            writer: Arc::new(RwLock::new(writer)),
            fields,
        })
    }

    /// Replace the whole index with the given products.
    pub async fn rebuild(&self, products: &[Product]) -> Result<(), AppError> {
        let mut writer = self.writer.write().await;
        writer.delete_all_documents()?;
        for product in products {
            writer.add_document(self.document(product))?;
        }
        writer.commit()?;
        self.reader.reload()?;

        tracing::info!("Search index rebuilt with {} products", products.len());
        Ok(())
    }

    /// Add or replace one product.
    pub async fn index_product(&self, product: &Product) -> Result<(), AppError> {
        let mut writer = self.writer.write().await;
        writer.delete_term(Term::from_field_text(self.fields.product_id, &product.id));
        writer.add_document(self.document(product))?;
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    pub async fn remove_product(&self, product_id: &str) -> Result<(), AppError> {
        let mut writer = self.writer.write().await;
        writer.delete_term(Term::from_field_text(self.fields.product_id, product_id));
        writer.commit()?;
        self.reader.reload()?;
        Ok(())
    }

    /// Best matches first. Syntax errors in the query are tolerated.
    pub fn search(&self, query_str: &str, limit: usize) -> Result<Vec<SearchHit>, AppError> {
        if query_str.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let searcher = self.reader.searcher();

        let mut subqueries: Vec<(Occur, Box<dyn Query>)> = Vec::new();
        for (field, boost) in [
            (self.fields.title, BOOST_TITLE),
            (self.fields.category, BOOST_CATEGORY),
            (self.fields.description, BOOST_DESCRIPTION),
            (self.fields.location, BOOST_LOCATION),
        ] {
            let parser = QueryParser::for_index(&self.index, vec![field]);
            let (field_query, _errors) = parser.parse_query_lenient(query_str);
            subqueries.push((Occur::Should, Box::new(BoostQuery::new(field_query, boost))));
        }
        let query = BooleanQuery::new(subqueries);

        let top_docs = searcher
            .search(&query, &TopDocs::with_limit(limit))
            .map_err(|e| AppError::Search(format!("Search failed: {}", e)))?;

        let hits = top_docs
            .into_iter()
            .filter_map(|(score, address)| {
                let doc: TantivyDocument = searcher.doc(address).ok()?;
                let product_id = doc.get_first(self.fields.product_id)?.as_str()?.to_string();
                Some(SearchHit { product_id, score })
            })
            .collect();

        Ok(hits)
    }

    fn document(&self, product: &Product) -> TantivyDocument {
        doc!(
            self.fields.product_id => product.id.clone(),
            self.fields.title => product.title.clone(),
            self.fields.category => product.category.clone(),
            self.fields.description => product.description.clone(),
            self.fields.location => product.location.clone().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductCondition, ProductStatus};
    use chrono::Utc;
    use tempfile::TempDir;

    fn product(id: &str, title: &str, category: &str, description: &str) -> Product {
        Product {
            id: id.to_string(),
            seller_id: "seller".to_string(),
            title: title.to_string(),
            description: description.to_string(),
            price: 10.0,
            original_price: None,
            category: category.to_string(),
            condition: ProductCondition::Good,
            images: Vec::new(),
            location: None,
            status: ProductStatus::Active,
            is_featured: false,
            is_flash_deal: false,
            flash_deal_ends_at: None,
            view_count: 0,
            save_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_title_outranks_description() {
        let temp_dir = TempDir::new().unwrap();
        let index = ProductIndex::open(temp_dir.path()).unwrap();

        index
            .rebuild(&[
                product("1", "Desk lamp", "furniture", "Bright bulb, works with any calculator desk"),
                product("2", "Graphing calculator", "electronics", "TI-84, barely used"),
            ])
            .await
            .unwrap();

        let hits = index.search("calculator", 10).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].product_id, "2");
    }

    #[tokio::test]
    async fn test_reindex_and_remove() {
        let temp_dir = TempDir::new().unwrap();
        let index = ProductIndex::open(temp_dir.path()).unwrap();

        let mut bike = product("1", "Road bike", "sports", "");
        index.index_product(&bike).await.unwrap();
        assert_eq!(index.search("bike", 10).unwrap().len(), 1);

        bike.title = "Mountain cycle".to_string();
        index.index_product(&bike).await.unwrap();
        assert!(index.search("bike", 10).unwrap().is_empty());
        assert_eq!(index.search("mountain", 10).unwrap().len(), 1);

        index.remove_product("1").await.unwrap();
        assert!(index.search("mountain", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_and_malformed_queries() {
        let temp_dir = TempDir::new().unwrap();
        let index = ProductIndex::open(temp_dir.path()).unwrap();
        index
            .rebuild(&[product("1", "Chemistry textbook", "books", "")])
            .await
            .unwrap();

        assert!(index.search("   ", 10).unwrap().is_empty());
        assert!(index.search("textbook AND (", 10).is_ok());
    }
}
