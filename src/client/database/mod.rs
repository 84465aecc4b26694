//! Typed access to the marketplace tables and procedures.
//!
//! Each entity gets a small set of wrappers over [`BackendClient`] queries;
//! the wrappers live in one file per area.

mod orders;
mod products;
mod users;

use std::collections::HashMap;

use tokio::sync::RwLock;

use super::backend::BackendClient;
use super::optimistic::Optimistic;
use crate::errors::AppError;

pub struct Database {
    backend: BackendClient,
    /// Saved flags toggled locally, keyed by product id.
    saved: RwLock<HashMap<String, Optimistic<bool>>>,
}

impl Database {
    pub fn new(backend: BackendClient) -> Self {
        Self {
            backend,
            saved: RwLock::new(HashMap::new()),
        }
    }

    pub fn backend(&self) -> &BackendClient {
        &self.backend
    }
}

/// First row of a write, which the backend always returns.
fn single<T>(rows: Vec<T>, what: &str) -> Result<T, AppError> {
    rows.into_iter()
        .next()
        .ok_or_else(|| AppError::NotFound(format!("{} not found", what)))
}

fn require_text(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Validation(format!("{} is required", field)));
    }
    Ok(())
}
