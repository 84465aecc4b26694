//! Campus marketplace data and sync layer.
//!
//! The [`client`] module is what an app links against: session handling,
//! typed table access and the chat and notification inboxes. The remaining
//! modules make up the reference backend that serves the same REST, RPC,
//! auth and realtime surface over SQLite and Tantivy.

pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod query;
pub mod realtime;
pub mod search;

#[cfg(test)]
mod tests;
