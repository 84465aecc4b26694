//! Data models for the campus marketplace.
//!
//! Field names match the backend's column names so rows deserialize directly.

mod address;
mod chat;
mod notification;
mod order;
mod preferences;
mod product;
mod review;
mod user;
mod verification;

pub use address::*;
pub use chat::*;
pub use notification::*;
pub use order::*;
pub use preferences::*;
pub use product::*;
pub use review::*;
pub use user::*;
pub use verification::*;
