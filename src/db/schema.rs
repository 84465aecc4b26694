//! Table descriptors for the tables exposed through `/rest/v1/{table}`.
//!
//! Only listed columns can be filtered, projected or written. Columns that are
//! not writable are managed by the backend (counters, lifecycle states,
//! timestamps).

/// Storage class of a column and how it maps to JSON.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Bool,
    /// JSON document stored as text
    Json,
}

#[derive(Debug, Clone, Copy)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    pub writable: bool,
}

const fn col(name: &'static str, kind: ColumnKind) -> Column {
    Column {
        name,
        kind,
        writable: true,
    }
}

const fn managed(name: &'static str, kind: ColumnKind) -> Column {
    Column {
        name,
        kind,
        writable: false,
    }
}

/// Which rows a signed-in user may read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAccess {
    /// Anyone holding the API key, signed in or not
    Public,
    /// Rows whose owner column is the user
    Owner,
    /// Rows where any of these columns is the user
    Parties(&'static [&'static str]),
    /// Rows whose `chat_id` is a chat the user is buyer or seller in
    ChatMembers,
}

/// A table reachable through the REST surface.
#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    pub columns: &'static [Column],
    /// Column that must equal the signed-in user on writes.
    pub owner_column: Option<&'static str>,
    pub read_access: ReadAccess,
}

impl Table {
    /// Anything but a public table needs a session to read or subscribe.
    pub fn requires_session(&self) -> bool {
        self.read_access != ReadAccess::Public
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

use ColumnKind::{Bool, Integer, Json, Real, Text};

pub static USERS: Table = Table {
    name: "users",
    columns: &[
        managed("id", Text),
        managed("email", Text),
        col("full_name", Text),
        col("avatar_url", Text),
        col("university", Text),
        col("phone", Text),
        col("bio", Text),
        managed("is_verified", Bool),
        managed("rating", Real),
        managed("created_at", Text),
        managed("updated_at", Text),
    ],
    owner_column: Some("id"),
    read_access: ReadAccess::Public,
};

pub static PRODUCTS: Table = Table {
    name: "products",
    columns: &[
        col("id", Text),
        col("seller_id", Text),
        col("title", Text),
        col("description", Text),
        col("price", Real),
        col("original_price", Real),
        col("category", Text),
        col("condition", Text),
        col("images", Json),
        col("location", Text),
        managed("status", Text),
        managed("is_featured", Bool),
        col("is_flash_deal", Bool),
        col("flash_deal_ends_at", Text),
        managed("view_count", Integer),
        managed("save_count", Integer),
        managed("created_at", Text),
        managed("updated_at", Text),
    ],
    owner_column: Some("seller_id"),
    read_access: ReadAccess::Public,
};

pub static CHATS: Table = Table {
    name: "chats",
    columns: &[
        managed("id", Text),
        managed("buyer_id", Text),
        managed("seller_id", Text),
        managed("product_id", Text),
        managed("last_message", Text),
        managed("last_message_at", Text),
        managed("created_at", Text),
    ],
    owner_column: None,
    read_access: ReadAccess::Parties(&["buyer_id", "seller_id"]),
};

pub static MESSAGES: Table = Table {
    name: "messages",
    columns: &[
        col("id", Text),
        col("chat_id", Text),
        col("sender_id", Text),
        col("content", Text),
        col("message_type", Text),
        managed("is_read", Bool),
        managed("created_at", Text),
    ],
    owner_column: Some("sender_id"),
    read_access: ReadAccess::ChatMembers,
};

pub static ORDERS: Table = Table {
    name: "orders",
    columns: &[
        col("id", Text),
        col("buyer_id", Text),
        col("seller_id", Text),
        col("product_id", Text),
        col("quantity", Integer),
        col("total_amount", Real),
        managed("status", Text),
        col("shipping_address_id", Text),
        col("payment_method", Text),
        col("notes", Text),
        managed("created_at", Text),
        managed("updated_at", Text),
    ],
    owner_column: Some("buyer_id"),
    read_access: ReadAccess::Parties(&["buyer_id", "seller_id"]),
};

pub static PRODUCT_REVIEWS: Table = Table {
    name: "product_reviews",
    columns: &[
        col("id", Text),
        col("product_id", Text),
        col("reviewer_id", Text),
        col("seller_id", Text),
        col("rating", Integer),
        col("comment", Text),
        managed("created_at", Text),
    ],
    owner_column: Some("reviewer_id"),
    read_access: ReadAccess::Public,
};

pub static SAVED_PRODUCTS: Table = Table {
    name: "saved_products",
    columns: &[
        col("id", Text),
        col("user_id", Text),
        col("product_id", Text),
        managed("created_at", Text),
    ],
    owner_column: Some("user_id"),
    read_access: ReadAccess::Owner,
};

pub static USER_PREFERENCES: Table = Table {
    name: "user_preferences",
    columns: &[
        col("id", Text),
        col("user_id", Text),
        col("notifications_enabled", Bool),
        col("push_notifications", Bool),
        col("email_notifications", Bool),
        col("dark_mode", Bool),
        col("language", Text),
        col("currency", Text),
        managed("updated_at", Text),
    ],
    owner_column: Some("user_id"),
    read_access: ReadAccess::Owner,
};

pub static USER_ADDRESSES: Table = Table {
    name: "user_addresses",
    columns: &[
        col("id", Text),
        col("user_id", Text),
        col("label", Text),
        col("full_name", Text),
        col("phone", Text),
        col("street", Text),
        col("city", Text),
        col("state", Text),
        col("postal_code", Text),
        col("country", Text),
        col("is_default", Bool),
        managed("created_at", Text),
    ],
    owner_column: Some("user_id"),
    read_access: ReadAccess::Owner,
};

pub static VERIFICATION_REQUESTS: Table = Table {
    name: "verification_requests",
    columns: &[
        col("id", Text),
        col("user_id", Text),
        col("document_type", Text),
        col("document_url", Text),
        col("student_id", Text),
        managed("status", Text),
        managed("notes", Text),
        managed("created_at", Text),
        managed("reviewed_at", Text),
    ],
    owner_column: Some("user_id"),
    read_access: ReadAccess::Owner,
};

pub static NOTIFICATIONS: Table = Table {
    name: "notifications",
    columns: &[
        managed("id", Text),
        managed("user_id", Text),
        managed("title", Text),
        managed("body", Text),
        managed("notification_type", Text),
        managed("data", Json),
        col("is_read", Bool),
        managed("created_at", Text),
    ],
    owner_column: Some("user_id"),
    read_access: ReadAccess::Owner,
};

pub static PUSH_TOKENS: Table = Table {
    name: "push_tokens",
    columns: &[
        col("id", Text),
        col("user_id", Text),
        col("token", Text),
        col("platform", Text),
        managed("created_at", Text),
    ],
    owner_column: Some("user_id"),
    read_access: ReadAccess::Owner,
};

static TABLES: [&Table; 12] = [
    &USERS,
    &PRODUCTS,
    &CHATS,
    &MESSAGES,
    &ORDERS,
    &PRODUCT_REVIEWS,
    &SAVED_PRODUCTS,
    &USER_PREFERENCES,
    &USER_ADDRESSES,
    &VERIFICATION_REQUESTS,
    &NOTIFICATIONS,
    &PUSH_TOKENS,
];

/// Look up an exposed table by name.
pub fn table(name: &str) -> Option<&'static Table> {
    TABLES.iter().copied().find(|t| t.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup() {
        assert_eq!(table("products").map(|t| t.name), Some("products"));
        assert!(table("auth_users").is_none());
        assert!(table("sessions").is_none());
    }

    #[test]
    fn test_counters_are_managed() {
        let products = table("products").unwrap();
        assert!(!products.column("view_count").unwrap().writable);
        assert!(!products.column("save_count").unwrap().writable);
        assert!(!table("orders").unwrap().column("status").unwrap().writable);
    }

    #[test]
    fn test_conversation_tables_need_a_session() {
        for name in ["chats", "messages", "orders", "notifications"] {
            assert!(table(name).unwrap().requires_session(), "{} is public", name);
        }
        assert!(!table("products").unwrap().requires_session());
        assert!(!table("product_reviews").unwrap().requires_session());
    }

    #[test]
    fn test_every_table_has_id() {
        for t in TABLES {
            assert!(t.has_column("id"), "{} lacks id", t.name);
            if let Some(owner) = t.owner_column {
                assert!(t.has_column(owner), "{} lacks {}", t.name, owner);
            }
        }
    }
}
