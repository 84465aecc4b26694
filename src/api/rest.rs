//! Table endpoints: `GET|POST|PATCH|DELETE /rest/v1/{table}`.
//!
//! Writes need a session. The table's owner column is pinned to the signed-in
//! user. Tables that are not public need a session to read and only show the
//! rows the user may see: their own, their chats and orders, and the messages
//! of their chats.

use axum::{
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde_json::{Map, Value};

use super::AppState;
use crate::auth::{CurrentUser, MaybeUser};
use crate::db::schema::{self, Table};
use crate::db::{check_writable, Conflict};
use crate::errors::{log_ignored, AppError};
use crate::models::{AuthUser, Chat, Product};
use crate::query::{Filter, Operator, RowQuery};

fn lookup_table(name: &str) -> Result<&'static Table, AppError> {
    schema::table(name).ok_or_else(|| AppError::NotFound(format!("Unknown table {}", name)))
}

fn parse_query(raw: Option<String>) -> Result<RowQuery, AppError> {
    let raw = raw.unwrap_or_default();
    RowQuery::from_pairs(url::form_urlencoded::parse(raw.as_bytes()))
}

fn conflict_mode(headers: &HeaderMap) -> Conflict {
    let prefer = headers
        .get("prefer")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if prefer.contains("resolution=ignore-duplicates") {
        Conflict::Ignore
    } else if prefer.contains("resolution=merge-duplicates") {
        Conflict::Merge
    } else {
        Conflict::Error
    }
}

/// Restrict a query to rows the user owns.
fn scope_to_owner(table: &Table, query: &mut RowQuery, user: &AuthUser) {
    if let Some(owner) = table.owner_column {
        query.filters.push(Filter::new(owner, Operator::Eq, &user.id));
    }
}

/// GET /rest/v1/{table} - Select rows.
pub async fn select(
    State(state): State<AppState>,
    Path(table): Path<String>,
    MaybeUser(user): MaybeUser,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Value>>, AppError> {
    let table = lookup_table(&table)?;
    let query = parse_query(raw)?;

    if !table.requires_session() {
        return Ok(Json(state.repo.select_rows(table, &query).await?));
    }
    let user = user.ok_or_else(|| {
        AppError::Unauthorized(format!("Sign in to read {}", table.name))
    })?;
    Ok(Json(state.repo.select_visible(table, &query, &user.id).await?))
}

/// POST /rest/v1/{table} - Insert one row or an array of rows.
pub async fn insert(
    State(state): State<AppState>,
    Path(table): Path<String>,
    CurrentUser(user): CurrentUser,
    headers: HeaderMap,
    RawQuery(raw): RawQuery,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Vec<Value>>), AppError> {
    let table = lookup_table(&table)?;
    if !table.column("id").is_some_and(|c| c.writable) {
        return Err(AppError::Unauthorized(format!(
            "Rows in {} are created by the server",
            table.name
        )));
    }
    let query = parse_query(raw)?;

    let rows: Vec<Map<String, Value>> = match body {
        Value::Object(row) => vec![row],
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::Object(row) => Ok(row),
                _ => Err(AppError::BadRequest("Expected an array of objects".to_string())),
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(AppError::BadRequest("Expected a JSON object or array".to_string())),
    };
    if rows.is_empty() {
        return Ok((StatusCode::CREATED, Json(Vec::new())));
    }

    let mut prepared = Vec::with_capacity(rows.len());
    for mut row in rows {
        check_writable(table, &row)?;
        if let Some(owner) = table.owner_column {
            match row.get(owner) {
                None | Some(Value::Null) => {
                    row.insert(owner.to_string(), Value::String(user.id.clone()));
                }
                Some(Value::String(id)) if *id == user.id => {}
                Some(_) => {
                    return Err(AppError::Unauthorized(format!(
                        "{}.{} must be the signed-in user",
                        table.name, owner
                    )))
                }
            }
        }
        validate_insert(&state, table, &row, &user).await?;
        prepared.push(row);
    }

    let inserted = state
        .repo
        .insert_rows(table, prepared, conflict_mode(&headers), query.on_conflict.as_deref())
        .await?;

    for record in &inserted {
        after_insert(&state, table, record).await;
    }

    tracing::debug!("Inserted {} row(s) into {}", inserted.len(), table.name);
    Ok((StatusCode::CREATED, Json(inserted)))
}

/// PATCH /rest/v1/{table} - Update the owner's rows matching the filters.
pub async fn update(
    State(state): State<AppState>,
    Path(table): Path<String>,
    CurrentUser(user): CurrentUser,
    RawQuery(raw): RawQuery,
    Json(changes): Json<Map<String, Value>>,
) -> Result<Json<Vec<Value>>, AppError> {
    let table = lookup_table(&table)?;
    let mut query = parse_query(raw)?;
    if query.filters.is_empty() {
        return Err(AppError::BadRequest(
            "UPDATE requires at least one filter".to_string(),
        ));
    }
    if table.owner_column.is_none() {
        return Err(AppError::Unauthorized(format!(
            "Rows in {} are managed by the server",
            table.name
        )));
    }
    check_writable(table, &changes)?;
    scope_to_owner(table, &mut query, &user);

    let updated = state.repo.update_rows(table, &query, changes).await?;

    if table.name == schema::PRODUCTS.name {
        for record in &updated {
            reindex(&state, record).await;
        }
    }
    Ok(Json(updated))
}

/// DELETE /rest/v1/{table} - Delete the owner's rows matching the filters.
pub async fn delete(
    State(state): State<AppState>,
    Path(table): Path<String>,
    CurrentUser(user): CurrentUser,
    RawQuery(raw): RawQuery,
) -> Result<Json<Vec<Value>>, AppError> {
    let table = lookup_table(&table)?;
    let mut query = parse_query(raw)?;
    if query.filters.is_empty() {
        return Err(AppError::BadRequest(
            "DELETE requires at least one filter".to_string(),
        ));
    }
    // Identity rows and server-owned rows cannot be deleted from here
    if matches!(table.owner_column, None | Some("id")) {
        return Err(AppError::Unauthorized(format!(
            "Rows in {} cannot be deleted",
            table.name
        )));
    }
    scope_to_owner(table, &mut query, &user);

    let deleted = state.repo.delete_rows(table, &query).await?;

    if table.name == schema::PRODUCTS.name {
        for record in &deleted {
            if let Some(id) = record.get("id").and_then(Value::as_str) {
                log_ignored("Search removal", state.search.remove_product(id).await);
            }
        }
    }
    Ok(Json(deleted))
}

/// Cross-row rules the schema cannot express.
async fn validate_insert(
    state: &AppState,
    table: &Table,
    row: &Map<String, Value>,
    user: &AuthUser,
) -> Result<(), AppError> {
    let text = |name: &str| row.get(name).and_then(Value::as_str).unwrap_or_default();

    match table.name {
        "messages" => {
            let chat: Chat = state
                .repo
                .fetch_by_id(&schema::CHATS, text("chat_id"))
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Chat {} not found", text("chat_id"))))?;
            if chat.buyer_id != user.id && chat.seller_id != user.id {
                return Err(AppError::Unauthorized("Not a member of this chat".to_string()));
            }
        }
        "orders" | "product_reviews" => {
            let product: Product = state
                .repo
                .fetch_by_id(&schema::PRODUCTS, text("product_id"))
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("Product {} not found", text("product_id")))
                })?;
            if product.seller_id != text("seller_id") {
                return Err(AppError::Validation(
                    "seller_id does not match the product".to_string(),
                ));
            }
            if product.seller_id == user.id {
                return Err(AppError::Validation(
                    "You cannot do that on your own listing".to_string(),
                ));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Index, broadcast and fan out a freshly inserted row. Failures are logged only.
async fn after_insert(state: &AppState, table: &Table, record: &Value) {
    if table.name == schema::PRODUCTS.name {
        reindex(state, record).await;
    }

    state.hub.publish(table.name, record.clone());

    let notifications = log_ignored(
        "Notification fan-out",
        state.repo.fan_out_insert(table.name, record).await,
    )
    .unwrap_or_default();
    for notification in notifications {
        state.hub.publish(schema::NOTIFICATIONS.name, notification);
    }
}

async fn reindex(state: &AppState, record: &Value) {
    match serde_json::from_value::<Product>(record.clone()) {
        Ok(product) => {
            log_ignored("Search indexing", state.search.index_product(&product).await);
        }
        Err(e) => tracing::warn!("Product row could not be indexed: {}", e),
    }
}
