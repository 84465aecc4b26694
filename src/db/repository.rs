//! Database repository for row operations on the exposed tables.
//!
//! Statements are assembled from whitelisted column names only; every value
//! is bound. Writes run inside a transaction and return the affected rows.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};

use super::now_timestamp;
use super::schema::{Column, ColumnKind, ReadAccess, Table};
use crate::errors::AppError;
use crate::query::{Direction, Filter, FilterValue, Nulls, Operator, RowQuery};

/// A value ready to be bound to a statement parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
}

/// What an insert does when it hits a unique constraint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Conflict {
    /// Fail with a conflict error
    #[default]
    Error,
    /// Skip the row; it is not returned
    Ignore,
    /// Update the existing row with the supplied columns
    Merge,
}

/// Database repository for all data operations.
#[derive(Clone)]
pub struct Repository {
    pool: SqlitePool,
}

impl Repository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Select rows matching a query, as JSON objects.
    pub async fn select_rows(
        &self,
        table: &'static Table,
        query: &RowQuery,
    ) -> Result<Vec<Value>, AppError> {
        self.select_scoped(table, query, None).await
    }

    /// Select only the rows `user_id` may read under the table's access rule.
    pub async fn select_visible(
        &self,
        table: &'static Table,
        query: &RowQuery,
        user_id: &str,
    ) -> Result<Vec<Value>, AppError> {
        self.select_scoped(table, query, Some(user_id)).await
    }

    async fn select_scoped(
        &self,
        table: &'static Table,
        query: &RowQuery,
        viewer: Option<&str>,
    ) -> Result<Vec<Value>, AppError> {
        let columns = projection(table, query.columns.as_deref())?;
        let mut binds = Vec::new();
        let mut where_sql = where_clause(table, &query.filters, &mut binds)?;
        if let Some(condition) = viewer.and_then(|id| access_condition(table, id, &mut binds)) {
            if where_sql.is_empty() {
                where_sql = format!(" WHERE {}", condition);
            } else {
                where_sql.push_str(&format!(" AND {}", condition));
            }
        }
        let order_sql = order_clause(table, query)?;

        let mut sql = format!(
            "SELECT {} FROM {}{}{}",
            column_list(&columns),
            quote(table.name),
            where_sql,
            order_sql
        );
        match (query.limit, query.offset) {
            (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (Some(limit), None) => sql.push_str(&format!(" LIMIT {}", limit)),
            (None, Some(offset)) => sql.push_str(&format!(" LIMIT -1 OFFSET {}", offset)),
            (None, None) => {}
        }

        let rows = bind_values(sqlx::query(&sql), &binds)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(|row| row_to_json(row, &columns)).collect()
    }

    /// Select rows and deserialize them into a model type.
    pub async fn select_as<T: DeserializeOwned>(
        &self,
        table: &'static Table,
        query: &RowQuery,
    ) -> Result<Vec<T>, AppError> {
        let rows = self.select_rows(table, query).await?;
        rows.into_iter()
            .map(|row| serde_json::from_value(row).map_err(AppError::from))
            .collect()
    }

    /// Fetch one row by primary key.
    pub async fn fetch_by_id<T: DeserializeOwned>(
        &self,
        table: &'static Table,
        id: &str,
    ) -> Result<Option<T>, AppError> {
        let query = RowQuery {
            filters: vec![Filter::new("id", Operator::Eq, id)],
            limit: Some(1),
            ..RowQuery::default()
        };
        Ok(self.select_as(table, &query).await?.into_iter().next())
    }

    /// Insert rows, filling in ids and timestamps the caller left out.
    pub async fn insert_rows(
        &self,
        table: &'static Table,
        rows: Vec<Map<String, Value>>,
        conflict: Conflict,
        on_conflict: Option<&[String]>,
    ) -> Result<Vec<Value>, AppError> {
        let all_columns: Vec<&'static Column> = table.columns.iter().collect();
        let returning = column_list(&all_columns);

        let mut tx = self.pool.begin().await?;
        let mut inserted = Vec::with_capacity(rows.len());

        for mut row in rows {
            apply_insert_defaults(table, &mut row);

            let mut names = Vec::with_capacity(row.len());
            let mut binds = Vec::with_capacity(row.len());
            for (key, value) in &row {
                let column = lookup_column(table, key)?;
                names.push(column.name);
                binds.push(bind_json(column, value)?);
            }

            let placeholders = vec!["?"; names.len()].join(", ");
            let quoted: Vec<String> = names.iter().map(|n| quote(n)).collect();
            let sql = format!(
                "INSERT INTO {} ({}) VALUES ({}){} RETURNING {}",
                quote(table.name),
                quoted.join(", "),
                placeholders,
                conflict_clause(table, conflict, on_conflict, &names)?,
                returning
            );

            let row = bind_values(sqlx::query(&sql), &binds)
                .fetch_optional(&mut *tx)
                .await?;
            if let Some(row) = row {
                inserted.push(row_to_json(&row, &all_columns)?);
            }
        }

        tx.commit().await?;
        Ok(inserted)
    }

    /// Update every row matching the filters. At least one filter is required.
    pub async fn update_rows(
        &self,
        table: &'static Table,
        query: &RowQuery,
        mut changes: Map<String, Value>,
    ) -> Result<Vec<Value>, AppError> {
        if query.filters.is_empty() {
            return Err(AppError::BadRequest(
                "UPDATE requires at least one filter".to_string(),
            ));
        }
        if changes.is_empty() {
            return Err(AppError::BadRequest("No columns to update".to_string()));
        }
        if table.has_column("updated_at") && !changes.contains_key("updated_at") {
            changes.insert("updated_at".to_string(), Value::String(now_timestamp()));
        }

        let all_columns: Vec<&'static Column> = table.columns.iter().collect();
        let mut binds = Vec::new();
        let mut assignments = Vec::with_capacity(changes.len());
        for (key, value) in &changes {
            let column = lookup_column(table, key)?;
            assignments.push(format!("{} = ?", quote(column.name)));
            binds.push(bind_json(column, value)?);
        }
        let where_sql = where_clause(table, &query.filters, &mut binds)?;

        let sql = format!(
            "UPDATE {} SET {}{} RETURNING {}",
            quote(table.name),
            assignments.join(", "),
            where_sql,
            column_list(&all_columns)
        );

        let mut tx = self.pool.begin().await?;
        let rows = bind_values(sqlx::query(&sql), &binds)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.iter().map(|row| row_to_json(row, &all_columns)).collect()
    }

    /// Delete every row matching the filters. At least one filter is required.
    pub async fn delete_rows(
        &self,
        table: &'static Table,
        query: &RowQuery,
    ) -> Result<Vec<Value>, AppError> {
        if query.filters.is_empty() {
            return Err(AppError::BadRequest(
                "DELETE requires at least one filter".to_string(),
            ));
        }

        let all_columns: Vec<&'static Column> = table.columns.iter().collect();
        let mut binds = Vec::new();
        let where_sql = where_clause(table, &query.filters, &mut binds)?;
        let sql = format!(
            "DELETE FROM {}{} RETURNING {}",
            quote(table.name),
            where_sql,
            column_list(&all_columns)
        );

        let mut tx = self.pool.begin().await?;
        let rows = bind_values(sqlx::query(&sql), &binds)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        rows.iter().map(|row| row_to_json(row, &all_columns)).collect()
    }
}

/// Reject columns the client may not write.
pub fn check_writable(table: &'static Table, row: &Map<String, Value>) -> Result<(), AppError> {
    for key in row.keys() {
        let column = lookup_column(table, key)?;
        if !column.writable {
            return Err(AppError::Validation(format!(
                "Column {}.{} is managed by the server",
                table.name, column.name
            )));
        }
    }
    Ok(())
}

/// Bind parameters in order.
pub fn bind_values<'q>(
    mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
    values: &[BindValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    for value in values {
        query = match value {
            BindValue::Null => query.bind(None::<String>),
            BindValue::Integer(v) => query.bind(*v),
            BindValue::Real(v) => query.bind(*v),
            BindValue::Text(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Decode a row into a JSON object using the column kinds.
pub fn row_to_json(row: &SqliteRow, columns: &[&Column]) -> Result<Value, AppError> {
    let mut map = Map::with_capacity(columns.len());
    for column in columns {
        let name = column.name;
        let value = match column.kind {
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(name)?
                .map(Value::String)
                .unwrap_or(Value::Null),
            ColumnKind::Integer => row
                .try_get::<Option<i64>, _>(name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnKind::Real => row
                .try_get::<Option<f64>, _>(name)?
                .map(Value::from)
                .unwrap_or(Value::Null),
            ColumnKind::Bool => row
                .try_get::<Option<bool>, _>(name)?
                .map(Value::Bool)
                .unwrap_or(Value::Null),
            ColumnKind::Json => match row.try_get::<Option<String>, _>(name)? {
                Some(text) => serde_json::from_str(&text).unwrap_or(Value::String(text)),
                None => Value::Null,
            },
        };
        map.insert(name.to_string(), value);
    }
    Ok(Value::Object(map))
}

/// Comma-separated, quoted column names.
pub fn column_list(columns: &[&Column]) -> String {
    columns
        .iter()
        .map(|c| quote(c.name))
        .collect::<Vec<_>>()
        .join(", ")
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name)
}

fn lookup_column(table: &'static Table, name: &str) -> Result<&'static Column, AppError> {
    table
        .columns
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown column {}.{}", table.name, name)))
}

fn projection(
    table: &'static Table,
    requested: Option<&[String]>,
) -> Result<Vec<&'static Column>, AppError> {
    match requested {
        None => Ok(table.columns.iter().collect()),
        Some(names) => names.iter().map(|n| lookup_column(table, n)).collect(),
    }
}

fn apply_insert_defaults(table: &Table, row: &mut Map<String, Value>) {
    if table.has_column("id") && !row.contains_key("id") {
        row.insert(
            "id".to_string(),
            Value::String(uuid::Uuid::new_v4().to_string()),
        );
    }
    let now = now_timestamp();
    for stamp in ["created_at", "updated_at"] {
        if table.has_column(stamp) && !row.contains_key(stamp) {
            row.insert(stamp.to_string(), Value::String(now.clone()));
        }
    }
}

fn conflict_clause(
    table: &'static Table,
    conflict: Conflict,
    on_conflict: Option<&[String]>,
    inserted: &[&str],
) -> Result<String, AppError> {
    let target = match on_conflict {
        Some(cols) if !cols.is_empty() => {
            let names = cols
                .iter()
                .map(|c| lookup_column(table, c).map(|col| quote(col.name)))
                .collect::<Result<Vec<_>, _>>()?;
            Some(names.join(", "))
        }
        _ => None,
    };

    match conflict {
        Conflict::Error => Ok(String::new()),
        Conflict::Ignore => Ok(match target {
            Some(t) => format!(" ON CONFLICT ({}) DO NOTHING", t),
            None => " ON CONFLICT DO NOTHING".to_string(),
        }),
        Conflict::Merge => {
            let target_cols: Vec<&str> = on_conflict
                .map(|cols| cols.iter().map(String::as_str).collect())
                .unwrap_or_else(|| vec!["id"]);
            let updates: Vec<String> = inserted
                .iter()
                .filter(|c| !target_cols.contains(c) && **c != "id" && **c != "created_at")
                .map(|c| format!("{} = excluded.{}", quote(c), quote(c)))
                .collect();
            let target = target.unwrap_or_else(|| quote("id"));
            if updates.is_empty() {
                Ok(format!(" ON CONFLICT ({}) DO NOTHING", target))
            } else {
                Ok(format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    target,
                    updates.join(", ")
                ))
            }
        }
    }
}

fn where_clause(
    table: &'static Table,
    filters: &[Filter],
    binds: &mut Vec<BindValue>,
) -> Result<String, AppError> {
    if filters.is_empty() {
        return Ok(String::new());
    }

    let mut conditions = Vec::with_capacity(filters.len());
    for filter in filters {
        let column = lookup_column(table, &filter.column)?;
        let name = quote(column.name);

        let condition = match (&filter.op, &filter.value) {
            (Operator::Is, FilterValue::Null) => format!("{} IS NULL", name),
            (Operator::Is, FilterValue::Scalar(v)) => {
                binds.push(bind_filter(column, v)?);
                format!("{} = ?", name)
            }
            (Operator::In, FilterValue::List(values)) => {
                if values.is_empty() {
                    "1 = 0".to_string()
                } else {
                    for v in values {
                        binds.push(bind_filter(column, v)?);
                    }
                    format!("{} IN ({})", name, vec!["?"; values.len()].join(", "))
                }
            }
            (Operator::Like, FilterValue::Scalar(v)) => {
                binds.push(BindValue::Text(v.replace('%', "*")));
                format!("{} GLOB ?", name)
            }
            (Operator::Ilike, FilterValue::Scalar(v)) => {
                binds.push(BindValue::Text(v.replace('*', "%")));
                format!("{} LIKE ?", name)
            }
            (op, FilterValue::Scalar(v)) => {
                let sql_op = match op {
                    Operator::Eq => "=",
                    Operator::Neq => "<>",
                    Operator::Gt => ">",
                    Operator::Gte => ">=",
                    Operator::Lt => "<",
                    Operator::Lte => "<=",
                    _ => {
                        return Err(AppError::BadRequest(format!(
                            "Operator {} is not valid on {}",
                            op.as_str(),
                            column.name
                        )))
                    }
                };
                binds.push(bind_filter(column, v)?);
                format!("{} {} ?", name, sql_op)
            }
            (op, _) => {
                return Err(AppError::BadRequest(format!(
                    "Operator {} is not valid on {}",
                    op.as_str(),
                    column.name
                )))
            }
        };
        conditions.push(condition);
    }

    Ok(format!(" WHERE {}", conditions.join(" AND ")))
}

/// Row condition for a reader. Its binds follow the filter binds.
fn access_condition(table: &Table, user_id: &str, binds: &mut Vec<BindValue>) -> Option<String> {
    match table.read_access {
        ReadAccess::Public => None,
        ReadAccess::Owner => Some(match table.owner_column {
            Some(owner) => {
                binds.push(BindValue::Text(user_id.to_string()));
                format!("{} = ?", quote(owner))
            }
            None => "1 = 0".to_string(),
        }),
        ReadAccess::Parties(columns) => {
            let terms: Vec<String> = columns
                .iter()
                .map(|column| {
                    binds.push(BindValue::Text(user_id.to_string()));
                    format!("{} = ?", quote(column))
                })
                .collect();
            Some(format!("({})", terms.join(" OR ")))
        }
        ReadAccess::ChatMembers => {
            binds.push(BindValue::Text(user_id.to_string()));
            binds.push(BindValue::Text(user_id.to_string()));
            Some(
                "\"chat_id\" IN (SELECT \"id\" FROM \"chats\" WHERE \"buyer_id\" = ? OR \"seller_id\" = ?)"
                    .to_string(),
            )
        }
    }
}

fn order_clause(table: &'static Table, query: &RowQuery) -> Result<String, AppError> {
    let mut terms = Vec::with_capacity(query.order.len() + 1);
    for order in &query.order {
        let column = lookup_column(table, &order.column)?;
        let mut term = format!(
            "{} {}",
            quote(column.name),
            match order.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            }
        );
        match order.nulls {
            Some(Nulls::First) => term.push_str(" NULLS FIRST"),
            Some(Nulls::Last) => term.push_str(" NULLS LAST"),
            None => {}
        }
        terms.push(term);
    }
    // Stable tie-break so repeated reads return the same sequence
    terms.push("rowid ASC".to_string());
    Ok(format!(" ORDER BY {}", terms.join(", ")))
}

/// Convert a filter operand to a bind value of the column's kind.
fn bind_filter(column: &Column, raw: &str) -> Result<BindValue, AppError> {
    let invalid = || {
        AppError::BadRequest(format!(
            "Invalid value '{}' for column {}",
            raw, column.name
        ))
    };
    match column.kind {
        ColumnKind::Text | ColumnKind::Json => Ok(BindValue::Text(raw.to_string())),
        ColumnKind::Integer => raw.parse().map(BindValue::Integer).map_err(|_| invalid()),
        ColumnKind::Real => raw.parse().map(BindValue::Real).map_err(|_| invalid()),
        ColumnKind::Bool => match raw {
            "true" | "1" => Ok(BindValue::Integer(1)),
            "false" | "0" => Ok(BindValue::Integer(0)),
            _ => Err(invalid()),
        },
    }
}

/// Convert a JSON body value to a bind value of the column's kind.
fn bind_json(column: &Column, value: &Value) -> Result<BindValue, AppError> {
    let invalid = |expected: &str| {
        AppError::BadRequest(format!("Column {} expects {}", column.name, expected))
    };
    if value.is_null() {
        return Ok(BindValue::Null);
    }
    match column.kind {
        ColumnKind::Text => value
            .as_str()
            .map(|s| BindValue::Text(s.to_string()))
            .ok_or_else(|| invalid("a string")),
        ColumnKind::Integer => value
            .as_i64()
            .map(BindValue::Integer)
            .ok_or_else(|| invalid("an integer")),
        ColumnKind::Real => value
            .as_f64()
            .map(BindValue::Real)
            .ok_or_else(|| invalid("a number")),
        ColumnKind::Bool => match value {
            Value::Bool(b) => Ok(BindValue::Integer(i64::from(*b))),
            _ => Err(invalid("a boolean")),
        },
        ColumnKind::Json => Ok(BindValue::Text(value.to_string())),
    }
}
