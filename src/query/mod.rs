//! Row filter grammar shared by the REST client and the reference backend.
//!
//! Filters travel as `column=op.value` query pairs (`price=gte.10`,
//! `chat_id=in.(a,b)`, `avatar_url=is.null`); ordering as
//! `order=last_message_at.desc.nullslast,created_at.desc`. The same
//! `column=op.value` form is used for realtime subscription filters.

use std::fmt;

use serde_json::Value;

use crate::errors::AppError;

/// Comparison operator of a filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    Ilike,
    Is,
    In,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "eq",
            Operator::Neq => "neq",
            Operator::Gt => "gt",
            Operator::Gte => "gte",
            Operator::Lt => "lt",
            Operator::Lte => "lte",
            Operator::Like => "like",
            Operator::Ilike => "ilike",
            Operator::Is => "is",
            Operator::In => "in",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eq" => Some(Operator::Eq),
            "neq" => Some(Operator::Neq),
            "gt" => Some(Operator::Gt),
            "gte" => Some(Operator::Gte),
            "lt" => Some(Operator::Lt),
            "lte" => Some(Operator::Lte),
            "like" => Some(Operator::Like),
            "ilike" => Some(Operator::Ilike),
            "is" => Some(Operator::Is),
            "in" => Some(Operator::In),
            _ => None,
        }
    }
}

/// Right-hand side of a filter.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    Scalar(String),
    List(Vec<String>),
    Null,
}

/// One `column op value` condition.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: Operator,
    pub value: FilterValue,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: Operator, value: impl fmt::Display) -> Self {
        Self {
            column: column.into(),
            op,
            value: FilterValue::Scalar(value.to_string()),
        }
    }

    pub fn is_in<I, V>(column: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: fmt::Display,
    {
        Self {
            column: column.into(),
            op: Operator::In,
            value: FilterValue::List(values.into_iter().map(|v| v.to_string()).collect()),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            op: Operator::Is,
            value: FilterValue::Null,
        }
    }

    /// Parse the value half of a query pair, e.g. `in.(a,b)` for column `id`.
    pub fn parse(column: &str, raw: &str) -> Result<Self, AppError> {
        let (op, rest) = raw
            .split_once('.')
            .ok_or_else(|| AppError::BadRequest(format!("Malformed filter on {}: {}", column, raw)))?;
        let op = Operator::parse(op)
            .ok_or_else(|| AppError::BadRequest(format!("Unknown operator '{}' on {}", op, column)))?;

        let value = match op {
            Operator::In => {
                let inner = rest
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(|| {
                        AppError::BadRequest(format!("Expected in.(...) on {}", column))
                    })?;
                FilterValue::List(split_list(inner))
            }
            Operator::Is => match rest {
                "null" => FilterValue::Null,
                "true" | "false" => FilterValue::Scalar(rest.to_string()),
                other => {
                    return Err(AppError::BadRequest(format!(
                        "is.{} is not supported on {}",
                        other, column
                    )))
                }
            },
            _ => FilterValue::Scalar(rest.to_string()),
        };

        Ok(Self {
            column: column.to_string(),
            op,
            value,
        })
    }

    /// Parse a whole `column=op.value` expression (realtime filters).
    pub fn parse_expr(expr: &str) -> Result<Self, AppError> {
        let (column, raw) = expr
            .split_once('=')
            .ok_or_else(|| AppError::BadRequest(format!("Malformed filter: {}", expr)))?;
        Self::parse(column.trim(), raw.trim())
    }

    /// Encode the value half of the query pair.
    pub fn encode_value(&self) -> String {
        match &self.value {
            FilterValue::Scalar(v) => format!("{}.{}", self.op.as_str(), v),
            FilterValue::List(values) => {
                let items: Vec<String> = values.iter().map(|v| quote_item(v)).collect();
                format!("{}.({})", self.op.as_str(), items.join(","))
            }
            FilterValue::Null => format!("{}.null", self.op.as_str()),
        }
    }

    /// Whether a JSON record satisfies this filter.
    pub fn matches(&self, record: &Value) -> bool {
        let field = record.get(&self.column).unwrap_or(&Value::Null);
        match (&self.op, &self.value) {
            (Operator::Is, FilterValue::Null) => field.is_null(),
            (Operator::Is, FilterValue::Scalar(v)) => field.as_bool().map(|b| b.to_string()) == Some(v.clone()),
            (Operator::In, FilterValue::List(values)) => match scalar_text(field) {
                Some(text) => values.iter().any(|v| *v == text),
                None => false,
            },
            (op, FilterValue::Scalar(v)) => {
                let Some(text) = scalar_text(field) else {
                    return false;
                };
                match op {
                    Operator::Eq => text == *v,
                    Operator::Neq => text != *v,
                    Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte => {
                        compare(&text, v).is_some_and(|ord| match op {
                            Operator::Gt => ord.is_gt(),
                            Operator::Gte => ord.is_ge(),
                            Operator::Lt => ord.is_lt(),
                            _ => ord.is_le(),
                        })
                    }
                    Operator::Like => like_matches(&text, v, false),
                    Operator::Ilike => like_matches(&text, v, true),
                    _ => false,
                }
            }
            _ => false,
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.column, self.encode_value())
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// Placement of NULLs in an ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Nulls {
    First,
    Last,
}

/// One ordering term.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub direction: Direction,
    pub nulls: Option<Nulls>,
}

impl Order {
    pub fn encode(&self) -> String {
        let mut out = format!(
            "{}.{}",
            self.column,
            match self.direction {
                Direction::Asc => "asc",
                Direction::Desc => "desc",
            }
        );
        match self.nulls {
            Some(Nulls::First) => out.push_str(".nullsfirst"),
            Some(Nulls::Last) => out.push_str(".nullslast"),
            None => {}
        }
        out
    }

    pub fn parse(term: &str) -> Result<Self, AppError> {
        let mut parts = term.split('.');
        let column = parts
            .next()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AppError::BadRequest(format!("Malformed order term: {}", term)))?;

        let mut order = Order {
            column: column.to_string(),
            direction: Direction::Asc,
            nulls: None,
        };
        for part in parts {
            match part {
                "asc" => order.direction = Direction::Asc,
                "desc" => order.direction = Direction::Desc,
                "nullsfirst" => order.nulls = Some(Nulls::First),
                "nullslast" => order.nulls = Some(Nulls::Last),
                other => {
                    return Err(AppError::BadRequest(format!(
                        "Unknown order modifier '{}' in {}",
                        other, term
                    )))
                }
            }
        }
        Ok(order)
    }
}

/// A complete row query: filters, projection, ordering and paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowQuery {
    pub filters: Vec<Filter>,
    pub columns: Option<Vec<String>>,
    pub order: Vec<Order>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub on_conflict: Option<Vec<String>>,
}

impl RowQuery {
    /// Encode as URL query pairs.
    pub fn to_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        if let Some(columns) = &self.columns {
            pairs.push(("select".to_string(), columns.join(",")));
        }
        for filter in &self.filters {
            pairs.push((filter.column.clone(), filter.encode_value()));
        }
        if !self.order.is_empty() {
            let terms: Vec<String> = self.order.iter().map(Order::encode).collect();
            pairs.push(("order".to_string(), terms.join(",")));
        }
        if let Some(limit) = self.limit {
            pairs.push(("limit".to_string(), limit.to_string()));
        }
        if let Some(offset) = self.offset {
            pairs.push(("offset".to_string(), offset.to_string()));
        }
        if let Some(cols) = &self.on_conflict {
            pairs.push(("on_conflict".to_string(), cols.join(",")));
        }
        pairs
    }

    /// Decode from URL query pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = RowQuery::default();
        for (key, value) in pairs {
            let (key, value) = (key.as_ref(), value.as_ref());
            match key {
                "select" => {
                    if value != "*" {
                        query.columns = Some(split_columns(value));
                    }
                }
                "order" => {
                    for term in value.split(',').filter(|t| !t.is_empty()) {
                        query.order.push(Order::parse(term)?);
                    }
                }
                "limit" => query.limit = Some(parse_count(key, value)?),
                "offset" => query.offset = Some(parse_count(key, value)?),
                "on_conflict" => query.on_conflict = Some(split_columns(value)),
                column => query.filters.push(Filter::parse(column, value)?),
            }
        }
        Ok(query)
    }
}

fn parse_count(key: &str, value: &str) -> Result<i64, AppError> {
    value
        .parse::<i64>()
        .ok()
        .filter(|n| *n >= 0)
        .ok_or_else(|| AppError::BadRequest(format!("{} must be a non-negative integer", key)))
}

fn split_columns(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// Split `a,"b,c",d` honouring double quotes.
fn split_list(inner: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = inner.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => quoted = !quoted,
            ',' if !quoted => items.push(std::mem::take(&mut current)),
            c => current.push(c),
        }
    }
    if !current.is_empty() || !items.is_empty() {
        items.push(current);
    }
    items
}

fn quote_item(value: &str) -> String {
    if value.contains(&[',', '(', ')', '"', '\\'][..]) {
        format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
    } else {
        value.to_string()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn compare(left: &str, right: &str) -> Option<std::cmp::Ordering> {
    match (left.parse::<f64>(), right.parse::<f64>()) {
        (Ok(l), Ok(r)) => l.partial_cmp(&r),
        _ => Some(left.cmp(right)),
    }
}

/// `*` and `%` are wildcards.
fn like_matches(text: &str, pattern: &str, case_insensitive: bool) -> bool {
    let (text, pattern) = if case_insensitive {
        (text.to_lowercase(), pattern.to_lowercase())
    } else {
        (text.to_string(), pattern.to_string())
    };
    let parts: Vec<&str> = pattern.split(&['*', '%'][..]).collect();
    if parts.len() == 1 {
        return text == pattern;
    }

    let mut rest = text.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            match rest.strip_prefix(part) {
                Some(r) => rest = r,
                None => return false,
            }
        } else if i == parts.len() - 1 {
            return rest.ends_with(part);
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}
