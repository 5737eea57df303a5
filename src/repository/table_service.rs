use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, PgConnection, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &[
    "app_users",
    "audit_logs",
    "client_profiles",
    "payment_history",
    "payments",
    "properties",
    "rental_contracts",
];

/// Lists rows as JSON objects. Filter keys support `__gte` / `__lte`
/// suffixes for range queries and array values for `IN` semantics.
pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query.push(" ORDER BY t.").push(order_name);
    query.push(if ascending { " ASC" } else { " DESC" });
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 1000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_eq_filter(&mut query, id_name, &infer_scalar(id_name, row_id));
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    extract_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Row-locking variant of [`get_row`] for use inside a transaction.
/// Serializes concurrent writers touching the same row.
pub async fn get_row_for_update(
    conn: &mut PgConnection,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_eq_filter(&mut query, id_name, &infer_scalar(id_name, row_id));
    query.push(" LIMIT 1 FOR UPDATE OF t");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    extract_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let mut query = build_insert(table_name, payload)?;
    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    extract_row(row)
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

/// Same as [`create_row`] but executes within an existing transaction.
pub async fn create_row_tx(
    conn: &mut PgConnection,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let mut query = build_insert(table_name, payload)?;
    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    extract_row(row)
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    let mut query = build_update(table_name, payload)?;
    query.push(" WHERE ");
    push_eq_filter(&mut query, id_name, &infer_scalar(id_name, row_id));
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    extract_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Same as [`update_row`] but executes within an existing transaction.
pub async fn update_row_tx(
    conn: &mut PgConnection,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    let mut query = build_update(table_name, payload)?;
    query.push(" WHERE ");
    push_eq_filter(&mut query, id_name, &infer_scalar(id_name, row_id));
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    extract_row(row).ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Compare-and-swap update: the row is only written when its current
/// `guard_column` value is in `expected`. Returns `None` on a guard miss so
/// the caller can distinguish "row gone" from "state already advanced".
pub async fn update_row_guarded(
    conn: &mut PgConnection,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
    id_field: &str,
    guard_column: &str,
    expected: &[&str],
) -> Result<Option<Value>, AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;
    let guard_name = validate_identifier(guard_column)?;

    let mut query = build_update(table_name, payload)?;
    query.push(" WHERE ");
    push_eq_filter(&mut query, id_name, &infer_scalar(id_name, row_id));
    query
        .push(" AND t.")
        .push(guard_name)
        .push("::text = ANY(")
        .push_bind(
            expected
                .iter()
                .map(|value| (*value).to_string())
                .collect::<Vec<_>>(),
        )
        .push(")");
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_error)?;

    Ok(extract_row(row))
}

pub async fn delete_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<Value, AppError> {
    let existing = get_row(pool, table, row_id, id_field).await?;
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_eq_filter(&mut query, id_name, &infer_scalar(id_name, row_id));
    query.build().execute(pool).await.map_err(map_db_error)?;

    Ok(existing)
}

pub async fn delete_row_tx(
    conn: &mut PgConnection,
    table: &str,
    row_id: &str,
    id_field: &str,
) -> Result<(), AppError> {
    let table_name = validate_table(table)?;
    let id_name = validate_identifier(id_field)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_eq_filter(&mut query, id_name, &infer_scalar(id_name, row_id));
    query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(())
}

/// Filtered bulk delete inside a transaction; returns the rows removed.
pub async fn delete_rows_tx(
    conn: &mut PgConnection,
    table: &str,
    filters: &Map<String, Value>,
) -> Result<u64, AppError> {
    let table_name = validate_table(table)?;
    if filters.is_empty() {
        return Err(AppError::BadRequest(
            "Refusing to delete without filters.".to_string(),
        ));
    }

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    for (key, value) in filters {
        push_filter_clause(&mut query, key, value)?;
    }

    let result = query
        .build()
        .execute(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(result.rows_affected())
}

pub async fn count_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let mut query = build_count(table, filters)?;
    let row = query.build().fetch_one(pool).await.map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

/// Same as [`count_rows`] but executes within an existing transaction, so
/// the count observes (and is serialized against) the transaction's own
/// locks.
pub async fn count_rows_tx(
    conn: &mut PgConnection,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let mut query = build_count(table, filters)?;
    let row = query
        .build()
        .fetch_one(&mut *conn)
        .await
        .map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

fn build_count<'q>(
    table: &'q str,
    filters: Option<&Map<String, Value>>,
) -> Result<QueryBuilder<'q, Postgres>, AppError> {
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");

    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }
    Ok(query)
}

// ── SQL construction ───────────────────────────────────────────────

// jsonb_populate_record lets PostgreSQL resolve column types (uuid, date,
// numeric …) from the table definition instead of hand-mapping them here.
fn build_insert<'q>(
    table_name: &'q str,
    payload: &Map<String, Value>,
) -> Result<QueryBuilder<'q, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let keys = sorted_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.clone());
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(key.clone());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");
    Ok(query)
}

fn build_update<'q>(
    table_name: &'q str,
    payload: &Map<String, Value>,
) -> Result<QueryBuilder<'q, Postgres>, AppError> {
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let keys = sorted_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.clone());
            separated.push_unseparated(" = r.");
            separated.push_unseparated(key.clone());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r");
    Ok(query)
}

fn sorted_keys(payload: &Map<String, Value>) -> Result<Vec<String>, AppError> {
    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }
    Ok(keys)
}

// ── Filters ────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Scalar {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gte,
    Lte,
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    if let Some((column, suffix)) = filter_key.rsplit_once("__") {
        let operator = match suffix {
            "gte" => FilterOperator::Gte,
            "lte" => FilterOperator::Lte,
            "in" => FilterOperator::Eq,
            _ => {
                return Err(AppError::BadRequest(format!(
                    "Unsupported filter suffix '{suffix}'."
                )))
            }
        };
        return Ok((validate_identifier(column)?, operator));
    }
    Ok((validate_identifier(filter_key)?, FilterOperator::Eq))
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if operator != FilterOperator::Eq {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                // An empty IN-list matches nothing.
                query.push(" AND 1=0");
                return Ok(());
            }
            query.push(" AND ");
            push_in_filter(query, column, items);
            Ok(())
        }
        _ => {
            query.push(" AND ");
            let scalar = infer_scalar_value(column, value);
            push_comparison(query, column, operator, &scalar);
            Ok(())
        }
    }
}

fn push_eq_filter(query: &mut QueryBuilder<Postgres>, column: &str, value: &Scalar) {
    push_comparison(query, column, FilterOperator::Eq, value);
}

fn push_comparison(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &Scalar,
) {
    query.push("t.").push(column);
    let sql_operator = match operator {
        FilterOperator::Eq => " = ",
        FilterOperator::Gte => " >= ",
        FilterOperator::Lte => " <= ",
    };
    match value {
        Scalar::Text(text) => {
            query
                .push("::text")
                .push(sql_operator)
                .push_bind(text.clone());
        }
        Scalar::Uuid(id) => {
            query.push(sql_operator).push_bind(*id);
        }
        Scalar::Bool(flag) => {
            query.push(sql_operator).push_bind(*flag);
        }
        Scalar::I64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        Scalar::F64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        Scalar::Date(date) => {
            query.push(sql_operator).push_bind(*date);
        }
        Scalar::Timestamp(ts) => {
            query.push(sql_operator).push_bind(ts.to_owned());
        }
    }
}

fn push_in_filter(query: &mut QueryBuilder<Postgres>, column: &str, items: &[Value]) {
    if is_uuid_identifier(column) {
        let parsed = items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
            .collect::<Vec<_>>();
        if parsed.len() == items.len() {
            query
                .push("t.")
                .push(column)
                .push(" = ANY(")
                .push_bind(parsed)
                .push(")");
            return;
        }
    }

    let texts = items
        .iter()
        .map(|item| match item {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>();
    query
        .push("t.")
        .push(column)
        .push("::text = ANY(")
        .push_bind(texts)
        .push(")");
}

fn infer_scalar(column: &str, raw: &str) -> Scalar {
    infer_scalar_value(column, &Value::String(raw.to_string()))
}

fn infer_scalar_value(column: &str, value: &Value) -> Scalar {
    match value {
        Value::Bool(flag) => Scalar::Bool(*flag),
        Value::Number(number) => {
            if let Some(as_i64) = number.as_i64() {
                return Scalar::I64(as_i64);
            }
            if let Some(as_f64) = number.as_f64() {
                return Scalar::F64(as_f64);
            }
            Scalar::Text(number.to_string())
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(column) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return Scalar::Uuid(parsed);
                }
            }
            if is_timestamp_identifier(column) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return Scalar::Timestamp(parsed);
                }
            }
            if is_date_identifier(column) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return Scalar::Date(parsed);
                }
            }
            Scalar::Text(text.clone())
        }
        other => Scalar::Text(other.to_string()),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized.ends_with("_date") || normalized.ends_with("_on")
}

fn is_timestamp_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_at")
}

// ── Plumbing ───────────────────────────────────────────────────────

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    if !trimmed
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    if trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit())
    {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn extract_row(row: Option<PgRow>) -> Option<Value> {
    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{
        build_insert, build_update, parse_filter_key, push_filter_clause, validate_identifier,
        validate_table, FilterOperator,
    };

    #[test]
    fn validates_identifiers() {
        assert!(validate_identifier("due_date").is_ok());
        assert!(validate_identifier("9lives").is_err());
        assert!(validate_identifier("due-date").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn rejects_unknown_tables() {
        assert!(validate_table("payments").is_ok());
        assert!(validate_table("pg_catalog").is_err());
    }

    #[test]
    fn parses_filter_suffixes() {
        assert_eq!(
            parse_filter_key("due_date__gte").unwrap(),
            ("due_date", FilterOperator::Gte)
        );
        assert_eq!(
            parse_filter_key("due_date__lte").unwrap(),
            ("due_date", FilterOperator::Lte)
        );
        assert_eq!(
            parse_filter_key("status").unwrap(),
            ("status", FilterOperator::Eq)
        );
        assert!(parse_filter_key("status__like").is_err());
    }

    #[test]
    fn empty_in_list_matches_nothing() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE 1=1");
        push_filter_clause(&mut query, "status", &Value::Array(Vec::new())).unwrap();
        assert!(query.sql().contains("AND 1=0"));
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let mut payload = Map::new();
        payload.insert("amount".to_string(), Value::from(1500.0));
        payload.insert(
            "contract_id".to_string(),
            Value::String("550e8400-e29b-41d4-a716-446655440000".to_string()),
        );
        payload.insert("status".to_string(), Value::String("pending".to_string()));

        let query = build_insert("payments", &payload).unwrap();
        let sql = query.sql();
        assert!(sql.contains("jsonb_populate_record(NULL::payments"), "{sql}");
        assert!(
            sql.contains("SELECT r.amount, r.contract_id, r.status"),
            "{sql}"
        );
    }

    #[test]
    fn update_sql_sets_columns_from_record() {
        let mut payload = Map::new();
        payload.insert("status".to_string(), Value::String("late".to_string()));
        payload.insert("notes".to_string(), Value::String("swept".to_string()));

        let query = build_update("payments", &payload).unwrap();
        let sql = query.sql();
        assert!(sql.contains("notes = r.notes, status = r.status"), "{sql}");
        assert!(sql.contains("jsonb_populate_record(NULL::payments"), "{sql}");
    }

    #[test]
    fn count_sql_carries_its_filters() {
        let mut filters = Map::new();
        filters.insert("status".to_string(), Value::String("paid".to_string()));
        filters.insert(
            "contract_id".to_string(),
            Value::String("550e8400-e29b-41d4-a716-446655440000".to_string()),
        );

        let query = super::build_count("payments", Some(&filters)).unwrap();
        let sql = query.sql();
        assert!(sql.starts_with("SELECT COUNT(*)::bigint AS total FROM payments"), "{sql}");
        assert!(sql.contains("t.contract_id = "), "{sql}");
        assert!(sql.contains("t.status::text = "), "{sql}");
    }

    #[test]
    fn rejects_empty_payloads() {
        assert!(build_insert("payments", &Map::new()).is_err());
        assert!(build_update("payments", &Map::new()).is_err());
    }
}
