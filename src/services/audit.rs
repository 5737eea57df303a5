use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::repository::table_service::create_row;

/// Best-effort audit trail entry. Failures are logged and swallowed so
/// an audit outage never fails the request that triggered it.
pub async fn write_audit_log(
    pool: &PgPool,
    actor_id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    detail: Option<Value>,
) {
    let mut row = Map::new();
    row.insert("actor_id".to_string(), Value::String(actor_id.to_string()));
    row.insert("action".to_string(), Value::String(action.to_string()));
    row.insert(
        "entity_type".to_string(),
        Value::String(entity_type.to_string()),
    );
    row.insert(
        "entity_id".to_string(),
        Value::String(entity_id.to_string()),
    );
    if let Some(payload) = detail {
        row.insert("detail".to_string(), payload);
    }

    if let Err(e) = create_row(pool, "audit_logs", &row).await {
        tracing::warn!("Failed to write audit log for {action}: {e}");
    }
}
