use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use sqlx::Row;

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        ChangePaymentMethodInput, ChangePaymentStatusInput, CreatePaymentInput, PayPaymentInput,
        PaymentPath, PaymentsQuery,
    },
    services::{
        audit::write_audit_log,
        payment_status::{
            change_payment_method, change_status, delete_payment, effective_status, mark_paid,
            register_payment, val_str, PaymentStatus,
        },
        payment_sweep::run_overdue_sweep,
        scheduler::local_today,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/payments",
            axum::routing::get(list_payments).post(create_payment),
        )
        .route("/payments/grouped", axum::routing::get(grouped_payments))
        .route("/payments/sweep", axum::routing::post(trigger_sweep))
        .route(
            "/payments/{payment_id}",
            axum::routing::get(get_payment).delete(remove_payment),
        )
        .route("/payments/{payment_id}/pay", axum::routing::post(pay_payment))
        .route(
            "/payments/{payment_id}/status",
            axum::routing::patch(patch_payment_status),
        )
        .route(
            "/payments/{payment_id}/payment-method",
            axum::routing::patch(patch_payment_method),
        )
}

async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(contract_id) = super::non_empty_opt(query.contract_id.as_deref()) {
        filters.insert("contract_id".to_string(), Value::String(contract_id));
    }
    if let Some(status) = super::non_empty_opt(query.status.as_deref()) {
        PaymentStatus::parse(&status)?;
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(due_from) = query.due_from {
        filters.insert(
            "due_date__gte".to_string(),
            Value::String(due_from.to_string()),
        );
    }
    if let Some(due_to) = query.due_to {
        filters.insert(
            "due_date__lte".to_string(),
            Value::String(due_to.to_string()),
        );
    }

    let mut rows = list_rows(
        pool,
        "payments",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 1000),
        0,
        "due_date",
        true,
    )
    .await?;

    let today = local_today(chrono::Utc::now(), state.config.sweep_timezone);
    for row in &mut rows {
        overlay_effective_status(row, today);
    }
    Ok(Json(json!({ "data": rows })))
}

async fn get_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut payment = get_row(pool, "payments", &path.payment_id, "id").await?;
    overlay_effective_status(
        &mut payment,
        local_today(chrono::Utc::now(), state.config.sweep_timezone),
    );
    Ok(Json(payment))
}

async fn create_payment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreatePaymentInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let payload = remove_nulls(serialize_to_map(&input));
    let payment = register_payment(pool, &payload).await?;
    write_audit_log(
        pool,
        &user_id,
        "payment.created",
        "payment",
        &val_str(&payment, "id"),
        None,
    )
    .await;
    Ok(Json(payment))
}

async fn pay_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
    Json(input): Json<PayPaymentInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let today = local_today(chrono::Utc::now(), state.config.sweep_timezone);
    let payment = mark_paid(
        pool,
        &path.payment_id,
        today,
        input.payment_method.as_deref(),
        input.notes.as_deref(),
        &user_id,
    )
    .await?;

    write_audit_log(
        pool,
        &user_id,
        "payment.paid",
        "payment",
        &path.payment_id,
        Some(json!({ "payment_method": input.payment_method })),
    )
    .await;
    Ok(Json(payment))
}

async fn patch_payment_status(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
    Json(input): Json<ChangePaymentStatusInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let payment = change_status(pool, &path.payment_id, &input.status).await?;
    write_audit_log(
        pool,
        &user_id,
        "payment.status_changed",
        "payment",
        &path.payment_id,
        Some(json!({ "status": input.status })),
    )
    .await;
    Ok(Json(payment))
}

async fn patch_payment_method(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
    Json(input): Json<ChangePaymentMethodInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let method = input.method.trim();
    if method.is_empty() {
        return Err(AppError::UnprocessableEntity(
            "Payment method cannot be empty.".to_string(),
        ));
    }

    let payment = change_payment_method(pool, &path.payment_id, method).await?;
    write_audit_log(
        pool,
        &user_id,
        "payment.method_changed",
        "payment",
        &path.payment_id,
        Some(json!({ "payment_method": method })),
    )
    .await;
    Ok(Json(payment))
}

async fn remove_payment(
    State(state): State<AppState>,
    Path(path): Path<PaymentPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let removed = delete_payment(pool, &path.payment_id).await?;
    write_audit_log(
        pool,
        &user_id,
        "payment.deleted",
        "payment",
        &path.payment_id,
        None,
    )
    .await;
    Ok(Json(removed))
}

/// Manual trigger for the daily overdue sweep. The scheduler runs the
/// same job at local midnight; this endpoint exists for operations.
async fn trigger_sweep(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let today = local_today(chrono::Utc::now(), state.config.sweep_timezone);
    let outcome = run_overdue_sweep(pool, today).await?;

    write_audit_log(
        pool,
        &user_id,
        "payment.sweep",
        "payment",
        "*",
        Some(json!({ "marked_late": outcome.marked_late })),
    )
    .await;
    Ok(Json(json!(outcome)))
}

/// Per-contract rollup of the payment book.
async fn grouped_payments(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let rows = sqlx::query(
        "SELECT p.contract_id::text AS contract_id, \
                COUNT(*)::bigint AS installments, \
                COALESCE(SUM(p.amount), 0)::float8 AS total_amount, \
                COALESCE(SUM(p.amount) FILTER (WHERE p.status = 'paid'), 0)::float8 AS paid_amount, \
                COUNT(*) FILTER (WHERE p.status = 'pending')::bigint AS pending_count, \
                COUNT(*) FILTER (WHERE p.status = 'late')::bigint AS late_count \
         FROM payments p GROUP BY p.contract_id ORDER BY p.contract_id",
    )
    .fetch_all(pool)
    .await
    .map_err(|e| {
        tracing::error!(db_error = %e, "Grouped payments query failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let groups: Vec<Value> = rows
        .into_iter()
        .map(|row| {
            json!({
                "contract_id": row.try_get::<String, _>("contract_id").unwrap_or_default(),
                "installments": row.try_get::<i64, _>("installments").unwrap_or(0),
                "total_amount": row.try_get::<f64, _>("total_amount").unwrap_or(0.0),
                "paid_amount": row.try_get::<f64, _>("paid_amount").unwrap_or(0.0),
                "pending_count": row.try_get::<i64, _>("pending_count").unwrap_or(0),
                "late_count": row.try_get::<i64, _>("late_count").unwrap_or(0),
            })
        })
        .collect();
    Ok(Json(json!({ "data": groups })))
}

/// Presents a pending-but-overdue installment as late without waiting for
/// the sweep to persist the flip.
fn overlay_effective_status(payment: &mut Value, today: NaiveDate) {
    let Some(map) = payment.as_object_mut() else {
        return;
    };
    let Some(status) = map
        .get("status")
        .and_then(Value::as_str)
        .and_then(|raw| PaymentStatus::parse(raw).ok())
    else {
        return;
    };
    let Some(due_date) = map
        .get("due_date")
        .and_then(Value::as_str)
        .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok())
    else {
        return;
    };

    let effective = effective_status(status, due_date, today);
    map.insert(
        "status".to_string(),
        Value::String(effective.as_str().to_string()),
    );
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use serde_json::json;

    use super::overlay_effective_status;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn overdue_pending_reads_as_late() {
        let mut payment = json!({ "status": "pending", "due_date": "2024-03-01" });
        overlay_effective_status(&mut payment, date(2024, 3, 5));
        assert_eq!(payment["status"], "late");
    }

    #[test]
    fn future_pending_stays_pending() {
        let mut payment = json!({ "status": "pending", "due_date": "2024-03-01" });
        overlay_effective_status(&mut payment, date(2024, 2, 20));
        assert_eq!(payment["status"], "pending");
    }

    #[test]
    fn settled_payments_are_untouched() {
        let mut payment = json!({ "status": "paid", "due_date": "2024-03-01" });
        overlay_effective_status(&mut payment, date(2024, 3, 5));
        assert_eq!(payment["status"], "paid");
    }
}
