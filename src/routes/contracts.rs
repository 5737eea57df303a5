use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{
        count_rows_tx, create_row_tx, delete_row_tx, delete_rows_tx, get_row, get_row_for_update,
        list_rows, update_row, update_row_tx,
    },
    schemas::{
        clamp_limit_in_range, validate_input, AvailabilityQuery, ChangeContractStatusInput,
        ContractPath, ContractsQuery, CreateContractInput,
    },
    services::{
        audit::write_audit_log,
        availability::{check_property_availability, check_property_availability_tx},
        payment_schedule::generate_monthly_schedule,
        payment_status::val_str,
    },
    state::AppState,
};

const CONTRACT_STATUSES: &[&str] = &["active", "pending", "terminated", "cancelled"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/contracts",
            axum::routing::get(list_contracts).post(create_contract),
        )
        .route(
            "/contracts/availability",
            axum::routing::get(check_availability),
        )
        .route(
            "/contracts/{contract_id}",
            axum::routing::get(get_contract).delete(delete_contract),
        )
        .route(
            "/contracts/{contract_id}/status",
            axum::routing::patch(change_contract_status),
        )
}

async fn list_contracts(
    State(state): State<AppState>,
    Query(query): Query<ContractsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(client_id) = super::non_empty_opt(query.client_id.as_deref()) {
        filters.insert("client_id".to_string(), Value::String(client_id));
    }
    if let Some(property_id) = super::non_empty_opt(query.property_id.as_deref()) {
        filters.insert("property_id".to_string(), Value::String(property_id));
    }
    if let Some(status) = super::non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(period_start) = query.period_start {
        filters.insert(
            "starts_on__gte".to_string(),
            Value::String(period_start.to_string()),
        );
    }
    if let Some(period_end) = query.period_end {
        filters.insert(
            "ends_on__lte".to_string(),
            Value::String(period_end.to_string()),
        );
    }

    let rows = list_rows(
        pool,
        "rental_contracts",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "starts_on",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn check_availability(
    State(state): State<AppState>,
    Query(query): Query<AvailabilityQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    // 404 when the property itself is unknown, not just "unavailable".
    get_row(pool, "properties", &query.property_id, "id").await?;

    let available =
        check_property_availability(pool, &query.property_id, query.starts_on, query.ends_on)
            .await?;
    Ok(Json(json!({
        "property_id": query.property_id,
        "starts_on": query.starts_on,
        "ends_on": query.ends_on,
        "available": available,
    })))
}

async fn get_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut contract = get_row(pool, "rental_contracts", &path.contract_id, "id").await?;

    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(path.contract_id.clone()),
    );
    let payments = list_rows(pool, "payments", Some(&filters), 1000, 0, "due_date", true).await?;
    if let Some(map) = contract.as_object_mut() {
        map.insert("payments".to_string(), Value::Array(payments));
    }
    Ok(Json(contract))
}

/// Creates a contract together with its full installment schedule.
///
/// The property row is locked for the duration of the transaction so two
/// concurrent requests for the same property cannot both pass the
/// availability check.
async fn create_contract(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateContractInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    if input.ends_on <= input.starts_on {
        return Err(AppError::UnprocessableEntity(
            "End date must be after start date.".to_string(),
        ));
    }

    let client = get_row(pool, "client_profiles", &input.client_id, "id").await?;
    if val_str(&client, "status") != "active" {
        return Err(AppError::BadRequest(
            "Contracts can only be created for active clients.".to_string(),
        ));
    }

    let schedule = generate_monthly_schedule(
        input.starts_on,
        input.ends_on,
        input.monthly_rent,
        input.billing_day,
    )?;

    let mut tx = pool.begin().await.map_err(|e| {
        tracing::error!(db_error = %e, "Could not open transaction");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let property = get_row_for_update(&mut tx, "properties", &input.property_id, "id").await?;
    if val_str(&property, "status") == "inactive" {
        return Err(AppError::BadRequest(
            "Inactive properties cannot be rented.".to_string(),
        ));
    }

    let available = check_property_availability_tx(
        &mut tx,
        &input.property_id,
        input.starts_on,
        input.ends_on,
    )
    .await?;
    if !available {
        return Err(AppError::BadRequest(
            "Property is not available for the requested period.".to_string(),
        ));
    }

    let mut contract_row = Map::new();
    contract_row.insert(
        "client_id".to_string(),
        Value::String(input.client_id.clone()),
    );
    contract_row.insert(
        "property_id".to_string(),
        Value::String(input.property_id.clone()),
    );
    contract_row.insert(
        "starts_on".to_string(),
        Value::String(input.starts_on.to_string()),
    );
    contract_row.insert(
        "ends_on".to_string(),
        Value::String(input.ends_on.to_string()),
    );
    contract_row.insert("monthly_rent".to_string(), json!(input.monthly_rent));
    if let Some(deposit) = input.deposit_amount {
        contract_row.insert("deposit_amount".to_string(), json!(deposit));
    }
    if let Some(fee) = input.admin_fee {
        contract_row.insert("admin_fee".to_string(), json!(fee));
    }
    contract_row.insert("billing_day".to_string(), json!(input.billing_day));
    contract_row.insert("status".to_string(), Value::String("active".to_string()));
    if let Some(notes) = super::non_empty_opt(input.notes.as_deref()) {
        contract_row.insert("notes".to_string(), Value::String(notes));
    }

    let mut contract = create_row_tx(&mut tx, "rental_contracts", &contract_row).await?;
    let contract_id = val_str(&contract, "id");

    let mut payments = Vec::with_capacity(schedule.len());
    for draft in &schedule {
        let mut payment_row = Map::new();
        payment_row.insert(
            "contract_id".to_string(),
            Value::String(contract_id.clone()),
        );
        payment_row.insert(
            "due_date".to_string(),
            Value::String(draft.due_date.to_string()),
        );
        payment_row.insert("amount".to_string(), json!(draft.amount));
        payment_row.insert("status".to_string(), Value::String("pending".to_string()));
        payments.push(create_row_tx(&mut tx, "payments", &payment_row).await?);
    }

    let mut property_patch = Map::new();
    property_patch.insert("status".to_string(), Value::String("rented".to_string()));
    update_row_tx(&mut tx, "properties", &input.property_id, &property_patch, "id").await?;

    tx.commit().await.map_err(|e| {
        tracing::error!(db_error = %e, "Could not commit contract");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    write_audit_log(
        pool,
        &user_id,
        "contract.created",
        "contract",
        &contract_id,
        Some(json!({ "installments": payments.len() })),
    )
    .await;

    if let Some(map) = contract.as_object_mut() {
        map.insert("payments".to_string(), Value::Array(payments));
    }
    Ok(Json(contract))
}

async fn change_contract_status(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
    Json(input): Json<ChangeContractStatusInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let target = input.status.trim().to_ascii_lowercase();
    if !CONTRACT_STATUSES.contains(&target.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "Unknown contract status '{target}'."
        )));
    }

    let contract = get_row(pool, "rental_contracts", &path.contract_id, "id").await?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String(target.clone()));
    let updated = update_row(pool, "rental_contracts", &path.contract_id, &patch, "id").await?;

    // Leaving the active state hands the property back to the market,
    // unless another active contract still holds it.
    if target != "active" && val_str(&contract, "status") == "active" {
        release_property_if_free(pool, &val_str(&contract, "property_id")).await?;
    }
    if target == "active" {
        let mut property_patch = Map::new();
        property_patch.insert("status".to_string(), Value::String("rented".to_string()));
        update_row(
            pool,
            "properties",
            &val_str(&contract, "property_id"),
            &property_patch,
            "id",
        )
        .await?;
    }

    write_audit_log(
        pool,
        &user_id,
        "contract.status_changed",
        "contract",
        &path.contract_id,
        Some(json!({ "status": target })),
    )
    .await;
    Ok(Json(updated))
}

/// Removes a contract and its open installments. Active contracts must be
/// terminated first, and any settled installment pins the contract in
/// place permanently.
async fn delete_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut tx = pool.begin().await.map_err(|e| {
        tracing::error!(db_error = %e, "Could not open transaction");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    // Both guards run inside the transaction, with the contract row
    // locked, so a pay call landing between check and delete cannot slip
    // a settled payment past the paid-count check.
    let contract =
        get_row_for_update(&mut tx, "rental_contracts", &path.contract_id, "id").await?;
    if val_str(&contract, "status") == "active" {
        return Err(AppError::BadRequest(
            "Active contracts cannot be deleted. Terminate the contract first.".to_string(),
        ));
    }

    let mut paid_filters = Map::new();
    paid_filters.insert(
        "contract_id".to_string(),
        Value::String(path.contract_id.clone()),
    );
    paid_filters.insert("status".to_string(), Value::String("paid".to_string()));
    let paid = count_rows_tx(&mut tx, "payments", Some(&paid_filters)).await?;
    if paid > 0 {
        return Err(AppError::BadRequest(
            "Contracts with settled payments cannot be deleted.".to_string(),
        ));
    }

    // The delete itself skips paid rows; if one was settled concurrently
    // it survives the delete and the remaining-count below aborts the
    // whole transaction with the business error.
    let mut payment_filters = Map::new();
    payment_filters.insert(
        "contract_id".to_string(),
        Value::String(path.contract_id.clone()),
    );
    payment_filters.insert(
        "status".to_string(),
        Value::Array(vec![
            Value::String("pending".to_string()),
            Value::String("late".to_string()),
            Value::String("cancelled".to_string()),
        ]),
    );
    let removed_payments = delete_rows_tx(&mut tx, "payments", &payment_filters).await?;

    let mut remaining_filters = Map::new();
    remaining_filters.insert(
        "contract_id".to_string(),
        Value::String(path.contract_id.clone()),
    );
    let remaining = count_rows_tx(&mut tx, "payments", Some(&remaining_filters)).await?;
    if remaining > 0 {
        return Err(AppError::BadRequest(
            "Contracts with settled payments cannot be deleted.".to_string(),
        ));
    }

    delete_row_tx(&mut tx, "rental_contracts", &path.contract_id, "id").await?;

    tx.commit().await.map_err(|e| {
        tracing::error!(db_error = %e, "Could not commit contract deletion");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    release_property_if_free(pool, &val_str(&contract, "property_id")).await?;

    write_audit_log(
        pool,
        &user_id,
        "contract.deleted",
        "contract",
        &path.contract_id,
        Some(json!({ "removed_payments": removed_payments })),
    )
    .await;
    Ok(Json(contract))
}

/// Puts a property back to `available` when no active contract remains.
async fn release_property_if_free(pool: &sqlx::PgPool, property_id: &str) -> AppResult<()> {
    if property_id.is_empty() {
        return Ok(());
    }

    let mut filters = Map::new();
    filters.insert(
        "property_id".to_string(),
        Value::String(property_id.to_string()),
    );
    filters.insert("status".to_string(), Value::String("active".to_string()));
    let active = crate::repository::table_service::count_rows(
        pool,
        "rental_contracts",
        Some(&filters),
    )
    .await?;

    if active == 0 {
        let mut patch = Map::new();
        patch.insert("status".to_string(), Value::String("available".to_string()));
        update_row(pool, "properties", property_id, &patch, "id").await?;
    }
    Ok(())
}
