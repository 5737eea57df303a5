use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    auth::require_user_id,
    error::{AppError, AppResult},
    repository::table_service::{count_rows, create_row, delete_row, get_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, ClientPath,
        ClientsQuery, CreateClientInput, UpdateClientInput,
    },
    services::audit::write_audit_log,
    services::payment_status::val_str,
    state::AppState,
};

const CLIENT_STATUSES: &[&str] = &["active", "inactive"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/clients",
            axum::routing::get(list_clients).post(create_client),
        )
        .route(
            "/clients/{client_id}",
            axum::routing::get(get_client)
                .patch(update_client)
                .delete(delete_client),
        )
}

async fn list_clients(
    State(state): State<AppState>,
    Query(query): Query<ClientsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = super::non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }

    let rows = list_rows(
        pool,
        "client_profiles",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_client(
    State(state): State<AppState>,
    Path(path): Path<ClientPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;
    let row = get_row(pool, "client_profiles", &path.client_id, "id").await?;
    Ok(Json(row))
}

async fn create_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateClientInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    if !CLIENT_STATUSES.contains(&input.status.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "Unknown client status '{}'.",
            input.status
        )));
    }

    let mut payload = remove_nulls(serialize_to_map(&input));
    payload.insert(
        "email".to_string(),
        Value::String(input.email.trim().to_ascii_lowercase()),
    );

    let row = create_row(pool, "client_profiles", &payload).await?;
    write_audit_log(
        pool,
        &user_id,
        "client.created",
        "client",
        &val_str(&row, "id"),
        None,
    )
    .await;
    Ok(Json(row))
}

async fn update_client(
    State(state): State<AppState>,
    Path(path): Path<ClientPath>,
    headers: HeaderMap,
    Json(input): Json<UpdateClientInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    if let Some(status) = input.status.as_deref() {
        if !CLIENT_STATUSES.contains(&status) {
            return Err(AppError::UnprocessableEntity(format!(
                "Unknown client status '{status}'."
            )));
        }
    }

    let payload = remove_nulls(serialize_to_map(&input));
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let row = update_row(pool, "client_profiles", &path.client_id, &payload, "id").await?;
    write_audit_log(
        pool,
        &user_id,
        "client.updated",
        "client",
        &path.client_id,
        Some(Value::Object(payload)),
    )
    .await;
    Ok(Json(row))
}

async fn delete_client(
    State(state): State<AppState>,
    Path(path): Path<ClientPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "client_id".to_string(),
        Value::String(path.client_id.clone()),
    );
    let contracts = count_rows(pool, "rental_contracts", Some(&filters)).await?;
    if contracts > 0 {
        return Err(AppError::BadRequest(
            "Client has contracts on record and cannot be deleted.".to_string(),
        ));
    }

    let removed = delete_row(pool, "client_profiles", &path.client_id, "id").await?;
    write_audit_log(
        pool,
        &user_id,
        "client.deleted",
        "client",
        &path.client_id,
        None,
    )
    .await;
    Ok(Json(removed))
}
