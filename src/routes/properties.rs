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
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreatePropertyInput,
        PropertiesQuery, PropertyPath, UpdatePropertyInput,
    },
    services::audit::write_audit_log,
    services::payment_status::val_str,
    state::AppState,
};

const PROPERTY_STATUSES: &[&str] = &["available", "rented", "maintenance", "inactive"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/properties",
            axum::routing::get(list_properties).post(create_property),
        )
        .route(
            "/properties/{property_id}",
            axum::routing::get(get_property)
                .patch(update_property)
                .delete(delete_property),
        )
}

async fn list_properties(
    State(state): State<AppState>,
    Query(query): Query<PropertiesQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(status) = super::non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(city) = super::non_empty_opt(query.city.as_deref()) {
        filters.insert("city".to_string(), Value::String(city));
    }

    let rows = list_rows(
        pool,
        "properties",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "created_at",
        false,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;
    let row = get_row(pool, "properties", &path.property_id, "id").await?;
    Ok(Json(row))
}

async fn create_property(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreatePropertyInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    if !PROPERTY_STATUSES.contains(&input.status.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "Unknown property status '{}'.",
            input.status
        )));
    }

    let payload = build_property_payload(&input, &user_id);
    let row = create_row(pool, "properties", &payload).await?;
    write_audit_log(
        pool,
        &user_id,
        "property.created",
        "property",
        &val_str(&row, "id"),
        None,
    )
    .await;
    Ok(Json(row))
}

async fn update_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
    Json(input): Json<UpdatePropertyInput>,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    if let Some(status) = input.status.as_deref() {
        if !PROPERTY_STATUSES.contains(&status) {
            return Err(AppError::UnprocessableEntity(format!(
                "Unknown property status '{status}'."
            )));
        }
    }

    let payload = remove_nulls(serialize_to_map(&input));
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let row = update_row(pool, "properties", &path.property_id, &payload, "id").await?;
    write_audit_log(
        pool,
        &user_id,
        "property.updated",
        "property",
        &path.property_id,
        Some(Value::Object(payload)),
    )
    .await;
    Ok(Json(row))
}

/// A property with any contract on record, of any status, stays in the
/// system so its payment history remains reachable.
async fn delete_property(
    State(state): State<AppState>,
    Path(path): Path<PropertyPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user_id = require_user_id(&state, &headers)?;
    let pool = super::db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "property_id".to_string(),
        Value::String(path.property_id.clone()),
    );
    let contracts = count_rows(pool, "rental_contracts", Some(&filters)).await?;
    if contracts > 0 {
        return Err(AppError::BadRequest(
            "Property has contracts on record and cannot be deleted.".to_string(),
        ));
    }

    let removed = delete_row(pool, "properties", &path.property_id, "id").await?;
    write_audit_log(
        pool,
        &user_id,
        "property.deleted",
        "property",
        &path.property_id,
        None,
    )
    .await;
    Ok(Json(removed))
}

/// Creation payload with the generated bits filled in: a code when the
/// caller supplied none, and the creator as owning administrator when no
/// explicit one was named.
fn build_property_payload(input: &CreatePropertyInput, creator_id: &str) -> Map<String, Value> {
    let mut payload = remove_nulls(serialize_to_map(input));
    let code =
        super::non_empty_opt(input.code.as_deref()).unwrap_or_else(generate_property_code);
    payload.insert("code".to_string(), Value::String(code));

    let administrator_id = super::non_empty_opt(input.administrator_id.as_deref())
        .unwrap_or_else(|| creator_id.to_string());
    payload.insert(
        "administrator_id".to_string(),
        Value::String(administrator_id),
    );
    payload
}

fn generate_property_code() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("IMV-{}", suffix[..8].to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use crate::schemas::CreatePropertyInput;

    use super::{build_property_payload, generate_property_code};

    fn base_input() -> CreatePropertyInput {
        CreatePropertyInput {
            title: "Loft".to_string(),
            description: None,
            code: None,
            administrator_id: None,
            status: "available".to_string(),
            address_line1: None,
            address_line2: None,
            city: None,
            state: None,
            postal_code: None,
            bedrooms: None,
            bathrooms: None,
            area_m2: None,
            asking_rent: None,
        }
    }

    #[test]
    fn creator_becomes_administrator_by_default() {
        let payload = build_property_payload(&base_input(), "admin-1");
        assert_eq!(payload["administrator_id"], "admin-1");
    }

    #[test]
    fn explicit_administrator_wins_over_creator() {
        let mut input = base_input();
        input.administrator_id = Some("admin-2".to_string());
        let payload = build_property_payload(&input, "admin-1");
        assert_eq!(payload["administrator_id"], "admin-2");
    }

    #[test]
    fn property_codes_have_fixed_shape() {
        let code = generate_property_code();
        assert!(code.starts_with("IMV-"));
        assert_eq!(code.len(), 12);
        assert!(code[4..]
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }
}
