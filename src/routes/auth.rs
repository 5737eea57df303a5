use axum::{extract::State, Json};
use serde_json::{json, Map, Value};

use crate::{
    auth::issue_token,
    error::{AppError, AppResult},
    repository::table_service::{create_row, list_rows},
    schemas::{validate_input, LoginInput, RegisterInput},
    services::payment_status::val_str,
    state::AppState,
};

const KNOWN_ROLES: &[&str] = &["administrator", "client", "owner"];

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/auth/register", axum::routing::post(register))
        .route("/auth/login", axum::routing::post(login))
}

async fn register(
    State(state): State<AppState>,
    Json(input): Json<RegisterInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let pool = super::db_pool(&state)?;

    let role = input.role.trim().to_ascii_lowercase();
    if !KNOWN_ROLES.contains(&role.as_str()) {
        return Err(AppError::UnprocessableEntity(format!(
            "Unknown role '{role}'."
        )));
    }

    let email = input.email.trim().to_ascii_lowercase();
    let password_hash = bcrypt::hash(&input.password, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::Internal(format!("Could not hash password: {e}")))?;

    let mut user_row = Map::new();
    user_row.insert("name".to_string(), Value::String(input.name.clone()));
    user_row.insert("email".to_string(), Value::String(email.clone()));
    user_row.insert("role".to_string(), Value::String(role.clone()));
    user_row.insert("password_hash".to_string(), Value::String(password_hash));

    // A unique index on app_users.email turns duplicates into a 409.
    let user = create_row(pool, "app_users", &user_row).await?;
    let user_id = val_str(&user, "id");

    if role == "client" {
        let mut profile = Map::new();
        profile.insert("user_id".to_string(), Value::String(user_id.clone()));
        profile.insert("name".to_string(), Value::String(input.name.clone()));
        profile.insert("email".to_string(), Value::String(email.clone()));
        if let Some(phone) = super::non_empty_opt(input.phone.as_deref()) {
            profile.insert("phone".to_string(), Value::String(phone));
        }
        if let Some(document) = super::non_empty_opt(input.document.as_deref()) {
            profile.insert("document".to_string(), Value::String(document));
        }
        profile.insert("status".to_string(), Value::String("active".to_string()));
        create_row(pool, "client_profiles", &profile).await?;
    }

    let token = issue_token(&state, &user_id, &role, &input.name, &email)?;
    Ok(Json(json!({
        "token": token,
        "user": public_user(user),
    })))
}

async fn login(
    State(state): State<AppState>,
    Json(input): Json<LoginInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let pool = super::db_pool(&state)?;

    let mut filters = Map::new();
    filters.insert(
        "email".to_string(),
        Value::String(input.email.trim().to_ascii_lowercase()),
    );
    let users = list_rows(pool, "app_users", Some(&filters), 1, 0, "created_at", true).await?;

    let invalid = || AppError::Unauthorized("Invalid email or password.".to_string());
    let user = users.into_iter().next().ok_or_else(invalid)?;

    let stored_hash = val_str(&user, "password_hash");
    let verified = bcrypt::verify(&input.password, &stored_hash).unwrap_or(false);
    if !verified {
        return Err(invalid());
    }

    let token = issue_token(
        &state,
        &val_str(&user, "id"),
        &val_str(&user, "role"),
        &val_str(&user, "name"),
        &val_str(&user, "email"),
    )?;
    Ok(Json(json!({
        "token": token,
        "user": public_user(user),
    })))
}

/// Strip credential material before the row leaves the API.
fn public_user(mut user: Value) -> Value {
    if let Some(map) = user.as_object_mut() {
        map.remove("password_hash");
    }
    user
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::public_user;

    #[test]
    fn public_user_drops_password_hash() {
        let user = json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "email": "ana@example.com",
            "password_hash": "$2b$12$abcdef",
        });
        let cleaned = public_user(user);
        assert!(cleaned.get("password_hash").is_none());
        assert_eq!(cleaned["email"], "ana@example.com");
    }
}
