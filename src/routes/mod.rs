use axum::{routing::get, Router};

use crate::error::{AppError, AppResult};
use crate::state::AppState;

pub mod auth;
pub mod clients;
pub mod contracts;
pub mod health;
pub mod payments;
pub mod properties;

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(auth::router())
        .merge(properties::router())
        .merge(clients::router())
        .merge(contracts::router())
        .merge(payments::router())
}

pub(crate) fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state.db_pool.as_ref().ok_or_else(|| {
        AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string())
    })
}

pub(crate) fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
