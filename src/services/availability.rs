use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::{PgConnection, PgPool};

use crate::error::AppError;
use crate::repository::table_service::list_rows;

/// Half-open overlap test: two periods conflict when each starts before
/// the other ends. Contracts that merely touch at an endpoint (one ends
/// on the day the next begins) do not conflict.
pub fn periods_overlap(
    a_start: NaiveDate,
    a_end: NaiveDate,
    b_start: NaiveDate,
    b_end: NaiveDate,
) -> bool {
    a_start < b_end && b_start < a_end
}

/// Checks whether a property is free for the requested period.
///
/// Only active contracts that have not already ended before the requested
/// start are considered. The property's own status flag is ignored: a
/// property marked `rented` is still available for a period after its
/// current contract ends.
pub async fn check_property_availability(
    pool: &PgPool,
    property_id: &str,
    starts_on: NaiveDate,
    ends_on: NaiveDate,
) -> Result<bool, AppError> {
    validate_period(starts_on, ends_on)?;

    let mut filters = Map::new();
    filters.insert(
        "property_id".to_string(),
        Value::String(property_id.to_string()),
    );
    filters.insert("status".to_string(), Value::String("active".to_string()));
    filters.insert(
        "ends_on__gte".to_string(),
        Value::String(starts_on.to_string()),
    );

    let contracts = list_rows(pool, "rental_contracts", Some(&filters), 500, 0, "starts_on", true)
        .await?;
    Ok(!any_overlap(&contracts, starts_on, ends_on))
}

/// Transaction-scoped variant used by contract creation, after the
/// property row has been locked `FOR UPDATE`.
pub async fn check_property_availability_tx(
    conn: &mut PgConnection,
    property_id: &str,
    starts_on: NaiveDate,
    ends_on: NaiveDate,
) -> Result<bool, AppError> {
    validate_period(starts_on, ends_on)?;

    let property_uuid = uuid::Uuid::parse_str(property_id)
        .map_err(|_| AppError::UnprocessableEntity("Invalid property id.".to_string()))?;

    let rows: Vec<(NaiveDate, NaiveDate)> = sqlx::query_as(
        "SELECT starts_on, ends_on FROM rental_contracts \
         WHERE property_id = $1 AND status = 'active' AND ends_on >= $2",
    )
    .bind(property_uuid)
    .bind(starts_on)
    .fetch_all(&mut *conn)
    .await
    .map_err(|e| {
        tracing::error!(db_error = %e, "Availability lookup failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    Ok(!rows
        .iter()
        .any(|(existing_start, existing_end)| {
            periods_overlap(starts_on, ends_on, *existing_start, *existing_end)
        }))
}

fn validate_period(starts_on: NaiveDate, ends_on: NaiveDate) -> Result<(), AppError> {
    if ends_on <= starts_on {
        return Err(AppError::UnprocessableEntity(
            "End date must be after start date.".to_string(),
        ));
    }
    Ok(())
}

fn any_overlap(contracts: &[Value], starts_on: NaiveDate, ends_on: NaiveDate) -> bool {
    contracts.iter().any(|contract| {
        let existing_start = date_field(contract, "starts_on");
        let existing_end = date_field(contract, "ends_on");
        match (existing_start, existing_end) {
            (Some(s), Some(e)) => periods_overlap(starts_on, ends_on, s, e),
            _ => false,
        }
    })
}

fn date_field(row: &Value, key: &str) -> Option<NaiveDate> {
    row.get(key)
        .and_then(Value::as_str)
        .and_then(|text| NaiveDate::parse_from_str(text, "%Y-%m-%d").ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn overlapping_periods_conflict() {
        assert!(periods_overlap(
            date(2024, 1, 1),
            date(2024, 6, 1),
            date(2024, 3, 1),
            date(2024, 9, 1),
        ));
        assert!(periods_overlap(
            date(2024, 3, 1),
            date(2024, 4, 1),
            date(2024, 1, 1),
            date(2024, 12, 1),
        ));
    }

    #[test]
    fn disjoint_periods_do_not_conflict() {
        assert!(!periods_overlap(
            date(2024, 1, 1),
            date(2024, 3, 1),
            date(2024, 6, 1),
            date(2024, 9, 1),
        ));
    }

    #[test]
    fn touching_endpoints_do_not_conflict() {
        // New tenancy starting the day the old one ends is allowed.
        assert!(!periods_overlap(
            date(2024, 1, 1),
            date(2024, 6, 1),
            date(2024, 6, 1),
            date(2024, 12, 1),
        ));
    }

    #[test]
    fn rejects_inverted_periods() {
        assert!(validate_period(date(2024, 6, 1), date(2024, 1, 1)).is_err());
        assert!(validate_period(date(2024, 6, 1), date(2024, 6, 1)).is_err());
    }

    #[test]
    fn scans_contract_rows_for_conflicts() {
        let contracts = vec![json!({
            "id": "550e8400-e29b-41d4-a716-446655440000",
            "starts_on": "2024-03-01",
            "ends_on": "2024-09-01",
        })];
        assert!(any_overlap(&contracts, date(2024, 1, 1), date(2024, 4, 1)));
        assert!(!any_overlap(&contracts, date(2024, 9, 1), date(2025, 1, 1)));
    }
}
