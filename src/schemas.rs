use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn default_client_role() -> String {
    "client".to_string()
}
fn default_property_status() -> String {
    "available".to_string()
}
fn default_client_status() -> String {
    "active".to_string()
}
fn default_payment_status() -> String {
    "pending".to_string()
}
fn default_billing_day() -> u8 {
    5
}
fn default_limit_100() -> i64 {
    100
}
fn default_limit_500() -> i64 {
    500
}

// ── Auth ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct RegisterInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 8, max = 128))]
    pub password: String,
    #[serde(default = "default_client_role")]
    pub role: String,
    pub phone: Option<String>,
    pub document: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct LoginInput {
    #[validate(email)]
    pub email: String,
    #[validate(length(min = 1))]
    pub password: String,
}

// ── Properties ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePropertyInput {
    #[validate(length(min = 1, max = 255))]
    pub title: String,
    pub description: Option<String>,
    pub code: Option<String>,
    /// Owning administrator; defaults to the authenticated user.
    pub administrator_id: Option<String>,
    #[serde(default = "default_property_status")]
    pub status: String,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub bedrooms: Option<i16>,
    pub bathrooms: Option<i16>,
    pub area_m2: Option<f64>,
    #[validate(range(min = 0.0))]
    pub asking_rent: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdatePropertyInput {
    pub title: Option<String>,
    pub description: Option<String>,
    pub administrator_id: Option<String>,
    pub status: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postal_code: Option<String>,
    pub bedrooms: Option<i16>,
    pub bathrooms: Option<i16>,
    pub area_m2: Option<f64>,
    pub asking_rent: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertiesQuery {
    pub status: Option<String>,
    pub city: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PropertyPath {
    pub property_id: String,
}

// ── Clients ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateClientInput {
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    #[validate(email)]
    pub email: String,
    pub phone: Option<String>,
    pub document: Option<String>,
    #[serde(default = "default_client_status")]
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct UpdateClientInput {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub document: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ClientsQuery {
    pub status: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ClientPath {
    pub client_id: String,
}

// ── Contracts ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreateContractInput {
    pub client_id: String,
    pub property_id: String,
    pub starts_on: chrono::NaiveDate,
    pub ends_on: chrono::NaiveDate,
    #[validate(range(min = 0.01))]
    pub monthly_rent: f64,
    #[validate(range(min = 0.0))]
    pub deposit_amount: Option<f64>,
    #[validate(range(min = 0.0))]
    pub admin_fee: Option<f64>,
    #[serde(default = "default_billing_day")]
    #[validate(range(min = 1, max = 31))]
    pub billing_day: u8,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ContractsQuery {
    pub client_id: Option<String>,
    pub property_id: Option<String>,
    pub status: Option<String>,
    pub period_start: Option<chrono::NaiveDate>,
    pub period_end: Option<chrono::NaiveDate>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ContractPath {
    pub contract_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChangeContractStatusInput {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct AvailabilityQuery {
    pub property_id: String,
    pub starts_on: chrono::NaiveDate,
    pub ends_on: chrono::NaiveDate,
}

// ── Payments ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct CreatePaymentInput {
    pub contract_id: String,
    #[validate(range(min = 0.01))]
    pub amount: f64,
    pub due_date: chrono::NaiveDate,
    #[serde(default = "default_payment_status")]
    pub status: String,
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentsQuery {
    pub contract_id: Option<String>,
    pub status: Option<String>,
    pub due_from: Option<chrono::NaiveDate>,
    pub due_to: Option<chrono::NaiveDate>,
    #[serde(default = "default_limit_500")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentPath {
    pub payment_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PayPaymentInput {
    pub payment_method: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChangePaymentStatusInput {
    pub status: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ChangePaymentMethodInput {
    #[serde(alias = "payment_method")]
    pub method: String,
}

// ── Helpers ────────────────────────────────────────────────────────

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: serde::Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamps_limits() {
        assert_eq!(clamp_limit_in_range(0, 1, 500), 1);
        assert_eq!(clamp_limit_in_range(100, 1, 500), 100);
        assert_eq!(clamp_limit_in_range(9999, 1, 500), 500);
    }

    #[test]
    fn remove_nulls_drops_absent_fields() {
        let update = UpdatePropertyInput {
            title: Some("Loft".to_string()),
            description: None,
            administrator_id: None,
            status: None,
            address_line1: None,
            address_line2: None,
            city: None,
            state: None,
            postal_code: None,
            bedrooms: None,
            bathrooms: None,
            area_m2: None,
            asking_rent: None,
        };
        let map = remove_nulls(serialize_to_map(&update));
        assert_eq!(map.len(), 1);
        assert_eq!(map["title"], "Loft");
    }

    #[test]
    fn contract_queries_use_period_parameter_names() {
        let query: ContractsQuery = serde_json::from_value(serde_json::json!({
            "period_start": "2024-01-01",
            "period_end": "2024-12-31",
        }))
        .unwrap();
        assert_eq!(
            query.period_start,
            chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
        );
        assert_eq!(
            query.period_end,
            chrono::NaiveDate::from_ymd_opt(2024, 12, 31)
        );
        assert_eq!(query.limit, 100);
    }

    #[test]
    fn rejects_short_passwords() {
        let input = RegisterInput {
            name: "Ana".to_string(),
            email: "ana@example.com".to_string(),
            password: "short".to_string(),
            role: "client".to_string(),
            phone: None,
            document: None,
        };
        assert!(validate_input(&input).is_err());
    }

    #[test]
    fn rejects_out_of_range_billing_day() {
        let input = CreateContractInput {
            client_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
            property_id: "550e8400-e29b-41d4-a716-446655440001".to_string(),
            starts_on: chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            ends_on: chrono::NaiveDate::from_ymd_opt(2024, 4, 15).unwrap(),
            monthly_rent: 1500.0,
            deposit_amount: None,
            admin_fee: None,
            billing_day: 32,
            notes: None,
        };
        assert!(validate_input(&input).is_err());
    }
}
