use std::fmt;

use chrono::NaiveDate;
use serde_json::{Map, Value};
use sqlx::PgPool;

use crate::error::AppError;
use crate::repository::table_service::{
    create_row, create_row_tx, delete_row, get_row, update_row, update_row_guarded,
};

/// Lifecycle state of an installment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Late,
    Paid,
    Cancelled,
}

impl PaymentStatus {
    pub fn parse(raw: &str) -> Result<Self, AppError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "late" => Ok(Self::Late),
            "paid" => Ok(Self::Paid),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::UnprocessableEntity(format!(
                "Unknown payment status '{other}'."
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Late => "late",
            Self::Paid => "paid",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Paid | Self::Cancelled)
    }

    /// Whether `self -> target` is a legal transition. Paid and cancelled
    /// are terminal; a pending payment can only move forward.
    pub fn can_transition_to(&self, target: Self) -> bool {
        match (self, target) {
            (Self::Pending, Self::Late)
            | (Self::Pending, Self::Paid)
            | (Self::Pending, Self::Cancelled)
            | (Self::Late, Self::Paid)
            | (Self::Late, Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status a payment should present as of `today`, without touching the
/// database. A pending installment whose due date has arrived reads as
/// late even before the daily sweep has run.
pub fn effective_status(status: PaymentStatus, due_date: NaiveDate, today: NaiveDate) -> PaymentStatus {
    if crate::services::payment_sweep::is_overdue(status, due_date, today) {
        return PaymentStatus::Late;
    }
    status
}

/// Outcome of validating a requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionPlan {
    NoOp,
    Apply,
}

/// Validates `current -> target` before any row is written. Terminal
/// states reject every request, including a repeat of themselves.
pub fn plan_transition(
    current: PaymentStatus,
    target: PaymentStatus,
) -> Result<TransitionPlan, AppError> {
    if target == PaymentStatus::Paid {
        return Err(AppError::BadRequest(
            "Use the pay operation to settle a payment.".to_string(),
        ));
    }
    if current.is_terminal() {
        return Err(AppError::BadRequest(format!(
            "Payment is already {current} and cannot change status."
        )));
    }
    if current == target {
        return Ok(TransitionPlan::NoOp);
    }
    if !current.can_transition_to(target) {
        return Err(AppError::BadRequest(format!(
            "Payment cannot move from {current} to {target}."
        )));
    }
    Ok(TransitionPlan::Apply)
}

/// Creates a manual installment against an active contract.
pub async fn register_payment(
    pool: &PgPool,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let contract_id = payload
        .get("contract_id")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::UnprocessableEntity("contract_id is required.".to_string()))?;

    let contract = get_row(pool, "rental_contracts", contract_id, "id").await?;
    if val_str(&contract, "status") != "active" {
        return Err(AppError::BadRequest(
            "Payments can only be registered against an active contract.".to_string(),
        ));
    }

    if let Some(status) = payload.get("status").and_then(Value::as_str) {
        let parsed = PaymentStatus::parse(status)?;
        if parsed.is_terminal() {
            return Err(AppError::UnprocessableEntity(
                "New payments cannot start in a terminal status.".to_string(),
            ));
        }
    }

    create_row(pool, "payments", payload).await
}

/// Marks a payment as paid and records the payment-history entry, in one
/// transaction. The status write is guarded so two concurrent pay calls
/// cannot both succeed or duplicate the history row.
pub async fn mark_paid(
    pool: &PgPool,
    payment_id: &str,
    today: NaiveDate,
    payment_method: Option<&str>,
    notes: Option<&str>,
    actor_id: &str,
) -> Result<Value, AppError> {
    let mut tx = pool.begin().await.map_err(|e| {
        tracing::error!(db_error = %e, "Could not open transaction");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let mut patch = Map::new();
    patch.insert("status".to_string(), Value::String("paid".to_string()));
    patch.insert("paid_on".to_string(), Value::String(today.to_string()));
    if let Some(method) = payment_method {
        patch.insert(
            "payment_method".to_string(),
            Value::String(method.to_string()),
        );
    }
    if let Some(text) = notes {
        patch.insert("notes".to_string(), Value::String(text.to_string()));
    }

    let updated = update_row_guarded(
        &mut tx,
        "payments",
        payment_id,
        &patch,
        "id",
        "status",
        &["pending", "late"],
    )
    .await?;

    let Some(payment) = updated else {
        tx.rollback().await.ok();
        // Distinguish a missing payment from one already settled.
        let existing = get_row(pool, "payments", payment_id, "id").await?;
        let status = val_str(&existing, "status");
        return Err(AppError::BadRequest(format!(
            "Payment is already {status} and cannot be paid."
        )));
    };

    let mut history = Map::new();
    history.insert(
        "payment_id".to_string(),
        Value::String(val_str(&payment, "id")),
    );
    history.insert(
        "contract_id".to_string(),
        Value::String(val_str(&payment, "contract_id")),
    );
    history.insert(
        "amount".to_string(),
        payment.get("amount").cloned().unwrap_or(Value::Null),
    );
    history.insert("paid_on".to_string(), Value::String(today.to_string()));
    if let Some(method) = payment.get("payment_method").filter(|v| !v.is_null()) {
        history.insert("payment_method".to_string(), method.clone());
    }
    history.insert(
        "recorded_by".to_string(),
        Value::String(actor_id.to_string()),
    );
    let history_row = create_row_tx(&mut tx, "payment_history", &history).await?;

    let mut link = Map::new();
    link.insert(
        "history_id".to_string(),
        Value::String(val_str(&history_row, "id")),
    );
    let linked = update_row_guarded(
        &mut tx,
        "payments",
        payment_id,
        &link,
        "id",
        "status",
        &["paid"],
    )
    .await?
    .ok_or_else(|| AppError::Internal("Could not link payment history.".to_string()))?;

    tx.commit().await.map_err(|e| {
        tracing::error!(db_error = %e, "Could not commit payment");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    Ok(linked)
}

/// Moves a payment along the status table. Paying goes through
/// [`mark_paid`] so the history entry is never skipped.
pub async fn change_status(
    pool: &PgPool,
    payment_id: &str,
    target_raw: &str,
) -> Result<Value, AppError> {
    let target = PaymentStatus::parse(target_raw)?;
    let payment = get_row(pool, "payments", payment_id, "id").await?;
    let current = PaymentStatus::parse(&val_str(&payment, "status"))?;

    if plan_transition(current, target)? == TransitionPlan::NoOp {
        return Ok(payment);
    }

    let mut patch = Map::new();
    patch.insert(
        "status".to_string(),
        Value::String(target.as_str().to_string()),
    );
    update_row(pool, "payments", payment_id, &patch, "id").await
}

pub async fn change_payment_method(
    pool: &PgPool,
    payment_id: &str,
    method: &str,
) -> Result<Value, AppError> {
    let payment = get_row(pool, "payments", payment_id, "id").await?;
    if val_str(&payment, "status") == "cancelled" {
        return Err(AppError::BadRequest(
            "Cancelled payments cannot be modified.".to_string(),
        ));
    }

    let mut patch = Map::new();
    patch.insert(
        "payment_method".to_string(),
        Value::String(method.to_string()),
    );
    update_row(pool, "payments", payment_id, &patch, "id").await
}

/// Removes an installment. Settled payments, and any payment with a
/// history entry, stay on the books.
pub async fn delete_payment(pool: &PgPool, payment_id: &str) -> Result<Value, AppError> {
    let payment = get_row(pool, "payments", payment_id, "id").await?;
    let has_history = payment
        .get("history_id")
        .is_some_and(|value| !value.is_null());
    if val_str(&payment, "status") == "paid" || has_history {
        return Err(AppError::BadRequest(
            "Settled payments cannot be deleted.".to_string(),
        ));
    }

    delete_row(pool, "payments", payment_id, "id").await
}

pub fn val_str(row: &Value, key: &str) -> String {
    row.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn parses_known_statuses() {
        assert_eq!(PaymentStatus::parse("pending").unwrap(), PaymentStatus::Pending);
        assert_eq!(PaymentStatus::parse(" LATE ").unwrap(), PaymentStatus::Late);
        assert!(PaymentStatus::parse("overdue").is_err());
    }

    #[test]
    fn terminal_states_admit_no_transitions() {
        for target in [
            PaymentStatus::Pending,
            PaymentStatus::Late,
            PaymentStatus::Paid,
            PaymentStatus::Cancelled,
        ] {
            assert!(!PaymentStatus::Paid.can_transition_to(target));
            assert!(!PaymentStatus::Cancelled.can_transition_to(target));
        }
    }

    #[test]
    fn pending_moves_forward_only() {
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Late));
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Paid));
        assert!(PaymentStatus::Pending.can_transition_to(PaymentStatus::Cancelled));
        assert!(!PaymentStatus::Late.can_transition_to(PaymentStatus::Pending));
    }

    #[test]
    fn effective_status_flips_on_due_date() {
        let due = date(2024, 3, 10);
        assert_eq!(
            effective_status(PaymentStatus::Pending, due, date(2024, 3, 9)),
            PaymentStatus::Pending
        );
        assert_eq!(
            effective_status(PaymentStatus::Pending, due, date(2024, 3, 10)),
            PaymentStatus::Late
        );
        assert_eq!(
            effective_status(PaymentStatus::Pending, due, date(2024, 4, 1)),
            PaymentStatus::Late
        );
    }

    #[test]
    fn repeating_a_terminal_status_is_rejected() {
        assert!(plan_transition(PaymentStatus::Cancelled, PaymentStatus::Cancelled).is_err());
        assert!(plan_transition(PaymentStatus::Paid, PaymentStatus::Cancelled).is_err());
    }

    #[test]
    fn repeating_a_live_status_is_a_no_op() {
        assert_eq!(
            plan_transition(PaymentStatus::Pending, PaymentStatus::Pending).unwrap(),
            TransitionPlan::NoOp
        );
        assert_eq!(
            plan_transition(PaymentStatus::Late, PaymentStatus::Late).unwrap(),
            TransitionPlan::NoOp
        );
    }

    #[test]
    fn paying_is_routed_away_from_plain_status_changes() {
        assert!(plan_transition(PaymentStatus::Pending, PaymentStatus::Paid).is_err());
        assert_eq!(
            plan_transition(PaymentStatus::Pending, PaymentStatus::Cancelled).unwrap(),
            TransitionPlan::Apply
        );
    }

    #[test]
    fn effective_status_leaves_settled_payments_alone() {
        let due = date(2024, 3, 10);
        assert_eq!(
            effective_status(PaymentStatus::Paid, due, date(2024, 4, 1)),
            PaymentStatus::Paid
        );
        assert_eq!(
            effective_status(PaymentStatus::Cancelled, due, date(2024, 4, 1)),
            PaymentStatus::Cancelled
        );
    }
}
