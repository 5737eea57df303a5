use chrono::NaiveDate;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::AppError;
use crate::services::payment_status::PaymentStatus;

/// The sweep predicate: a pending installment whose due date has arrived
/// is overdue. The UPDATE in [`run_overdue_sweep`] is the SQL form of
/// this function; the two must agree.
pub fn is_overdue(status: PaymentStatus, due_date: NaiveDate, today: NaiveDate) -> bool {
    status == PaymentStatus::Pending && due_date <= today
}

/// Result of an overdue sweep run.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SweepOutcome {
    pub reference_date: NaiveDate,
    pub marked_late: u64,
}

/// Flips every pending installment whose due date has arrived to late.
///
/// A single set-based UPDATE keeps the sweep atomic and idempotent:
/// rerunning it on the same day matches no further rows, and payments
/// settled or cancelled in between are never touched.
pub async fn run_overdue_sweep(
    pool: &PgPool,
    reference_date: NaiveDate,
) -> Result<SweepOutcome, AppError> {
    let result = sqlx::query(
        "UPDATE payments SET status = 'late' \
         WHERE status = 'pending' AND due_date <= $1",
    )
    .bind(reference_date)
    .execute(pool)
    .await
    .map_err(|e| {
        warn!(db_error = %e, "Overdue sweep failed");
        AppError::Dependency("Database operation failed.".to_string())
    })?;

    let outcome = SweepOutcome {
        reference_date,
        marked_late: result.rows_affected(),
    };

    if outcome.marked_late > 0 {
        info!(
            reference_date = %outcome.reference_date,
            marked_late = outcome.marked_late,
            "Overdue sweep completed"
        );
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn sweep(book: &mut [(PaymentStatus, NaiveDate)], today: NaiveDate) -> usize {
        let mut flipped = 0;
        for entry in book.iter_mut() {
            if is_overdue(entry.0, entry.1, today) {
                entry.0 = PaymentStatus::Late;
                flipped += 1;
            }
        }
        flipped
    }

    #[test]
    fn selects_pending_due_on_or_before_today() {
        let today = date(2024, 3, 10);
        assert!(is_overdue(PaymentStatus::Pending, date(2024, 3, 9), today));
        assert!(is_overdue(PaymentStatus::Pending, date(2024, 3, 10), today));
        assert!(!is_overdue(PaymentStatus::Pending, date(2024, 3, 11), today));
    }

    #[test]
    fn never_touches_settled_or_already_late_payments() {
        let today = date(2024, 3, 10);
        let overdue = date(2024, 3, 1);
        assert!(!is_overdue(PaymentStatus::Late, overdue, today));
        assert!(!is_overdue(PaymentStatus::Paid, overdue, today));
        assert!(!is_overdue(PaymentStatus::Cancelled, overdue, today));
    }

    #[test]
    fn second_run_on_the_same_day_flips_nothing() {
        let today = date(2024, 3, 10);
        let mut book = vec![
            (PaymentStatus::Pending, date(2024, 3, 1)),
            (PaymentStatus::Pending, date(2024, 3, 10)),
            (PaymentStatus::Pending, date(2024, 4, 1)),
            (PaymentStatus::Paid, date(2024, 2, 1)),
        ];

        assert_eq!(sweep(&mut book, today), 2);
        let after_first = book.clone();
        assert_eq!(sweep(&mut book, today), 0);
        assert_eq!(book, after_first);
    }
}
