use chrono::{Datelike, Days, Months, NaiveDate};

use crate::error::AppError;

/// One installment of a contract's payment schedule, before persistence.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct PaymentDraft {
    pub due_date: NaiveDate,
    pub amount: f64,
}

/// Generates the monthly installment schedule for a contract.
///
/// One installment per calendar month between the start and end months,
/// inclusive of both. Each installment is due on `billing_day`, clamped
/// to the last day of short months; the first installment never falls
/// before the contract start, and the last never after the contract end.
pub fn generate_monthly_schedule(
    starts_on: NaiveDate,
    ends_on: NaiveDate,
    monthly_rent: f64,
    billing_day: u8,
) -> Result<Vec<PaymentDraft>, AppError> {
    if ends_on <= starts_on {
        return Err(AppError::UnprocessableEntity(
            "End date must be after start date.".to_string(),
        ));
    }
    if !(1..=31).contains(&billing_day) {
        return Err(AppError::UnprocessableEntity(
            "Billing day must be between 1 and 31.".to_string(),
        ));
    }
    if monthly_rent <= 0.0 {
        return Err(AppError::UnprocessableEntity(
            "Monthly rent must be positive.".to_string(),
        ));
    }

    let installments = month_span(starts_on, ends_on) + 1;
    let mut schedule = Vec::with_capacity(installments as usize);

    for index in 0..installments {
        let month_anchor = first_of_month(starts_on) + Months::new(index);
        let mut due_date = day_in_month(month_anchor, billing_day);
        if due_date < starts_on {
            due_date = starts_on;
        }
        if due_date > ends_on {
            due_date = ends_on;
        }
        schedule.push(PaymentDraft {
            due_date,
            amount: monthly_rent,
        });
    }

    Ok(schedule)
}

/// Whole calendar months between the first-of-month of each date.
fn month_span(from: NaiveDate, to: NaiveDate) -> u32 {
    let months_from = from.year() * 12 + from.month0() as i32;
    let months_to = to.year() * 12 + to.month0() as i32;
    (months_to - months_from).max(0) as u32
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// The requested day in the month of `anchor`, pulled back to the last
/// day of the month when the month is shorter.
fn day_in_month(anchor: NaiveDate, day: u8) -> NaiveDate {
    anchor
        .with_day(u32::from(day))
        .unwrap_or_else(|| last_day_of_month(anchor))
}

fn last_day_of_month(anchor: NaiveDate) -> NaiveDate {
    let next_month = first_of_month(anchor) + Months::new(1);
    next_month - Days::new(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn mid_month_contract_with_day_31_billing() {
        let schedule =
            generate_monthly_schedule(date(2024, 1, 15), date(2024, 4, 15), 1500.0, 31).unwrap();
        let due_dates: Vec<NaiveDate> = schedule.iter().map(|p| p.due_date).collect();
        assert_eq!(
            due_dates,
            vec![
                date(2024, 1, 31),
                date(2024, 2, 29),
                date(2024, 3, 31),
                date(2024, 4, 15),
            ]
        );
        assert!(schedule.iter().all(|p| (p.amount - 1500.0).abs() < f64::EPSILON));
    }

    #[test]
    fn clamps_short_months_to_their_last_day() {
        let schedule =
            generate_monthly_schedule(date(2023, 1, 1), date(2023, 3, 31), 900.0, 30).unwrap();
        let due_dates: Vec<NaiveDate> = schedule.iter().map(|p| p.due_date).collect();
        assert_eq!(
            due_dates,
            vec![date(2023, 1, 30), date(2023, 2, 28), date(2023, 3, 30)]
        );
    }

    #[test]
    fn leap_february_keeps_day_29() {
        let schedule =
            generate_monthly_schedule(date(2024, 2, 1), date(2024, 3, 31), 900.0, 29).unwrap();
        assert_eq!(schedule[0].due_date, date(2024, 2, 29));
    }

    #[test]
    fn first_installment_never_precedes_start() {
        let schedule =
            generate_monthly_schedule(date(2024, 1, 15), date(2024, 3, 15), 1200.0, 1).unwrap();
        assert_eq!(schedule[0].due_date, date(2024, 1, 15));
        assert_eq!(schedule[1].due_date, date(2024, 2, 1));
    }

    #[test]
    fn one_installment_per_covered_month() {
        let schedule =
            generate_monthly_schedule(date(2024, 1, 1), date(2024, 12, 31), 1000.0, 5).unwrap();
        assert_eq!(schedule.len(), 12);
    }

    #[test]
    fn sub_month_contract_gets_single_installment() {
        let schedule =
            generate_monthly_schedule(date(2024, 3, 10), date(2024, 3, 25), 800.0, 5).unwrap();
        assert_eq!(schedule.len(), 1);
        // Billing day already passed; due date lands on the start.
        assert_eq!(schedule[0].due_date, date(2024, 3, 10));
    }

    #[test]
    fn rejects_invalid_inputs() {
        assert!(generate_monthly_schedule(date(2024, 5, 1), date(2024, 1, 1), 900.0, 5).is_err());
        assert!(generate_monthly_schedule(date(2024, 1, 1), date(2024, 5, 1), 900.0, 0).is_err());
        assert!(generate_monthly_schedule(date(2024, 1, 1), date(2024, 5, 1), 0.0, 5).is_err());
    }
}
