use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use chrono_tz::Tz;
use tokio::time::sleep;

use crate::state::AppState;

/// Calendar date of the given instant in the business timezone. The
/// business day rolls over at local midnight, not UTC.
pub fn local_today(now: DateTime<Utc>, timezone: Tz) -> NaiveDate {
    now.with_timezone(&timezone).date_naive()
}

/// Spawn the background scheduler that runs the daily overdue sweep.
///
/// The sweep job runs in its own `tokio::spawn` so a failure never
/// crashes the scheduler loop.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    let pool = match state.db_pool.as_ref() {
        Some(p) => p.clone(),
        None => {
            tracing::warn!("Scheduler: no database pool configured, exiting");
            return;
        }
    };

    let timezone = state.config.sweep_timezone;
    let mut last_daily_run: Option<u32> = None;

    loop {
        sleep(Duration::from_secs(60)).await;

        let today = local_today(Utc::now(), timezone);
        let today_ordinal = today.ordinal();
        if last_daily_run == Some(today_ordinal) {
            continue;
        }
        last_daily_run = Some(today_ordinal);

        tracing::info!("Scheduler: running daily jobs for {today}");

        let pool = pool.clone();
        tokio::spawn(async move {
            match crate::services::payment_sweep::run_overdue_sweep(&pool, today).await {
                Ok(outcome) => {
                    if outcome.marked_late > 0 {
                        tracing::info!(
                            marked_late = outcome.marked_late,
                            "Scheduler: overdue sweep marked payments late"
                        );
                    }
                }
                Err(e) => {
                    tracing::warn!("Scheduler: overdue sweep failed: {e}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::local_today;

    #[test]
    fn business_day_rolls_over_at_local_midnight() {
        // 01:00 UTC is still the previous evening in Sao Paulo (UTC-3).
        let just_past_utc_midnight = Utc.with_ymd_and_hms(2024, 3, 10, 1, 0, 0).unwrap();
        assert_eq!(
            local_today(just_past_utc_midnight, chrono_tz::America::Sao_Paulo),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 9).unwrap()
        );

        let local_morning = Utc.with_ymd_and_hms(2024, 3, 10, 12, 0, 0).unwrap();
        assert_eq!(
            local_today(local_morning, chrono_tz::America::Sao_Paulo),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 10).unwrap()
        );
    }
}
