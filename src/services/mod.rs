pub mod audit;
pub mod availability;
pub mod payment_schedule;
pub mod payment_status;
pub mod payment_sweep;
pub mod scheduler;
