mod instances;
mod logs;
mod traffic_reset;

pub use instances::{clean_expired_instances, clean_stale_failed_instances};
pub use logs::retain_logs;
pub use traffic_reset::roll_over_traffic;

use sqlx::PgPool;

use crate::ledger::ReservationLedger;

/// Runs every scheduled janitor sweep once (§4.H); the caller ticks
/// this on its own interval-aligned schedule.
pub async fn run_once(
  pool: &PgPool,
  log_dir: &str,
  log_retention_days: u32,
  log_retention_gzip: bool,
) -> anyhow::Result<()> {
  let expired = clean_expired_instances(pool).await?;
  let stale_failed = clean_stale_failed_instances(pool).await?;
  let released = ReservationLedger::new(pool).release_stale(pool).await?;
  let rolled_over = roll_over_traffic(pool).await?;
  retain_logs(log_dir, log_retention_days, log_retention_gzip).await?;

  tracing::info!(
    expired,
    stale_failed,
    released,
    rolled_over,
    "janitor sweep complete"
  );
  Ok(())
}
