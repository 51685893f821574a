use chrono::{Datelike, Utc};
use engine_client::entities::provider::{Provider, TrafficCountMode};
use engine_client::error::EngineError;
use node_transport::NodeSession;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::daemon::DaemonSource;

/// One collection round for a provider (§4.F): pull samples, resolve
/// `instance_name -> instance_id`, apply `traffic_count_mode` and
/// `traffic_multiplier`, and UPSERT the per-(instance, year, month)
/// accounting row. Returns the number of instances ingested.
pub async fn ingest_provider(
  pool: &PgPool,
  provider: &Provider,
  session: &NodeSession,
  source: &dyn DaemonSource,
) -> Result<u32, EngineError> {
  let samples = source.read_samples(session).await?;
  let now = Utc::now();
  let (year, month) = (now.year(), now.month() as i32);
  let policy = &provider.config.traffic;

  let mut ingested = 0u32;
  for sample in samples {
    let instance_id: Option<Uuid> = sqlx::query(
      "SELECT id FROM instances WHERE provider_id = $1 AND name = $2 AND NOT deleted",
    )
    .bind(provider.id)
    .bind(&sample.instance_name)
    .fetch_optional(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?
    .map(|row| row.get(0));

    let Some(instance_id) = instance_id else { continue };

    let bytes_in = (sample.bytes_in as f64 * policy.multiplier).round() as i64;
    let bytes_out = (sample.bytes_out as f64 * policy.multiplier).round() as i64;
    let total = match policy.count_mode {
      TrafficCountMode::In => bytes_in,
      TrafficCountMode::Out => bytes_out,
      TrafficCountMode::Both => bytes_in + bytes_out,
    };

    sqlx::query(
      "INSERT INTO traffic_records \
         (id, provider_id, instance_id, year, month, bytes_in, bytes_out, total_bytes, last_sync) \
       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now()) \
       ON CONFLICT (instance_id, year, month) DO UPDATE SET \
         bytes_in = traffic_records.bytes_in + EXCLUDED.bytes_in, \
         bytes_out = traffic_records.bytes_out + EXCLUDED.bytes_out, \
         total_bytes = traffic_records.total_bytes + EXCLUDED.total_bytes, \
         last_sync = now()",
    )
    .bind(Uuid::new_v4())
    .bind(provider.id)
    .bind(instance_id)
    .bind(year)
    .bind(month)
    .bind(bytes_in)
    .bind(bytes_out)
    .bind(total)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

    ingested += 1;
  }

  Ok(ingested)
}
