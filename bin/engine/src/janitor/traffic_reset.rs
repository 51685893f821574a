use chrono::{Datelike, Utc};
use chrono_tz::Tz;
use engine_client::error::EngineError;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Traffic accounting is additive and keyed by `(instance, year, month)`
/// in UTC, so a new month's usage already starts at 0 without any row
/// to touch; the janitor's job is clearing `traffic_limited` flags once
/// the provider has locally crossed into the next month (§4.F, §4.H
/// "first of the next month in the provider's timezone"). Runs once
/// per provider, gated on that provider's own `timezone`, unlike
/// [`crate::traffic::enforce_limits`]'s per-ingest `clear_recovered_flags`.
pub async fn roll_over_traffic(pool: &PgPool) -> Result<u32, EngineError> {
  let rows = sqlx::query("SELECT id, config->>'timezone' FROM providers")
    .fetch_all(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

  let mut rolled_over = 0u32;
  for row in rows {
    let provider_id: Uuid = row.get(0);
    let tz_name: Option<String> = row.get(1);
    let tz: Tz = tz_name
      .as_deref()
      .and_then(|name| name.parse().ok())
      .unwrap_or(Tz::UTC);

    if Utc::now().with_timezone(&tz).day() != 1 {
      continue;
    }
    rolled_over += clear_recovered_for_provider(pool, provider_id).await?;
  }
  Ok(rolled_over)
}

/// Same reason-aware recovery baseline as
/// [`crate::traffic::enforce::enforce_limits`]'s per-ingest sweep: an
/// `instance`-flagged row is checked against its own cap, `user`/
/// `provider`-flagged rows against their tier's cap, so a 0-cap
/// instance flagged only at the user or provider tier still recovers.
async fn clear_recovered_for_provider(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<u32, EngineError> {
  let result = sqlx::query(
    "UPDATE instances i SET traffic_limited = false, traffic_limit_reason = NULL \
     WHERE i.provider_id = $1 AND i.traffic_limited \
     AND ( \
       (i.traffic_limit_reason = 'instance' AND i.traffic_cap_mb > 0 \
        AND COALESCE(( \
          SELECT SUM(t.total_bytes) FROM traffic_records t WHERE t.instance_id = i.id \
            AND t.year = EXTRACT(year FROM now())::int \
            AND t.month = EXTRACT(month FROM now())::int \
        ), 0) < i.traffic_cap_mb * 1024 * 1024) \
       OR \
       (i.traffic_limit_reason = 'user' AND EXISTS ( \
         SELECT 1 FROM users u WHERE u.id = i.owner_user_id \
           AND u.traffic_cap_mb_override > 0 \
           AND COALESCE(( \
             SELECT SUM(t.total_bytes) FROM traffic_records t \
             JOIN instances i2 ON i2.id = t.instance_id \
             WHERE i2.owner_user_id = u.id AND i2.provider_id = i.provider_id AND NOT i2.deleted \
               AND t.year = EXTRACT(year FROM now())::int \
               AND t.month = EXTRACT(month FROM now())::int \
           ), 0) < u.traffic_cap_mb_override * 1024 * 1024 \
       )) \
       OR \
       (i.traffic_limit_reason = 'provider' AND EXISTS ( \
         SELECT 1 FROM providers p WHERE p.id = i.provider_id \
           AND (p.config->'traffic'->>'monthly_cap_mb')::bigint > 0 \
           AND COALESCE(( \
             SELECT SUM(t.total_bytes) FROM traffic_records t \
             JOIN instances i3 ON i3.id = t.instance_id \
             WHERE i3.provider_id = p.id AND NOT i3.deleted \
               AND t.year = EXTRACT(year FROM now())::int \
               AND t.month = EXTRACT(month FROM now())::int \
           ), 0) < (p.config->'traffic'->>'monthly_cap_mb')::bigint * 1024 * 1024 \
       )) \
     )",
  )
  .bind(provider_id)
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  Ok(result.rows_affected() as u32)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unparseable_timezone_falls_back_to_utc() {
    let tz: Tz = "not-a-real-zone".parse().unwrap_or(Tz::UTC);
    assert_eq!(tz, Tz::UTC);
  }
}
