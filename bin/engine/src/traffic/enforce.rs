use engine_client::api::task_payload::{InstanceOp, InstanceOpPayload, TaskPayload};
use engine_client::entities::task::Task;
use engine_client::error::EngineError;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Three-tier traffic enforcement (§4.F): instance, user, then
/// provider. Each newly-crossed threshold flags the instance and
/// synthesizes at most one pending/running `stop` task (testable
/// property #6); recovery (falling back below cap) clears the flag.
pub async fn enforce_limits(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<u32, EngineError> {
  let mut flagged = 0u32;
  flagged += enforce_instance_tier(pool, provider_id).await?;
  flagged += enforce_user_tier(pool, provider_id).await?;
  flagged += enforce_provider_tier(pool, provider_id).await?;
  clear_recovered_flags(pool, provider_id).await?;
  Ok(flagged)
}

async fn current_month_usage_by_instance(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<Vec<(Uuid, Uuid, i64)>, EngineError> {
  let rows = sqlx::query(
    "SELECT i.id, i.owner_user_id, COALESCE(SUM(t.total_bytes), 0) \
     FROM instances i \
     LEFT JOIN traffic_records t ON t.instance_id = i.id \
       AND t.year = EXTRACT(year FROM now())::int \
       AND t.month = EXTRACT(month FROM now())::int \
     WHERE i.provider_id = $1 AND NOT i.deleted \
     GROUP BY i.id, i.owner_user_id",
  )
  .bind(provider_id)
  .fetch_all(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  Ok(
    rows
      .into_iter()
      .map(|row| (row.get(0), row.get(1), row.get(2)))
      .collect(),
  )
}

async fn enforce_instance_tier(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<u32, EngineError> {
  let rows = sqlx::query(
    "SELECT id, owner_user_id FROM instances \
     WHERE provider_id = $1 AND NOT deleted AND traffic_cap_mb > 0 \
     AND EXISTS ( \
       SELECT 1 FROM traffic_records t WHERE t.instance_id = instances.id \
         AND t.year = EXTRACT(year FROM now())::int \
         AND t.month = EXTRACT(month FROM now())::int \
       GROUP BY t.instance_id \
       HAVING SUM(t.total_bytes) >= instances.traffic_cap_mb * 1024 * 1024 \
     )",
  )
  .bind(provider_id)
  .fetch_all(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  let mut flagged = 0u32;
  for row in rows {
    let instance_id: Uuid = row.get(0);
    let owner_user_id: Uuid = row.get(1);
    if flag_and_stop(pool, provider_id, instance_id, owner_user_id, "instance")
      .await?
    {
      flagged += 1;
    }
  }
  Ok(flagged)
}

async fn enforce_user_tier(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<u32, EngineError> {
  let usage = current_month_usage_by_instance(pool, provider_id).await?;

  let mut by_user: std::collections::HashMap<Uuid, i64> =
    std::collections::HashMap::new();
  for (_, owner, total) in &usage {
    *by_user.entry(*owner).or_default() += total;
  }

  let mut flagged = 0u32;
  for (owner_user_id, total) in by_user {
    let cap_row = sqlx::query(
      "SELECT traffic_cap_mb_override FROM users WHERE id = $1",
    )
    .bind(owner_user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;
    let Some(cap_mb) = cap_row.and_then(|r| r.get::<Option<i64>, _>(0)) else {
      continue;
    };
    if cap_mb <= 0 || total < cap_mb * 1024 * 1024 {
      continue;
    }
    for (instance_id, owner, _) in &usage {
      if *owner != owner_user_id {
        continue;
      }
      if flag_and_stop(pool, provider_id, *instance_id, *owner, "user").await? {
        flagged += 1;
      }
    }
  }
  Ok(flagged)
}

async fn enforce_provider_tier(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<u32, EngineError> {
  let row = sqlx::query(
    "SELECT (config->'traffic'->>'monthly_cap_mb')::bigint FROM providers WHERE id = $1",
  )
  .bind(provider_id)
  .fetch_optional(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;
  let Some(cap_mb) = row.and_then(|r| r.get::<Option<i64>, _>(0)) else {
    return Ok(0);
  };
  if cap_mb <= 0 {
    return Ok(0);
  }

  let usage = current_month_usage_by_instance(pool, provider_id).await?;
  let total: i64 = usage.iter().map(|(_, _, bytes)| bytes).sum();
  if total < cap_mb * 1024 * 1024 {
    return Ok(0);
  }

  let mut flagged = 0u32;
  for (instance_id, owner_user_id, _) in usage {
    if flag_and_stop(pool, provider_id, instance_id, owner_user_id, "provider")
      .await?
    {
      flagged += 1;
    }
  }
  Ok(flagged)
}

/// Marks the instance `traffic_limited=true` with `reason`, and
/// synthesizes a `stop` task unless one is already pending/running for
/// it. Returns whether this call is the one that flagged it.
async fn flag_and_stop(
  pool: &PgPool,
  provider_id: Uuid,
  instance_id: Uuid,
  owner_user_id: Uuid,
  reason: &str,
) -> Result<bool, EngineError> {
  let updated = sqlx::query(
    "UPDATE instances SET traffic_limited = true, traffic_limit_reason = $2 \
     WHERE id = $1 AND (traffic_limited = false OR traffic_limit_reason IS DISTINCT FROM $2)",
  )
  .bind(instance_id)
  .bind(reason)
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  let already_queued = sqlx::query(
    "SELECT 1 FROM tasks WHERE instance_id = $1 \
     AND status IN ('pending', 'processing', 'running') \
     AND payload->>'type' = 'instance-op' AND payload->>'op' = 'stop'",
  )
  .bind(instance_id)
  .fetch_optional(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?
  .is_some();

  if !already_queued {
    let payload = TaskPayload::InstanceOp(InstanceOpPayload {
      instance_id,
      provider_id,
      op: InstanceOp::Stop,
    });
    sqlx::query(
      "INSERT INTO tasks (id, payload, status, owner_user_id, provider_id, instance_id, timeout_duration_secs, preallocated) \
       VALUES ($1, $2, 'pending', $3, $4, $5, $6, $7)",
    )
    .bind(Uuid::new_v4())
    .bind(serde_json::to_value(&payload).map_err(|e| EngineError::Internal(e.into()))?)
    .bind(owner_user_id)
    .bind(provider_id)
    .bind(instance_id)
    .bind(Task::default_timeout_for(&payload))
    .bind(serde_json::to_value(
      engine_client::entities::task::ResourcePreallocation::default(),
    ).map_err(|e| EngineError::Internal(e.into()))?)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;
  }

  Ok(updated.rows_affected() > 0)
}

/// Clears `traffic_limited` for instances that have fallen back below
/// whichever tier actually flagged them (recovery, e.g. after monthly
/// reset). The baseline differs per `traffic_limit_reason`: an
/// `instance`-flagged row recovers against its own `traffic_cap_mb`, a
/// `user`-flagged one against its owner's `traffic_cap_mb_override`
/// summed across that owner's instances on this provider, and a
/// `provider`-flagged one against the provider's monthly cap summed
/// across all its instances. A flat `traffic_cap_mb > 0` filter would
/// wrongly strand instances with no per-instance cap that were only
/// ever flagged at the user or provider tier.
async fn clear_recovered_flags(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<(), EngineError> {
  sqlx::query(
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
  Ok(())
}
