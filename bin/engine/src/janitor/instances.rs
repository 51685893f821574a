use engine_client::api::task_payload::{DeleteInstancePayload, TaskPayload};
use engine_client::entities::task::{ResourcePreallocation, Task};
use engine_client::error::EngineError;
use sqlx::{PgPool, Row};
use uuid::Uuid;

const STALE_FAILED_AFTER_HOURS: i64 = 24;

/// Synthesizes a `delete` task for every non-deleted instance whose
/// `expiry` has passed (§4.H), unless one is already pending/running.
pub async fn clean_expired_instances(pool: &PgPool) -> Result<u32, EngineError> {
  let rows = sqlx::query(
    "SELECT id, provider_id, owner_user_id FROM instances \
     WHERE NOT deleted AND expiry IS NOT NULL AND expiry < now()",
  )
  .fetch_all(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  let mut queued = 0u32;
  for row in rows {
    let instance_id: Uuid = row.get(0);
    let provider_id: Uuid = row.get(1);
    let owner_user_id: Uuid = row.get(2);
    if queue_delete(pool, provider_id, instance_id, owner_user_id, true).await? {
      queued += 1;
    }
  }
  Ok(queued)
}

/// Synthesizes a `delete` task for every instance stuck `failed` for
/// more than [`STALE_FAILED_AFTER_HOURS`] (§4.H): a create that never
/// recovered shouldn't hold its reservation forever.
pub async fn clean_stale_failed_instances(pool: &PgPool) -> Result<u32, EngineError> {
  let rows = sqlx::query(
    "SELECT id, provider_id, owner_user_id FROM instances \
     WHERE NOT deleted AND status = 'failed' \
     AND created_at < now() - ($1 || ' hours')::interval",
  )
  .bind(STALE_FAILED_AFTER_HOURS)
  .fetch_all(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  let mut queued = 0u32;
  for row in rows {
    let instance_id: Uuid = row.get(0);
    let provider_id: Uuid = row.get(1);
    let owner_user_id: Uuid = row.get(2);
    if queue_delete(pool, provider_id, instance_id, owner_user_id, true).await? {
      queued += 1;
    }
  }
  Ok(queued)
}

async fn queue_delete(
  pool: &PgPool,
  provider_id: Uuid,
  instance_id: Uuid,
  owner_user_id: Uuid,
  admin_operation: bool,
) -> Result<bool, EngineError> {
  let already_queued = sqlx::query(
    "SELECT 1 FROM tasks WHERE instance_id = $1 \
     AND status IN ('pending', 'processing', 'running') \
     AND payload->>'type' = 'delete-instance'",
  )
  .bind(instance_id)
  .fetch_optional(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?
  .is_some();

  if already_queued {
    return Ok(false);
  }

  let payload = TaskPayload::DeleteInstance(DeleteInstancePayload {
    instance_id,
    provider_id,
    admin_operation,
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
  .bind(
    serde_json::to_value(ResourcePreallocation::default())
      .map_err(|e| EngineError::Internal(e.into()))?,
  )
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  Ok(true)
}

#[cfg(test)]
mod tests {
  #[test]
  fn stale_failed_window_is_a_full_day() {
    assert_eq!(super::STALE_FAILED_AFTER_HOURS, 24);
  }
}
