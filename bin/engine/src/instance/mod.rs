use std::time::Duration;

use engine_client::api::task_payload::CreateInstancePayload;
use engine_client::entities::instance::{InstanceCredentials, InstanceKind};
use engine_client::entities::task::{ResourcePreallocation, Task};
use engine_client::error::EngineError;
use sqlx::PgPool;
use uuid::Uuid;

use crate::drivers::{CreateSpec, ProvisionedInstance};

const TRAFFIC_PURGE_BATCH: i64 = 100;
const TRAFFIC_PURGE_GAP: Duration = Duration::from_millis(100);

/// Builds the driver-facing create request from the task's already-
/// reserved `ResourcePreallocation` rather than re-resolving the
/// payload's catalog ids (`cpu_id`/`memory_id`/...); those are owned by
/// the (external) catalog collaborator and are opaque to this engine.
/// Instance kind is not yet carried on the payload, so new instances
/// default to `container` until a future payload revision adds it.
pub fn spec_for_create(
  payload: &CreateInstancePayload,
  preallocated: &ResourcePreallocation,
  name: &str,
) -> CreateSpec {
  CreateSpec {
    name: name.to_string(),
    kind: InstanceKind::Container,
    image: payload.image_id.clone(),
    cpu_cores: preallocated.cpu_cores,
    memory_mb: preallocated.memory_mb,
    disk_mb: preallocated.disk_mb,
  }
}

pub fn generate_instance_name(task_id: Uuid) -> String {
  format!("inst-{}", task_id.simple())
}

/// Persists the row for a successfully provisioned instance (§4.D,
/// after (B) returns). Owner/traffic-cap are resolved by the (external)
/// collaborator that created the task; this only needs the identifiers
/// already carried on the task and payload.
#[allow(clippy::too_many_arguments)]
pub async fn persist_created_instance(
  pool: &PgPool,
  task: &Task,
  payload: &CreateInstancePayload,
  spec: &CreateSpec,
  provisioned: &ProvisionedInstance,
) -> Result<Uuid, EngineError> {
  let instance_id = Uuid::new_v4();
  let credentials = InstanceCredentials {
    username: "root".into(),
    password: Some(provisioned.credentials_password.clone()),
  };

  sqlx::query(
    "INSERT INTO instances \
       (id, provider_id, name, kind, image, cpu_cores, memory_mb, disk_mb, \
        bandwidth_mbps, network, credentials, owner_user_id, status) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, 'running')",
  )
  .bind(instance_id)
  .bind(payload.provider_id)
  .bind(&spec.name)
  .bind(spec.kind.to_string())
  .bind(&spec.image)
  .bind(spec.cpu_cores)
  .bind(spec.memory_mb)
  .bind(spec.disk_mb)
  .bind(task.preallocated.bandwidth_mbps)
  .bind(serde_json::to_value(&provisioned.network).map_err(|e| EngineError::Internal(e.into()))?)
  .bind(serde_json::to_value(&credentials).map_err(|e| EngineError::Internal(e.into()))?)
  .bind(task.owner_user_id)
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  Ok(instance_id)
}

/// Hard-clean on successful delete (§4.H): soft-delete the instance
/// row, deactivate its ports, and purge traffic records in small
/// batches with a gap between batches to avoid long table locks.
pub async fn finalize_delete(
  pool: &PgPool,
  instance_id: Uuid,
) -> Result<(), EngineError> {
  sqlx::query("UPDATE instances SET deleted = true, status = 'deleted' WHERE id = $1")
    .bind(instance_id)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

  sqlx::query("UPDATE ports SET active = false WHERE instance_id = $1")
    .bind(instance_id)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

  purge_traffic_records(pool, instance_id).await?;
  Ok(())
}

async fn purge_traffic_records(
  pool: &PgPool,
  instance_id: Uuid,
) -> Result<(), EngineError> {
  loop {
    let deleted = sqlx::query(
      "DELETE FROM traffic_records WHERE id IN ( \
         SELECT id FROM traffic_records WHERE instance_id = $1 LIMIT $2 \
       )",
    )
    .bind(instance_id)
    .bind(TRAFFIC_PURGE_BATCH)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

    if deleted.rows_affected() == 0 {
      return Ok(());
    }
    tokio::time::sleep(TRAFFIC_PURGE_GAP).await;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn instance_name_is_stable_per_task() {
    let task_id = Uuid::new_v4();
    assert_eq!(generate_instance_name(task_id), generate_instance_name(task_id));
  }
}
