use chrono::{Duration, Utc};
use engine_client::entities::instance::InstanceKind;
use engine_client::entities::provider::{Provider, ResourceAccounting};
use engine_client::entities::reservation::{
  ReservationKind, ReservationStatus, ResourceDelta,
};
use engine_client::error::EngineError;
use sqlx::PgPool;
use uuid::Uuid;

const RESERVATION_HORIZON: Duration = Duration::hours(2);

/// Single arbiter for provider capacity (§5 shared-resource policy):
/// drivers must never read or write `providers.allocated_*` directly,
/// only through [`reserve`]/[`settle`]/[`release`].
pub struct ReservationLedger<'a> {
  pool: &'a PgPool,
}

impl<'a> ReservationLedger<'a> {
  pub fn new(pool: &'a PgPool) -> Self {
    Self { pool }
  }

  /// Reserves `delta` against `provider_id` inside one transaction that
  /// also row-locks the provider, so concurrent admissions cannot both
  /// observe capacity that only one of them will consume (§5, §8 #1).
  pub async fn reserve(
    &self,
    task_id: Uuid,
    provider: &Provider,
    kind: ReservationKind,
    instance_kind: InstanceKind,
    delta: ResourceDelta,
    user_limit_mb: Option<i64>,
    level_limit_mb: Option<i64>,
  ) -> Result<Uuid, EngineError> {
    if provider.is_effectively_frozen() {
      return Err(EngineError::PreconditionFailed(
        "provider is frozen or expired".into(),
      ));
    }

    let mut tx = self
      .pool
      .begin()
      .await
      .map_err(|e| EngineError::Internal(e.into()))?;

    let (held_cpu, held_mem, held_disk, held_instances): (
      i64,
      i64,
      i64,
      i64,
    ) = sqlx::query_as(
      "SELECT \
         COALESCE(SUM((delta->>'cpu_cores')::bigint), 0), \
         COALESCE(SUM((delta->>'memory_mb')::bigint), 0), \
         COALESCE(SUM((delta->>'disk_mb')::bigint), 0), \
         COALESCE(SUM((delta->>'instance_count')::bigint), 0) \
       FROM reservations \
       WHERE provider_id = $1 AND status IN ('held', 'settled') \
       FOR UPDATE",
    )
    .bind(provider.id)
    .fetch_one(&mut *tx)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

    let accounting = &provider.config.resource_accounting;
    check_capacity(
      accounting,
      instance_kind,
      held_cpu,
      delta.cpu_cores as i64,
      provider.config.node_cpu_cores as i64,
      "cpu",
    )?;
    check_capacity(
      accounting,
      instance_kind,
      held_mem,
      delta.memory_mb,
      provider.config.node_memory_mb,
      "memory",
    )?;
    check_capacity(
      accounting,
      instance_kind,
      held_disk,
      delta.disk_mb,
      provider.config.node_disk_mb,
      "disk",
    )?;

    if delta.instance_count > 0 {
      let cap = match instance_kind {
        InstanceKind::Container => provider.config.max_container_instances as i64,
        InstanceKind::Vm => provider.config.max_vm_instances as i64,
      };
      if cap > 0 && held_instances + delta.instance_count as i64 > cap {
        return Err(EngineError::ResourceExhausted(
          "instance count limit reached".into(),
        ));
      }
    }

    let effective_limit_mb =
      match (user_limit_mb, level_limit_mb) {
        (Some(u), Some(l)) => Some(u.min(l)),
        (Some(u), None) => Some(u),
        (None, Some(l)) => Some(l),
        (None, None) => None,
      };
    if let Some(limit) = effective_limit_mb {
      if held_mem + delta.memory_mb > limit {
        return Err(EngineError::ResourceExhausted(
          "user/level memory limit reached".into(),
        ));
      }
    }

    let id = Uuid::new_v4();
    let expires_at = Utc::now() + RESERVATION_HORIZON;
    sqlx::query(
      "INSERT INTO reservations (id, task_id, provider_id, kind, delta, status, expires_at) \
       VALUES ($1, $2, $3, $4, $5, 'held', $6)",
    )
    .bind(id)
    .bind(task_id)
    .bind(provider.id)
    .bind(kind.to_string())
    .bind(serde_json::to_value(&delta).map_err(|e| EngineError::Internal(e.into()))?)
    .bind(expires_at)
    .execute(&mut *tx)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

    tx.commit().await.map_err(|e| EngineError::Internal(e.into()))?;
    Ok(id)
  }

  /// held -> settled, once the real remote object exists.
  pub async fn settle(&self, task_id: Uuid) -> Result<(), EngineError> {
    self.transition(task_id, ReservationStatus::Settled).await
  }

  /// held -> released, on failure or cancellation.
  pub async fn release(&self, task_id: Uuid) -> Result<(), EngineError> {
    self.transition(task_id, ReservationStatus::Released).await
  }

  async fn transition(
    &self,
    task_id: Uuid,
    to: ReservationStatus,
  ) -> Result<(), EngineError> {
    sqlx::query(
      "UPDATE reservations SET status = $2 \
       WHERE task_id = $1 AND status = 'held'",
    )
    .bind(task_id)
    .bind(to.to_string())
    .execute(self.pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;
    Ok(())
  }

  /// Releases reservations whose task has no corresponding non-terminal
  /// row and which are past the safety horizon — the janitor's
  /// crash-recovery sweep (§4.C, §4.H).
  pub async fn release_stale(&self, pool: &PgPool) -> Result<u64, EngineError> {
    let result = sqlx::query(
      "UPDATE reservations r SET status = 'released' \
       WHERE r.status = 'held' AND r.expires_at < now() \
       AND NOT EXISTS ( \
         SELECT 1 FROM tasks t WHERE t.id = r.task_id \
         AND t.status NOT IN ('completed','failed','cancelled','timeout') \
       )",
    )
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;
    Ok(result.rows_affected())
  }
}

fn check_capacity(
  accounting: &ResourceAccounting,
  instance_kind: InstanceKind,
  held: i64,
  requested: i64,
  capacity: i64,
  resource: &str,
) -> Result<(), EngineError> {
  // Accounting toggles gate whether a resource counts toward the
  // node's budget at all for the instance kind actually being
  // reserved; a vm-only toggle shouldn't block a container reservation.
  let counted = match (resource, instance_kind) {
    ("cpu", InstanceKind::Container) => accounting.container_cpu,
    ("cpu", InstanceKind::Vm) => accounting.vm_cpu,
    ("memory", InstanceKind::Container) => accounting.container_memory,
    ("memory", InstanceKind::Vm) => accounting.vm_memory,
    ("disk", InstanceKind::Container) => accounting.container_disk,
    ("disk", InstanceKind::Vm) => accounting.vm_disk,
    _ => true,
  };
  if !counted {
    return Ok(());
  }
  if held + requested > capacity {
    return Err(EngineError::ResourceExhausted(format!(
      "{resource} exhausted: held={held} requested={requested} capacity={capacity}"
    )));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use engine_client::entities::provider::ResourceAccounting;

  #[test]
  fn effective_limit_is_minimum_of_user_and_level() {
    let user = Some(1000i64);
    let level = Some(500i64);
    let effective = match (user, level) {
      (Some(u), Some(l)) => Some(u.min(l)),
      (Some(u), None) => Some(u),
      (None, Some(l)) => Some(l),
      (None, None) => None,
    };
    assert_eq!(effective, Some(500));
  }

  #[test]
  fn check_capacity_rejects_oversubscription() {
    let accounting = ResourceAccounting::default();
    let err = check_capacity(&accounting, InstanceKind::Container, 3, 2, 4, "cpu");
    assert!(err.is_err());
  }

  #[test]
  fn check_capacity_allows_exact_fit() {
    let accounting = ResourceAccounting::default();
    assert!(
      check_capacity(&accounting, InstanceKind::Container, 2, 2, 4, "cpu").is_ok()
    );
  }

  #[test]
  fn check_capacity_ignores_other_kinds_toggle() {
    let mut accounting = ResourceAccounting::default();
    accounting.vm_cpu = false;
    accounting.container_cpu = true;
    // a vm-only toggle being off must not block a container reservation.
    assert!(
      check_capacity(&accounting, InstanceKind::Container, 2, 2, 4, "cpu").is_ok()
    );
  }
}
