use engine_client::entities::instance::InstanceKind;
use engine_client::entities::provider::Provider;
use engine_client::entities::reservation::{ReservationKind, ResourceDelta};
use engine_client::error::EngineError;
use node_transport::{Credentials, SessionPool, UsageClass};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::ledger::ReservationLedger;

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
  #[error(transparent)]
  Engine(#[from] EngineError),
}

/// Admission rules in order (§4.D): provider exists & not frozen/expired,
/// transport healthy, reservation accepted, rate limits OK, per-
/// (provider, instance) serialization lock acquirable (checked by the
/// caller via `AppState::lock_instance` once this returns).
#[allow(clippy::too_many_arguments)]
pub async fn admit(
  pool: &PgPool,
  transport: &SessionPool,
  rate_limiter: &std::sync::Arc<rate_limit::RateLimiter<Uuid>>,
  task_id: Uuid,
  owner_user_id: Uuid,
  provider: &Provider,
  host: &str,
  port: u16,
  creds: &Credentials,
  delta: ResourceDelta,
  kind: ReservationKind,
  instance_kind: InstanceKind,
) -> Result<Uuid, AdmissionError> {
  if provider.is_effectively_frozen() {
    return Err(EngineError::PreconditionFailed(
      "provider is frozen or expired".into(),
    )
    .into());
  }

  let session = transport
    .get_or_connect(provider.id, UsageClass::Interactive, host, port, creds)
    .await
    .map_err(EngineError::TransportShell)?;
  if !session.healthy().await {
    return Err(EngineError::TransportShell(anyhow::anyhow!(
      "node transport unhealthy"
    ))
    .into());
  }

  let level_limit_mb = level_limit_mb(pool, provider, owner_user_id).await?;

  let ledger = ReservationLedger::new(pool);
  let reservation_id = ledger
    .reserve(task_id, provider, kind, instance_kind, delta, None, level_limit_mb)
    .await?;

  rate_limiter
    .check(&provider.id)
    .await
    .map_err(|_| {
      EngineError::ResourceExhausted("admission rate limit exceeded".into())
    })?;

  Ok(reservation_id)
}

/// Resolves the task owner's user level and looks it up in the
/// provider's `level_limits`. There is no separate per-user memory
/// override on [`engine_client::entities::user::User`] today (only a
/// traffic-cap override, a different dimension), so `user_limit_mb`
/// stays unset in [`ReservationLedger::reserve`] until one exists.
async fn level_limit_mb(
  pool: &PgPool,
  provider: &Provider,
  owner_user_id: Uuid,
) -> Result<Option<i64>, EngineError> {
  let row = sqlx::query("SELECT level FROM users WHERE id = $1")
    .bind(owner_user_id)
    .fetch_optional(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;
  let Some(row) = row else { return Ok(None) };
  let level: String = row.get(0);
  Ok(provider.config.level_limits.get(&level).copied())
}
