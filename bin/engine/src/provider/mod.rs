use engine_client::entities::provider::{Provider, ProviderConfig};
use engine_client::error::EngineError;
use node_transport::SessionPool;
use sqlx::{PgPool, Row};
use uuid::Uuid;
use validations::{StringValidator, StringValidatorMatches};

use crate::health::{HealthProber, ProbeResult};

/// Registers a new provider row (§6 `POST /admin/providers`, a
/// collaborator-facing endpoint this crate only backs with state).
/// `name` must be unique across providers — the DB constraint is the
/// source of truth, this just turns the violation into `Conflict`.
pub async fn register(
  pool: &PgPool,
  name: &str,
  config: ProviderConfig,
) -> Result<Uuid, EngineError> {
  StringValidator::default()
    .min_length(1)
    .max_length(100)
    .matches(StringValidatorMatches::ResourceName)
    .validate(name)
    .map_err(|e| EngineError::Validation(e.to_string()))?;

  let id = Uuid::new_v4();
  sqlx::query(
    "INSERT INTO providers (id, name, config, info, status) \
     VALUES ($1, $2, $3, '{}'::jsonb, 'inactive')",
  )
  .bind(id)
  .bind(name)
  .bind(serde_json::to_value(&config).map_err(|e| EngineError::Internal(e.into()))?)
  .execute(pool)
  .await
  .map_err(|e| {
    if let sqlx::Error::Database(db_err) = &e {
      if db_err.is_unique_violation() {
        return EngineError::Conflict(format!("provider name {name:?} already exists"));
      }
    }
    EngineError::Internal(e.into())
  })?;
  Ok(id)
}

/// Sets `config.frozen`; in-flight tasks keep running, admission of new
/// ones is rejected at [`super::task_engine::admission::admit`]'s
/// `is_effectively_frozen()` check (§4.D, §6 `POST /providers/freeze`).
pub async fn freeze(pool: &PgPool, provider_id: Uuid) -> Result<(), EngineError> {
  set_frozen(pool, provider_id, true).await
}

pub async fn unfreeze(pool: &PgPool, provider_id: Uuid) -> Result<(), EngineError> {
  set_frozen(pool, provider_id, false).await
}

async fn set_frozen(
  pool: &PgPool,
  provider_id: Uuid,
  frozen: bool,
) -> Result<(), EngineError> {
  let updated = sqlx::query(
    "UPDATE providers SET config = jsonb_set(config, '{frozen}', to_jsonb($2::bool)) WHERE id = $1",
  )
  .bind(provider_id)
  .bind(frozen)
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  if updated.rows_affected() == 0 {
    return Err(EngineError::not_found("provider", provider_id.to_string()));
  }
  Ok(())
}

/// Backs `POST /providers/:id/health-check` (§6): always forces a
/// probe, bypassing the prober's debounce window, since an admin
/// explicitly asked for a fresh read.
pub async fn trigger_health_check(
  pool: &PgPool,
  transport: &SessionPool,
  prober: &HealthProber,
  provider_id: Uuid,
) -> anyhow::Result<ProbeResult> {
  let provider = load(pool, provider_id).await?;
  prober.probe(pool, transport, &provider, true).await
}

async fn load(pool: &PgPool, provider_id: Uuid) -> anyhow::Result<Provider> {
  let row = sqlx::query("SELECT id, name, config, info FROM providers WHERE id = $1")
    .bind(provider_id)
    .fetch_one(pool)
    .await?;
  Ok(Provider {
    id: row.get(0),
    name: row.get(1),
    config: serde_json::from_value(row.get(2))?,
    info: serde_json::from_value(row.get(3))?,
  })
}
