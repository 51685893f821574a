use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};

/// Opens the pool and runs embedded migrations. Called once from
/// startup; the resulting `PgPool` is cloned into `AppState` (cheap,
/// it's an `Arc` internally) rather than re-opened per request.
pub async fn connect(database_uri: &str) -> anyhow::Result<PgPool> {
  let pool = PgPoolOptions::new()
    .max_connections(20)
    .acquire_timeout(Duration::from_secs(10))
    .connect(database_uri)
    .await
    .context("failed to connect to the database")?;

  sqlx::migrate!("./migrations")
    .run(&pool)
    .await
    .context("failed to run database migrations")?;

  Ok(pool)
}

/// Cheap liveness probe for `/healthz`-style checks and the janitor's
/// startup gate.
pub async fn ping(pool: &PgPool) -> anyhow::Result<()> {
  sqlx::query("SELECT 1")
    .execute(pool)
    .await
    .context("database ping failed")?;
  Ok(())
}
