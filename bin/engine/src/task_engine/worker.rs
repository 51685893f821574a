use std::sync::Arc;
use std::time::Duration;

use engine_client::api::task_payload::{InstanceOp, TaskPayload};
use engine_client::entities::instance::InstanceKind;
use engine_client::entities::reservation::{ReservationKind, ResourceDelta};
use engine_client::entities::task::{is_legal_task_transition, Task, TaskStatus};
use engine_client::error::EngineError;
use node_transport::{Credentials, UsageClass};
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::ledger::ReservationLedger;
use crate::state::AppState;
use crate::task_engine::admit;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Spawns the background loop that dequeues pending tasks FIFO by
/// `created_at`, dispatches each into a per-provider worker pool slot,
/// and runs the watchdog that marks overdue tasks `timeout` (§4.D).
pub fn spawn_worker_pool(
  state: Arc<AppState>,
  pools: Arc<super::WorkerPools>,
) -> JoinHandle<()> {
  let dequeue_state = state.clone();
  let dequeue_pools = pools.clone();
  let dequeue_token = state.shutdown.clone();
  let watchdog_state = state.clone();
  let watchdog_token = state.shutdown.clone();

  tokio::spawn(async move {
    tokio::select! {
      _ = dequeue_loop(dequeue_state, dequeue_pools) => {}
      _ = dequeue_token.cancelled() => {}
    }
  });

  tokio::spawn(async move {
    tokio::select! {
      _ = watchdog_loop(watchdog_state) => {}
      _ = watchdog_token.cancelled() => {}
    }
  })
}

async fn dequeue_loop(state: Arc<AppState>, pools: Arc<super::WorkerPools>) {
  loop {
    if state.shutdown.is_cancelled() {
      return;
    }
    match dequeue_one(&state, &pools).await {
      Ok(true) => continue,
      Ok(false) => tokio::time::sleep(POLL_INTERVAL).await,
      Err(e) => {
        tracing::warn!("task dequeue failed: {e:#}");
        tokio::time::sleep(POLL_INTERVAL).await;
      }
    }
  }
}

async fn dequeue_one(
  state: &Arc<AppState>,
  pools: &Arc<super::WorkerPools>,
) -> anyhow::Result<bool> {
  let row = sqlx::query(
    "SELECT id FROM tasks WHERE status = 'pending' ORDER BY created_at ASC LIMIT 1",
  )
  .fetch_optional(&state.db)
  .await?;

  let Some(row) = row else { return Ok(false) };
  let task_id: Uuid = row.get(0);

  let transitioned = sqlx::query(
    "UPDATE tasks SET status = 'processing' WHERE id = $1 AND status = 'pending'",
  )
  .bind(task_id)
  .execute(&state.db)
  .await?;
  if transitioned.rows_affected() == 0 {
    return Ok(true);
  }

  let provider_row = sqlx::query(
    "SELECT provider_id FROM tasks WHERE id = $1",
  )
  .bind(task_id)
  .fetch_one(&state.db)
  .await?;
  let provider_id: Option<Uuid> = provider_row.get(0);

  let semaphore = match provider_id {
    Some(pid) => {
      let provider = load_provider(&state.db, pid).await?;
      pools.pool_for(&provider).await
    }
    None => pools.default_pool(),
  };

  let state = state.clone();
  tokio::spawn(async move {
    let _permit = match semaphore.acquire_owned().await {
      Ok(permit) => permit,
      Err(_) => return,
    };
    if let Err(e) = run_task(&state, task_id).await {
      tracing::error!("task {task_id} failed: {e:#}");
    }
  });

  Ok(true)
}

async fn run_task(state: &AppState, task_id: Uuid) -> anyhow::Result<()> {
  let task = load_task(&state.db, task_id).await?;

  let provider_id = task.payload.provider_id();
  let provider = load_provider(&state.db, provider_id).await?;
  let instance_id = task.payload.instance_id();

  let instance_kind = match (&task.payload, instance_id) {
    (TaskPayload::CreateInstance(_), _) => InstanceKind::Container,
    (_, Some(id)) => load_instance_kind(&state.db, id).await?,
    (_, None) => InstanceKind::Container,
  };
  let reservation_kind = match &task.payload {
    TaskPayload::CreatePortMapping(_) | TaskPayload::DeletePortMapping(_) => {
      ReservationKind::Port
    }
    _ => ReservationKind::Instance,
  };
  let delta = ResourceDelta {
    cpu_cores: task.preallocated.cpu_cores,
    memory_mb: task.preallocated.memory_mb,
    disk_mb: task.preallocated.disk_mb,
    bandwidth_mbps: task.preallocated.bandwidth_mbps,
    instance_count: matches!(&task.payload, TaskPayload::CreateInstance(_)) as i32,
  };

  let creds = Credentials {
    username: provider.config.credentials.shell_username.clone(),
    password: provider.config.credentials.shell_password.clone(),
    private_key_pem: provider.config.credentials.shell_private_key.clone(),
  };
  let (host, port) = split_endpoint(&provider.config.endpoint);

  if let Err(e) = admit(
    &state.db,
    &state.transport,
    &state.admission_rate_limiter,
    task_id,
    task.owner_user_id,
    &provider,
    &host,
    port,
    &creds,
    delta,
    reservation_kind,
    instance_kind,
  )
  .await
  {
    set_error_message(&state.db, task_id, &e.to_string()).await?;
    transition(&state.db, task_id, TaskStatus::Failed).await?;
    set_completed_at(&state.db, task_id).await?;
    return Ok(());
  }

  let cancel = state.begin_task(task_id).await;

  transition(&state.db, task_id, TaskStatus::Running).await?;
  set_started_at(&state.db, task_id).await?;

  let _instance_guard = if let Some(instance_id) = instance_id {
    Some(state.lock_instance(provider_id, instance_id).await)
  } else {
    None
  };

  let session = state
    .transport
    .get_or_connect(provider.id, UsageClass::Interactive, &host, port, &creds)
    .await?;

  let driver = crate::drivers::for_provider(&provider, session.clone());

  let result = tokio::select! {
    result = execute_payload(&state.db, &provider, session.as_ref(), driver.as_ref(), &task) => result,
    _ = cancel.cancelled() => Err(EngineError::Cancelled("task cancelled".into())),
  };

  state.end_task(task_id).await;

  let ledger = ReservationLedger::new(&state.db);

  match result {
    Ok(()) => {
      ledger.settle(task_id).await.ok();
      transition(&state.db, task_id, TaskStatus::Completed).await?;
    }
    Err(EngineError::Cancelled(reason)) => {
      ledger.release(task_id).await.ok();
      set_cancel_reason(&state.db, task_id, &reason).await?;
      transition(&state.db, task_id, TaskStatus::Cancelled).await?;
    }
    Err(e) => {
      ledger.release(task_id).await.ok();
      set_error_message(&state.db, task_id, &e.to_string()).await?;
      transition(&state.db, task_id, TaskStatus::Failed).await?;
    }
  }

  set_completed_at(&state.db, task_id).await?;
  Ok(())
}

async fn load_instance_kind(pool: &PgPool, instance_id: Uuid) -> anyhow::Result<InstanceKind> {
  let row = sqlx::query("SELECT kind FROM instances WHERE id = $1")
    .bind(instance_id)
    .fetch_one(pool)
    .await?;
  let kind: String = row.get(0);
  Ok(match kind.as_str() {
    "vm" => InstanceKind::Vm,
    _ => InstanceKind::Container,
  })
}

/// Force-stops a single in-flight task without touching the rest of
/// the worker pool. Only legal while the task is `running` — callers
/// should check `Task::force_stoppable` before invoking this.
pub async fn force_stop(state: &AppState, task_id: Uuid) -> anyhow::Result<bool> {
  if !state.force_stop(task_id).await {
    return Ok(false);
  }
  transition(&state.db, task_id, TaskStatus::Cancelling).await?;
  Ok(true)
}

async fn execute_payload(
  pool: &PgPool,
  provider: &engine_client::entities::provider::Provider,
  session: &node_transport::NodeSession,
  driver: &dyn crate::drivers::Driver,
  task: &Task,
) -> Result<(), EngineError> {
  match &task.payload {
    TaskPayload::InstanceOp(op) => {
      let name = op.instance_id.to_string();
      match op.op {
        InstanceOp::Start => driver.start_instance(&name).await,
        InstanceOp::Stop => driver.stop_instance(&name).await,
        InstanceOp::Restart => driver.restart_instance(&name).await,
        InstanceOp::Reset => driver.reset_instance(&name).await,
      }
    }
    TaskPayload::DeleteInstance(del) => {
      driver.delete_instance(&del.instance_id.to_string()).await?;
      crate::instance::finalize_delete(pool, del.instance_id).await
    }
    TaskPayload::ResetPassword(rp) => {
      let password = uuid::Uuid::new_v4().to_string();
      driver.set_password(&rp.instance_id.to_string(), &password).await
    }
    TaskPayload::CreateInstance(create) => {
      let name = crate::instance::generate_instance_name(task.id);
      let spec = crate::instance::spec_for_create(create, &task.preallocated, &name);
      let progress: &crate::drivers::ProgressFn = &|pct| {
        tracing::debug!(task_id = %task.id, pct, "create-instance progress");
      };
      let provisioned = driver.create_instance(&spec, progress).await?;
      let instance_id =
        crate::instance::persist_created_instance(pool, task, create, &spec, &provisioned)
          .await?;
      crate::ports::map_ssh_port(pool, session, provider, &spec.name, instance_id).await?;
      Ok(())
    }
    TaskPayload::CreatePortMapping(cpm) => {
      let container_ref = cpm.instance_id.to_string();
      crate::ports::create_manual_mapping(
        pool,
        session,
        provider,
        &container_ref,
        cpm.port_id,
        cpm.instance_id,
        cpm.host_port,
        cpm.guest_port,
        cpm.protocol,
      )
      .await
    }
    TaskPayload::DeletePortMapping(dpm) => {
      crate::ports::delete_manual_port(pool, dpm.port_id).await
    }
  }
}

/// Marks any non-terminal task past its `timeout_duration_secs`
/// deadline as `timeout` and releases its reservation (§4.D watchdog).
async fn watchdog_loop(state: Arc<AppState>) {
  loop {
    if state.shutdown.is_cancelled() {
      return;
    }
    if let Err(e) = sweep_timeouts(&state.db).await {
      tracing::warn!("watchdog sweep failed: {e:#}");
    }
    tokio::time::sleep(Duration::from_secs(15)).await;
  }
}

async fn sweep_timeouts(pool: &PgPool) -> anyhow::Result<()> {
  let rows = sqlx::query(
    "SELECT id FROM tasks \
     WHERE status NOT IN ('completed','failed','cancelled','timeout') \
     AND started_at IS NOT NULL \
     AND started_at + (timeout_duration_secs || ' seconds')::interval < now()",
  )
  .fetch_all(pool)
  .await?;

  for row in rows {
    let task_id: Uuid = row.get(0);
    let ledger = ReservationLedger::new(pool);
    ledger.release(task_id).await.ok();
    transition(pool, task_id, TaskStatus::Timeout).await.ok();
  }
  Ok(())
}

async fn transition(
  pool: &PgPool,
  task_id: Uuid,
  to: TaskStatus,
) -> anyhow::Result<()> {
  let row = sqlx::query("SELECT status FROM tasks WHERE id = $1")
    .bind(task_id)
    .fetch_one(pool)
    .await?;
  let current: String = row.get(0);
  let from = parse_status(&current);
  if !is_legal_task_transition(from, to) {
    anyhow::bail!("illegal task transition {from:?} -> {to:?}");
  }
  sqlx::query("UPDATE tasks SET status = $2 WHERE id = $1")
    .bind(task_id)
    .bind(to.to_string())
    .execute(pool)
    .await?;
  Ok(())
}

fn parse_status(s: &str) -> TaskStatus {
  match s {
    "pending" => TaskStatus::Pending,
    "processing" => TaskStatus::Processing,
    "running" => TaskStatus::Running,
    "completed" => TaskStatus::Completed,
    "failed" => TaskStatus::Failed,
    "cancelling" => TaskStatus::Cancelling,
    "cancelled" => TaskStatus::Cancelled,
    _ => TaskStatus::Timeout,
  }
}

async fn load_task(pool: &PgPool, task_id: Uuid) -> anyhow::Result<Task> {
  let row = sqlx::query(
    "SELECT id, payload, status, progress, status_message, error_message, \
            cancel_reason, owner_user_id, provider_id, instance_id, \
            created_at, started_at, completed_at, timeout_duration_secs, \
            preallocated, force_stoppable \
     FROM tasks WHERE id = $1",
  )
  .bind(task_id)
  .fetch_one(pool)
  .await?;

  Ok(Task {
    id: row.get(0),
    payload: serde_json::from_value(row.get(1))?,
    status: parse_status(row.get::<String, _>(2).as_str()),
    progress: row.get::<i16, _>(3) as u8,
    status_message: row.get(4),
    error_message: row.get(5),
    cancel_reason: row.get(6),
    owner_user_id: row.get(7),
    provider_id: row.get(8),
    instance_id: row.get(9),
    created_at: row.get(10),
    started_at: row.get(11),
    completed_at: row.get(12),
    timeout_duration_secs: row.get(13),
    preallocated: serde_json::from_value(row.get(14))?,
    force_stoppable: row.get(15),
  })
}

async fn load_provider(
  pool: &PgPool,
  provider_id: Uuid,
) -> anyhow::Result<engine_client::entities::provider::Provider> {
  let row = sqlx::query(
    "SELECT id, name, config, info FROM providers WHERE id = $1",
  )
  .bind(provider_id)
  .fetch_one(pool)
  .await?;
  Ok(engine_client::entities::provider::Provider {
    id: row.get(0),
    name: row.get(1),
    config: serde_json::from_value(row.get(2))?,
    info: serde_json::from_value(row.get(3))?,
  })
}

fn split_endpoint(endpoint: &str) -> (String, u16) {
  match endpoint.rsplit_once(':') {
    Some((host, port)) => {
      (host.to_string(), port.parse().unwrap_or(22))
    }
    None => (endpoint.to_string(), 22),
  }
}

async fn set_started_at(pool: &PgPool, task_id: Uuid) -> anyhow::Result<()> {
  sqlx::query("UPDATE tasks SET started_at = now() WHERE id = $1")
    .bind(task_id)
    .execute(pool)
    .await?;
  Ok(())
}

async fn set_completed_at(pool: &PgPool, task_id: Uuid) -> anyhow::Result<()> {
  sqlx::query("UPDATE tasks SET completed_at = now() WHERE id = $1")
    .bind(task_id)
    .execute(pool)
    .await?;
  Ok(())
}

async fn set_error_message(
  pool: &PgPool,
  task_id: Uuid,
  message: &str,
) -> anyhow::Result<()> {
  sqlx::query("UPDATE tasks SET error_message = $2 WHERE id = $1")
    .bind(task_id)
    .bind(message)
    .execute(pool)
    .await?;
  Ok(())
}

async fn set_cancel_reason(
  pool: &PgPool,
  task_id: Uuid,
  reason: &str,
) -> anyhow::Result<()> {
  sqlx::query("UPDATE tasks SET cancel_reason = $2 WHERE id = $1")
    .bind(task_id)
    .bind(reason)
    .execute(pool)
    .await?;
  Ok(())
}
