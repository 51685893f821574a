use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use engine_client::entities::provider::{Provider, ProviderStatus};
use node_transport::{Credentials, UsageClass};
use sqlx::Row;
use tracing::Instrument;

#[macro_use]
extern crate tracing;

mod drivers;
mod health;
mod instance;
mod janitor;
mod ledger;
mod ports;
mod provider;
mod state;
mod task_engine;
mod traffic;

use state::AppState;

/// On-node path of the traffic accounting daemon's SQLite store; the
/// daemon's own schema is an integration contract this crate doesn't
/// own (§9), so only the path it lives at is hardcoded here.
const DAEMON_DB_PATH: &str = "/var/lib/engine-accounting/traffic.db";

async fn app(state: Arc<AppState>) -> anyhow::Result<()> {
  let startup_span = info_span!("EngineStartup");

  async {
    info!("engine version: v{}", env!("CARGO_PKG_VERSION"));
    info!(bind_address = %state.config.bind_address, "starting up");

    let pools = Arc::new(task_engine::WorkerPools::new(8));
    let prober = Arc::new(health::HealthProber::new());

    task_engine::spawn_worker_pool(state.clone(), pools.clone());
    spawn_traffic_ticker(state.clone(), prober.clone());
    spawn_janitor_ticker(state.clone());
  }
  .instrument(startup_span)
  .await;

  state.shutdown.cancelled().await;
  Ok(())
}

/// Drives ingestion, enforcement, and health probing for every active
/// provider on the configured interval (§4.F, §4.G).
fn spawn_traffic_ticker(
  state: Arc<AppState>,
  prober: Arc<health::HealthProber>,
) {
  let token = state.shutdown.child_token();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(
      state.config.traffic_collect_interval_secs.max(60) as u64,
    ));
    loop {
      tokio::select! {
        _ = interval.tick() => {}
        _ = token.cancelled() => return,
      }
      if let Err(e) = run_traffic_round(&state, &prober).await {
        tracing::warn!("traffic round failed: {e:#}");
      }
    }
  });
}

async fn run_traffic_round(
  state: &AppState,
  prober: &health::HealthProber,
) -> anyhow::Result<()> {
  let rows = sqlx::query("SELECT id, name, config, info FROM providers")
    .fetch_all(&state.db)
    .await?;

  for row in rows {
    let provider = Provider {
      id: row.get(0),
      name: row.get(1),
      config: serde_json::from_value(row.get(2))?,
      info: serde_json::from_value(row.get(3))?,
    };

    let probe = prober.probe(&state.db, &state.transport, &provider, false).await?;
    if probe.status != ProviderStatus::Active {
      continue;
    }
    if !provider.config.traffic.enabled {
      continue;
    }

    let creds = Credentials {
      username: provider.config.credentials.shell_username.clone(),
      password: provider.config.credentials.shell_password.clone(),
      private_key_pem: provider.config.credentials.shell_private_key.clone(),
    };
    let (host, port) = split_endpoint(&provider.config.endpoint);
    let session = state
      .transport
      .get_or_connect(provider.id, UsageClass::Probe, &host, port, &creds)
      .await?;

    let source = traffic::SqliteDaemonSource::new(DAEMON_DB_PATH);
    if let Err(e) = traffic::ingest_provider(&state.db, &provider, &session, &source).await {
      tracing::warn!(provider = %provider.name, "traffic ingest failed: {e:#}");
      continue;
    }
    if let Err(e) = traffic::enforce_limits(&state.db, provider.id).await {
      tracing::warn!(provider = %provider.name, "traffic enforcement failed: {e:#}");
    }
  }
  Ok(())
}

fn spawn_janitor_ticker(state: Arc<AppState>) {
  let token = state.shutdown.child_token();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(300));
    loop {
      tokio::select! {
        _ = interval.tick() => {}
        _ = token.cancelled() => return,
      }
      if let Err(e) = janitor::run_once(
        &state.db,
        &state.config.log_dir,
        state.config.log_retention_days,
        state.config.log_retention_gzip,
      )
      .await
      {
        tracing::warn!("janitor sweep failed: {e:#}");
      }
    }
  });
}

fn split_endpoint(endpoint: &str) -> (String, u16) {
  match endpoint.rsplit_once(':') {
    Some((host, port)) => (host.to_string(), port.parse().unwrap_or(22)),
    None => (endpoint.to_string(), 22),
  }
}

#[tokio::main]
async fn main() -> ExitCode {
  let config = match config::load() {
    Ok(config) => config,
    Err(e) => {
      eprintln!("bad config: {e:#}");
      return ExitCode::from(2u8);
    }
  };

  if let Err(e) = logger::init(&config.logging) {
    eprintln!("failed to init logger: {e:#}");
    return ExitCode::from(1u8);
  }

  let db = match db::connect(&config.database_uri).await {
    Ok(db) => db,
    Err(e) => {
      error!("database unreachable at startup: {e:#}");
      return ExitCode::from(3u8);
    }
  };

  let mut term_signal =
    match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
      Ok(signal) => signal,
      Err(e) => {
        eprintln!("failed to install signal handler: {e:#}");
        return ExitCode::from(1u8);
      }
    };

  let grace = Duration::from_secs(config.shutdown_grace_period_secs);
  let state = AppState::new(db, config);
  let app_handle = tokio::spawn(app(state.clone()));

  tokio::select! {
    res = app_handle => {
      if let Err(e) = res {
        error!("engine task panicked: {e:#}");
        return ExitCode::from(1u8);
      }
    }
    _ = term_signal.recv() => {
      info!("shutdown signal received, draining in-flight tasks");
      state.shutdown.cancel();
      tokio::time::sleep(grace).await;
    }
  }

  ExitCode::SUCCESS
}
