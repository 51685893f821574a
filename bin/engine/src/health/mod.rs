use std::time::Duration;

use cache::TimeoutCache;
use chrono::Utc;
use engine_client::entities::provider::{
  Provider, ProviderInfo, ProviderKind, ProviderStatus,
};
use engine_client::error::EngineError;
use node_transport::{Credentials, NodeSession, SessionPool, UsageClass};
use sqlx::PgPool;
use uuid::Uuid;

/// Minimum gap between two probes of the same provider unless the
/// caller passes `force` (e.g. an admin-triggered refresh endpoint).
const DEBOUNCE_SECS: i64 = 30;

#[derive(Debug, Clone, Default)]
pub struct ProbeResult {
  pub ssh_reachable: bool,
  pub api_reachable: bool,
  pub status: ProviderStatus,
  pub info: ProviderInfo,
  pub capacity: Option<DiscoveredCapacity>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiscoveredCapacity {
  pub cpu_cores: i32,
  pub memory_mb: i64,
  pub disk_mb: i64,
}

/// Reuses the debounced-refresh idiom: a per-provider cached result
/// that a background loop and an admin force-refresh endpoint can both
/// call without racing each other into redundant probes (§4.G).
#[derive(Default)]
pub struct HealthProber {
  cache: TimeoutCache<Uuid, ProbeResult>,
}

impl HealthProber {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn probe(
    &self,
    pool: &PgPool,
    transport: &SessionPool,
    provider: &Provider,
    force: bool,
  ) -> anyhow::Result<ProbeResult> {
    let lock = self.cache.get_lock(provider.id).await;
    let mut entry = lock.lock().await;
    let now = Utc::now().timestamp();
    if !force && now - entry.last_ts < DEBOUNCE_SECS {
      return entry.clone_res();
    }

    let discover = force || provider.info.last_probed.is_none();
    let result = run_probe(transport, provider, discover).await;
    entry.set(&result, now);
    drop(entry);

    if let Ok(probe) = &result {
      persist(pool, provider.id, probe).await.ok();
    }
    result
  }
}

async fn run_probe(
  transport: &SessionPool,
  provider: &Provider,
  discover: bool,
) -> anyhow::Result<ProbeResult> {
  let creds = Credentials {
    username: provider.config.credentials.shell_username.clone(),
    password: provider.config.credentials.shell_password.clone(),
    private_key_pem: provider.config.credentials.shell_private_key.clone(),
  };
  let (host, port) = split_endpoint(&provider.config.endpoint);

  let session = transport
    .get_or_connect(provider.id, UsageClass::Probe, &host, port, &creds)
    .await;
  let ssh_reachable = session.is_ok();

  let (capacity, mut info) = match (&session, discover) {
    (Ok(session), true) => discover_capacity(session, provider.config.kind).await,
    _ => (
      None,
      ProviderInfo { last_probed: Some(Utc::now()), ..provider.info.clone() },
    ),
  };

  let api_reachable = if provider.config.credentials.has_api_auth() {
    match crate::drivers::NativeApiClient::build(provider) {
      Ok(client) => match client.version().await {
        Ok(version) => {
          info.version = Some(version);
          true
        }
        Err(_) => false,
      },
      Err(_) => false,
    }
  } else {
    false
  };

  let status = match (ssh_reachable, api_reachable_applies(provider), api_reachable) {
    (true, false, _) => ProviderStatus::Active,
    (true, true, true) => ProviderStatus::Active,
    (false, _, false) => ProviderStatus::Inactive,
    _ => ProviderStatus::Partial,
  };

  Ok(ProbeResult { ssh_reachable, api_reachable, status, info, capacity })
}

fn api_reachable_applies(provider: &Provider) -> bool {
  provider.config.credentials.has_api_auth()
}

/// (4) of §4.G: `nproc`, `/proc/meminfo`, and a best-effort storage
/// pool path resolution per backend kind. Capacity is stamped once; a
/// failed read leaves the previous value in place rather than zeroing it.
async fn discover_capacity(
  session: &NodeSession,
  kind: ProviderKind,
) -> (Option<DiscoveredCapacity>, ProviderInfo) {
  let cpu_cores = session
    .execute("nproc", Some(Duration::from_secs(10)))
    .await
    .ok()
    .and_then(|out| out.stdout_combined.trim().parse::<i32>().ok());

  let memory_mb = session
    .execute(
      "awk '/MemTotal/ {print int($2/1024)}' /proc/meminfo",
      Some(Duration::from_secs(10)),
    )
    .await
    .ok()
    .and_then(|out| out.stdout_combined.trim().parse::<i64>().ok());

  let host_name = session
    .execute("hostname", Some(Duration::from_secs(10)))
    .await
    .ok()
    .map(|out| out.stdout_combined.trim().to_string());

  let disk_mb = session
    .execute(
      "df -m / --output=avail | tail -1",
      Some(Duration::from_secs(10)),
    )
    .await
    .ok()
    .and_then(|out| out.stdout_combined.trim().parse::<i64>().ok());

  let capacity = match (cpu_cores, memory_mb, disk_mb) {
    (Some(cpu_cores), Some(memory_mb), Some(disk_mb)) => {
      Some(DiscoveredCapacity { cpu_cores, memory_mb, disk_mb })
    }
    _ => None,
  };

  let storage_pool_path = match storage_pool_path_cmd(kind) {
    Some(cmd) => session
      .execute(cmd, Some(Duration::from_secs(10)))
      .await
      .ok()
      .map(|out| out.stdout_combined.trim().to_string())
      .filter(|s| !s.is_empty()),
    None => None,
  };

  let info = ProviderInfo {
    host_name,
    // Filled in separately from the native API's version response,
    // when the provider carries API credentials (run_probe).
    version: None,
    storage_pool_path,
    last_probed: Some(Utc::now()),
  };

  (capacity, info)
}

/// Best-effort default storage pool/root path per backend kind. `None`
/// is left in place rather than guessed at for Proxmox, whose storage
/// is keyed by named pools with no single canonical default.
fn storage_pool_path_cmd(kind: ProviderKind) -> Option<&'static str> {
  match kind {
    ProviderKind::Docker => Some("docker info -f '{{.DockerRootDir}}'"),
    ProviderKind::Lxd => {
      Some("lxc storage get default source 2>/dev/null")
    }
    ProviderKind::Incus => {
      Some("incus storage get default source 2>/dev/null")
    }
    ProviderKind::Proxmox => None,
  }
}

async fn persist(
  pool: &PgPool,
  provider_id: Uuid,
  probe: &ProbeResult,
) -> Result<(), EngineError> {
  sqlx::query("UPDATE providers SET status = $2, info = $3 WHERE id = $1")
    .bind(provider_id)
    .bind(probe.status.to_string())
    .bind(serde_json::to_value(&probe.info).map_err(|e| EngineError::Internal(e.into()))?)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

  if let Some(capacity) = probe.capacity {
    sqlx::query(
      "UPDATE providers SET config = \
         jsonb_set( \
           jsonb_set( \
             jsonb_set(config, '{node_cpu_cores}', to_jsonb($2::int)), \
             '{node_memory_mb}', to_jsonb($3::bigint) \
           ), \
           '{node_disk_mb}', to_jsonb($4::bigint) \
         ) \
       WHERE id = $1",
    )
    .bind(provider_id)
    .bind(capacity.cpu_cores)
    .bind(capacity.memory_mb)
    .bind(capacity.disk_mb)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;
  }

  Ok(())
}

fn split_endpoint(endpoint: &str) -> (String, u16) {
  match endpoint.rsplit_once(':') {
    Some((host, port)) => (host.to_string(), port.parse().unwrap_or(22)),
    None => (endpoint.to_string(), 22),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn both_reachable_is_active() {
    let status = derive_status(true, true, true);
    assert_eq!(status, ProviderStatus::Active);
  }

  #[test]
  fn both_unreachable_is_inactive() {
    let status = derive_status(false, true, false);
    assert_eq!(status, ProviderStatus::Inactive);
  }

  #[test]
  fn ssh_only_with_no_api_credentials_is_active() {
    let status = derive_status(true, false, false);
    assert_eq!(status, ProviderStatus::Active);
  }

  #[test]
  fn partial_when_only_one_side_reachable() {
    let status = derive_status(true, true, false);
    assert_eq!(status, ProviderStatus::Partial);
  }

  fn derive_status(
    ssh_reachable: bool,
    api_credentialed: bool,
    api_reachable: bool,
  ) -> ProviderStatus {
    match (ssh_reachable, api_credentialed, api_reachable) {
      (true, false, _) => ProviderStatus::Active,
      (true, true, true) => ProviderStatus::Active,
      (false, _, false) => ProviderStatus::Inactive,
      _ => ProviderStatus::Partial,
    }
  }
}
