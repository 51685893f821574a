use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use engine_client::entities::provider::ExecutionPolicy;
use engine_client::error::EngineError;
use node_transport::NodeSession;

use super::{Backend, CreateSpec, Driver, NativeApiClient, ProgressFn, ProvisionedInstance, dispatch};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(120);
const READINESS_TIMEOUT: Duration = Duration::from_secs(60);
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct ShellDriver {
  pub backend: Box<dyn Backend>,
  pub session: Arc<NodeSession>,
  pub api: Option<NativeApiClient>,
}

impl ShellDriver {
  async fn run(&self, cmd: &str) -> Result<(), EngineError> {
    let out = self
      .session
      .execute(cmd, Some(COMMAND_TIMEOUT))
      .await
      .map_err(EngineError::TransportShell)?;
    if !out.success() {
      return Err(EngineError::TransportShell(anyhow::anyhow!(
        "command failed (status {}): {}",
        out.status,
        out.stdout_combined
      )));
    }
    Ok(())
  }

  async fn wait_ready(&self, name: &str) -> Result<(), EngineError> {
    let probe = self.backend.readiness_probe_cmd(name);
    let deadline = tokio::time::Instant::now() + READINESS_TIMEOUT;
    loop {
      let out = self
        .session
        .execute(&probe, Some(Duration::from_secs(10)))
        .await
        .map_err(EngineError::TransportShell)?;
      if out.success() {
        return Ok(());
      }
      if tokio::time::Instant::now() >= deadline {
        return Err(EngineError::Timeout(READINESS_TIMEOUT.as_secs()));
      }
      tokio::time::sleep(READINESS_POLL_INTERVAL).await;
    }
  }

  async fn shell_healthy(&self) -> bool {
    self.session.healthy().await
  }

  /// Shared start/stop/restart path: `PUT .../state` over the api when
  /// the backend describes one, else the backend's shell command.
  async fn dispatch_state_change(
    &self,
    name: &str,
    action: &str,
    shell_cmd: String,
  ) -> Result<(), EngineError> {
    let shell_only = self.backend.shell_only();
    let has_api = self.api.is_some() && self.backend.api_state_request(name, action).is_some();
    let shell_fut = self.run(&shell_cmd);
    let api_fut = async {
      match (&self.api, self.backend.api_state_request(name, action)) {
        (Some(api), Some((path, body))) => api.put(&path, &body).await.map(|_| ()),
        _ => Err(EngineError::PreconditionFailed(
          "no api client configured".into(),
        )),
      }
    };
    dispatch(
      ExecutionPolicy::Auto,
      has_api,
      shell_only,
      api_fut,
      shell_fut,
      self.shell_healthy(),
    )
    .await
  }
}

#[async_trait]
impl Driver for ShellDriver {
  async fn create_instance(
    &self,
    spec: &CreateSpec,
    progress: &ProgressFn<'_>,
  ) -> Result<ProvisionedInstance, EngineError> {
    // Step 1-2: resolve image (assumed pre-pulled or pulled on demand
    // by the backend's own create command) and materialize the guest.
    progress(10);

    let shell_only = self.backend.shell_only();
    let has_api = self.api.is_some() && self.backend.api_create_request(spec).is_some();
    let create_cmd = self.backend.create_cmd(spec);
    let shell_fut = self.run(&create_cmd);
    let api_fut = async {
      match (&self.api, self.backend.api_create_request(spec)) {
        (Some(api), Some((path, body))) => {
          api.post(&path, &body).await.map(|_| ())
        }
        _ => Err(EngineError::PreconditionFailed(
          "no api client configured".into(),
        )),
      }
    };
    dispatch(
      ExecutionPolicy::Auto,
      has_api,
      shell_only,
      api_fut,
      shell_fut,
      self.shell_healthy(),
    )
    .await?;
    progress(30);

    // Step 5: wait for readiness.
    self.wait_ready(&spec.name).await?;
    progress(60);

    // Step 6: set credentials via a generated password.
    let password = generate_password();
    self.run(&self.backend.set_password_cmd(&spec.name, &password)).await?;
    progress(80);

    Ok(ProvisionedInstance {
      network: Default::default(),
      credentials_password: password,
    })
  }

  async fn start_instance(&self, name: &str) -> Result<(), EngineError> {
    self.dispatch_state_change(name, "start", self.backend.start_cmd(name)).await
  }

  async fn stop_instance(&self, name: &str) -> Result<(), EngineError> {
    self.dispatch_state_change(name, "stop", self.backend.stop_cmd(name)).await
  }

  async fn restart_instance(&self, name: &str) -> Result<(), EngineError> {
    self.dispatch_state_change(name, "restart", self.backend.restart_cmd(name)).await
  }

  async fn reset_instance(&self, name: &str) -> Result<(), EngineError> {
    self.stop_instance(name).await?;
    self.start_instance(name).await
  }

  async fn delete_instance(&self, name: &str) -> Result<(), EngineError> {
    // The backend's delete command itself tolerates a missing remote
    // object (`|| true`), matching §4.B's idempotent-delete contract.
    let shell_only = self.backend.shell_only();
    let has_api = self.api.is_some() && self.backend.api_delete_path(name).is_some();
    let delete_cmd = self.backend.delete_cmd(name);
    let shell_fut = self.run(&delete_cmd);
    let api_fut = async {
      match (&self.api, self.backend.api_delete_path(name)) {
        (Some(api), Some(path)) => api.delete(&path).await.map(|_| ()),
        _ => Err(EngineError::PreconditionFailed(
          "no api client configured".into(),
        )),
      }
    };
    dispatch(
      ExecutionPolicy::Auto,
      has_api,
      shell_only,
      api_fut,
      shell_fut,
      self.shell_healthy(),
    )
    .await
  }

  async fn set_password(
    &self,
    name: &str,
    password: &str,
  ) -> Result<(), EngineError> {
    // Neither Lxd/Incus's nor Proxmox's REST API exposes an in-guest
    // exec equivalent here, so this always runs over shell regardless
    // of what api client is configured.
    self.run(&self.backend.set_password_cmd(name, password)).await
  }

  async fn version(&self) -> Result<String, EngineError> {
    let shell_only = self.backend.shell_only();
    let has_api = self.api.is_some();

    let shell_cmd = self.backend.version_cmd();
    let shell_fut = async {
      let out = self
        .session
        .execute(&shell_cmd, Some(Duration::from_secs(15)))
        .await
        .map_err(EngineError::TransportShell)?;
      Ok(out.stdout_combined.trim().to_string())
    };

    let api_fut = async {
      match &self.api {
        Some(api) => api.version().await,
        None => Err(EngineError::PreconditionFailed(
          "no api client configured".into(),
        )),
      }
    };

    dispatch(
      ExecutionPolicy::Auto,
      has_api,
      shell_only,
      api_fut,
      shell_fut,
      self.shell_healthy(),
    )
    .await
  }
}

fn generate_password() -> String {
  use rand::Rng;
  const CHARSET: &[u8] =
    b"ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz23456789";
  let mut rng = rand::rng();
  (0..16)
    .map(|_| {
      let idx = rng.random_range(0..CHARSET.len());
      CHARSET[idx] as char
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn generated_password_has_expected_length() {
    let password = generate_password();
    assert_eq!(password.chars().count(), 16);
  }
}
