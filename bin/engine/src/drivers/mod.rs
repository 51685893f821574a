mod backend;
mod dispatch;
mod native_api;
mod shell_driver;

pub use backend::{docker, incus, lxd, proxmox, Backend};
pub use dispatch::dispatch;
pub use native_api::NativeApiClient;
pub use shell_driver::ShellDriver;

use async_trait::async_trait;
use engine_client::entities::instance::{Instance, NetworkAssignment};
use engine_client::entities::provider::{Provider, ProviderKind};
use engine_client::error::EngineError;
use node_transport::NodeSession;
use std::sync::Arc;

/// Requested shape for a to-be-created instance; the typed subset of
/// `CreateInstancePayload` a driver actually needs once the task
/// worker has resolved image/cpu/memory/disk/bandwidth ids.
pub struct CreateSpec {
  pub name: String,
  pub kind: engine_client::entities::instance::InstanceKind,
  pub image: String,
  pub cpu_cores: i32,
  pub memory_mb: i64,
  pub disk_mb: i64,
}

pub struct ProvisionedInstance {
  pub network: NetworkAssignment,
  pub credentials_password: String,
}

/// Callback invoked at each numbered step of the create flow (§4.B).
pub type ProgressFn<'a> = dyn Fn(u8) + Send + Sync + 'a;

/// Common capability set every backend (docker, lxd, incus, proxmox)
/// implements. Concrete implementations own their shell session and
/// (optionally) a native API client handle.
#[async_trait]
pub trait Driver: Send + Sync {
  async fn create_instance(
    &self,
    spec: &CreateSpec,
    progress: &ProgressFn<'_>,
  ) -> Result<ProvisionedInstance, EngineError>;

  async fn start_instance(&self, name: &str) -> Result<(), EngineError>;
  async fn stop_instance(&self, name: &str) -> Result<(), EngineError>;
  async fn restart_instance(&self, name: &str) -> Result<(), EngineError>;
  async fn reset_instance(&self, name: &str) -> Result<(), EngineError>;

  /// Must tolerate the remote object already being gone (idempotent).
  async fn delete_instance(&self, name: &str) -> Result<(), EngineError>;

  async fn set_password(
    &self,
    name: &str,
    password: &str,
  ) -> Result<(), EngineError>;

  async fn version(&self) -> Result<String, EngineError>;
}

/// Maps `ProviderKind -> Driver` construction, the "hidden backend
/// polymorphism" registry from §9's design notes.
pub fn for_provider(
  provider: &Provider,
  session: Arc<NodeSession>,
) -> Box<dyn Driver> {
  let backend: Box<dyn Backend> = match provider.config.kind {
    ProviderKind::Docker => Box::new(docker::DockerBackend),
    ProviderKind::Lxd => Box::new(lxd::LxdBackend),
    ProviderKind::Incus => Box::new(incus::IncusBackend),
    ProviderKind::Proxmox => Box::new(proxmox::ProxmoxBackend),
  };
  let api = if provider.config.kind != ProviderKind::Docker
    && provider.config.credentials.has_api_auth()
  {
    NativeApiClient::build(provider).ok()
  } else {
    None
  };
  Box::new(ShellDriver { backend, session, api })
}

/// The handle a backend's CLI/API expects to address this instance by.
pub fn instance_container_ref(instance: &Instance) -> &str {
  &instance.name
}
