use std::collections::HashMap;

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A managed node exposing one backend kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
  pub id: Uuid,
  pub name: String,
  pub config: ProviderConfig,
  pub info: ProviderInfo,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderKind {
  Docker,
  Lxd,
  Incus,
  Proxmox,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ProviderStatus {
  #[default]
  Inactive,
  Partial,
  Active,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ExecutionPolicy {
  #[default]
  Auto,
  ApiOnly,
  ShellOnly,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortMappingMethod {
  #[default]
  Native,
  Iptables,
  DeviceProxy,
}

#[derive(
  Debug, Clone, Copy, Default, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrafficCountMode {
  In,
  Out,
  #[default]
  Both,
}

/// Shell and (optional) native-API credentials for a [`Provider`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderCredentials {
  pub shell_username: String,
  pub shell_password: Option<String>,
  pub shell_private_key: Option<String>,
  pub api_client_cert: Option<String>,
  pub api_client_key: Option<String>,
  pub api_token_id: Option<String>,
  pub api_token_secret: Option<String>,
}

impl ProviderCredentials {
  pub fn has_shell_auth(&self) -> bool {
    self.shell_password.is_some() || self.shell_private_key.is_some()
  }

  pub fn has_api_auth(&self) -> bool {
    (self.api_client_cert.is_some() && self.api_client_key.is_some())
      || (self.api_token_id.is_some() && self.api_token_secret.is_some())
  }
}

/// Per-kind toggle for whether a resource counts toward the node's
/// accounted budget. `true` by default for both kinds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResourceAccounting {
  pub container_cpu: bool,
  pub container_memory: bool,
  pub container_disk: bool,
  pub vm_cpu: bool,
  pub vm_memory: bool,
  pub vm_disk: bool,
}

impl Default for ResourceAccounting {
  fn default() -> Self {
    Self {
      container_cpu: true,
      container_memory: true,
      container_disk: true,
      vm_cpu: true,
      vm_memory: true,
      vm_disk: true,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficPolicy {
  pub enabled: bool,
  pub monthly_cap_mb: i64,
  pub count_mode: TrafficCountMode,
  pub multiplier: f64,
  pub next_reset: chrono::DateTime<chrono::Utc>,
}

impl Default for TrafficPolicy {
  fn default() -> Self {
    Self {
      enabled: false,
      monthly_cap_mb: 0,
      count_mode: TrafficCountMode::default(),
      multiplier: 1.0,
      next_reset: chrono::Utc::now(),
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestionPacing {
  pub collect_interval_secs: i64,
  pub collect_batch_size: i64,
  pub enforce_interval_secs: i64,
  pub enforce_batch_size: i64,
  pub reset_interval_secs: i64,
  pub reset_batch_size: i64,
}

impl Default for IngestionPacing {
  fn default() -> Self {
    Self {
      collect_interval_secs: default_traffic_collect_interval(),
      collect_batch_size: 100,
      enforce_interval_secs: 60,
      enforce_batch_size: 100,
      reset_interval_secs: 86_400,
      reset_batch_size: 100,
    }
  }
}

pub fn default_traffic_collect_interval() -> i64 {
  300
}

pub fn default_port_count() -> i32 {
  1
}

#[derive(Debug, Clone, Builder, Serialize, Deserialize)]
#[builder(setter(into), default)]
pub struct ProviderConfig {
  pub kind: ProviderKind,
  pub endpoint: String,
  pub public_ip: Option<String>,
  pub credentials: ProviderCredentials,

  #[serde(default = "default_node_capacity")]
  #[builder(default = "default_node_capacity()")]
  pub node_cpu_cores: i32,
  #[serde(default)]
  pub node_memory_mb: i64,
  #[serde(default)]
  pub node_disk_mb: i64,

  #[serde(default)]
  pub allocated_cpu_cores: i32,
  #[serde(default)]
  pub allocated_memory_mb: i64,
  #[serde(default)]
  pub allocated_disk_mb: i64,
  #[serde(default)]
  pub allocated_instances: i32,

  #[serde(default)]
  pub frozen: bool,
  pub expiry: Option<chrono::DateTime<chrono::Utc>>,

  #[serde(default)]
  pub execution_policy: ExecutionPolicy,

  #[serde(default)]
  pub allow_concurrent_tasks: bool,
  #[serde(default = "default_max_concurrent_tasks")]
  #[builder(default = "default_max_concurrent_tasks()")]
  pub max_concurrent_tasks: i32,

  pub port_range_start: i32,
  pub port_range_end: i32,
  #[serde(default)]
  pub next_available_port: i32,
  #[serde(default = "default_ipv4_port_mapping_method")]
  #[builder(default = "default_ipv4_port_mapping_method()")]
  pub ipv4_port_mapping_method: PortMappingMethod,

  #[serde(default)]
  pub resource_accounting: ResourceAccounting,

  #[serde(default)]
  pub max_container_instances: i32,
  #[serde(default)]
  pub max_vm_instances: i32,

  #[serde(default)]
  pub traffic: TrafficPolicy,
  #[serde(default)]
  pub ingestion_pacing: IngestionPacing,

  /// Per-user-level limit overrides, keyed by level name.
  #[serde(default)]
  pub level_limits: HashMap<String, i64>,

  /// IANA timezone name the monthly traffic rollover is anchored to
  /// (§4.F/§4.H "first of the next month in the provider's timezone").
  #[serde(default = "default_timezone")]
  #[builder(default = "default_timezone()")]
  pub timezone: String,
}

fn default_timezone() -> String {
  "UTC".to_string()
}

fn default_node_capacity() -> i32 {
  0
}

fn default_max_concurrent_tasks() -> i32 {
  1
}

fn default_ipv4_port_mapping_method() -> PortMappingMethod {
  PortMappingMethod::Native
}

impl Default for ProviderConfig {
  fn default() -> Self {
    Self {
      kind: ProviderKind::Docker,
      endpoint: String::new(),
      public_ip: None,
      credentials: ProviderCredentials::default(),
      node_cpu_cores: default_node_capacity(),
      node_memory_mb: 0,
      node_disk_mb: 0,
      allocated_cpu_cores: 0,
      allocated_memory_mb: 0,
      allocated_disk_mb: 0,
      allocated_instances: 0,
      frozen: false,
      expiry: None,
      execution_policy: ExecutionPolicy::default(),
      allow_concurrent_tasks: false,
      max_concurrent_tasks: default_max_concurrent_tasks(),
      port_range_start: 20000,
      port_range_end: 30000,
      next_available_port: 20000,
      ipv4_port_mapping_method: default_ipv4_port_mapping_method(),
      resource_accounting: ResourceAccounting::default(),
      max_container_instances: 0,
      max_vm_instances: 0,
      traffic: TrafficPolicy::default(),
      ingestion_pacing: IngestionPacing::default(),
      level_limits: HashMap::new(),
      timezone: default_timezone(),
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProviderInfo {
  pub host_name: Option<String>,
  pub version: Option<String>,
  pub storage_pool_path: Option<String>,
  pub last_probed: Option<chrono::DateTime<chrono::Utc>>,
}

impl Provider {
  /// A provider whose expiry has passed is treated as frozen for
  /// admission purposes, even if the `frozen` flag itself is unset.
  pub fn is_effectively_frozen(&self) -> bool {
    self.config.frozen
      || self
        .config
        .expiry
        .is_some_and(|expiry| expiry < chrono::Utc::now())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn expiry_in_past_is_frozen() {
    let mut provider = Provider {
      id: Uuid::new_v4(),
      name: "p1".into(),
      config: ProviderConfig::default(),
      info: ProviderInfo::default(),
    };
    provider.config.expiry =
      Some(chrono::Utc::now() - chrono::Duration::days(1));
    assert!(provider.is_effectively_frozen());
  }

  #[test]
  fn fresh_provider_not_frozen() {
    let provider = Provider {
      id: Uuid::new_v4(),
      name: "p1".into(),
      config: ProviderConfig::default(),
      info: ProviderInfo::default(),
    };
    assert!(!provider.is_effectively_frozen());
  }
}
