use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceKind {
  Container,
  Vm,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceStatus {
  Pending,
  Creating,
  Running,
  Stopping,
  Stopped,
  Restarting,
  Resetting,
  Deleting,
  Deleted,
  Failed,
  Suspended,
}

impl InstanceStatus {
  pub fn is_terminal_for_lifecycle(&self) -> bool {
    matches!(self, InstanceStatus::Deleted)
  }
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TrafficLimitReason {
  Instance,
  User,
  Provider,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkAssignment {
  pub private_ipv4: Option<String>,
  pub private_ipv6: Option<String>,
  pub public_ipv4: Option<String>,
  pub public_ipv6: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InstanceCredentials {
  pub username: String,
  pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
  pub id: Uuid,
  pub provider_id: Uuid,
  pub name: String,
  pub kind: InstanceKind,
  pub image: String,

  pub cpu_cores: i32,
  pub memory_mb: i64,
  pub disk_mb: i64,
  pub bandwidth_mbps: i32,

  pub network: NetworkAssignment,
  pub ssh_port: Option<i32>,

  pub credentials: InstanceCredentials,
  pub owner_user_id: Uuid,

  pub status: InstanceStatus,

  pub traffic_cap_mb: i64,
  pub traffic_limited: bool,
  pub traffic_limit_reason: Option<TrafficLimitReason>,

  pub expiry: Option<chrono::DateTime<chrono::Utc>>,
  pub deleted: bool,

  pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Legal status transitions, per the Task Engine's state machine (§4.D
/// drives these; this table is consulted by drivers/workers rather than
/// duplicated ad hoc at each call site).
pub fn is_legal_transition(
  from: InstanceStatus,
  to: InstanceStatus,
) -> bool {
  use InstanceStatus::*;
  matches!(
    (from, to),
    (Pending, Creating)
      | (Pending, Failed)
      | (Creating, Running)
      | (Creating, Failed)
      | (Creating, Deleting)
      | (Running, Stopping)
      | (Running, Restarting)
      | (Running, Resetting)
      | (Running, Deleting)
      | (Running, Suspended)
      | (Stopping, Stopped)
      | (Stopping, Failed)
      | (Stopped, Running)
      | (Stopped, Deleting)
      | (Restarting, Running)
      | (Restarting, Failed)
      | (Resetting, Running)
      | (Resetting, Failed)
      | (Suspended, Running)
      | (Suspended, Deleting)
      | (Deleting, Deleted)
      | (Deleting, Failed)
      | (Failed, Deleting)
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn running_to_deleted_is_illegal_directly() {
    assert!(!is_legal_transition(
      InstanceStatus::Running,
      InstanceStatus::Deleted
    ));
  }

  #[test]
  fn creating_to_running_is_legal() {
    assert!(is_legal_transition(
      InstanceStatus::Creating,
      InstanceStatus::Running
    ));
  }

  #[test]
  fn deleted_has_no_outbound_transitions() {
    for to in [
      InstanceStatus::Pending,
      InstanceStatus::Running,
      InstanceStatus::Stopped,
    ] {
      assert!(!is_legal_transition(InstanceStatus::Deleted, to));
    }
  }
}
