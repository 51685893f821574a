use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::port::PortProtocol;

/// Typed task payloads, tagged on the wire as `{"type": ..., ...fields}`
/// matching the shapes in §6. One worker interprets whichever variant
/// it dequeues.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
#[serde(rename_all = "kebab-case")]
pub enum TaskPayload {
  CreateInstance(CreateInstancePayload),
  InstanceOp(InstanceOpPayload),
  DeleteInstance(DeleteInstancePayload),
  ResetPassword(ResetPasswordPayload),
  CreatePortMapping(CreatePortMappingPayload),
  DeletePortMapping(DeletePortMappingPayload),
}

#[derive(Debug, Clone, Copy, strum::Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum InstanceOp {
  Start,
  Stop,
  Restart,
  Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInstancePayload {
  pub provider_id: Uuid,
  pub image_id: String,
  pub cpu_id: String,
  pub memory_id: String,
  pub disk_id: String,
  pub bandwidth_id: String,
  pub session_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceOpPayload {
  pub instance_id: Uuid,
  pub provider_id: Uuid,
  pub op: InstanceOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteInstancePayload {
  pub instance_id: Uuid,
  pub provider_id: Uuid,
  pub admin_operation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetPasswordPayload {
  pub instance_id: Uuid,
  pub provider_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePortMappingPayload {
  pub port_id: Uuid,
  pub instance_id: Uuid,
  pub provider_id: Uuid,
  pub host_port: i32,
  pub guest_port: i32,
  pub protocol: PortProtocol,
  pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePortMappingPayload {
  pub port_id: Uuid,
  pub instance_id: Uuid,
  pub provider_id: Uuid,
}

impl TaskPayload {
  pub fn provider_id(&self) -> Uuid {
    match self {
      TaskPayload::CreateInstance(p) => p.provider_id,
      TaskPayload::InstanceOp(p) => p.provider_id,
      TaskPayload::DeleteInstance(p) => p.provider_id,
      TaskPayload::ResetPassword(p) => p.provider_id,
      TaskPayload::CreatePortMapping(p) => p.provider_id,
      TaskPayload::DeletePortMapping(p) => p.provider_id,
    }
  }

  pub fn instance_id(&self) -> Option<Uuid> {
    match self {
      TaskPayload::CreateInstance(_) => None,
      TaskPayload::InstanceOp(p) => Some(p.instance_id),
      TaskPayload::DeleteInstance(p) => Some(p.instance_id),
      TaskPayload::ResetPassword(p) => Some(p.instance_id),
      TaskPayload::CreatePortMapping(p) => Some(p.instance_id),
      TaskPayload::DeletePortMapping(p) => Some(p.instance_id),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn payload_roundtrips_through_json() {
    let payload = TaskPayload::InstanceOp(InstanceOpPayload {
      instance_id: Uuid::new_v4(),
      provider_id: Uuid::new_v4(),
      op: InstanceOp::Restart,
    });
    let json = serde_json::to_string(&payload).unwrap();
    assert!(json.contains("\"type\":\"instance-op\""));
    let back: TaskPayload = serde_json::from_str(&json).unwrap();
    assert_eq!(back.provider_id(), payload.provider_id());
  }
}
