use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortProtocol {
  Tcp,
  Udp,
  Both,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortMappingRule {
  Native,
  Iptables,
  DeviceProxy,
  Firewall,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PortType {
  RangeMapped,
  Manual,
  Batch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
  pub id: Uuid,
  pub provider_id: Uuid,
  pub instance_id: Uuid,
  pub host_port: i32,
  pub guest_port: i32,
  pub protocol: PortProtocol,
  pub mapping_rule: PortMappingRule,
  pub is_ssh: bool,
  pub port_type: PortType,
  pub has_ipv6: bool,
  pub active: bool,
}

impl Port {
  /// Only `manual`/`batch` rows may be deleted independently of the
  /// instance's lifecycle; `range_mapped` rows are immutable until the
  /// owning instance is deleted.
  pub fn is_independently_deletable(&self) -> bool {
    matches!(self.port_type, PortType::Manual | PortType::Batch)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn port(port_type: PortType) -> Port {
    Port {
      id: Uuid::new_v4(),
      provider_id: Uuid::new_v4(),
      instance_id: Uuid::new_v4(),
      host_port: 22000,
      guest_port: 22,
      protocol: PortProtocol::Tcp,
      mapping_rule: PortMappingRule::Native,
      is_ssh: true,
      port_type,
      has_ipv6: false,
      active: true,
    }
  }

  #[test]
  fn range_mapped_is_not_independently_deletable() {
    assert!(!port(PortType::RangeMapped).is_independently_deletable());
  }

  #[test]
  fn manual_is_independently_deletable() {
    assert!(port(PortType::Manual).is_independently_deletable());
  }
}
