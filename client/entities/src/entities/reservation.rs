use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReservationKind {
  Instance,
  Port,
}

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReservationStatus {
  Held,
  Settled,
  Released,
}

/// A resource delta requested at admission time and reserved against
/// a provider's remaining capacity until the owning task terminates.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceDelta {
  pub cpu_cores: i32,
  pub memory_mb: i64,
  pub disk_mb: i64,
  pub bandwidth_mbps: i32,
  pub instance_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
  pub id: Uuid,
  pub task_id: Uuid,
  pub provider_id: Uuid,
  pub kind: ReservationKind,
  pub delta: ResourceDelta,
  pub status: ReservationStatus,
  pub expires_at: chrono::DateTime<chrono::Utc>,
}
