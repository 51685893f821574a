use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Accounting row, unique per `(instance_id, year, month)`. Provider-
/// and user-level totals are derived `SUM(...)`s over this table, never
/// a separately mutated scalar (§4.F / the "traffic aggregation"
/// redesign note).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficRecord {
  pub id: Uuid,
  pub provider_id: Uuid,
  pub instance_id: Uuid,
  pub year: i32,
  pub month: i32,
  pub bytes_in: i64,
  pub bytes_out: i64,
  pub total_bytes: i64,
  pub last_sync: chrono::DateTime<chrono::Utc>,
}

impl TrafficRecord {
  pub fn total_mb(&self) -> i64 {
    self.total_bytes / (1024 * 1024)
  }
}

/// A node-level view, aggregated on demand rather than stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeTrafficSnapshot {
  pub provider_id: Uuid,
  pub year: i32,
  pub month: i32,
  pub total_bytes: i64,
}
