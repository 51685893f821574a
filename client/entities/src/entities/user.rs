use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Minimal user-level view the engine needs for quota joins (§4.C,
/// §4.F). Authentication and profile data belong to the (external)
/// auth collaborator; the engine only ever reads these fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
  pub id: Uuid,
  pub username: String,
  pub level: String,
  pub traffic_cap_mb_override: Option<i64>,
}
