use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::task_payload::TaskPayload;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  Processing,
  Running,
  Completed,
  Failed,
  Cancelling,
  Cancelled,
  Timeout,
}

impl TaskStatus {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskStatus::Completed
        | TaskStatus::Failed
        | TaskStatus::Cancelled
        | TaskStatus::Timeout
    )
  }
}

/// Legal task status transitions (§4.D state machine); `cancelling` is
/// only reachable from `running`, force-stop goes straight to `cancelled`.
pub fn is_legal_task_transition(
  from: TaskStatus,
  to: TaskStatus,
) -> bool {
  use TaskStatus::*;
  if from.is_terminal() {
    return false;
  }
  matches!(
    (from, to),
    (Pending, Processing)
      | (Pending, Cancelled)
      | (Processing, Running)
      | (Processing, Failed)
      | (Processing, Cancelled)
      | (Running, Completed)
      | (Running, Failed)
      | (Running, Timeout)
      | (Running, Cancelling)
      | (Running, Cancelled)
      | (Cancelling, Cancelled)
      | (Cancelling, Completed)
      | (Cancelling, Failed)
  )
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourcePreallocation {
  pub cpu_cores: i32,
  pub memory_mb: i64,
  pub disk_mb: i64,
  pub bandwidth_mbps: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
  pub id: Uuid,
  pub payload: TaskPayload,
  pub status: TaskStatus,
  pub progress: u8,
  pub status_message: Option<String>,
  pub error_message: Option<String>,
  pub cancel_reason: Option<String>,

  pub owner_user_id: Uuid,
  pub provider_id: Option<Uuid>,
  pub instance_id: Option<Uuid>,

  pub created_at: chrono::DateTime<chrono::Utc>,
  pub started_at: Option<chrono::DateTime<chrono::Utc>>,
  pub completed_at: Option<chrono::DateTime<chrono::Utc>>,

  pub timeout_duration_secs: i64,
  pub preallocated: ResourcePreallocation,
  pub force_stoppable: bool,
}

pub const DEFAULT_TASK_TIMEOUT_SECS: i64 = 30 * 60;
pub const PORT_OP_TASK_TIMEOUT_SECS: i64 = 10 * 60;

impl Task {
  pub fn default_timeout_for(payload: &TaskPayload) -> i64 {
    match payload {
      TaskPayload::CreatePortMapping(_)
      | TaskPayload::DeletePortMapping(_) => PORT_OP_TASK_TIMEOUT_SECS,
      _ => DEFAULT_TASK_TIMEOUT_SECS,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn terminal_statuses_have_no_outbound_transition() {
    for terminal in [
      TaskStatus::Completed,
      TaskStatus::Failed,
      TaskStatus::Cancelled,
      TaskStatus::Timeout,
    ] {
      assert!(!is_legal_task_transition(terminal, TaskStatus::Running));
    }
  }

  #[test]
  fn running_can_reach_any_terminal_status() {
    for to in [
      TaskStatus::Completed,
      TaskStatus::Failed,
      TaskStatus::Timeout,
      TaskStatus::Cancelled,
    ] {
      assert!(is_legal_task_transition(TaskStatus::Running, to));
    }
  }

  #[test]
  fn cancelling_only_reachable_from_running() {
    assert!(is_legal_task_transition(
      TaskStatus::Running,
      TaskStatus::Cancelling
    ));
    assert!(!is_legal_task_transition(
      TaskStatus::Pending,
      TaskStatus::Cancelling
    ));
  }
}
