use serde::{Deserialize, Serialize};

/// The taxonomy every engine subsystem reports through. Transport
/// failures are split shell/api so callers can tell an SSH-layer
/// break from the remote daemon rejecting the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
  Validation,
  Unauthorized,
  Forbidden,
  NotFound,
  Conflict,
  ResourceExhausted,
  PreconditionFailed,
  TransportShell,
  TransportApi,
  DualTransportFailure,
  RemoteObjectMissing,
  Timeout,
  Cancelled,
  Internal,
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
  #[error("validation failed: {0}")]
  Validation(String),

  #[error("unauthorized")]
  Unauthorized,

  #[error("forbidden: {0}")]
  Forbidden(String),

  #[error("{resource} not found: {id}")]
  NotFound { resource: &'static str, id: String },

  #[error("conflict: {0}")]
  Conflict(String),

  #[error("resource exhausted: {0}")]
  ResourceExhausted(String),

  #[error("precondition failed: {0}")]
  PreconditionFailed(String),

  #[error("shell transport error: {0}")]
  TransportShell(#[source] anyhow::Error),

  #[error("remote api error: {0}")]
  TransportApi(#[source] anyhow::Error),

  /// Neither transport reached the remote (§9 dual-transport policy):
  /// the api attempt failed and the shell fallback was either unhealthy
  /// or failed too. Distinct from a single-transport failure so callers
  /// can tell "one path broke" from "the node is unreachable".
  #[error("both transports failed: api={api}, shell={shell}")]
  DualTransportFailure { api: String, shell: String },

  #[error("remote object missing: {0}")]
  RemoteObjectMissing(String),

  #[error("operation timed out after {0}s")]
  Timeout(u64),

  #[error("cancelled: {0}")]
  Cancelled(String),

  #[error(transparent)]
  Internal(#[from] anyhow::Error),
}

impl EngineError {
  pub fn kind(&self) -> ErrorKind {
    match self {
      EngineError::Validation(_) => ErrorKind::Validation,
      EngineError::Unauthorized => ErrorKind::Unauthorized,
      EngineError::Forbidden(_) => ErrorKind::Forbidden,
      EngineError::NotFound { .. } => ErrorKind::NotFound,
      EngineError::Conflict(_) => ErrorKind::Conflict,
      EngineError::ResourceExhausted(_) => ErrorKind::ResourceExhausted,
      EngineError::PreconditionFailed(_) => ErrorKind::PreconditionFailed,
      EngineError::TransportShell(_) => ErrorKind::TransportShell,
      EngineError::TransportApi(_) => ErrorKind::TransportApi,
      EngineError::DualTransportFailure { .. } => ErrorKind::DualTransportFailure,
      EngineError::RemoteObjectMissing(_) => ErrorKind::RemoteObjectMissing,
      EngineError::Timeout(_) => ErrorKind::Timeout,
      EngineError::Cancelled(_) => ErrorKind::Cancelled,
      EngineError::Internal(_) => ErrorKind::Internal,
    }
  }

  /// Whether the task engine's worker should retry the task instead of
  /// failing it outright (§4.D retry policy).
  pub fn is_retryable(&self) -> bool {
    matches!(
      self.kind(),
      ErrorKind::TransportShell
        | ErrorKind::TransportApi
        | ErrorKind::Timeout
        | ErrorKind::ResourceExhausted
    )
  }

  pub fn not_found(resource: &'static str, id: impl Into<String>) -> Self {
    EngineError::NotFound { resource, id: id.into() }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn transport_errors_are_retryable() {
    let err = EngineError::TransportShell(anyhow::anyhow!("ssh closed"));
    assert!(err.is_retryable());
    assert_eq!(err.kind(), ErrorKind::TransportShell);
  }

  #[test]
  fn validation_is_not_retryable() {
    let err = EngineError::Validation("name too short".into());
    assert!(!err.is_retryable());
  }

  #[test]
  fn not_found_carries_resource_and_id() {
    let err = EngineError::not_found("instance", "abc-123");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(err.to_string().contains("abc-123"));
  }
}
