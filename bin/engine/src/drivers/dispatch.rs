use std::future::Future;

use engine_client::entities::provider::ExecutionPolicy;
use engine_client::error::EngineError;
use node_transport::classify_transport_error;

/// Routes an operation through API or shell per `policy`, rather than
/// each call site reimplementing try/fallback (§9 design notes).
///
/// - `auto`: try API iff `has_api`; on a retryable transport failure,
///   check the shell transport is actually healthy before falling back
///   — if it isn't, both paths are dead and the caller gets a single
///   [`EngineError::DualTransportFailure`] instead of a confusing shell
///   error that has nothing to do with the original api failure.
/// - `api_only`: API must be available; shell is never attempted.
/// - `shell_only`: API is never attempted.
pub async fn dispatch<T, FA, FS, FH>(
  policy: ExecutionPolicy,
  has_api: bool,
  shell_only_backend: bool,
  api_fut: FA,
  shell_fut: FS,
  shell_healthy: FH,
) -> Result<T, EngineError>
where
  FA: Future<Output = Result<T, EngineError>>,
  FS: Future<Output = Result<T, EngineError>>,
  FH: Future<Output = bool>,
{
  let policy = if shell_only_backend {
    ExecutionPolicy::ShellOnly
  } else {
    policy
  };

  match policy {
    ExecutionPolicy::ShellOnly => shell_fut.await,
    ExecutionPolicy::ApiOnly => {
      if !has_api {
        return Err(EngineError::PreconditionFailed(
          "api_only policy requires api credentials".into(),
        ));
      }
      api_fut.await
    }
    ExecutionPolicy::Auto => {
      if !has_api {
        return shell_fut.await;
      }
      match api_fut.await {
        Ok(value) => Ok(value),
        Err(api_err) if is_transport_retryable(&api_err) => {
          if !shell_healthy.await {
            return Err(EngineError::DualTransportFailure {
              api: api_err.to_string(),
              shell: "shell transport unhealthy, fallback skipped".into(),
            });
          }
          match shell_fut.await {
            Ok(value) => Ok(value),
            Err(shell_err) => Err(EngineError::DualTransportFailure {
              api: api_err.to_string(),
              shell: shell_err.to_string(),
            }),
          }
        }
        Err(err) => Err(err),
      }
    }
  }
}

fn is_transport_retryable(err: &EngineError) -> bool {
  match err {
    EngineError::TransportApi(inner) => classify_transport_error(inner),
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  async fn ok_api() -> Result<&'static str, EngineError> {
    Ok("api")
  }

  async fn ok_shell() -> Result<&'static str, EngineError> {
    Ok("shell")
  }

  async fn failing_api() -> Result<&'static str, EngineError> {
    Err(EngineError::TransportApi(anyhow::anyhow!("connection refused")))
  }

  async fn failing_shell() -> Result<&'static str, EngineError> {
    Err(EngineError::TransportShell(anyhow::anyhow!("ssh closed")))
  }

  async fn healthy() -> bool {
    true
  }

  async fn unhealthy() -> bool {
    false
  }

  #[tokio::test]
  async fn auto_prefers_api_when_available() {
    let result =
      dispatch(ExecutionPolicy::Auto, true, false, ok_api(), ok_shell(), healthy())
        .await
        .unwrap();
    assert_eq!(result, "api");
  }

  #[tokio::test]
  async fn auto_falls_back_to_shell_on_transport_failure() {
    let result = dispatch(
      ExecutionPolicy::Auto,
      true,
      false,
      failing_api(),
      ok_shell(),
      healthy(),
    )
    .await
    .unwrap();
    assert_eq!(result, "shell");
  }

  #[tokio::test]
  async fn api_only_rejects_when_no_api_credentials() {
    let result =
      dispatch(ExecutionPolicy::ApiOnly, false, false, ok_api(), ok_shell(), healthy())
        .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn shell_only_backend_overrides_auto_policy() {
    let result =
      dispatch(ExecutionPolicy::Auto, true, true, ok_api(), ok_shell(), healthy())
        .await
        .unwrap();
    assert_eq!(result, "shell");
  }

  #[tokio::test]
  async fn auto_skips_fallback_when_shell_unhealthy() {
    let result = dispatch(
      ExecutionPolicy::Auto,
      true,
      false,
      failing_api(),
      ok_shell(),
      unhealthy(),
    )
    .await;
    assert!(matches!(result, Err(EngineError::DualTransportFailure { .. })));
  }

  #[tokio::test]
  async fn auto_reports_dual_failure_when_both_transports_fail() {
    let result = dispatch(
      ExecutionPolicy::Auto,
      true,
      false,
      failing_api(),
      failing_shell(),
      healthy(),
    )
    .await;
    assert!(matches!(result, Err(EngineError::DualTransportFailure { .. })));
  }
}
