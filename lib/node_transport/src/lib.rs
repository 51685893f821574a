mod client;
mod pool;
mod session;

pub use pool::{SessionPool, UsageClass};
pub use session::NodeSession;

use serde::{Deserialize, Serialize};

/// Shell credentials for a provider node. At least one of
/// `password`/`private_key_pem` must be set (§3 Provider invariant);
/// construction attempts the key first, then the password.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
  pub username: String,
  pub password: Option<String>,
  pub private_key_pem: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecOutput {
  pub stdout_combined: String,
  pub status: u32,
}

impl ExecOutput {
  pub fn success(&self) -> bool {
    self.status == 0
  }
}

/// Transient network failures surface as retryable; anything else is
/// classified internal. Mirrors §4.A's failure-semantics table.
pub fn classify_transport_error(err: &anyhow::Error) -> bool {
  let message = err.to_string().to_lowercase();
  [
    "connection reset",
    "connection refused",
    "broken pipe",
    "eof",
    "handshake failed",
    "session creation failed",
    "timed out",
  ]
  .iter()
  .any(|needle| message.contains(needle))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recognizes_transient_network_errors() {
    let err = anyhow::anyhow!("connection reset by peer");
    assert!(classify_transport_error(&err));
  }

  #[test]
  fn leaves_other_errors_unclassified() {
    let err = anyhow::anyhow!("permission denied");
    assert!(!classify_transport_error(&err));
  }

  #[test]
  fn exec_output_success_checks_zero_status() {
    let out = ExecOutput { stdout_combined: String::new(), status: 0 };
    assert!(out.success());
    let out = ExecOutput { stdout_combined: String::new(), status: 1 };
    assert!(!out.success());
  }
}
