use std::net::ToSocketAddrs;
use std::sync::Arc;

use anyhow::Context;
use cache::CloneCache;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{Credentials, NodeSession};

/// Distinguishes the long-lived interactive pool from short-lived
/// probe connections (§4.A), mirroring the donor's per-server
/// connection cache keyed by server id.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
pub enum UsageClass {
  Interactive,
  Probe,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct SessionKey(Uuid, UsageClass);

/// Shared among every driver of a provider; each driver must call
/// `healthy()` before reusing a session it pulls from here (§5 shared-
/// resource policy).
#[derive(Default)]
pub struct SessionPool {
  sessions: CloneCache<SessionKey, Arc<NodeSession>>,
}

impl SessionPool {
  pub fn new() -> Self {
    Self::default()
  }

  /// Returns the pooled session for `(provider_id, usage_class)`,
  /// establishing one if absent, if the cached one is unhealthy, or if
  /// `host` no longer resolves to the address it was connected against
  /// (DNS drift — see [`verify_remote_address`]). A single connect
  /// retry absorbs one transient failure before giving up, since SSH
  /// handshakes over WAN links routinely drop the first attempt.
  pub async fn get_or_connect(
    &self,
    provider_id: Uuid,
    usage_class: UsageClass,
    host: &str,
    port: u16,
    creds: &Credentials,
  ) -> anyhow::Result<Arc<NodeSession>> {
    let key = SessionKey(provider_id, usage_class);

    if let Some(session) = self.sessions.get(&key).await {
      let address_still_matches =
        verify_remote_address(host, port, session.peer_addr().ip())
          .unwrap_or(true);
      if address_still_matches && session.healthy().await {
        return Ok(session);
      }
      self.sessions.remove(&key).await;
    }

    let session = match NodeSession::connect(host, port, creds).await {
      Ok(session) => session,
      Err(err) if crate::classify_transport_error(&err) => {
        NodeSession::connect(host, port, creds)
          .await
          .context("session creation failed after retry")?
      }
      Err(err) => return Err(err),
    };
    self.sessions.insert(key, session.clone()).await;
    Ok(session)
  }

  pub async fn evict(&self, provider_id: Uuid, usage_class: UsageClass) {
    self.sessions.remove(&SessionKey(provider_id, usage_class)).await;
  }
}

/// Resolves `expected` to an IP set and compares against it; guards
/// against DNS drift mid-session. `actual` is the socket peer address
/// recorded at connect time.
pub fn verify_remote_address(
  expected: &str,
  port: u16,
  actual: std::net::IpAddr,
) -> anyhow::Result<bool> {
  let resolved: Vec<_> = (expected, port)
    .to_socket_addrs()
    .with_context(|| format!("failed to resolve {expected:?}"))?
    .map(|addr| addr.ip())
    .collect();
  Ok(resolved.contains(&actual))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn verify_remote_address_matches_loopback() {
    let matched =
      verify_remote_address("localhost", 22, "127.0.0.1".parse().unwrap())
        .unwrap();
    assert!(matched);
  }

  #[test]
  fn verify_remote_address_rejects_mismatch() {
    let matched =
      verify_remote_address("localhost", 22, "8.8.8.8".parse().unwrap())
        .unwrap();
    assert!(!matched);
  }
}
