use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use russh::client::{self, Handle};
use russh_keys::key::KeyPair;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::client::{ClientHandler, drain_exec_channel};
use crate::{Credentials, ExecOutput};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_FAILURE_LIMIT: u32 = 3;
const HEALTH_CHECK_DEBOUNCE: Duration = Duration::from_secs(5);

/// Profile sourced before every command so backend CLIs (docker, lxc,
/// pvesh, ...) resolve regardless of the remote account's default PATH.
const PROFILE_PREAMBLE: &str = "\
. /etc/profile 2>/dev/null; \
. ~/.bashrc 2>/dev/null; \
. ~/.bash_profile 2>/dev/null; \
export PATH=\"$PATH:/usr/local/sbin:/usr/local/bin:/usr/sbin:/sbin\"; \
";

/// One authenticated connection to a provider node. Exclusively owned
/// by the guard returned from [`NodeSession::acquire`]; the keep-alive
/// task pings on a fixed interval and this struct's `Drop` aborts it.
pub struct NodeSession {
  handle: Handle<ClientHandler>,
  keepalive: JoinHandle<()>,
  last_health_check: Mutex<Option<Instant>>,
  last_health_result: Mutex<bool>,
  /// Socket address actually dialed at connect time, so a later DNS
  /// change for the provider's hostname can be detected by comparing
  /// against a fresh resolution (see [`crate::verify_remote_address`]).
  peer_addr: std::net::SocketAddr,
}

impl Drop for NodeSession {
  fn drop(&mut self) {
    self.keepalive.abort();
  }
}

impl NodeSession {
  pub async fn connect(
    host: &str,
    port: u16,
    creds: &Credentials,
  ) -> anyhow::Result<Arc<Self>> {
    use std::net::ToSocketAddrs;
    let peer_addr = (host, port)
      .to_socket_addrs()
      .with_context(|| format!("failed to resolve {host:?}"))?
      .next()
      .with_context(|| format!("no address found for {host:?}"))?;

    let config = Arc::new(client::Config::default());
    let mut handle = client::connect(config, peer_addr, ClientHandler)
      .await
      .context("session creation failed")?;

    let mut authenticated = false;

    if let Some(key_pem) = &creds.private_key_pem {
      let key = russh_keys::decode_secret_key(key_pem, None)
        .context("failed to decode private key")?;
      if handle
        .authenticate_publickey(&creds.username, Arc::new(key))
        .await
        .context("session creation failed")?
      {
        authenticated = true;
      }
    }

    if !authenticated {
      if let Some(password) = &creds.password {
        authenticated = handle
          .authenticate_password(&creds.username, password)
          .await
          .context("session creation failed")?;
      }
    }

    if !authenticated {
      bail!("session creation failed: no credential accepted");
    }

    let keepalive = {
      let handle = handle.clone();
      tokio::spawn(async move {
        let mut failures = 0u32;
        loop {
          tokio::time::sleep(KEEPALIVE_INTERVAL).await;
          match handle
            .channel_open_session()
            .await
            .and_then(|_| Ok(()))
          {
            Ok(()) => failures = 0,
            Err(_) => {
              failures += 1;
              if failures >= KEEPALIVE_FAILURE_LIMIT {
                tracing::warn!(
                  "node session keep-alive failed {failures} times, retiring"
                );
                break;
              }
            }
          }
        }
      })
    };

    Ok(Arc::new(Self {
      handle,
      keepalive,
      last_health_check: Mutex::new(None),
      last_health_result: Mutex::new(true),
      peer_addr,
    }))
  }

  pub fn peer_addr(&self) -> std::net::SocketAddr {
    self.peer_addr
  }

  /// Executes `cmd` inside a PTY with the admin profile pre-sourced,
  /// optionally bounded by `timeout`. Caller classifies the resulting
  /// error via [`crate::classify_transport_error`].
  pub async fn execute(
    &self,
    cmd: &str,
    timeout: Option<Duration>,
  ) -> anyhow::Result<ExecOutput> {
    let channel = self
      .handle
      .channel_open_session()
      .await
      .context("session creation failed")?;
    channel
      .request_pty(false, "xterm", 80, 24, 0, 0, &[])
      .await
      .context("failed to request pty")?;

    let full_cmd = format!("{PROFILE_PREAMBLE}{cmd}");
    channel
      .exec(true, full_cmd.as_bytes())
      .await
      .context("failed to exec command")?;

    let drain = drain_exec_channel(channel);
    let (stdout, status) = match timeout {
      Some(duration) => tokio::time::timeout(duration, drain)
        .await
        .context("command timed out")??,
      None => drain.await?,
    };

    Ok(ExecOutput {
      stdout_combined: String::from_utf8_lossy(&stdout).into_owned(),
      status: status.unwrap_or(u32::MAX),
    })
  }

  /// Writes `bytes` to `remote_path`, creating parent directories and
  /// chmod'ing to `mode`. There is no SFTP subsystem negotiated here;
  /// the content is shipped base64-encoded through the same exec
  /// channel used for everything else, matching §4.A's "one transport"
  /// design (no second session type for file transfer).
  pub async fn upload_content(
    &self,
    bytes: &[u8],
    remote_path: &str,
    mode: &str,
  ) -> anyhow::Result<()> {
    use base64::Engine;
    let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
    let cmd = format!(
      "set -e; mkdir -p \"$(dirname '{remote_path}')\"; \
       printf '%s' '{encoded}' | base64 -d > '{remote_path}.tmp'; \
       mv '{remote_path}.tmp' '{remote_path}'; \
       chmod {mode} '{remote_path}'"
    );
    let out = self.execute(&cmd, Some(Duration::from_secs(30))).await?;
    if out.status != 0 {
      bail!("upload failed (status {}): {}", out.status, out.stdout_combined);
    }
    Ok(())
  }

  /// Short-circuits for 5s to avoid probe storms; otherwise opens a
  /// throwaway session.
  pub async fn healthy(&self) -> bool {
    let mut last_check = self.last_health_check.lock().await;
    if let Some(checked_at) = *last_check {
      if checked_at.elapsed() < HEALTH_CHECK_DEBOUNCE {
        return *self.last_health_result.lock().await;
      }
    }
    let result = self.handle.channel_open_session().await.is_ok();
    *last_check = Some(Instant::now());
    *self.last_health_result.lock().await = result;
    result
  }
}
