use russh::client::Msg;
use russh::{Channel, ChannelMsg, client};
use russh_keys::key::PublicKey;

/// Accepts whatever host key the node presents. Provider nodes are
/// operator-managed infrastructure reached over a private/VPN network,
/// not arbitrary internet hosts; host-key pinning is left to the
/// (external) provider-registration collaborator that records
/// `endpoint`.
pub struct ClientHandler;

#[async_trait::async_trait]
impl client::Handler for ClientHandler {
  type Error = russh::Error;

  async fn check_server_key(
    &mut self,
    _server_public_key: &PublicKey,
  ) -> Result<bool, Self::Error> {
    Ok(true)
  }
}

/// Drains a channel opened with `exec`, combining stdout and stderr in
/// arrival order (§4.A's `execute` returns one combined stream) and
/// recording the exit status once the remote closes it.
pub async fn drain_exec_channel(
  mut channel: Channel<Msg>,
) -> anyhow::Result<(Vec<u8>, Option<u32>)> {
  let mut combined = Vec::new();
  let mut status = None;

  while let Some(msg) = channel.wait().await {
    match msg {
      ChannelMsg::Data { data } => combined.extend_from_slice(&data),
      ChannelMsg::ExtendedData { data, .. } => {
        combined.extend_from_slice(&data)
      }
      ChannelMsg::ExitStatus { exit_status } => status = Some(exit_status),
      ChannelMsg::Eof | ChannelMsg::Close => break,
      _ => {}
    }
  }

  Ok((combined, status))
}
