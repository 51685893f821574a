use std::collections::HashSet;

use engine_client::entities::port::{PortMappingRule, PortProtocol};
use engine_client::entities::provider::{Provider, PortMappingMethod};
use engine_client::error::EngineError;
use node_transport::NodeSession;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// Result of [`allocate`]: a contiguous block of `port_count` host
/// ports, disjoint from both the DB's mapped set and the node's
/// live-listening set.
pub struct AllocatedBlock {
  pub host_ports: Vec<i32>,
}

/// (1)-(4) of §4.E: read the cursor, fetch mapped + live-listening
/// ports, scan forward for a free contiguous block, wrapping once.
pub async fn allocate(
  pool: &PgPool,
  provider: &Provider,
  session: &NodeSession,
  port_count: i32,
) -> Result<AllocatedBlock, EngineError> {
  let mapped = mapped_ports(pool, provider.id).await?;
  let listening = live_listening_ports(session).await?;

  let start = provider.config.port_range_start;
  let end = provider.config.port_range_end;
  let span = end - start;
  if span < port_count {
    return Err(EngineError::ResourceExhausted(
      "provider port range too small for requested block".into(),
    ));
  }

  // Every valid block start, rotated so the scan begins at the cursor
  // and wraps at most once (§4.E step 4).
  let last_valid_start = end - port_count + 1;
  let cursor =
    provider.config.next_available_port.clamp(start, last_valid_start);
  let starts: Vec<i32> = (start..=last_valid_start)
    .cycle()
    .skip_while(|s| *s < cursor)
    .take((last_valid_start - start + 1) as usize)
    .collect();

  for candidate_start in starts {
    let block: Vec<i32> =
      (candidate_start..candidate_start + port_count).collect();
    if block.iter().all(|p| !mapped.contains(p) && !listening.contains(p)) {
      return Ok(AllocatedBlock { host_ports: block });
    }
  }

  Err(EngineError::ResourceExhausted(
    "no free contiguous port block in range".into(),
  ))
}

/// Advances and persists `next_available_port` past the allocated block.
pub async fn advance_cursor(
  pool: &PgPool,
  provider_id: Uuid,
  block: &AllocatedBlock,
  range_start: i32,
  range_end: i32,
) -> Result<(), EngineError> {
  let next = block
    .host_ports
    .last()
    .copied()
    .unwrap_or(range_start)
    + 1;
  let wrapped = if next > range_end { range_start } else { next };
  sqlx::query(
    "UPDATE providers SET config = jsonb_set(config, '{next_available_port}', to_jsonb($2::int)) WHERE id = $1",
  )
  .bind(provider_id)
  .bind(wrapped)
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;
  Ok(())
}

async fn mapped_ports(
  pool: &PgPool,
  provider_id: Uuid,
) -> Result<HashSet<i32>, EngineError> {
  let rows = sqlx::query(
    "SELECT host_port FROM ports WHERE provider_id = $1 AND active",
  )
  .bind(provider_id)
  .fetch_all(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;
  Ok(rows.into_iter().map(|row| row.get::<i32, _>(0)).collect())
}

/// Prefers `ss -tuln`, falls back to `netstat -tuln`; per §4.E these are
/// the two tools the shell layer can discover listening ports with
/// without administrator-supplied hints.
async fn live_listening_ports(
  session: &NodeSession,
) -> Result<HashSet<i32>, EngineError> {
  let out = session
    .execute("ss -tuln 2>/dev/null || netstat -tuln 2>/dev/null", None)
    .await
    .map_err(EngineError::TransportShell)?;
  Ok(parse_listening_ports(&out.stdout_combined))
}

fn parse_listening_ports(output: &str) -> HashSet<i32> {
  output
    .lines()
    .filter_map(|line| {
      let last_colon = line.rsplit_once(':')?;
      let port_field: String =
        last_colon.1.chars().take_while(|c| c.is_ascii_digit()).collect();
      port_field.parse::<i32>().ok()
    })
    .collect()
}

/// Installs the host-side rule for a newly allocated block, per the
/// provider's `ipv4_port_mapping_method`.
pub async fn install_mapping_rule(
  session: &NodeSession,
  method: PortMappingMethod,
  container_ref: &str,
  host_port: i32,
  guest_port: i32,
  protocol: PortProtocol,
) -> Result<PortMappingRule, EngineError> {
  let proto = match protocol {
    PortProtocol::Tcp => "tcp",
    PortProtocol::Udp => "udp",
    PortProtocol::Both => "tcp/udp",
  };
  let (cmd, rule) = match method {
    PortMappingMethod::Native => (
      format!("docker update --publish-add {host_port}:{guest_port}/{proto} {container_ref} 2>/dev/null || true"),
      PortMappingRule::Native,
    ),
    PortMappingMethod::Iptables => (
      format!(
        "iptables -t nat -A PREROUTING -p {proto} --dport {host_port} -j DNAT --to-destination {container_ref}:{guest_port}"
      ),
      PortMappingRule::Iptables,
    ),
    PortMappingMethod::DeviceProxy => (
      format!(
        "lxc config device add {container_ref} proxy-{host_port} proxy listen={proto}:0.0.0.0:{host_port} connect={proto}:127.0.0.1:{guest_port}"
      ),
      PortMappingRule::DeviceProxy,
    ),
  };
  let out = session
    .execute(&cmd, Some(std::time::Duration::from_secs(20)))
    .await
    .map_err(EngineError::TransportShell)?;
  if !out.success() {
    return Err(EngineError::TransportShell(anyhow::anyhow!(
      "failed to install port mapping: {}",
      out.stdout_combined
    )));
  }
  Ok(rule)
}

/// Allocates and installs the single `is_ssh=true` range-mapped port a
/// freshly created instance needs (§4.E, testable property #5).
pub async fn map_ssh_port(
  pool: &PgPool,
  session: &NodeSession,
  provider: &Provider,
  container_ref: &str,
  instance_id: Uuid,
) -> Result<i32, EngineError> {
  let count = engine_client::entities::provider::default_port_count();
  let block = allocate(pool, provider, session, count).await?;
  let host_port = block.host_ports[0];
  const GUEST_SSH_PORT: i32 = 22;

  let rule = install_mapping_rule(
    session,
    provider.config.ipv4_port_mapping_method,
    container_ref,
    host_port,
    GUEST_SSH_PORT,
    PortProtocol::Tcp,
  )
  .await?;

  sqlx::query(
    "INSERT INTO ports \
       (id, provider_id, instance_id, host_port, guest_port, protocol, \
        mapping_rule, is_ssh, port_type, active) \
     VALUES ($1, $2, $3, $4, $5, 'tcp', $6, true, 'range_mapped', true)",
  )
  .bind(Uuid::new_v4())
  .bind(provider.id)
  .bind(instance_id)
  .bind(host_port)
  .bind(GUEST_SSH_PORT)
  .bind(rule.to_string())
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  advance_cursor(
    pool,
    provider.id,
    &block,
    provider.config.port_range_start,
    provider.config.port_range_end,
  )
  .await?;

  Ok(host_port)
}

/// Installs a user-requested manual port mapping (§4.E, §6
/// `create-port-mapping`): checks the host port is free, installs the
/// host-side rule, and inserts the `manual` row.
pub async fn create_manual_mapping(
  pool: &PgPool,
  session: &NodeSession,
  provider: &Provider,
  container_ref: &str,
  port_id: Uuid,
  instance_id: Uuid,
  host_port: i32,
  guest_port: i32,
  protocol: PortProtocol,
) -> Result<(), EngineError> {
  let mapped = mapped_ports(pool, provider.id).await?;
  let listening = live_listening_ports(session).await?;
  if mapped.contains(&host_port) || listening.contains(&host_port) {
    return Err(EngineError::Conflict(format!(
      "host port {host_port} already in use"
    )));
  }

  let rule = install_mapping_rule(
    session,
    provider.config.ipv4_port_mapping_method,
    container_ref,
    host_port,
    guest_port,
    protocol,
  )
  .await?;

  sqlx::query(
    "INSERT INTO ports \
       (id, provider_id, instance_id, host_port, guest_port, protocol, \
        mapping_rule, is_ssh, port_type, active) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, false, 'manual', true)",
  )
  .bind(port_id)
  .bind(provider.id)
  .bind(instance_id)
  .bind(host_port)
  .bind(guest_port)
  .bind(protocol.to_string())
  .bind(rule.to_string())
  .execute(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?;

  Ok(())
}

/// Deletes `manual`/`batch` rows only (§4.E); range-mapped rows are
/// immutable for the instance's lifetime and purged only on instance
/// delete.
pub async fn delete_manual_port(
  pool: &PgPool,
  port_id: Uuid,
) -> Result<(), EngineError> {
  let row = sqlx::query(
    "SELECT port_type FROM ports WHERE id = $1",
  )
  .bind(port_id)
  .fetch_optional(pool)
  .await
  .map_err(|e| EngineError::Internal(e.into()))?
  .ok_or_else(|| EngineError::not_found("port", port_id.to_string()))?;

  let port_type: String = row.get(0);
  if !matches!(port_type.as_str(), "manual" | "batch") {
    return Err(EngineError::PreconditionFailed(
      "only manual/batch ports may be deleted independently".into(),
    ));
  }

  sqlx::query("UPDATE ports SET active = false WHERE id = $1")
    .bind(port_id)
    .execute(pool)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_ss_style_output() {
    let output = "\
udp   UNCONN 0 0   0.0.0.0:68   0.0.0.0:*
tcp   LISTEN 0 128 0.0.0.0:22   0.0.0.0:*
tcp   LISTEN 0 128 127.0.0.1:20000 0.0.0.0:*
";
    let ports = parse_listening_ports(output);
    assert!(ports.contains(&22));
    assert!(ports.contains(&20000));
    assert!(ports.contains(&68));
  }

  #[test]
  fn parses_empty_output() {
    assert!(parse_listening_ports("").is_empty());
  }
}
