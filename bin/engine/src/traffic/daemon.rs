use std::time::Duration;

use async_trait::async_trait;
use engine_client::error::EngineError;
use node_transport::NodeSession;

/// One row read back from the on-node accounting daemon. The real
/// column layout is an integration contract with that daemon (§9 open
/// question); everything downstream of ingestion only ever sees this
/// shape.
#[derive(Debug, Clone)]
pub struct DaemonSample {
  pub instance_name: String,
  pub bytes_in: i64,
  pub bytes_out: i64,
  pub sampled_at: chrono::DateTime<chrono::Utc>,
}

/// Isolates the on-node daemon's actual schema from the ingestion
/// pipeline (§4.F, §9). A fake implementation can stand in for tests
/// without a real node.
#[async_trait]
pub trait DaemonSource: Send + Sync {
  async fn read_samples(
    &self,
    session: &NodeSession,
  ) -> Result<Vec<DaemonSample>, EngineError>;
}

/// Reads the daemon's SQLite file over the existing shell session
/// rather than opening a second transport; the query shape is the
/// smallest one the ingestion contract needs.
pub struct SqliteDaemonSource {
  pub db_path: String,
}

impl SqliteDaemonSource {
  pub fn new(db_path: impl Into<String>) -> Self {
    Self { db_path: db_path.into() }
  }
}

#[async_trait]
impl DaemonSource for SqliteDaemonSource {
  async fn read_samples(
    &self,
    session: &NodeSession,
  ) -> Result<Vec<DaemonSample>, EngineError> {
    let cmd = format!(
      "sqlite3 -separator '|' {} \"SELECT instance_name, bytes_in, bytes_out, strftime('%s', sampled_at) FROM traffic_samples;\"",
      self.db_path,
    );
    let out = session
      .execute(&cmd, Some(Duration::from_secs(20)))
      .await
      .map_err(EngineError::TransportShell)?;
    if !out.success() {
      return Err(EngineError::RemoteObjectMissing(format!(
        "accounting daemon database unreadable: {}",
        out.stdout_combined
      )));
    }
    Ok(parse_daemon_rows(&out.stdout_combined))
  }
}

fn parse_daemon_rows(output: &str) -> Vec<DaemonSample> {
  output
    .lines()
    .filter_map(|line| {
      let mut parts = line.splitn(4, '|');
      let instance_name = parts.next()?.to_string();
      let bytes_in: i64 = parts.next()?.parse().ok()?;
      let bytes_out: i64 = parts.next()?.parse().ok()?;
      let epoch: i64 = parts.next()?.trim().parse().ok()?;
      let sampled_at = chrono::DateTime::from_timestamp(epoch, 0)?;
      Some(DaemonSample { instance_name, bytes_in, bytes_out, sampled_at })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_pipe_separated_rows() {
    let output = "web-1|1024|2048|1700000000\nweb-2|0|0|1700000001\n";
    let samples = parse_daemon_rows(output);
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[0].instance_name, "web-1");
    assert_eq!(samples[0].bytes_in, 1024);
  }

  #[test]
  fn skips_malformed_rows() {
    let output = "garbage\nweb-1|10|20|1700000000\n";
    let samples = parse_daemon_rows(output);
    assert_eq!(samples.len(), 1);
  }
}
