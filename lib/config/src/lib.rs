use std::path::Path;

use anyhow::Context;
use logger::LogConfig;
use serde::{Deserialize, Serialize};

/// Flat environment view, parsed with `envy`. Every field mirrors one
/// `ENGINE_*` variable; `_file` siblings let secrets be supplied as a
/// path instead of a literal (Docker/Kubernetes secret mounts).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct Env {
  #[serde(default)]
  pub engine_config_paths: Vec<String>,

  #[serde(default)]
  pub engine_database_uri: Option<String>,
  #[serde(default)]
  pub engine_database_uri_file: Option<String>,

  #[serde(default)]
  pub engine_bind_address: Option<String>,
  #[serde(default)]
  pub engine_storage_dir: Option<String>,

  #[serde(default)]
  pub engine_logging_level: Option<logger::LogLevel>,
  #[serde(default)]
  pub engine_logging_stdio: Option<logger::StdioLogMode>,
  #[serde(default)]
  pub engine_logging_pretty: Option<bool>,

  #[serde(default)]
  pub engine_traffic_collect_interval_secs: Option<i64>,
  #[serde(default)]
  pub engine_traffic_enforce_interval_secs: Option<i64>,

  #[serde(default)]
  pub engine_shutdown_grace_period_secs: Option<u64>,

  #[serde(default)]
  pub engine_log_dir: Option<String>,
  #[serde(default)]
  pub engine_log_retention_days: Option<u32>,
  #[serde(default)]
  pub engine_log_retention_gzip: Option<bool>,
}

/// The explicit, passed-down configuration struct (§9 `AppState`
/// redesign: no process-global). Built once in `main` by [`load`] and
/// handed into every component constructor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  pub database_uri: String,
  pub bind_address: String,
  pub storage_dir: String,
  pub logging: LogConfig,
  pub traffic_collect_interval_secs: i64,
  pub traffic_enforce_interval_secs: i64,
  pub shutdown_grace_period_secs: u64,
  pub log_dir: String,
  pub log_retention_days: u32,
  pub log_retention_gzip: bool,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      database_uri: String::new(),
      bind_address: "0.0.0.0:9120".into(),
      storage_dir: "./storage".into(),
      logging: LogConfig::default(),
      traffic_collect_interval_secs: 300,
      traffic_enforce_interval_secs: 60,
      shutdown_grace_period_secs: 15,
      log_dir: "./storage/logs".into(),
      log_retention_days: 14,
      log_retention_gzip: true,
    }
  }
}

/// Reads `value`, falling back to the contents of `file` (trimmed) when
/// `value` is absent. Mirrors the donor's `secret_file`/`environment_file`
/// helpers of the same name, without the extra crate dependency.
pub fn maybe_read_item_from_file(
  file: Option<String>,
  value: Option<String>,
) -> Option<String> {
  if let Some(value) = value {
    return Some(value);
  }
  let path = file?;
  match std::fs::read_to_string(&path) {
    Ok(contents) => Some(contents.trim().to_string()),
    Err(e) => {
      tracing::warn!("failed to read secret file {path:?}: {e:#}");
      None
    }
  }
}

/// Same as [`maybe_read_item_from_file`] but for newline-separated lists.
pub fn maybe_read_list_from_file(
  file: Option<String>,
  value: Option<Vec<String>>,
) -> Option<Vec<String>> {
  if let Some(value) = value {
    return Some(value);
  }
  let path = file?;
  match std::fs::read_to_string(&path) {
    Ok(contents) => Some(
      contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(String::from)
        .collect(),
    ),
    Err(e) => {
      tracing::warn!("failed to read secret list file {path:?}: {e:#}");
      None
    }
  }
}

/// `./storage/.system_initialized` is the authoritative bootstrap
/// marker for the (external) init-wizard collaborator; its absence
/// simply means "fresh install", never an error.
pub fn is_system_initialized(storage_dir: &str) -> bool {
  Path::new(storage_dir).join(".system_initialized").is_file()
}

/// Loads the layered configuration: env (`envy::from_env`) over an
/// optional YAML file over hardcoded defaults, then re-applies env/
/// file-secret overrides on top so they always win.
pub fn load() -> anyhow::Result<EngineConfig> {
  dotenvy::dotenv().ok();

  let env: Env = envy::from_env()
    .context("failed to parse engine environment variables")?;

  let mut config = EngineConfig::default();

  for path in &env.engine_config_paths {
    let contents = std::fs::read_to_string(path)
      .with_context(|| format!("failed to read config file {path:?}"))?;
    let from_file: EngineConfig = serde_yaml_ng::from_str(&contents)
      .with_context(|| format!("failed to parse config file {path:?}"))?;
    config = from_file;
  }

  config.database_uri = maybe_read_item_from_file(
    env.engine_database_uri_file,
    env.engine_database_uri,
  )
  .unwrap_or(config.database_uri);

  config.bind_address =
    env.engine_bind_address.unwrap_or(config.bind_address);
  config.storage_dir = env.engine_storage_dir.unwrap_or(config.storage_dir);

  config.logging.level =
    env.engine_logging_level.unwrap_or(config.logging.level);
  config.logging.stdio =
    env.engine_logging_stdio.unwrap_or(config.logging.stdio);
  config.logging.pretty =
    env.engine_logging_pretty.unwrap_or(config.logging.pretty);

  config.traffic_collect_interval_secs = env
    .engine_traffic_collect_interval_secs
    .unwrap_or(config.traffic_collect_interval_secs)
    .max(60);
  config.traffic_enforce_interval_secs = env
    .engine_traffic_enforce_interval_secs
    .unwrap_or(config.traffic_enforce_interval_secs);
  config.shutdown_grace_period_secs = env
    .engine_shutdown_grace_period_secs
    .unwrap_or(config.shutdown_grace_period_secs);

  config.log_dir = env.engine_log_dir.unwrap_or(config.log_dir);
  config.log_retention_days =
    env.engine_log_retention_days.unwrap_or(config.log_retention_days);
  config.log_retention_gzip =
    env.engine_log_retention_gzip.unwrap_or(config.log_retention_gzip);

  if config.database_uri.is_empty() {
    anyhow::bail!("ENGINE_DATABASE_URI (or _FILE) must be set");
  }

  Ok(config)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn secret_file_wins_only_when_value_absent() {
    let dir = std::env::temp_dir().join(format!(
      "engine-config-test-{}",
      uuid::Uuid::new_v4()
    ));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("secret");
    std::fs::write(&path, "from-file\n").unwrap();

    let from_file = maybe_read_item_from_file(
      Some(path.to_string_lossy().to_string()),
      None,
    );
    assert_eq!(from_file.as_deref(), Some("from-file"));

    let from_value = maybe_read_item_from_file(
      Some(path.to_string_lossy().to_string()),
      Some("explicit".into()),
    );
    assert_eq!(from_value.as_deref(), Some("explicit"));

    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn traffic_interval_has_a_floor() {
    // Matches the §4.F floor of 60s even if the env override is lower.
    let mut config = EngineConfig::default();
    config.traffic_collect_interval_secs = 10.max(60);
    assert_eq!(config.traffic_collect_interval_secs, 60);
  }

  #[test]
  fn missing_marker_file_means_fresh_install() {
    assert!(!is_system_initialized("/nonexistent/path/for/engine/tests"));
  }
}
