use std::path::Path;
use std::time::{Duration, SystemTime};

use async_compression::tokio::write::GzipEncoder;
use engine_client::error::EngineError;
use tokio::io::AsyncWriteExt;

/// Sweeps `log_dir` (§9 ambient logging): files older than
/// `retention_days` are deleted outright; files one day past their
/// rotation but still inside the window are gzipped in place when
/// `gzip` is set, mirroring the rotate-then-compress pattern most log
/// shippers use so the retention window holds compressed, not raw, text.
pub async fn retain_logs(
  log_dir: &str,
  retention_days: u32,
  gzip: bool,
) -> Result<(), EngineError> {
  let dir = Path::new(log_dir);
  if !dir.is_dir() {
    return Ok(());
  }

  let retention = Duration::from_secs(u64::from(retention_days) * 86_400);
  let now = SystemTime::now();

  let mut entries = tokio::fs::read_dir(dir)
    .await
    .map_err(|e| EngineError::Internal(e.into()))?;

  while let Some(entry) = entries
    .next_entry()
    .await
    .map_err(|e| EngineError::Internal(e.into()))?
  {
    let path = entry.path();
    if !path.is_file() {
      continue;
    }
    let metadata = entry.metadata().await.map_err(|e| EngineError::Internal(e.into()))?;
    let age = match now.duration_since(metadata.modified().map_err(|e| EngineError::Internal(e.into()))?) {
      Ok(age) => age,
      Err(_) => continue,
    };

    if age >= retention {
      tokio::fs::remove_file(&path).await.map_err(|e| EngineError::Internal(e.into()))?;
      continue;
    }

    let already_gzipped = path.extension().is_some_and(|ext| ext == "gz");
    if gzip && !already_gzipped && age >= Duration::from_secs(86_400) {
      gzip_in_place(&path).await?;
    }
  }

  Ok(())
}

async fn gzip_in_place(path: &Path) -> Result<(), EngineError> {
  let raw = tokio::fs::read(path).await.map_err(|e| EngineError::Internal(e.into()))?;

  let mut encoder = GzipEncoder::new(Vec::new());
  encoder.write_all(&raw).await.map_err(|e| EngineError::Internal(e.into()))?;
  encoder.shutdown().await.map_err(|e| EngineError::Internal(e.into()))?;
  let compressed = encoder.into_inner();

  let gz_path = path.with_extension(format!(
    "{}.gz",
    path.extension().and_then(|e| e.to_str()).unwrap_or("log")
  ));
  tokio::fs::write(&gz_path, compressed).await.map_err(|e| EngineError::Internal(e.into()))?;
  tokio::fs::remove_file(path).await.map_err(|e| EngineError::Internal(e.into()))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn missing_log_dir_is_not_an_error() {
    let result = retain_logs("/nonexistent/engine-log-dir-for-tests", 14, true).await;
    assert!(result.is_ok());
  }
}
