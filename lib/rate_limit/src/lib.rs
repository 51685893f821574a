use std::{
  hash::Hash,
  sync::Arc,
  time::{Duration, Instant},
};

use anyhow::anyhow;
use cache::CloneCache;
use tokio::sync::RwLock;

type Attempts = Arc<RwLock<Vec<Instant>>>;

/// Sliding-window rate limiter keyed by an arbitrary id (provider id,
/// user id, ...). Used by task admission (§4.D's "rate limits OK" check)
/// to bound how many tasks a given provider/user can enqueue per window,
/// independent of any HTTP-layer concern.
pub struct RateLimiter<K: Eq + Hash + Clone> {
  attempts: CloneCache<K, Attempts>,
  disabled: bool,
  max_attempts: usize,
  window: Duration,
}

impl<K: Eq + Hash + Clone + Send + Sync + 'static> RateLimiter<K> {
  pub fn new(
    disabled: bool,
    max_attempts: usize,
    window: Duration,
  ) -> Arc<Self> {
    let limiter = Arc::new(Self {
      attempts: CloneCache::default(),
      disabled,
      max_attempts,
      window,
    });
    if !disabled {
      spawn_cleanup_task(limiter.clone());
    }
    limiter
  }

  /// Records an attempt for `key` and returns an error if the window's
  /// attempt budget is already exhausted.
  pub async fn check(&self, key: &K) -> anyhow::Result<()> {
    if self.disabled {
      return Ok(());
    }

    let attempts = self.attempts.get_or_insert_default(key).await;
    let now = Instant::now();
    let window_start = now - self.window;

    let mut write = attempts.write().await;
    write.retain(|&t| t > window_start);
    if write.len() >= self.max_attempts {
      return Err(anyhow!(
        "rate limit exceeded, retry after {:?}",
        self.window
      ));
    }
    write.push(now);
    Ok(())
  }
}

fn spawn_cleanup_task<K: Eq + Hash + Clone + Send + Sync + 'static>(
  limiter: Arc<RateLimiter<K>>,
) {
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
      interval.tick().await;
      let remove_before = Instant::now() - Duration::from_secs(15 * 60);
      for key in limiter.attempts.get_keys().await {
        let Some(attempts) = limiter.attempts.get(&key).await else {
          continue;
        };
        let Ok(attempts) = attempts.try_read() else {
          continue;
        };
        if attempts.last().is_none_or(|&last| last <= remove_before) {
          drop(attempts);
          limiter.attempts.remove(&key).await;
        }
      }
    }
  });
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn allows_up_to_max_attempts() {
    let limiter =
      RateLimiter::<String>::new(false, 2, Duration::from_secs(60));
    assert!(limiter.check(&"p1".to_string()).await.is_ok());
    assert!(limiter.check(&"p1".to_string()).await.is_ok());
    assert!(limiter.check(&"p1".to_string()).await.is_err());
  }

  #[tokio::test]
  async fn disabled_never_limits() {
    let limiter =
      RateLimiter::<String>::new(true, 1, Duration::from_secs(60));
    for _ in 0..10 {
      assert!(limiter.check(&"p1".to_string()).await.is_ok());
    }
  }

  #[tokio::test]
  async fn keys_are_independent() {
    let limiter =
      RateLimiter::<String>::new(false, 1, Duration::from_secs(60));
    assert!(limiter.check(&"p1".to_string()).await.is_ok());
    assert!(limiter.check(&"p2".to_string()).await.is_ok());
  }
}
