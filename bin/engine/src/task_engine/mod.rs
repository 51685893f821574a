mod admission;
mod worker;

pub use admission::{admit, AdmissionError};
pub use worker::{force_stop, spawn_worker_pool};

use std::collections::HashMap;
use std::sync::Arc;

use engine_client::entities::provider::Provider;
use tokio::sync::Semaphore;
use uuid::Uuid;

/// One bounded `Semaphore`-gated pool per provider, sized to
/// `max_concurrent_tasks` when `allow_concurrent_tasks`, else 1 (§4.D,
/// §9 "goroutine-style concurrency" note). Tasks without a provider run
/// in the shared default pool.
pub struct WorkerPools {
  pools: tokio::sync::RwLock<HashMap<Uuid, Arc<Semaphore>>>,
  default_pool: Arc<Semaphore>,
}

impl WorkerPools {
  pub fn new(default_concurrency: usize) -> Self {
    Self {
      pools: tokio::sync::RwLock::new(HashMap::new()),
      default_pool: Arc::new(Semaphore::new(default_concurrency.max(1))),
    }
  }

  pub async fn pool_for(&self, provider: &Provider) -> Arc<Semaphore> {
    let size = if provider.config.allow_concurrent_tasks {
      provider.config.max_concurrent_tasks.max(1) as usize
    } else {
      1
    };

    if let Some(pool) = self.pools.read().await.get(&provider.id) {
      if pool.available_permits() <= size {
        return pool.clone();
      }
    }

    let mut pools = self.pools.write().await;
    pools
      .entry(provider.id)
      .or_insert_with(|| Arc::new(Semaphore::new(size)))
      .clone()
  }

  pub fn default_pool(&self) -> Arc<Semaphore> {
    self.default_pool.clone()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn default_pool_has_at_least_one_permit() {
    let pools = WorkerPools::new(0);
    assert_eq!(pools.default_pool().available_permits(), 1);
  }
}
