use std::sync::Arc;

use config::EngineConfig;
use node_transport::SessionPool;
use rate_limit::RateLimiter;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cache::CloneCache;

/// Explicit, passed-down application state (§9 redesign flag: replaces
/// Komodo's `OnceLock` process-globals). Built once in `main`, handed
/// to every component constructor as `Arc<AppState>`; tests construct
/// their own instance pointed at a scratch database instead of
/// reaching into statics.
pub struct AppState {
  pub db: PgPool,
  pub config: EngineConfig,
  pub transport: SessionPool,
  /// Per-(provider, instance) advisory lock enforcing the §5
  /// serialization guarantee at the in-process level; the DB
  /// transaction around reservation + task-row updates is what makes
  /// it crash-safe, this cache just avoids two in-process workers
  /// racing on the same pair.
  pub instance_locks: CloneCache<(Uuid, Uuid), Arc<Mutex<()>>>,
  pub admission_rate_limiter: Arc<RateLimiter<Uuid>>,
  /// Per-task child of `shutdown`, registered for the duration of
  /// `run_task` so a single in-flight task can be force-stopped without
  /// tearing down every other worker.
  pub cancel_tokens: CloneCache<Uuid, CancellationToken>,
  /// Root cancellation context; every task's context is a child of
  /// this one so shutdown cancels everything in-flight at once.
  pub shutdown: CancellationToken,
}

impl AppState {
  pub fn new(
    db: PgPool,
    config: EngineConfig,
  ) -> Arc<Self> {
    let admission_rate_limiter = RateLimiter::new(
      false,
      20,
      std::time::Duration::from_secs(60),
    );
    Arc::new(Self {
      db,
      config,
      transport: SessionPool::new(),
      instance_locks: CloneCache::default(),
      admission_rate_limiter,
      cancel_tokens: CloneCache::default(),
      shutdown: CancellationToken::new(),
    })
  }

  /// Acquires the advisory lock for `(provider_id, instance_id)`,
  /// serializing workers targeting the same instance (§5 ordering
  /// guarantees). The returned guard releases on drop.
  pub async fn lock_instance(
    &self,
    provider_id: Uuid,
    instance_id: Uuid,
  ) -> tokio::sync::OwnedMutexGuard<()> {
    let lock = self
      .instance_locks
      .get_or_insert_default(&(provider_id, instance_id))
      .await;
    lock.lock_owned().await
  }

  /// Registers a fresh cancellation context for `task_id`, a child of
  /// `shutdown` so process shutdown still cancels it. Call
  /// `end_task(task_id)` once the task reaches a terminal state.
  pub async fn begin_task(&self, task_id: Uuid) -> CancellationToken {
    let token = self.shutdown.child_token();
    self.cancel_tokens.insert(task_id, token.clone()).await;
    token
  }

  pub async fn end_task(&self, task_id: Uuid) {
    self.cancel_tokens.remove(&task_id).await;
  }

  /// Cancels a single in-flight task without affecting any other
  /// worker. Returns `false` if the task isn't currently registered
  /// (not running, or already finished).
  pub async fn force_stop(&self, task_id: Uuid) -> bool {
    match self.cancel_tokens.get(&task_id).await {
      Some(token) => {
        token.cancel();
        true
      }
      None => false,
    }
  }
}
