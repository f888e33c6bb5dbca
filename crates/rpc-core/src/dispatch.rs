//! A bounded-concurrency worker pool keyed by client id. Each submitted task carries the
//! acknowledgment for the inbound message it is processing so callers never forget to ack.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

struct Pool {
    semaphore: Arc<Semaphore>,
    tasks: Vec<JoinHandle<()>>,
}

/// A process-wide collection of per-client-id worker pools.
pub struct DispatchRegistry {
    pools: Mutex<HashMap<String, Pool>>,
}

impl Default for DispatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DispatchRegistry {
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// Submits `task` (and always `ack` after it, success or failure) against the pool for
    /// `client_id`, creating the pool with `preferred_concurrency` if it does not exist yet.
    /// A nil `task` means "only ack": the call still waits for a free slot in the pool
    /// (preserving per-client ordering against other submissions) but runs nothing before
    /// acking, for callers that already produced their response synchronously.
    pub async fn submit<Fut>(
        &self,
        client_id: &str,
        preferred_concurrency: usize,
        task: Option<Fut>,
        ack: impl FnOnce() + Send + 'static,
    ) where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let semaphore = {
            let mut pools = self.pools.lock().await;
            let pool = pools.entry(client_id.to_string()).or_insert_with(|| Pool {
                semaphore: Arc::new(Semaphore::new(preferred_concurrency.max(1))),
                tasks: Vec::new(),
            });
            pool.tasks.retain(|handle| !handle.is_finished());
            Arc::clone(&pool.semaphore)
        };

        let boxed: Option<BoxFuture> = task.map(|task| Box::pin(task) as BoxFuture);
        let handle = tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore never closed");
            if let Some(boxed) = boxed {
                boxed.await;
            }
            ack();
        });

        let mut pools = self.pools.lock().await;
        if let Some(pool) = pools.get_mut(client_id) {
            pool.tasks.push(handle);
        }
    }

    /// Aborts every in-flight task for every client id. Used on process shutdown only;
    /// an executor's own `stop()` lets in-flight handlers drain instead.
    pub async fn abort_all(&self) {
        let mut pools = self.pools.lock().await;
        for pool in pools.values_mut() {
            for handle in pool.tasks.drain(..) {
                handle.abort();
            }
        }
    }
}
