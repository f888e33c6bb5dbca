//! The small owned service shared between an invoker and any executors that run in the
//! same process: a single authoritative hybrid logical clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::hlc::{HlcTimestamp, HybridLogicalClock, HlcError};

#[derive(Clone)]
pub struct AppContext {
    clock: Arc<Mutex<HybridLogicalClock>>,
}

impl AppContext {
    pub fn new(node_id: impl Into<String>, max_clock_drift: Duration) -> Self {
        Self {
            clock: Arc::new(Mutex::new(HybridLogicalClock::new(node_id, max_clock_drift))),
        }
    }

    pub async fn now(&self) -> HlcTimestamp {
        self.clock.lock().await.now()
    }

    pub async fn merge(&self, remote: &HlcTimestamp) -> Result<HlcTimestamp, HlcError> {
        self.clock.lock().await.merge(remote)
    }
}
