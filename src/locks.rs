use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async lock per `(server_id, channel_id)`, shared by message sync and
/// summarization so their writes to the same channel never interleave.
#[derive(Clone, Default)]
pub struct ChannelLocks {
    locks: Arc<Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>>,
}

impl ChannelLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, server_id: &str, channel_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            locks
                .entry((server_id.to_string(), channel_id.to_string()))
                .or_default()
                .clone()
        };
        lock.lock_owned().await
    }
}
