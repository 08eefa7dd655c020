//! Sync Orchestrator: the only path from the chat platform into the store.
//!
//! Every operation that touches the shared session holds one process-wide
//! mutex for its whole duration, so two scrapes never navigate at once.
//! Crawler calls run under the [`RetryPolicy`]; store writes are upserts keyed
//! by id, which keeps a retried or overlapping sync idempotent.

use crate::config::Config;
use crate::cursor::Cursor;
use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::locks::ChannelLocks;
use crate::platform::ChatPlatform;
use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ChannelSyncMode {
    /// Update-if-exists else insert; channels missing from the scrape survive.
    #[default]
    Merge,
    /// Delete the server's channels, then bulk-insert the scrape.
    Replace,
}

/// Outcome of a fan-out over several channels.
#[derive(Debug, Default)]
pub struct ChannelReport {
    pub total: usize,
    pub failures: Vec<(String, SyncError)>,
}

impl ChannelReport {
    pub fn succeeded(&self) -> usize {
        self.total - self.failures.len()
    }

    /// Turns any per-channel failure into [`SyncError::PartialSync`].
    pub fn ensure_complete(&self) -> Result<()> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(SyncError::PartialSync {
                failed: self.failures.len(),
                total: self.total,
            })
        }
    }
}

pub struct SyncOrchestrator {
    platform: Arc<dyn ChatPlatform>,
    db: Database,
    locks: ChannelLocks,
    session_lock: Mutex<()>,
    retry: RetryPolicy,
    retention: Duration,
    stale_after: Duration,
}

impl SyncOrchestrator {
    pub fn new(platform: Arc<dyn ChatPlatform>, db: Database, locks: ChannelLocks, config: &Config) -> Self {
        Self {
            platform,
            db,
            locks,
            session_lock: Mutex::new(()),
            retry: RetryPolicy::from_config(config),
            retention: config.retention_window,
            stale_after: config.stale_after,
        }
    }

    fn horizon(&self) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::from_std(self.retention).unwrap_or_else(|_| chrono::Duration::days(3))
    }

    fn is_stale(&self, last: Option<DateTime<Utc>>) -> bool {
        match last {
            None => true,
            Some(at) => {
                let stale = chrono::Duration::from_std(self.stale_after).unwrap_or_else(|_| chrono::Duration::hours(1));
                at < Utc::now() - stale
            }
        }
    }

    /// Checks the session is logged in, re-probing once through the login page.
    pub async fn authenticate(&self) -> Result<()> {
        let _session = self.session_lock.lock().await;
        self.platform.authenticate().await
    }

    /// Scrapes the server list and replaces the stored one wholesale.
    pub async fn sync_servers(&self) -> Result<usize> {
        let _session = self.session_lock.lock().await;
        info!("Sync: syncing servers");

        let servers = self
            .retry
            .run("list servers", || self.platform.list_servers())
            .await?;
        let count = self
            .db
            .run_blocking(move |db| db.replace_servers(&servers))
            .await?;

        info!("Sync: stored {} servers", count);
        Ok(count)
    }

    pub async fn sync_channels(&self, server_id: &str, mode: ChannelSyncMode) -> Result<usize> {
        let _session = self.session_lock.lock().await;
        let id = server_id.to_string();
        if self.db.run_blocking(move |db| db.get_server(&id)).await?.is_none() {
            return Err(SyncError::NotFound(format!("server {}", server_id)));
        }
        info!("Sync: syncing channels for server {} ({:?})", server_id, mode);

        let channels = self
            .retry
            .run("list channels", || self.platform.list_channels(server_id))
            .await?;
        let id = server_id.to_string();
        let count = self
            .db
            .run_blocking(move |db| match mode {
                ChannelSyncMode::Merge => db.upsert_channels(&channels),
                ChannelSyncMode::Replace => db.replace_channels(&id, &channels),
            })
            .await?;

        info!("Sync: stored {} channels for server {}", count, server_id);
        Ok(count)
    }

    /// Purges expired messages, then fetches everything newer than the newest
    /// stored id (or the retention horizon for an empty channel).
    pub async fn sync_messages(&self, server_id: &str, channel_id: &str) -> Result<usize> {
        let _session = self.session_lock.lock().await;
        let (server, channel) = (server_id.to_string(), channel_id.to_string());
        let known = self
            .db
            .run_blocking(move |db| db.get_channel(&server, &channel))
            .await?;
        if known.is_none() {
            return Err(SyncError::NotFound(format!("channel {} in server {}", channel_id, server_id)));
        }

        let horizon = self.horizon();
        let since = {
            let _channel = self.locks.lock(server_id, channel_id).await;
            let (server, channel) = (server_id.to_string(), channel_id.to_string());
            self.db
                .run_blocking(move |db| {
                    let purged = db.delete_messages_before(horizon, Some((&server, &channel)))?;
                    if purged > 0 {
                        info!("Sync: purged {} expired messages from channel {}", purged, channel);
                    }
                    db.latest_message_id(&server, &channel)
                })
                .await?
                .unwrap_or_else(|| Cursor::from_time(horizon))
        };

        let messages = self
            .retry
            .run("list messages", || {
                self.platform
                    .list_messages(server_id, channel_id, since, self.retention)
            })
            .await?;

        let _channel = self.locks.lock(server_id, channel_id).await;
        let count = self
            .db
            .run_blocking(move |db| db.upsert_messages(&messages))
            .await?;

        info!("Sync: stored {} messages for channel {} since {}", count, channel_id, since);
        Ok(count)
    }

    /// Syncs one channel or every stored channel of a server. A failing channel
    /// is logged and skipped; only an authentication failure aborts the rest.
    pub async fn sync_messages_for_server(&self, server_id: &str, channel_id: Option<&str>) -> Result<ChannelReport> {
        let (server, channel) = (server_id.to_string(), channel_id.map(str::to_string));
        let channels = self
            .db
            .run_blocking(move |db| db.list_channels(Some(&server), channel.as_deref()))
            .await?;
        if let (Some(channel_id), true) = (channel_id, channels.is_empty()) {
            return Err(SyncError::NotFound(format!("channel {} in server {}", channel_id, server_id)));
        }

        info!("Sync: syncing messages for {} channels of server {}", channels.len(), server_id);
        let mut report = ChannelReport {
            total: channels.len(),
            ..Default::default()
        };
        for channel in channels {
            match self.sync_messages(server_id, &channel.id).await {
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!("Sync: cannot sync channel {} ({}): {}", channel.name, channel.id, e);
                    report.failures.push((channel.id, e));
                }
            }
        }

        info!(
            "Sync: server {} done, {}/{} channels synced",
            server_id,
            report.succeeded(),
            report.total
        );
        Ok(report)
    }

    /// Posts through the shared session. Not retried: a repeat could post twice.
    pub async fn post_message(&self, server_id: &str, channel_id: &str, content: &str) -> Result<()> {
        let _session = self.session_lock.lock().await;
        self.platform.post_message(server_id, channel_id, content).await
    }

    pub async fn needs_server_sync(&self) -> Result<bool> {
        let last = self.db.run_blocking(|db| db.last_server_sync()).await?;
        Ok(self.is_stale(last))
    }

    pub async fn needs_channel_sync(&self, server_id: &str) -> Result<bool> {
        let id = server_id.to_string();
        let last = self.db.run_blocking(move |db| db.last_channel_sync(&id)).await?;
        Ok(self.is_stale(last))
    }
}
