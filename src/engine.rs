//! The explicitly constructed engine: one store, one orchestrator (and with it
//! the one session), one summarizer, shared by the background job and by
//! on-demand callers.

use crate::config::Config;
use crate::db::Database;
use crate::error::Result;
use crate::llm::TextGenerator;
use crate::locks::ChannelLocks;
use crate::models::{Channel, Summary};
use crate::platform::ChatPlatform;
use crate::summarize::{SummarizationManager, SummarizerOptions};
use crate::sync::{ChannelReport, ChannelSyncMode, SyncOrchestrator};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// What on-demand callers get back for a server: its channels and every
/// summary still inside the retention window, oldest window end first.
#[derive(Debug, Serialize)]
pub struct ChannelDigest {
    pub server_id: String,
    pub channels: Vec<Channel>,
    pub summaries: Vec<Summary>,
    /// Channels whose refresh failed; their summaries may be stale.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed_channels: Vec<String>,
}

pub struct Engine {
    config: Config,
    db: Database,
    sync: SyncOrchestrator,
    summarizer: SummarizationManager,
}

impl Engine {
    pub fn new(
        config: &Config,
        db: Database,
        platform: Arc<dyn ChatPlatform>,
        llm: Arc<dyn TextGenerator>,
    ) -> Self {
        let locks = ChannelLocks::new();
        Self {
            config: config.clone(),
            sync: SyncOrchestrator::new(platform, db.clone(), locks.clone(), config),
            summarizer: SummarizationManager::new(
                db.clone(),
                llm,
                locks,
                SummarizerOptions::from_config(config),
            ),
            db,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn sync(&self) -> &SyncOrchestrator {
        &self.sync
    }

    pub fn summarizer(&self) -> &SummarizationManager {
        &self.summarizer
    }

    /// Staleness-gated server and channel sync, then message sync and
    /// summarization for the server (or one of its channels).
    pub async fn refresh(&self, server_id: &str, channel_id: Option<&str>) -> Result<ChannelReport> {
        if self.sync.needs_server_sync().await? {
            self.sync.sync_servers().await?;
        }
        if self.sync.needs_channel_sync(server_id).await? {
            self.sync.sync_channels(server_id, ChannelSyncMode::Merge).await?;
        }

        let report = self.sync.sync_messages_for_server(server_id, channel_id).await?;
        let summarized = self
            .summarizer
            .summarize_all_channels(Some(server_id), channel_id)
            .await?;

        let mut combined = report;
        for (channel, e) in summarized.failures {
            if !combined.failures.iter().any(|(failed, _)| failed == &channel) {
                combined.failures.push((channel, e));
            }
        }
        Ok(combined)
    }

    pub async fn channel_digest(&self, server_id: &str, channel_id: Option<&str>) -> Result<ChannelDigest> {
        let report = self.refresh(server_id, channel_id).await?;
        if let Err(e) = report.ensure_complete() {
            warn!("Engine: digest for server {} served with stale channels: {}", server_id, e);
        }

        let since = Utc::now() - self.config.retention();
        let (server, channel) = (server_id.to_string(), channel_id.map(str::to_string));
        let (channels, summaries) = self
            .db
            .run_blocking(move |db| {
                Ok((
                    db.list_channels(Some(&server), channel.as_deref())?,
                    db.list_summaries(&server, channel.as_deref(), since)?,
                ))
            })
            .await?;

        info!(
            "Engine: digest for server {} has {} channels and {} summaries",
            server_id,
            channels.len(),
            summaries.len()
        );
        Ok(ChannelDigest {
            server_id: server_id.to_string(),
            channels,
            summaries,
            failed_channels: report.failures.into_iter().map(|(channel, _)| channel).collect(),
        })
    }

    pub async fn post_message(&self, server_id: &str, channel_id: &str, content: &str) -> Result<()> {
        self.sync.post_message(server_id, channel_id, content).await
    }
}

/// Renders an on-demand result for a human or a tool: JSON on success,
/// `Error: <reason>` on failure.
pub fn user_facing<T: Serialize>(result: Result<T>) -> String {
    match result {
        Ok(value) => serde_json::to_string_pretty(&value)
            .unwrap_or_else(|e| format!("Error: cannot render result: {}", e)),
        Err(e) => e.user_message(),
    }
}
