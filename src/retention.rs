use crate::config::Config;
use crate::engine::Engine;
use crate::error::{Result, SyncError};
use crate::sync::ChannelSyncMode;
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{sleep, Duration};
use tracing::{debug, error, info, warn};

/// Counters from one pass, for logs and tests.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleStats {
    pub purged_summaries: usize,
    pub purged_messages: usize,
    /// Watched servers whose summarization ran, scraped or not.
    pub servers: usize,
    pub failed_phases: usize,
}

/// Background loop: purge expired rows, then sync and summarize every
/// watched server, then sleep. A failing phase is logged and the loop goes on.
pub struct RetentionJob {
    engine: Arc<Engine>,
    poll_interval: Duration,
}

impl RetentionJob {
    pub fn new(engine: Arc<Engine>, config: &Config) -> Self {
        Self {
            engine,
            poll_interval: config.poll_interval,
        }
    }

    pub async fn run(self) {
        info!("Retention job started, polling every {:?}", self.poll_interval);
        loop {
            let stats = self.run_cycle().await;
            info!(
                "Retention cycle finished: {} summaries and {} messages purged, {} servers refreshed, {} failed phases",
                stats.purged_summaries, stats.purged_messages, stats.servers, stats.failed_phases
            );
            sleep(self.poll_interval).await;
        }
    }

    pub async fn run_cycle(&self) -> CycleStats {
        let mut stats = CycleStats::default();
        let engine = &self.engine;
        let cutoff = Utc::now() - engine.config().retention();

        match engine
            .db()
            .run_blocking(move |db| db.delete_summaries_before(cutoff, None))
            .await
        {
            Ok(count) => stats.purged_summaries = count,
            Err(e) => self.phase_failed(&mut stats, "summary purge", &e),
        }
        match engine
            .db()
            .run_blocking(move |db| db.delete_messages_before(cutoff, None))
            .await
        {
            Ok(count) => stats.purged_messages = count,
            Err(e) => self.phase_failed(&mut stats, "message purge", &e),
        }

        // Scraping stops for the rest of the cycle once the session is logged
        // out; summarizing stored messages does not need the session.
        let mut scraping = true;
        if let Err(e) = self.sync_servers_if_stale().await {
            self.phase_failed(&mut stats, "server sync", &e);
            scraping = !e.is_fatal();
        }

        let servers = match engine.db().run_blocking(|db| db.list_servers()).await {
            Ok(servers) => servers,
            Err(e) => {
                self.phase_failed(&mut stats, "server listing", &e);
                return stats;
            }
        };

        for server in servers.iter().filter(|s| engine.config().is_watched(&s.id)) {
            debug!("Retention: refreshing server {} ({})", server.name, server.id);
            if scraping {
                if let Err(e) = self.sync_server(&server.id).await {
                    self.phase_failed(&mut stats, &format!("sync of server {}", server.id), &e);
                    scraping = !e.is_fatal();
                }
            }
            match engine
                .summarizer()
                .summarize_all_channels(Some(&server.id), None)
                .await
            {
                Ok(report) => {
                    if !report.failures.is_empty() {
                        warn!(
                            "Retention: {} channels of server {} failed to summarize",
                            report.failures.len(),
                            server.id
                        );
                    }
                    stats.servers += 1;
                }
                Err(e) => self.phase_failed(&mut stats, &format!("summaries of server {}", server.id), &e),
            }
        }
        stats
    }

    async fn sync_servers_if_stale(&self) -> Result<()> {
        let sync = self.engine.sync();
        if sync.needs_server_sync().await? {
            sync.sync_servers().await?;
        }
        Ok(())
    }

    async fn sync_server(&self, server_id: &str) -> Result<()> {
        let sync = self.engine.sync();
        if sync.needs_channel_sync(server_id).await? {
            sync.sync_channels(server_id, ChannelSyncMode::Merge).await?;
        }
        let report = sync.sync_messages_for_server(server_id, None).await?;
        if !report.failures.is_empty() {
            warn!(
                "Retention: {} channels of server {} failed to sync",
                report.failures.len(),
                server_id
            );
        }
        Ok(())
    }

    fn phase_failed(&self, stats: &mut CycleStats, phase: &str, e: &SyncError) {
        stats.failed_phases += 1;
        error!("Retention: {} failed: {}", phase, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::db::Database;
    use crate::models::{Channel, NewSummary, Server, SummaryPayload};
    use crate::testing::{message_at, FakeGenerator, FakePlatform};
    use chrono::Duration as ChronoDuration;

    fn job(platform: &FakePlatform, config: &Config) -> (Database, RetentionJob) {
        let db = Database::open_in_memory().unwrap();
        db.execute_init().unwrap();
        let engine = Engine::new(
            config,
            db.clone(),
            Arc::new(platform.clone()),
            Arc::new(FakeGenerator::topics()),
        );
        (db, RetentionJob::new(Arc::new(engine), config))
    }

    #[tokio::test]
    async fn test_cycle_purges_expired_rows() {
        let platform = FakePlatform::new();
        let (db, job) = job(&platform, &test_config());
        let old = Utc::now() - ChronoDuration::days(4);
        let fresh = Utc::now() - ChronoDuration::hours(1);
        db.upsert_messages(&[
            message_at("s1", "c1", old, "expired"),
            message_at("s1", "c1", fresh, "kept"),
        ])
        .unwrap();
        db.insert_summary(&NewSummary {
            server_id: "s1".into(),
            channel_id: "c1".into(),
            summary: SummaryPayload::Raw("old talk".into()),
            num_messages: 12,
            from_timestamp: old - ChronoDuration::hours(1),
            to_timestamp: old,
        })
        .unwrap();

        let stats = job.run_cycle().await;

        assert_eq!(stats.purged_messages, 1);
        assert_eq!(stats.purged_summaries, 1);
        let left = db.list_messages("s1", "c1").unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].content, "kept");
    }

    #[tokio::test]
    async fn test_cycle_refreshes_watched_servers_only() {
        let platform = FakePlatform::new();
        platform.set_servers(&[("s1", "watched"), ("s2", "ignored")]);
        platform.set_channels("s1", &[("c1", "general")]);
        platform.set_channels("s2", &[("c9", "general")]);
        let end = Utc::now() - ChronoDuration::minutes(1);
        platform.set_messages(
            "s1",
            "c1",
            (0..12)
                .map(|i| message_at("s1", "c1", end - ChronoDuration::seconds(i), "hi"))
                .collect(),
        );
        let mut config = test_config();
        config.watched_servers = vec!["s1".to_string()];
        let (db, job) = job(&platform, &config);

        let stats = job.run_cycle().await;

        assert_eq!(stats.servers, 1);
        assert_eq!(stats.failed_phases, 0);
        assert_eq!(platform.calls("list_channels"), 1);
        assert_eq!(db.list_messages("s1", "c1").unwrap().len(), 12);
        assert_eq!(
            db.list_summaries("s1", Some("c1"), Utc::now() - ChronoDuration::days(1))
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_logged_out_session_still_summarizes_stored_messages() {
        let platform = FakePlatform::new();
        platform.set_auth_failed(true);
        let (db, job) = job(&platform, &test_config());
        db.replace_servers(&[
            Server { id: "s1".into(), name: "alpha".into() },
            Server { id: "s2".into(), name: "beta".into() },
        ])
        .unwrap();
        let end = Utc::now() - ChronoDuration::minutes(1);
        for (n, (server, channel)) in [("s1", "c1"), ("s2", "c2")].into_iter().enumerate() {
            db.upsert_channel(&Channel { id: channel.into(), server_id: server.into(), name: "general".into() })
                .unwrap();
            let messages: Vec<_> = (0..15)
                .map(|i| message_at(server, channel, end - ChronoDuration::seconds(100 * n as i64 + i), "stored"))
                .collect();
            db.upsert_messages(&messages).unwrap();
        }

        let stats = job.run_cycle().await;

        assert_eq!(stats.failed_phases, 1);
        assert_eq!(stats.servers, 2);
        assert_eq!(platform.calls("list_messages"), 1);
        let since = Utc::now() - ChronoDuration::days(1);
        assert_eq!(db.list_summaries("s1", Some("c1"), since).unwrap().len(), 1);
        assert_eq!(db.list_summaries("s2", Some("c2"), since).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cycle_survives_auth_failure() {
        let platform = FakePlatform::new();
        platform.set_auth_failed(true);
        let (_db, job) = job(&platform, &test_config());

        let stats = job.run_cycle().await;
        assert_eq!(stats.failed_phases, 1);
        assert_eq!(stats.servers, 0);

        platform.set_auth_failed(false);
        platform.set_servers(&[("s1", "back")]);
        platform.set_channels("s1", &[]);
        let stats = job.run_cycle().await;
        assert_eq!(stats.failed_phases, 0);
        assert_eq!(stats.servers, 1);
    }
}
