use crate::config::Config;
use crate::cursor::Cursor;
use crate::error::{Result, SyncError};
use crate::models::{Channel, Message, NewSummary, Server, Summary, SummaryPayload};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info};

pub mod schema;

/// Restricts a purge to one channel.
pub type ChannelScope<'a> = Option<(&'a str, &'a str)>;

#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl ToSql for Cursor {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = i64::try_from(self.get())
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        Ok(ToSqlOutput::from(value))
    }
}

impl FromSql for Cursor {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let raw = i64::column_result(value)?;
        u64::try_from(raw)
            .map(Cursor::new)
            .map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

fn to_ms(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn message_from_row(row: &Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        server_id: row.get(1)?,
        channel_id: row.get(2)?,
        author_id: row.get(3)?,
        author: row.get(4)?,
        is_bot: row.get(5)?,
        content: row.get(6)?,
        reply_to_id: row.get(7)?,
        timestamp: from_ms(row.get(8)?),
    })
}

fn summary_from_row(row: &Row<'_>) -> rusqlite::Result<Summary> {
    let text: String = row.get(3)?;
    let num_messages: i64 = row.get(4)?;
    Ok(Summary {
        id: row.get(0)?,
        server_id: row.get(1)?,
        channel_id: row.get(2)?,
        summary: SummaryPayload::parse(&text),
        num_messages: num_messages.max(0) as usize,
        from_timestamp: from_ms(row.get(5)?),
        to_timestamp: from_ms(row.get(6)?),
    })
}

const MESSAGE_COLUMNS: &str =
    "id, server_id, channel_id, author_id, author, is_bot, content, reply_to_id, timestamp";
const SUMMARY_COLUMNS: &str =
    "id, server_id, channel_id, summary, num_messages, from_timestamp, to_timestamp";

impl Database {
    pub fn new(config: &Config) -> Result<Self> {
        Self::open(&config.database_url)
    }

    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && path != ":memory:" {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SyncError::Config(format!("cannot create {}: {}", parent.display(), e)))?;
            }
        }
        let conn = Connection::open(path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn execute_init(&self) -> Result<()> {
        info!("Database: Initializing schema...");
        let conn = self.conn()?;
        conn.execute_batch(schema::SCHEMA)?;
        debug!("Database: Schema initialized successfully");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Task("database connection mutex poisoned".to_string()))
    }

    /// Runs a store call on the blocking pool so SQLite work never stalls the runtime.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }

    // --- Servers ---

    /// Delete-all then bulk-insert, in one transaction.
    pub fn replace_servers(&self, servers: &[Server]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = to_ms(Utc::now());
        tx.execute("DELETE FROM servers", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO servers (id, name, synced_at) VALUES (?1, ?2, ?3)",
            )?;
            for server in servers {
                stmt.execute((&server.id, &server.name, now))?;
            }
        }
        tx.commit()?;
        debug!("Database: Replaced server list with {} servers", servers.len());
        Ok(servers.len())
    }

    pub fn list_servers(&self) -> Result<Vec<Server>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name FROM servers ORDER BY name, id")?;
        let rows = stmt.query_map([], |row| {
            Ok(Server {
                id: row.get(0)?,
                name: row.get(1)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn get_server(&self, server_id: &str) -> Result<Option<Server>> {
        let conn = self.conn()?;
        let server = conn
            .query_row(
                "SELECT id, name FROM servers WHERE id = ?1",
                [server_id],
                |row| {
                    Ok(Server {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(server)
    }

    pub fn last_server_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let latest: Option<i64> =
            conn.query_row("SELECT MAX(synced_at) FROM servers", [], |row| row.get(0))?;
        Ok(latest.map(from_ms))
    }

    // --- Channels ---

    /// Update-if-exists else insert, keyed by channel id.
    pub fn upsert_channel(&self, channel: &Channel) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO channels (id, server_id, name, synced_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET server_id = excluded.server_id, name = excluded.name,
                synced_at = excluded.synced_at",
            (&channel.id, &channel.server_id, &channel.name, to_ms(Utc::now())),
        )?;
        Ok(())
    }

    pub fn upsert_channels(&self, channels: &[Channel]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = to_ms(Utc::now());
        {
            let mut stmt = tx.prepare(
                "INSERT INTO channels (id, server_id, name, synced_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET server_id = excluded.server_id, name = excluded.name,
                    synced_at = excluded.synced_at",
            )?;
            for channel in channels {
                stmt.execute((&channel.id, &channel.server_id, &channel.name, now))?;
            }
        }
        tx.commit()?;
        Ok(channels.len())
    }

    /// Destructive per-server resync: drops the server's channels, then bulk-inserts.
    pub fn replace_channels(&self, server_id: &str, channels: &[Channel]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let now = to_ms(Utc::now());
        tx.execute("DELETE FROM channels WHERE server_id = ?1", [server_id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO channels (id, server_id, name, synced_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            for channel in channels {
                stmt.execute((&channel.id, server_id, &channel.name, now))?;
            }
        }
        tx.commit()?;
        Ok(channels.len())
    }

    pub fn get_channel(&self, server_id: &str, channel_id: &str) -> Result<Option<Channel>> {
        let conn = self.conn()?;
        let channel = conn
            .query_row(
                "SELECT id, server_id, name FROM channels WHERE id = ?1 AND server_id = ?2",
                [channel_id, server_id],
                |row| {
                    Ok(Channel {
                        id: row.get(0)?,
                        server_id: row.get(1)?,
                        name: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(channel)
    }

    /// Channels, optionally narrowed to one server and/or one channel id.
    pub fn list_channels(
        &self,
        server_id: Option<&str>,
        channel_id: Option<&str>,
    ) -> Result<Vec<Channel>> {
        let conn = self.conn()?;
        let mut sql = String::from("SELECT id, server_id, name FROM channels WHERE 1 = 1");
        let mut params: Vec<Box<dyn ToSql>> = Vec::new();

        if let Some(server_id) = server_id {
            sql.push_str(" AND server_id = ?");
            params.push(Box::new(server_id.to_string()));
        }
        if let Some(channel_id) = channel_id {
            sql.push_str(" AND id = ?");
            params.push(Box::new(channel_id.to_string()));
        }
        sql.push_str(" ORDER BY server_id, name, id");

        let mut stmt = conn.prepare(&sql)?;
        let params_slice: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(&params_slice[..], |row| {
            Ok(Channel {
                id: row.get(0)?,
                server_id: row.get(1)?,
                name: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn last_channel_sync(&self, server_id: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let latest: Option<i64> = conn.query_row(
            "SELECT MAX(synced_at) FROM channels WHERE server_id = ?1",
            [server_id],
            |row| row.get(0),
        )?;
        Ok(latest.map(from_ms))
    }

    // --- Messages ---

    /// Idempotent by id: a re-scraped message overwrites the stored row.
    pub fn upsert_message(&self, message: &Message) -> Result<()> {
        let conn = self.conn()?;
        Self::upsert_message_with(&conn, message)?;
        Ok(())
    }

    pub fn upsert_messages(&self, messages: &[Message]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        for message in messages {
            Self::upsert_message_with(&tx, message)?;
        }
        tx.commit()?;
        Ok(messages.len())
    }

    fn upsert_message_with(conn: &Connection, message: &Message) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO messages (id, server_id, channel_id, author_id, author, is_bot, content, reply_to_id, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                server_id = excluded.server_id,
                channel_id = excluded.channel_id,
                author_id = excluded.author_id,
                author = excluded.author,
                is_bot = excluded.is_bot,
                content = excluded.content,
                reply_to_id = excluded.reply_to_id,
                timestamp = excluded.timestamp",
            (
                message.id,
                &message.server_id,
                &message.channel_id,
                &message.author_id,
                &message.author,
                message.is_bot,
                &message.content,
                message.reply_to_id,
                to_ms(message.timestamp),
            ),
        )
    }

    pub fn latest_message_id(&self, server_id: &str, channel_id: &str) -> Result<Option<Cursor>> {
        let conn = self.conn()?;
        let latest: Option<Cursor> = conn.query_row(
            "SELECT MAX(id) FROM messages WHERE server_id = ?1 AND channel_id = ?2",
            [server_id, channel_id],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    /// Non-bot messages with `id >= from`, ascending, at most `limit` rows.
    pub fn messages_from(
        &self,
        server_id: &str,
        channel_id: &str,
        from: Cursor,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE server_id = ?1 AND channel_id = ?2 AND id >= ?3 AND is_bot = 0
             ORDER BY id ASC LIMIT ?4"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            (server_id, channel_id, from, limit as i64),
            message_from_row,
        )?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn list_messages(&self, server_id: &str, channel_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE server_id = ?1 AND channel_id = ?2 ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map([server_id, channel_id], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Deletes messages with `timestamp < cutoff`. Returns the number deleted.
    pub fn delete_messages_before(&self, cutoff: DateTime<Utc>, scope: ChannelScope<'_>) -> Result<usize> {
        let conn = self.conn()?;
        let count = match scope {
            Some((server_id, channel_id)) => conn.execute(
                "DELETE FROM messages WHERE server_id = ?1 AND channel_id = ?2 AND timestamp < ?3",
                (server_id, channel_id, to_ms(cutoff)),
            )?,
            None => conn.execute(
                "DELETE FROM messages WHERE timestamp < ?1",
                (to_ms(cutoff),),
            )?,
        };
        Ok(count)
    }

    // --- Summaries ---

    /// Most recent row for a channel, by window end.
    pub fn latest_summary(&self, server_id: &str, channel_id: &str) -> Result<Option<Summary>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries
             WHERE server_id = ?1 AND channel_id = ?2
             ORDER BY to_timestamp DESC, id DESC LIMIT 1"
        );
        let summary = conn
            .query_row(&sql, [server_id, channel_id], summary_from_row)
            .optional()?;
        Ok(summary)
    }

    pub fn insert_summary(&self, summary: &NewSummary) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO summaries (server_id, channel_id, summary, num_messages, from_timestamp, to_timestamp, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            (
                &summary.server_id,
                &summary.channel_id,
                summary.summary.to_stored_text(),
                summary.num_messages as i64,
                to_ms(summary.from_timestamp),
                to_ms(summary.to_timestamp),
                to_ms(Utc::now()),
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn update_summary(&self, id: i64, summary: &NewSummary) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE summaries SET summary = ?1, num_messages = ?2, from_timestamp = ?3,
                to_timestamp = ?4, updated_at = ?5
             WHERE id = ?6",
            (
                summary.summary.to_stored_text(),
                summary.num_messages as i64,
                to_ms(summary.from_timestamp),
                to_ms(summary.to_timestamp),
                to_ms(Utc::now()),
                id,
            ),
        )?;
        if updated == 0 {
            return Err(SyncError::NotFound(format!("summary {}", id)));
        }
        Ok(())
    }

    /// Deletes summaries whose window ended before `cutoff`.
    pub fn delete_summaries_before(&self, cutoff: DateTime<Utc>, scope: ChannelScope<'_>) -> Result<usize> {
        let conn = self.conn()?;
        let count = match scope {
            Some((server_id, channel_id)) => conn.execute(
                "DELETE FROM summaries WHERE server_id = ?1 AND channel_id = ?2 AND to_timestamp < ?3",
                (server_id, channel_id, to_ms(cutoff)),
            )?,
            None => conn.execute(
                "DELETE FROM summaries WHERE to_timestamp < ?1",
                (to_ms(cutoff),),
            )?,
        };
        Ok(count)
    }

    /// Summaries of a server whose window ends at or after `since`, ascending by window end.
    pub fn list_summaries(
        &self,
        server_id: &str,
        channel_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Summary>> {
        let conn = self.conn()?;
        let mut sql = format!(
            "SELECT {SUMMARY_COLUMNS} FROM summaries WHERE server_id = ? AND to_timestamp >= ?"
        );
        let mut params: Vec<Box<dyn ToSql>> =
            vec![Box::new(server_id.to_string()), Box::new(to_ms(since))];
        if let Some(channel_id) = channel_id {
            sql.push_str(" AND channel_id = ?");
            params.push(Box::new(channel_id.to_string()));
        }
        sql.push_str(" ORDER BY to_timestamp ASC, id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let params_slice: Vec<&dyn ToSql> = params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(&params_slice[..], summary_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Topic;
    use crate::testing::message_at;
    use chrono::Duration;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.execute_init().unwrap();
        db
    }

    #[test]
    fn test_message_upsert_is_idempotent() {
        let db = test_db();
        let t = Utc::now() - Duration::minutes(5);
        let mut msg = message_at("s1", "c1", t, "first draft");

        db.upsert_message(&msg).unwrap();
        msg.content = "edited".to_string();
        db.upsert_message(&msg).unwrap();

        let stored = db.list_messages("s1", "c1").unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "edited");
        assert_eq!(stored[0].id, msg.id);
        assert_eq!(stored[0].timestamp.timestamp_millis(), t.timestamp_millis());
    }

    #[test]
    fn test_replace_servers() {
        let db = test_db();
        assert!(db.last_server_sync().unwrap().is_none());

        db.replace_servers(&[
            Server { id: "s1".into(), name: "alpha".into() },
            Server { id: "s2".into(), name: "beta".into() },
        ])
        .unwrap();
        db.replace_servers(&[Server { id: "s3".into(), name: "gamma".into() }]).unwrap();

        let servers = db.list_servers().unwrap();
        assert_eq!(servers, vec![Server { id: "s3".into(), name: "gamma".into() }]);
        assert!(db.last_server_sync().unwrap().is_some());
        assert!(db.get_server("s1").unwrap().is_none());
    }

    #[test]
    fn test_channel_merge_and_replace() {
        let db = test_db();
        db.upsert_channel(&Channel { id: "c1".into(), server_id: "s1".into(), name: "general".into() }).unwrap();
        db.upsert_channel(&Channel { id: "c1".into(), server_id: "s1".into(), name: "general-chat".into() }).unwrap();
        db.upsert_channel(&Channel { id: "c2".into(), server_id: "s1".into(), name: "random".into() }).unwrap();

        let channels = db.list_channels(Some("s1"), None).unwrap();
        assert_eq!(channels.len(), 2);
        assert_eq!(db.get_channel("s1", "c1").unwrap().unwrap().name, "general-chat");

        db.replace_channels("s1", &[Channel { id: "c3".into(), server_id: "s1".into(), name: "news".into() }]).unwrap();
        let channels = db.list_channels(Some("s1"), None).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(channels[0].id, "c3");
        assert_eq!(db.list_channels(Some("s1"), Some("c3")).unwrap().len(), 1);
        assert!(db.list_channels(None, Some("c1")).unwrap().is_empty());
    }

    #[test]
    fn test_messages_from_skips_bots_and_orders() {
        let db = test_db();
        let base = Utc::now() - Duration::hours(2);
        let mut msgs: Vec<Message> = (0..5)
            .map(|i| message_at("s1", "c1", base + Duration::minutes(i), &format!("m{}", i)))
            .collect();
        msgs[2].is_bot = true;
        // Insert out of order
        msgs.reverse();
        db.upsert_messages(&msgs).unwrap();

        let from = Cursor::from_time(base + Duration::minutes(1));
        let found = db.messages_from("s1", "c1", from, 10).unwrap();
        let contents: Vec<_> = found.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m1", "m3", "m4"]);

        let limited = db.messages_from("s1", "c1", Cursor::new(0), 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(db.latest_message_id("s1", "c1").unwrap(), Some(msgs[0].id));
        assert_eq!(db.latest_message_id("s1", "other").unwrap(), None);
    }

    #[test]
    fn test_retention_purge() {
        let db = test_db();
        let now = Utc::now();
        let cutoff = now - Duration::days(3);
        db.upsert_message(&message_at("s1", "c1", now - Duration::days(4), "old")).unwrap();
        db.upsert_message(&message_at("s1", "c2", now - Duration::days(4) - Duration::minutes(1), "old elsewhere")).unwrap();
        db.upsert_message(&message_at("s1", "c1", now - Duration::hours(1), "new")).unwrap();

        let window = |from: DateTime<Utc>, to: DateTime<Utc>| NewSummary {
            server_id: "s1".into(),
            channel_id: "c1".into(),
            summary: SummaryPayload::Raw("x".into()),
            num_messages: 20,
            from_timestamp: from,
            to_timestamp: to,
        };
        db.insert_summary(&window(now - Duration::days(5), now - Duration::days(4))).unwrap();
        // Straddles the cutoff: still partly inside the window, so it stays.
        db.insert_summary(&window(now - Duration::days(4), now - Duration::days(2))).unwrap();

        assert_eq!(db.delete_messages_before(cutoff, Some(("s1", "c1"))).unwrap(), 1);
        assert_eq!(db.delete_messages_before(cutoff, None).unwrap(), 1);
        assert_eq!(db.delete_summaries_before(cutoff, None).unwrap(), 1);

        assert_eq!(db.list_messages("s1", "c1").unwrap().len(), 1);
        let remaining = db.list_summaries("s1", None, cutoff).unwrap();
        assert_eq!(remaining.len(), 1);
        assert!(remaining[0].to_timestamp >= cutoff);
    }

    #[test]
    fn test_summary_insert_update_latest() {
        let db = test_db();
        let now = Utc::now();
        let mut window = NewSummary {
            server_id: "s1".into(),
            channel_id: "c1".into(),
            summary: SummaryPayload::Structured(vec![Topic {
                topic: "launch".into(),
                creator: "ana".into(),
                top_active_users: vec!["ana".into()],
                number_of_messages: 14,
                number_of_users: 1,
                summary: "dates agreed".into(),
            }]),
            num_messages: 14,
            from_timestamp: now - Duration::hours(3),
            to_timestamp: now - Duration::hours(2),
        };
        let id = db.insert_summary(&window).unwrap();

        window.num_messages = 30;
        window.to_timestamp = now - Duration::hours(1);
        db.update_summary(id, &window).unwrap();

        let latest = db.latest_summary("s1", "c1").unwrap().unwrap();
        assert_eq!(latest.id, id);
        assert_eq!(latest.num_messages, 30);
        assert_eq!(latest.summary, window.summary);
        assert!(matches!(db.update_summary(id + 100, &window), Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_run_blocking() {
        let db = test_db();
        db.run_blocking(|db| {
            db.upsert_channel(&Channel { id: "c1".into(), server_id: "s1".into(), name: "general".into() })
        })
        .await
        .unwrap();
        let channels = db.run_blocking(|db| db.list_channels(None, None)).await.unwrap();
        assert_eq!(channels.len(), 1);
    }
}
