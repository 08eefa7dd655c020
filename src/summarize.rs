use crate::config::Config;
use crate::cursor::Cursor;
use crate::db::Database;
use crate::error::{Result, SyncError};
use crate::llm::{ChatTurn, TextGenerator};
use crate::locks::ChannelLocks;
use crate::models::{Message, NewSummary, Summary, SummaryPayload};
use crate::sync::ChannelReport;
use chrono::Utc;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{info, warn};

const ANALYZER_PROMPT: &str = r#"You are a chat message analyzer. Analyze the provided messages and extract the key discussion topics.

Output a JSON array of topics with this schema:
{
  "topic": "string - specific subject being discussed",
  "creator": "string - username who started the topic",
  "top_active_users": "array of string - most engaged users, at most three",
  "number_of_messages": "number - count of messages in this topic",
  "number_of_users": "number - count of unique users in this topic",
  "summary": "string - key points and conclusions"
}

Guidelines:
- Focus on substantive discussions, not chit-chat
- Group related messages into coherent topics
- Track who participates most actively
- Only include messages that contribute meaningfully

Output must be valid JSON with no other text."#;

#[derive(Debug, Clone)]
pub struct SummarizerOptions {
    /// Messages per summary window; a row holding this many is finalized.
    pub capacity: usize,
    pub min_messages: usize,
    pub retention: chrono::Duration,
}

impl SummarizerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.summary_window_capacity.max(1),
            min_messages: config.min_messages_to_summarize,
            retention: config.retention(),
        }
    }
}

/// Result of one select-fetch-summarize-persist pass over a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowStep {
    Written {
        num_messages: usize,
        /// The row reached capacity and will never be rewritten.
        finalized: bool,
        /// A full window came back, so older-than-now history may remain.
        more: bool,
    },
    Stable,
    /// Another writer changed the channel's latest row while the model was
    /// running; nothing was written and the window should be selected again.
    Superseded,
}

/// Where the next window starts, and the row it would rewrite.
struct Window {
    from: Cursor,
    open: Option<Summary>,
    /// `(id, num_messages)` of the latest row when the window was chosen.
    latest: Option<(i64, usize)>,
}

pub struct SummarizationManager {
    db: Database,
    llm: Arc<dyn TextGenerator>,
    locks: ChannelLocks,
    options: SummarizerOptions,
}

impl SummarizationManager {
    pub fn new(db: Database, llm: Arc<dyn TextGenerator>, locks: ChannelLocks, options: SummarizerOptions) -> Self {
        Self { db, llm, locks, options }
    }

    fn select_window(&self, latest: Option<Summary>) -> Window {
        let horizon = Utc::now() - self.options.retention;
        let snapshot = latest.as_ref().map(|row| (row.id, row.num_messages));
        match latest {
            // An open row reaching past the horizon has lost messages to the
            // purge, so it can no longer be regrown and counts as finalized.
            Some(row) if row.num_messages < self.options.capacity && row.from_timestamp >= horizon => Window {
                from: Cursor::from_time(row.from_timestamp),
                open: Some(row),
                latest: snapshot,
            },
            // Finalized: start strictly after its last millisecond.
            Some(row) => Window {
                from: Cursor::from_time(row.to_timestamp).next_millisecond(),
                open: None,
                latest: snapshot,
            },
            None => Window {
                from: Cursor::from_time(horizon),
                open: None,
                latest: None,
            },
        }
    }

    /// Runs one window pass for a channel. The channel lock covers window
    /// selection and the write, but not the model call.
    pub async fn summarize_step(&self, server_id: &str, channel_id: &str) -> Result<WindowStep> {
        let (window, candidates) = {
            let _channel = self.locks.lock(server_id, channel_id).await;
            let (server, channel) = (server_id.to_string(), channel_id.to_string());
            let latest = self
                .db
                .run_blocking(move |db| db.latest_summary(&server, &channel))
                .await?;
            let window = self.select_window(latest);

            let (server, channel, capacity) = (server_id.to_string(), channel_id.to_string(), self.options.capacity);
            let from = window.from;
            let candidates = self
                .db
                .run_blocking(move |db| db.messages_from(&server, &channel, from, capacity))
                .await?;
            (window, candidates)
        };

        if candidates.len() < self.options.min_messages {
            return Ok(WindowStep::Stable);
        }
        if let Some(open) = &window.open {
            if open.num_messages >= candidates.len() {
                return Ok(WindowStep::Stable);
            }
        }
        let (Some(first), Some(last)) = (candidates.first(), candidates.last()) else {
            return Ok(WindowStep::Stable);
        };

        let reply = self
            .llm
            .generate(ANALYZER_PROMPT, &[ChatTurn::user(format_transcript(&candidates))])
            .await?;
        let payload = SummaryPayload::parse(&reply);
        if payload.is_empty() {
            warn!("Summarizer: empty model reply for channel {}, keeping previous window", channel_id);
            return Ok(WindowStep::Stable);
        }
        if matches!(payload, SummaryPayload::Raw(_)) {
            warn!("Summarizer: reply for channel {} is not a topic list, storing raw text", channel_id);
        }

        let row = NewSummary {
            server_id: server_id.to_string(),
            channel_id: channel_id.to_string(),
            summary: payload,
            num_messages: candidates.len(),
            from_timestamp: first.timestamp,
            to_timestamp: last.timestamp,
        };
        let open_id = window.open.as_ref().map(|open| open.id);
        let seen = window.latest;

        let _channel = self.locks.lock(server_id, channel_id).await;
        let (server, channel) = (server_id.to_string(), channel_id.to_string());
        let written = self
            .db
            .run_blocking(move |db| {
                let current = db
                    .latest_summary(&server, &channel)?
                    .map(|row| (row.id, row.num_messages));
                if current != seen {
                    return Ok(false);
                }
                match open_id {
                    Some(id) => db.update_summary(id, &row)?,
                    None => {
                        db.insert_summary(&row)?;
                    }
                }
                Ok(true)
            })
            .await?;
        if !written {
            info!("Summarizer: channel {} changed during generation, reselecting window", channel_id);
            return Ok(WindowStep::Superseded);
        }

        let num_messages = candidates.len();
        let step = WindowStep::Written {
            num_messages,
            finalized: num_messages >= self.options.capacity,
            more: num_messages == self.options.capacity,
        };
        info!(
            "Summarizer: {} window of {} messages for channel {}",
            if open_id.is_some() { "updated" } else { "wrote" },
            num_messages,
            channel_id
        );
        Ok(step)
    }

    /// Purges expired rows, then writes windows until the channel is caught up.
    pub async fn summarize_channel(&self, server_id: &str, channel_id: &str) -> Result<usize> {
        info!("Summarizer: summarizing channel {}", channel_id);
        let cutoff = Utc::now() - self.options.retention;
        let (server, channel) = (server_id.to_string(), channel_id.to_string());
        let purged = self
            .db
            .run_blocking(move |db| db.delete_summaries_before(cutoff, Some((&server, &channel))))
            .await?;
        if purged > 0 {
            info!("Summarizer: purged {} expired summaries for channel {}", purged, channel_id);
        }

        let mut written = 0;
        loop {
            match self.summarize_step(server_id, channel_id).await? {
                WindowStep::Written { more, .. } => {
                    written += 1;
                    if !more {
                        break;
                    }
                }
                WindowStep::Superseded => continue,
                WindowStep::Stable => break,
            }
        }
        Ok(written)
    }

    /// Summarizes every stored channel matching the filters. A failing channel
    /// is logged and reported; the rest still run.
    pub async fn summarize_all_channels(
        &self,
        server_id: Option<&str>,
        channel_id: Option<&str>,
    ) -> Result<ChannelReport> {
        let (server, channel) = (server_id.map(str::to_string), channel_id.map(str::to_string));
        let channels = self
            .db
            .run_blocking(move |db| db.list_channels(server.as_deref(), channel.as_deref()))
            .await?;
        if let (Some(channel_id), true) = (channel_id, channels.is_empty()) {
            return Err(SyncError::NotFound(format!("channel {}", channel_id)));
        }

        let mut report = ChannelReport {
            total: channels.len(),
            ..Default::default()
        };
        for channel in channels {
            if let Err(e) = self.summarize_channel(&channel.server_id, &channel.id).await {
                warn!("Summarizer: cannot summarize channel {} ({}): {}", channel.name, channel.id, e);
                report.failures.push((channel.id, e));
            }
        }
        info!(
            "Summarizer: {}/{} channels summarized",
            report.succeeded(),
            report.total
        );
        Ok(report)
    }
}

/// One line per message: id, reply target, author and content.
fn format_transcript(messages: &[Message]) -> String {
    let mut text = String::from("Here are the chat messages to analyze:\n\n");
    for message in messages {
        let _ = write!(text, "- #{} [{}] ", message.id, message.timestamp.format("%Y-%m-%d %H:%M"));
        if let Some(reply_to) = message.reply_to_id {
            let _ = write!(text, "(reply to #{}) ", reply_to);
        }
        let _ = writeln!(text, "{} <@{}>: {}", message.author, message.author_id, message.content);
    }
    text
}
