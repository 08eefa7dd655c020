//! Scripted navigation and extraction against the shared session.
//!
//! Every call runs authenticate, navigate, extract (scrolling as needed) and
//! normalize, and either returns a complete result or fails. Retrying is the
//! caller's business.

use crate::config::Config;
use crate::cursor::Cursor;
use crate::error::{Result, SyncError};
use crate::models::{Channel, Message, Server};
use crate::platform::ChatPlatform;
use crate::session::SessionResource;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, info, warn};

pub mod scripts;

/// Author recorded for bot and system messages.
pub const BOT_AUTHOR: &str = "Bot";
/// Author recorded for a continuation whose header never rendered.
pub const UNKNOWN_AUTHOR: &str = "unknown";
/// Consecutive "load older" steps without new messages before giving up.
pub const STALL_LIMIT: usize = 3;
const MAX_CHANNEL_SCROLLS: usize = 200;
const ENTER_KEY: &str = "\u{E007}";

#[derive(Debug, Clone)]
pub struct CrawlerOptions {
    pub scroll_pause: Duration,
    pub navigation_timeout: Duration,
    pub max_messages: usize,
    pub stall_limit: usize,
}

impl CrawlerOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            scroll_pause: config.scroll_pause,
            navigation_timeout: config.navigation_timeout,
            max_messages: config.max_scrape_messages,
            stall_limit: STALL_LIMIT,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawServer {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChannel {
    id: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawMessage {
    id: String,
    #[serde(default)]
    author_id: Option<String>,
    #[serde(default)]
    author: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(default)]
    reply_to_id: Option<String>,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Debug, Deserialize)]
struct ScrollState {
    position: f64,
    height: f64,
    viewport: f64,
}

/// A normalized message plus whether its author came from markup or inheritance.
#[derive(Debug, Clone)]
struct Scraped {
    message: Message,
    resolved: bool,
}

#[derive(Clone)]
struct Author {
    id: String,
    name: String,
    is_bot: bool,
}

fn decode<T: DeserializeOwned>(what: &str, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| SyncError::extraction(what, e))
}

fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw?.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// Normalizes one DOM-ordered batch. Continuations inherit the author of the
/// message right before them; bot/system messages get [`BOT_AUTHOR`].
fn normalize_batch(server_id: &str, channel_id: &str, batch: Vec<RawMessage>) -> Vec<Scraped> {
    let mut previous: Option<Author> = None;
    let mut out = Vec::with_capacity(batch.len());

    for raw in batch {
        let Ok(id) = raw.id.parse::<Cursor>() else {
            debug!("Crawler: skipping element with non-numeric id '{}'", raw.id);
            continue;
        };
        let header = raw
            .author
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        let author = if raw.is_bot {
            Some(Author {
                id: raw.author_id.clone().unwrap_or_default(),
                name: BOT_AUTHOR.to_string(),
                is_bot: true,
            })
        } else if let Some(name) = header {
            Some(Author {
                id: raw
                    .author_id
                    .clone()
                    .filter(|id| !id.is_empty())
                    .unwrap_or_else(|| name.clone()),
                name,
                is_bot: false,
            })
        } else {
            previous.clone()
        };
        if author.is_some() {
            previous = author.clone();
        }

        let resolved = author.is_some();
        let author = author.unwrap_or(Author {
            id: String::new(),
            name: UNKNOWN_AUTHOR.to_string(),
            is_bot: false,
        });

        out.push(Scraped {
            message: Message {
                id,
                server_id: server_id.to_string(),
                channel_id: channel_id.to_string(),
                author_id: author.id,
                author: author.name,
                is_bot: author.is_bot,
                content: raw.content.unwrap_or_default(),
                reply_to_id: raw.reply_to_id.and_then(|r| r.parse().ok()),
                timestamp: parse_timestamp(raw.timestamp.as_deref()).unwrap_or_else(|| id.to_time()),
            },
            resolved,
        });
    }
    out
}

/// Adds unseen messages; a later batch may resolve an author an earlier one
/// could not. Returns how many ids were new.
fn merge(collected: &mut BTreeMap<Cursor, Scraped>, batch: Vec<Scraped>) -> usize {
    let mut added = 0;
    for scraped in batch {
        match collected.get_mut(&scraped.message.id) {
            Some(existing) => {
                if !existing.resolved && scraped.resolved {
                    *existing = scraped;
                }
            }
            None => {
                collected.insert(scraped.message.id, scraped);
                added += 1;
            }
        }
    }
    added
}

/// Time between the oldest collected message and where collection should have
/// stopped (the cursor or the retention horizon, whichever is later).
fn unfetched_gap(since: Cursor, horizon: DateTime<Utc>, oldest: DateTime<Utc>) -> chrono::Duration {
    let stop = since.to_time().max(horizon);
    chrono::Duration::seconds((oldest - stop).num_seconds().max(0))
}

pub struct Crawler {
    session: SessionResource,
    options: CrawlerOptions,
}

impl Crawler {
    pub fn new(session: SessionResource, options: CrawlerOptions) -> Self {
        Self { session, options }
    }

    async fn visible_messages(&self, server_id: &str, channel_id: &str) -> Result<Vec<Scraped>> {
        let value = self
            .session
            .web()
            .evaluate(scripts::MESSAGES, vec![json!(channel_id)])
            .await?;
        let raw: Vec<RawMessage> = decode("messages", value)?;
        Ok(normalize_batch(server_id, channel_id, raw))
    }

    async fn scroll_messages(&self, to: &str) -> Result<()> {
        let moved = self
            .session
            .web()
            .evaluate(scripts::SCROLL_MESSAGES, vec![json!(to)])
            .await?;
        if moved.as_bool() != Some(true) {
            return Err(SyncError::extraction("messages", "message pane not found"));
        }
        self.session.web().pause(self.options.scroll_pause).await;
        Ok(())
    }

    async fn visible_channels(
        &self,
        server_id: &str,
        seen: &mut HashSet<String>,
        channels: &mut Vec<Channel>,
    ) -> Result<()> {
        let value = self
            .session
            .web()
            .evaluate(scripts::CHANNELS, vec![json!(server_id)])
            .await?;
        let raw: Vec<RawChannel> = decode("channels", value)?;
        for channel in raw {
            let id = channel.id.trim().to_string();
            if id.is_empty() || !seen.insert(id.clone()) {
                continue;
            }
            channels.push(Channel {
                id,
                server_id: server_id.to_string(),
                name: channel.name.unwrap_or_default().trim().to_string(),
            });
        }
        Ok(())
    }

    async fn scroll_channels(&self, to: Option<f64>) -> Result<ScrollState> {
        let value = self
            .session
            .web()
            .evaluate(scripts::SCROLL_CHANNELS, vec![json!(to)])
            .await?;
        let state = decode("channel list", value)?;
        self.session.web().pause(self.options.scroll_pause).await;
        Ok(state)
    }
}

#[async_trait]
impl ChatPlatform for Crawler {
    async fn authenticate(&self) -> Result<()> {
        self.session.ensure_authenticated().await
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        self.session.ensure_authenticated().await?;
        self.session.navigate("/channels/@me").await?;
        self.session
            .web()
            .wait_for(scripts::SERVER_LIST_READY, self.options.navigation_timeout)
            .await?;

        let value = self.session.web().evaluate(scripts::SERVERS, vec![]).await?;
        let raw: Vec<RawServer> = decode("servers", value)?;

        let mut seen = HashSet::new();
        let servers: Vec<Server> = raw
            .into_iter()
            .filter(|s| !s.id.is_empty() && seen.insert(s.id.clone()))
            .map(|s| Server {
                id: s.id,
                name: s.name.unwrap_or_default(),
            })
            .collect();
        info!("Crawler: found {} servers", servers.len());
        Ok(servers)
    }

    async fn list_channels(&self, server_id: &str) -> Result<Vec<Channel>> {
        self.session.ensure_authenticated().await?;
        self.session.navigate(&format!("/channels/{}", server_id)).await?;
        self.session
            .web()
            .wait_for(scripts::CHANNEL_LIST_READY, self.options.navigation_timeout)
            .await?;

        let mut seen = HashSet::new();
        let mut channels = Vec::new();
        let mut state = self.scroll_channels(None).await?;
        self.visible_channels(server_id, &mut seen, &mut channels).await?;

        // The sidebar is virtualized: walk it one viewport at a time.
        for _ in 0..MAX_CHANNEL_SCROLLS {
            if state.position >= state.height {
                break;
            }
            let next = (state.position + state.viewport.max(1.0)).min(state.height);
            state = self.scroll_channels(Some(next)).await?;
            self.visible_channels(server_id, &mut seen, &mut channels).await?;
        }

        info!("Crawler: found {} channels in server {}", channels.len(), server_id);
        Ok(channels)
    }

    async fn list_messages(
        &self,
        server_id: &str,
        channel_id: &str,
        since: Cursor,
        retention: Duration,
    ) -> Result<Vec<Message>> {
        self.session.ensure_authenticated().await?;
        self.session
            .navigate(&format!("/channels/{}/{}", server_id, channel_id))
            .await?;
        self.session
            .web()
            .wait_for(scripts::MESSAGE_LIST_READY, self.options.navigation_timeout)
            .await?;
        self.scroll_messages("bottom").await?;

        let horizon = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(3));
        let mut collected: BTreeMap<Cursor, Scraped> = BTreeMap::new();
        let mut stalls = 0;

        loop {
            let batch = self.visible_messages(server_id, channel_id).await?;
            let added = merge(&mut collected, batch);

            if let Some((oldest_id, oldest)) = collected.first_key_value() {
                if *oldest_id <= since {
                    debug!("Crawler: reached cursor {} in channel {}", since, channel_id);
                    break;
                }
                if oldest.message.timestamp < horizon {
                    debug!("Crawler: reached retention horizon in channel {}", channel_id);
                    break;
                }
            }
            if collected.len() >= self.options.max_messages {
                let gap = collected
                    .first_key_value()
                    .map(|(_, oldest)| unfetched_gap(since, horizon, oldest.message.timestamp))
                    .unwrap_or_else(chrono::Duration::zero);
                warn!(
                    "Crawler: hit cap of {} messages in channel {}, leaving {} of history unfetched",
                    self.options.max_messages,
                    channel_id,
                    humantime::format_duration(gap.to_std().unwrap_or_default())
                );
                break;
            }
            if added == 0 {
                stalls += 1;
                if stalls >= self.options.stall_limit {
                    debug!("Crawler: no older messages in channel {} after {} tries", channel_id, stalls);
                    break;
                }
            } else {
                stalls = 0;
            }

            self.scroll_messages("top").await?;
        }

        let mut messages: Vec<Message> = collected
            .into_values()
            .map(|scraped| scraped.message)
            .filter(|m| m.id > since && m.timestamp >= horizon)
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));

        info!(
            "Crawler: collected {} messages newer than {} in channel {}",
            messages.len(),
            since,
            channel_id
        );
        Ok(messages)
    }

    async fn post_message(&self, server_id: &str, channel_id: &str, content: &str) -> Result<()> {
        self.session.ensure_authenticated().await?;
        self.session
            .navigate(&format!("/channels/{}/{}", server_id, channel_id))
            .await?;
        self.session
            .web()
            .wait_for(scripts::COMPOSER, self.options.navigation_timeout)
            .await?;
        self.session
            .web()
            .send_keys(scripts::COMPOSER, &format!("{}{}", content, ENTER_KEY))
            .await?;
        self.session.web().pause(self.options.scroll_pause).await;
        info!("Crawler: posted message to channel {}", channel_id);
        Ok(())
    }
}
