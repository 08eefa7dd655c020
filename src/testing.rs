//! In-memory stand-ins for the browser, the platform and the model.

use crate::crawler::scripts;
use crate::cursor::Cursor;
use crate::error::{Result, SyncError};
use crate::llm::{ChatTurn, TextGenerator};
use crate::models::{Channel, Message, Server};
use crate::platform::ChatPlatform;
use crate::session::{WebSession, AUTH_MARKER, LOGIN_PATH};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn message_at(server_id: &str, channel_id: &str, t: DateTime<Utc>, content: &str) -> Message {
    Message {
        id: Cursor::from_time(t),
        server_id: server_id.to_string(),
        channel_id: channel_id.to_string(),
        author_id: "u1".to_string(),
        author: "ana".to_string(),
        is_bot: false,
        content: content.to_string(),
        reply_to_id: None,
        timestamp: t,
    }
}

/// The JSON shape the message extraction script yields for one element.
pub fn raw_message(id: Cursor, author: Option<&str>, t: DateTime<Utc>, content: &str) -> Value {
    json!({
        "id": id.to_string(),
        "author": author,
        "author_id": author.map(|a| format!("id-{}", a)),
        "content": content,
        "timestamp": t.to_rfc3339(),
        "reply_to_id": null,
        "is_bot": false,
    })
}

const SIDEBAR_VIEWPORT: f64 = 100.0;

#[derive(Default)]
struct WebState {
    logged_in: bool,
    login_on_navigation: bool,
    visited: Vec<String>,
    servers: Vec<Value>,
    channel_pages: Vec<Vec<Value>>,
    channel_page: usize,
    history: Vec<Value>,
    page_size: usize,
    depth: usize,
    older_loads: usize,
    typed: Vec<(String, String)>,
}

/// Scripted browser. Message history renders `page_size` newest elements and
/// one more page for every scroll to the top.
#[derive(Clone, Default)]
pub struct FakeWeb {
    state: Arc<Mutex<WebState>>,
}

impl FakeWeb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn logged_in() -> Self {
        let web = Self::new();
        web.set_logged_in(true);
        web
    }

    pub fn set_logged_in(&self, logged_in: bool) {
        self.state.lock().unwrap().logged_in = logged_in;
    }

    pub fn log_in_on_navigation(&self) {
        self.state.lock().unwrap().login_on_navigation = true;
    }

    pub fn visited(&self) -> Vec<String> {
        self.state.lock().unwrap().visited.clone()
    }

    pub fn set_servers(&self, servers: Vec<Value>) {
        self.state.lock().unwrap().servers = servers;
    }

    pub fn set_channel_pages(&self, pages: Vec<Vec<Value>>) {
        self.state.lock().unwrap().channel_pages = pages;
    }

    pub fn set_history(&self, history: Vec<Value>, page_size: usize) {
        let mut state = self.state.lock().unwrap();
        state.history = history;
        state.page_size = page_size;
        state.depth = 1;
    }

    pub fn older_loads(&self) -> usize {
        self.state.lock().unwrap().older_loads
    }

    pub fn typed(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().typed.clone()
    }
}

#[async_trait]
impl WebSession for FakeWeb {
    async fn goto(&self, url: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.visited.push(url.to_string());
        if state.login_on_navigation && url.ends_with(LOGIN_PATH) {
            state.logged_in = true;
        }
        Ok(())
    }

    async fn wait_for(&self, selector: &str, timeout: Duration) -> Result<()> {
        let logged_in = self.state.lock().unwrap().logged_in;
        if selector == AUTH_MARKER && !logged_in {
            return Err(SyncError::NavigationTimeout {
                what: selector.to_string(),
                timeout,
            });
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str, args: Vec<Value>) -> Result<Value> {
        let mut state = self.state.lock().unwrap();
        let arg = args.into_iter().next().unwrap_or(Value::Null);

        if script == scripts::SERVERS {
            Ok(Value::Array(state.servers.clone()))
        } else if script == scripts::CHANNELS {
            let page = state
                .channel_pages
                .get(state.channel_page)
                .cloned()
                .unwrap_or_default();
            Ok(Value::Array(page))
        } else if script == scripts::SCROLL_CHANNELS {
            let height = state.channel_pages.len().saturating_sub(1) as f64 * SIDEBAR_VIEWPORT;
            let position = arg.as_f64().unwrap_or(0.0).min(height);
            state.channel_page = (position / SIDEBAR_VIEWPORT).round() as usize;
            Ok(json!({ "position": position, "height": height, "viewport": SIDEBAR_VIEWPORT }))
        } else if script == scripts::MESSAGES {
            let shown = (state.page_size * state.depth).min(state.history.len());
            let start = state.history.len() - shown;
            Ok(Value::Array(state.history[start..].to_vec()))
        } else if script == scripts::SCROLL_MESSAGES {
            if arg.as_str() == Some("top") {
                state.depth += 1;
                state.older_loads += 1;
            } else {
                state.depth = 1;
            }
            Ok(Value::Bool(true))
        } else {
            Err(SyncError::Session("unexpected script".to_string()))
        }
    }

    async fn send_keys(&self, selector: &str, text: &str) -> Result<()> {
        self.state
            .lock()
            .unwrap()
            .typed
            .push((selector.to_string(), text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct PlatformState {
    servers: Vec<Server>,
    channels: HashMap<String, Vec<Channel>>,
    messages: HashMap<(String, String), Vec<Message>>,
    /// Remaining failures per channel; `usize::MAX` fails forever.
    failures: HashMap<(String, String), usize>,
    auth_failed: bool,
    posted: Vec<(String, String, String)>,
    calls: HashMap<&'static str, usize>,
}

/// Platform double that serves canned records and counts calls per operation.
#[derive(Clone, Default)]
pub struct FakePlatform {
    state: Arc<Mutex<PlatformState>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_servers(&self, servers: &[(&str, &str)]) {
        self.state.lock().unwrap().servers = servers
            .iter()
            .map(|(id, name)| Server {
                id: id.to_string(),
                name: name.to_string(),
            })
            .collect();
    }

    pub fn set_channels(&self, server_id: &str, channels: &[(&str, &str)]) {
        let channels = channels
            .iter()
            .map(|(id, name)| Channel {
                id: id.to_string(),
                server_id: server_id.to_string(),
                name: name.to_string(),
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .channels
            .insert(server_id.to_string(), channels);
    }

    pub fn set_messages(&self, server_id: &str, channel_id: &str, messages: Vec<Message>) {
        self.state
            .lock()
            .unwrap()
            .messages
            .insert((server_id.to_string(), channel_id.to_string()), messages);
    }

    /// The next `times` scrapes of the channel fail with a transient error.
    pub fn fail_channel(&self, server_id: &str, channel_id: &str, times: usize) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert((server_id.to_string(), channel_id.to_string()), times);
    }

    pub fn set_auth_failed(&self, failed: bool) {
        self.state.lock().unwrap().auth_failed = failed;
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn posted(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().posted.clone()
    }

    fn enter(&self, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        *state.calls.entry(operation).or_default() += 1;
        if state.auth_failed {
            return Err(SyncError::Auth("login marker missing".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChatPlatform for FakePlatform {
    async fn authenticate(&self) -> Result<()> {
        self.enter("authenticate")
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        self.enter("list_servers")?;
        Ok(self.state.lock().unwrap().servers.clone())
    }

    async fn list_channels(&self, server_id: &str) -> Result<Vec<Channel>> {
        self.enter("list_channels")?;
        let state = self.state.lock().unwrap();
        state
            .channels
            .get(server_id)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(format!("server {}", server_id)))
    }

    async fn list_messages(
        &self,
        server_id: &str,
        channel_id: &str,
        since: Cursor,
        retention: Duration,
    ) -> Result<Vec<Message>> {
        self.enter("list_messages")?;
        let mut state = self.state.lock().unwrap();
        let key = (server_id.to_string(), channel_id.to_string());
        if let Some(remaining) = state.failures.get_mut(&key) {
            if *remaining > 0 {
                if *remaining != usize::MAX {
                    *remaining -= 1;
                }
                return Err(SyncError::NavigationTimeout {
                    what: format!("channel {}", channel_id),
                    timeout: Duration::from_millis(10),
                });
            }
        }

        let horizon = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_default();
        let mut messages: Vec<Message> = state
            .messages
            .get(&key)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|m| m.id > since && m.timestamp >= horizon)
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(messages)
    }

    async fn post_message(&self, server_id: &str, channel_id: &str, content: &str) -> Result<()> {
        self.enter("post_message")?;
        self.state.lock().unwrap().posted.push((
            server_id.to_string(),
            channel_id.to_string(),
            content.to_string(),
        ));
        Ok(())
    }
}

/// Model double returning one canned reply and recording each transcript.
#[derive(Clone)]
pub struct FakeGenerator {
    reply: String,
    prompts: Arc<Mutex<Vec<String>>>,
    calls: Arc<AtomicUsize>,
}

impl FakeGenerator {
    pub fn replying(reply: &str) -> Self {
        Self {
            reply: reply.to_string(),
            prompts: Arc::new(Mutex::new(Vec::new())),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn topics() -> Self {
        Self::replying(
            r#"[{"topic":"release","creator":"ana","top3_active_users":["ana","bo"],"number_of_messages":4,"number_of_users":2,"summary":"Release plan agreed."}]"#,
        )
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for FakeGenerator {
    async fn generate(&self, _system: &str, turns: &[ChatTurn]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let transcript = turns
            .iter()
            .map(|t| t.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        self.prompts.lock().unwrap().push(transcript);
        Ok(self.reply.clone())
    }
}
