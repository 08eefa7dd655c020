//! Entities persisted by the store.

use crate::cursor::Cursor;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub server_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: Cursor,
    pub server_id: String,
    pub channel_id: String,
    pub author_id: String,
    pub author: String,
    pub is_bot: bool,
    pub content: String,
    pub reply_to_id: Option<Cursor>,
    pub timestamp: DateTime<Utc>,
}

/// One topic extracted by the model from a message window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub topic: String,
    #[serde(default)]
    pub creator: String,
    #[serde(default, alias = "top3_active_users")]
    pub top_active_users: Vec<String>,
    #[serde(default)]
    pub number_of_messages: u32,
    #[serde(default)]
    pub number_of_users: u32,
    #[serde(default)]
    pub summary: String,
}

/// Model output for a window: parsed topics when the reply was valid JSON,
/// otherwise the reply text as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SummaryPayload {
    Structured(Vec<Topic>),
    Raw(String),
}

fn reasoning_blocks() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(think|action|summary|details)>.*?</(think|action|summary|details)>")
            .expect("static regex")
    })
}

impl SummaryPayload {
    /// Strips reasoning blocks and code fences, then tries to read a topic list.
    pub fn parse(reply: &str) -> Self {
        let cleaned = clean_reply(reply);
        match serde_json::from_str::<Vec<Topic>>(&cleaned) {
            Ok(topics) => Self::Structured(topics),
            Err(_) => Self::Raw(cleaned),
        }
    }

    /// Text form written to the `summary` column.
    pub fn to_stored_text(&self) -> String {
        match self {
            Self::Structured(topics) => {
                serde_json::to_string(topics).unwrap_or_else(|_| "[]".to_string())
            }
            Self::Raw(text) => text.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Structured(_) => false,
            Self::Raw(text) => text.trim().is_empty(),
        }
    }
}

pub fn clean_reply(reply: &str) -> String {
    let without_reasoning = reasoning_blocks().replace_all(reply, "");
    let mut text = without_reasoning.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }
    text.trim().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub id: i64,
    pub server_id: String,
    pub channel_id: String,
    pub summary: SummaryPayload,
    pub num_messages: usize,
    pub from_timestamp: DateTime<Utc>,
    pub to_timestamp: DateTime<Utc>,
}

/// Window contents before a row id is assigned.
#[derive(Debug, Clone)]
pub struct NewSummary {
    pub server_id: String,
    pub channel_id: String,
    pub summary: SummaryPayload,
    pub num_messages: usize,
    pub from_timestamp: DateTime<Utc>,
    pub to_timestamp: DateTime<Utc>,
}
