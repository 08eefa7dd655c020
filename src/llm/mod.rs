//! Text generation behind a trait so the summarizer never sees the HTTP client.

use crate::error::Result;
use async_trait::async_trait;

pub mod client;

pub use client::LlmClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

impl ChatTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// One completion for `system` followed by `turns`. An empty string means
    /// the model had nothing to say.
    async fn generate(&self, system: &str, turns: &[ChatTurn]) -> Result<String>;
}
