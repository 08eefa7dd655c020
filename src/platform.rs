use crate::cursor::Cursor;
use crate::error::Result;
use crate::models::{Channel, Message, Server};
use async_trait::async_trait;
use std::time::Duration;

/// Everything the engine needs from the chat platform. The crawler implements
/// it by driving a browser; an official API client could stand in unchanged.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn authenticate(&self) -> Result<()>;

    async fn list_servers(&self) -> Result<Vec<Server>>;

    async fn list_channels(&self, server_id: &str) -> Result<Vec<Channel>>;

    /// Messages with id greater than `since`, no older than `retention`,
    /// ascending by timestamp and unique by id.
    async fn list_messages(
        &self,
        server_id: &str,
        channel_id: &str,
        since: Cursor,
        retention: Duration,
    ) -> Result<Vec<Message>>;

    async fn post_message(&self, server_id: &str, channel_id: &str, content: &str) -> Result<()>;
}
