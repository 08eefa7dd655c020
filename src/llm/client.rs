use super::{ChatTurn, Role, TextGenerator};
use crate::config::Config;
use crate::error::{Result, SyncError};
use async_openai::{
    config::OpenAIConfig,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
    Client,
};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible chat completion client (OpenAI, llama.cpp, vLLM, Ollama).
pub struct LlmClient {
    chat_client: Client<OpenAIConfig>,
    chat_model: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(config: &Config) -> Self {
        let mut chat_config = OpenAIConfig::new().with_api_base(&config.llm_url);

        if let Some(key) = &config.llm_api_key {
            chat_config = chat_config.with_api_key(key);
        } else {
            chat_config = chat_config.with_api_key("unused");
        }

        Self {
            chat_client: Client::with_config(chat_config),
            chat_model: config.llm_model.clone(),
            timeout: Duration::from_secs(config.llm_timeout_secs),
        }
    }

    fn build_messages(system: &str, turns: &[ChatTurn]) -> Result<Vec<ChatCompletionRequestMessage>> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(system.to_string())
                .build()
                .map_err(llm_error)?
                .into(),
        ];
        for turn in turns {
            let message: ChatCompletionRequestMessage = match turn.role {
                Role::User => ChatCompletionRequestUserMessageArgs::default()
                    .content(turn.content.clone())
                    .build()
                    .map_err(llm_error)?
                    .into(),
                Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                    .content(turn.content.clone())
                    .build()
                    .map_err(llm_error)?
                    .into(),
            };
            messages.push(message);
        }
        Ok(messages)
    }
}

fn llm_error(e: impl std::fmt::Display) -> SyncError {
    SyncError::Llm(e.to_string())
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, system: &str, turns: &[ChatTurn]) -> Result<String> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages(Self::build_messages(system, turns)?)
            .build()
            .map_err(llm_error)?;

        debug!("LLM: requesting completion from {} ({} turns)", self.chat_model, turns.len());
        let response = tokio::time::timeout(self.timeout, self.chat_client.chat().create(request))
            .await
            .map_err(|_| SyncError::Llm(format!("no reply within {:?}", self.timeout)))?
            .map_err(llm_error)?;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default();

        Ok(content)
    }
}
