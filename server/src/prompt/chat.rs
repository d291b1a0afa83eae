use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{server_config::ModelConfig, HttpClient};

/// A text-generation backend: prompt in, raw text out
#[async_trait]
pub trait TextModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Chat-completions endpoint (Mistral / OpenAI wire format)
#[derive(Clone)]
pub struct ChatCompletionModel {
    http_client: HttpClient,
    config: ModelConfig,
}

impl ChatCompletionModel {
    pub fn new(http_client: HttpClient, config: ModelConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }
}

#[async_trait]
impl TextModel for ChatCompletionModel {
    async fn complete(&self, prompt: &str) -> anyhow::Result<String> {
        let resp = self
            .http_client
            .post(&self.config.endpoint)
            .bearer_auth(&self.config.api_key)
            .json(&json!(
              {
                "model": &self.config.id,
                "temperature": self.config.temperature,
                "messages": [
                  {
                    "role": "user",
                    "content": prompt
                  }
                ]
              }
            ))
            .send()
            .await?
            .json::<serde_json::Value>()
            .await?;

        let parsed = serde_json::from_value::<ChatApiResponseOrError>(resp.clone())
            .context(format!("Could not parse chat response: {}", resp))?;

        match parsed {
            ChatApiResponseOrError::Error(error) => Err(anyhow!("Chat API error: {:?}", error)),
            ChatApiResponseOrError::Response(parsed) => {
                let choice = parsed.choices.into_iter().next().context("No choices in response")?;
                Ok(choice.message.content)
            }
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PromptUsage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i32,
    pub message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiResponse {
    pub choices: Vec<ChatChoice>,
    pub usage: Option<PromptUsage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatApiError {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatApiResponseOrError {
    Response(ChatApiResponse),
    Error(ChatApiError),
}
