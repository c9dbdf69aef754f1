//! Chat-completions classifier.
//!
//! Implements [`Classifier`] against an OpenAI-compatible
//! `/v1/chat/completions` endpoint. Requests go through the call governor under
//! the `classifier` API name.

use crate::connectors::{build_client, check_response_status};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use atlas::classifier::Classifier;
use atlas::config::ClassifierConfig;
use atlas::rate_limit::CallGovernor;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub const API: &str = "classifier";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct HttpClassifier {
    http_client: Client,
    config: ClassifierConfig,
    api_key: Option<String>,
    governor: Arc<CallGovernor>,
}

impl HttpClassifier {
    /// Build from config, reading the bearer token from `config.api_key_env`.
    pub fn new(config: ClassifierConfig, user_agent: &str, governor: Arc<CallGovernor>) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.is_empty());
        Self::with_api_key(config, api_key, user_agent, governor)
    }

    pub fn with_api_key(
        config: ClassifierConfig,
        api_key: Option<String>,
        user_agent: &str,
        governor: Arc<CallGovernor>,
    ) -> Result<Self> {
        Ok(Self {
            http_client: build_client(user_agent)?,
            config,
            api_key,
            governor,
        })
    }

    async fn send(&self, prompt: &str) -> Result<String> {
        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        };

        let mut request = self.http_client.post(&self.config.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("Failed to send classifier request")?;
        check_response_status(API, &response)?;

        let body: ChatResponse = response
            .json()
            .await
            .context("Failed to parse classifier response")?;

        body.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow!("classifier returned no content"))
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn complete(&self, prompt: &str) -> Result<String> {
        self.governor.call(API, || self.send(prompt)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn classifier(endpoint: String, api_key: Option<&str>) -> HttpClassifier {
        let config = ClassifierConfig {
            enabled: true,
            endpoint,
            model: "test-model".to_string(),
            ..Default::default()
        };
        HttpClassifier::with_api_key(
            config,
            api_key.map(str::to_string),
            "atlas-test",
            Arc::new(CallGovernor::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(Matcher::PartialJsonString(
                r#"{"model": "test-model", "messages": [{"role": "user", "content": "hello"}]}"#.to_string(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": [{"index": 0, "message": {"role": "assistant", "content": "[]"}}]}"#)
            .create_async()
            .await;

        let c = classifier(format!("{}/v1/chat/completions", server.url()), Some("sk-test"));
        assert_eq!(c.complete("hello").await.unwrap(), "[]");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_choices_is_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let c = classifier(format!("{}/v1/chat/completions", server.url()), None);
        assert!(c.complete("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_server_error_counts_against_governor() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(500)
            .create_async()
            .await;

        let c = classifier(format!("{}/v1/chat/completions", server.url()), None);
        assert!(c.complete("hello").await.is_err());
        assert_eq!(c.governor.stats()[API].consecutive_errors, 1);
    }
}
