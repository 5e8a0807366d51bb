//! Minimal OpenAI Chat Completions client.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OpenAiConfig;
use crate::error::{AirhostError, Result};

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Thin wrapper over `POST {base_url}/chat/completions`
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    /// Build a client, or `None` when no API key is configured
    pub fn from_config(config: &OpenAiConfig) -> Result<Option<Self>> {
        let Some(api_key) = config.api_key.as_deref().filter(|k| !k.trim().is_empty()) else {
            return Ok(None);
        };
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Some(Self {
            http,
            api_key: api_key.to_string(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        }))
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// One system + user exchange. With `json_mode` the model is asked for a JSON object.
    /// Returns the first choice's text, empty if the model sent none.
    pub async fn complete(&self, system_prompt: &str, user_message: &str, max_tokens: u32, json_mode: bool) -> Result<String> {
        let request = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system_prompt },
                ChatMessage { role: "user", content: user_message },
            ],
            max_tokens,
            temperature: self.temperature,
            response_format: json_mode.then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AirhostError::Upstream {
                service: "OpenAI",
                status: status.as_u16(),
                body,
            });
        }

        let completion: ChatCompletionResponse = response.json().await?;
        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();
        debug!(model = %self.model, chars = content.len(), "Chat completion received");
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_url: String) -> OpenAiConfig {
        OpenAiConfig {
            api_key: Some("sk-test".to_string()),
            base_url,
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 200,
            timeout_secs: 5,
        }
    }

    #[test]
    fn test_no_key_means_no_client() {
        let mut config = config("http://localhost".to_string());
        config.api_key = None;
        assert!(OpenAiClient::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_complete_sends_json_mode_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "model": "gpt-4o",
                "max_tokens": 200,
                "response_format": {"type": "json_object"}
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices":[{"message":{"role":"assistant","content":"{\"ok\":true}"}}]}"#)
            .create_async()
            .await;

        let client = OpenAiClient::from_config(&config(server.url())).unwrap().unwrap();
        let content = client.complete("system", "user", 200, true).await.unwrap();
        assert_eq!(content, "{\"ok\":true}");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_error_status_is_upstream_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("rate limited")
            .create_async()
            .await;

        let client = OpenAiClient::from_config(&config(server.url())).unwrap().unwrap();
        let err = client.complete("s", "u", 10, false).await.unwrap_err();
        assert!(matches!(err, AirhostError::Upstream { status: 429, .. }));
    }
}
