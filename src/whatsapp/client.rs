//! Outbound calls to the WhatsApp Cloud (Graph) API.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::WhatsAppSettings;
use crate::error::{AirhostError, Result};
use crate::models::WhatsAppConfig;

/// Meta's sample template only exists in English
pub const HELLO_WORLD: &str = "hello_world";
pub const DEFAULT_LANGUAGE: &str = "fr";

/// A template message ready to send
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMessage {
    /// Recipient digits, no `+`
    pub to: String,
    pub template_name: String,
    pub language: String,
    /// Positional `{{n}}` values for the body component
    pub body_parameters: Vec<String>,
}

impl TemplateMessage {
    pub fn new(to: impl Into<String>, template_name: impl Into<String>, configured_language: Option<&str>) -> Self {
        let template_name = template_name.into();
        let language = template_language(&template_name, configured_language);
        Self {
            to: to.into(),
            template_name,
            language,
            body_parameters: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_body_parameters(mut self, parameters: Vec<String>) -> Self {
        self.body_parameters = parameters;
        self
    }

    fn to_payload(&self) -> Value {
        let mut template = json!({
            "name": self.template_name,
            "language": {"code": self.language},
        });
        if !self.body_parameters.is_empty() {
            let parameters: Vec<Value> = self
                .body_parameters
                .iter()
                .map(|text| json!({"type": "text", "text": text}))
                .collect();
            template["components"] = json!([{"type": "body", "parameters": parameters}]);
        }

        json!({
            "messaging_product": "whatsapp",
            "to": self.to,
            "type": "template",
            "template": template,
        })
    }
}

/// `en_US` for `hello_world`, otherwise the configured language or `fr`
#[must_use]
pub fn template_language(template_name: &str, configured: Option<&str>) -> String {
    if template_name == HELLO_WORLD {
        return "en_US".to_string();
    }
    configured
        .map(str::trim)
        .filter(|lang| !lang.is_empty())
        .unwrap_or(DEFAULT_LANGUAGE)
        .to_string()
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TemplateSender: Send + Sync {
    /// Send one template message with the given host credentials. Returns the WhatsApp message id.
    async fn send_template(&self, credentials: &WhatsAppConfig, message: &TemplateMessage) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentMessage>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

#[derive(Debug, Clone)]
pub struct WhatsAppClient {
    http: reqwest::Client,
    graph_api_base: String,
    api_version: String,
}

impl WhatsAppClient {
    pub fn from_settings(settings: &WhatsAppSettings) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            graph_api_base: settings.graph_api_base.trim_end_matches('/').to_string(),
            api_version: settings.api_version.clone(),
        })
    }

    fn messages_url(&self, phone_number_id: &str) -> String {
        format!("{}/{}/{}/messages", self.graph_api_base, self.api_version, phone_number_id)
    }
}

#[async_trait]
impl TemplateSender for WhatsAppClient {
    async fn send_template(&self, credentials: &WhatsAppConfig, message: &TemplateMessage) -> Result<String> {
        debug!(
            template = %message.template_name,
            language = %message.language,
            phone_number_id = %credentials.phone_number_id,
            "Sending WhatsApp template"
        );

        let response = self
            .http
            .post(self.messages_url(&credentials.phone_number_id))
            .bearer_auth(&credentials.access_token)
            .json(&message.to_payload())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AirhostError::Upstream {
                service: "WhatsApp",
                status: status.as_u16(),
                body,
            });
        }

        let sent: SendResponse = response.json().await?;
        let id = sent
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| AirhostError::Other("WhatsApp response contained no message id".to_string()))?;

        info!(template = %message.template_name, whatsapp_message_id = %id, "WhatsApp template sent");
        Ok(id)
    }
}
