//! WhatsApp Cloud API: inbound webhook payloads, outbound template sends and the
//! welcome template catalogue.

pub mod client;
pub mod templates;
pub mod webhook;

pub use client::{template_language, TemplateMessage, TemplateSender, WhatsAppClient, HELLO_WORLD};
pub use webhook::{extract_message_content, WebhookVerifyQuery, WhatsAppWebhook};

#[cfg(test)]
pub use client::MockTemplateSender;
