//! Payload types for the WhatsApp Cloud API webhook.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const BUSINESS_ACCOUNT_OBJECT: &str = "whatsapp_business_account";

#[derive(Debug, Deserialize)]
pub struct WebhookVerifyQuery {
    #[serde(rename = "hub.mode")]
    pub mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    pub verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    pub challenge: Option<String>,
}

/// Either a regular notification (`object` + `entry`) or the dashboard test shape
/// (`field` + `value` at the top level).
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WhatsAppWebhook {
    #[serde(default)]
    pub object: Option<String>,
    #[serde(default)]
    pub entry: Vec<WhatsAppEntry>,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub value: Option<WhatsAppValue>,
}

impl WhatsAppWebhook {
    /// Whether this payload comes from a WhatsApp Business account
    #[must_use]
    pub fn is_supported(&self) -> bool {
        match self.object.as_deref() {
            Some(object) => object == BUSINESS_ACCOUNT_OBJECT,
            None => self.field.as_deref() == Some("messages") && self.value.is_some(),
        }
    }

    /// All `messages` change values in delivery order
    pub fn message_values(&self) -> impl Iterator<Item = &WhatsAppValue> {
        let test_value = self
            .value
            .as_ref()
            .filter(|_| self.object.is_none() && self.field.as_deref() == Some("messages"));

        self.entry
            .iter()
            .flat_map(|entry| entry.changes.iter())
            .filter(|change| change.field == "messages")
            .map(|change| &change.value)
            .chain(test_value)
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WhatsAppEntry {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WhatsAppChange {
    pub field: String,
    pub value: WhatsAppValue,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WhatsAppValue {
    #[serde(default)]
    pub messaging_product: Option<String>,
    #[serde(default)]
    pub metadata: WhatsAppMetadata,
    #[serde(default)]
    pub contacts: Vec<WhatsAppContact>,
    #[serde(default)]
    pub messages: Vec<WhatsAppMessage>,
    #[serde(default)]
    pub statuses: Vec<WhatsAppStatus>,
}

impl WhatsAppValue {
    /// Profile name of the contact that sent `wa_id`, else the first contact's
    pub fn contact_name(&self, wa_id: &str) -> Option<&str> {
        self.contacts
            .iter()
            .find(|c| c.wa_id == wa_id)
            .or_else(|| self.contacts.first())
            .map(|c| c.profile.name.as_str())
            .filter(|name| !name.trim().is_empty())
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct WhatsAppMetadata {
    pub display_phone_number: Option<String>,
    pub phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WhatsAppContact {
    pub wa_id: String,
    pub profile: WhatsAppProfile,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WhatsAppProfile {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhatsAppMessage {
    pub id: String,
    pub from: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(default)]
    pub text: Option<WhatsAppText>,
    #[serde(default)]
    pub image: Option<WhatsAppMedia>,
    #[serde(default)]
    pub audio: Option<WhatsAppMedia>,
    #[serde(default)]
    pub video: Option<WhatsAppMedia>,
    #[serde(default)]
    pub document: Option<WhatsAppMedia>,
    #[serde(default)]
    pub location: Option<WhatsAppLocation>,
    #[serde(default)]
    pub button: Option<WhatsAppButton>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhatsAppText {
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhatsAppMedia {
    pub id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub sha256: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhatsAppLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WhatsAppButton {
    #[serde(default)]
    pub payload: String,
    pub text: String,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct WhatsAppStatus {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub recipient_id: String,
}

/// Text stored for an inbound message plus type-specific details for `messages.metadata`
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedContent {
    pub content: String,
    pub message_type: String,
    pub metadata: Value,
}

#[must_use]
pub fn extract_message_content(message: &WhatsAppMessage) -> ExtractedContent {
    let media = |attachment: Option<&WhatsAppMedia>| {
        attachment.map_or_else(|| json!({}), |m| {
            json!({
                "media_id": m.id,
                "mime_type": m.mime_type,
                "sha256": m.sha256,
                "caption": m.caption,
                "filename": m.filename,
            })
        })
    };

    let (content, details) = match message.message_type.as_str() {
        "text" => (message.text.as_ref().map(|t| t.body.clone()).unwrap_or_default(), json!({})),
        "image" => ("[Image]".to_string(), media(message.image.as_ref())),
        "audio" => ("[Audio]".to_string(), media(message.audio.as_ref())),
        "video" => ("[Vidéo]".to_string(), media(message.video.as_ref())),
        "document" => ("[Document]".to_string(), media(message.document.as_ref())),
        "location" => (
            "[Localisation]".to_string(),
            message.location.as_ref().map_or_else(
                || json!({}),
                |l| json!({"latitude": l.latitude, "longitude": l.longitude, "name": l.name, "address": l.address}),
            ),
        ),
        "button" => (message.button.as_ref().map(|b| b.text.clone()).unwrap_or_default(), json!({})),
        other => (format!("[Message de type {other}]"), json!({})),
    };

    let content = if content.trim().is_empty() {
        "[Message sans contenu]".to_string()
    } else {
        content
    };

    let mut metadata = json!({
        "whatsapp_message_id": message.id,
        "timestamp": message.timestamp,
    });
    if let (Some(target), Value::Object(extra)) = (metadata.as_object_mut(), details) {
        target.extend(extra.into_iter().filter(|(_, v)| !v.is_null()));
    }

    ExtractedContent {
        content,
        message_type: message.message_type.clone(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(json: Value) -> WhatsAppMessage {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_extract_text_message() {
        let extracted = extract_message_content(&message(json!({
            "id": "wamid.1", "from": "33612345678", "timestamp": "1700000000",
            "type": "text", "text": {"body": "Bonjour"}
        })));
        assert_eq!(extracted.content, "Bonjour");
        assert_eq!(extracted.message_type, "text");
        assert_eq!(extracted.metadata["whatsapp_message_id"], "wamid.1");
    }

    #[test]
    fn test_extract_media_message() {
        let extracted = extract_message_content(&message(json!({
            "id": "wamid.2", "from": "33612345678", "timestamp": "1700000000",
            "type": "image", "image": {"id": "media-9", "mime_type": "image/jpeg"}
        })));
        assert_eq!(extracted.content, "[Image]");
        assert_eq!(extracted.metadata["media_id"], "media-9");
        assert!(extracted.metadata.get("caption").is_none());
    }

    #[test]
    fn test_extract_location_and_unknown() {
        let extracted = extract_message_content(&message(json!({
            "id": "wamid.3", "from": "1", "type": "location",
            "location": {"latitude": 48.85, "longitude": 2.35}
        })));
        assert_eq!(extracted.content, "[Localisation]");
        assert_eq!(extracted.metadata["latitude"], 48.85);

        let extracted = extract_message_content(&message(json!({"id": "wamid.4", "from": "1", "type": "sticker"})));
        assert_eq!(extracted.content, "[Message de type sticker]");

        let extracted =
            extract_message_content(&message(json!({"id": "wamid.5", "from": "1", "type": "text", "text": {"body": " "}})));
        assert_eq!(extracted.content, "[Message sans contenu]");
    }

    #[test]
    fn test_whatsapp_webhook_deserialization() {
        let webhook: WhatsAppWebhook = serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "123",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": {"display_phone_number": "15550000000", "phone_number_id": "604674832740532"},
                        "contacts": [{"wa_id": "33612345678", "profile": {"name": "Marie"}}],
                        "messages": [{"id": "wamid.1", "from": "33612345678", "timestamp": "1", "type": "text", "text": {"body": "Salut"}}]
                    }
                }]
            }]
        }))
        .unwrap();

        assert!(webhook.is_supported());
        let values: Vec<_> = webhook.message_values().collect();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0].contact_name("33612345678"), Some("Marie"));
    }

    #[test]
    fn test_dashboard_test_shape() {
        let webhook: WhatsAppWebhook = serde_json::from_value(json!({
            "field": "messages",
            "value": {"messages": [{"id": "wamid.t", "from": "16315551181", "type": "text", "text": {"body": "this is a text message"}}]}
        }))
        .unwrap();
        assert!(webhook.is_supported());
        assert_eq!(webhook.message_values().count(), 1);

        let foreign: WhatsAppWebhook = serde_json::from_value(json!({"object": "page", "entry": []})).unwrap();
        assert!(!foreign.is_supported());
    }
}
