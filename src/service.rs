//! Messaging workflows: conversation creation with the welcome template, inbound webhook
//! ingestion and urgency analysis.
//!
//! Every step is a sequential await on the store or a remote API. Partial failures are
//! logged and reported; nothing already written is rolled back.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::cache::DeliveryLog;
use crate::classifier::Classifier;
use crate::config::AppConfig;
use crate::error::{AirhostError, Result};
use crate::metrics;
use crate::models::{
    ChatTurn, Classification, Conversation, ConversationOutcome, CreateConversationRequest, Direction,
    NewConversation, NewMessage, Property, WelcomeOutcome, WelcomeStatus, WhatsAppConfig,
};
use crate::phone::{normalize_french, normalize_international, to_whatsapp_recipient};
use crate::repository::ConversationStore;
use crate::validation::InputValidator;
use crate::whatsapp::templates::{self, TemplateVariables};
use crate::whatsapp::webhook::{WhatsAppMessage, WhatsAppValue};
use crate::whatsapp::{extract_message_content, TemplateMessage, TemplateSender, WhatsAppWebhook};

/// Name given to webhook senders without a profile name
pub const DEFAULT_GUEST_NAME: &str = "Invité";

/// Knobs the workflows read from configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSettings {
    pub default_welcome_template: String,
    pub analysis_enabled: bool,
    pub history_limit: usize,
}

impl ServiceSettings {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            default_welcome_template: config.whatsapp.default_welcome_template.clone(),
            analysis_enabled: config.analysis.enabled,
            history_limit: config.analysis.history_limit,
        }
    }
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

/// Per-delivery counts returned to WhatsApp
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookReport {
    pub processed: usize,
    /// Redeliveries of messages already ingested
    pub skipped: usize,
    pub failed: usize,
}

/// Body of `POST /send-template`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTemplateRequest {
    pub host_id: String,
    pub to: String,
    pub template_name: String,
    #[serde(default)]
    pub guest_name: Option<String>,
    #[serde(default)]
    pub property_id: Option<String>,
    /// Render the template text without calling WhatsApp
    #[serde(default)]
    pub test_mode: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTemplateResponse {
    pub template_name: String,
    pub content: String,
    pub test_mode: bool,
    pub whatsapp_message_id: Option<String>,
}

pub struct ConversationService {
    store: Arc<dyn ConversationStore>,
    sender: Arc<dyn TemplateSender>,
    classifier: Arc<dyn Classifier>,
    deliveries: Arc<dyn DeliveryLog>,
    settings: ServiceSettings,
}

impl ConversationService {
    pub fn new(
        store: Arc<dyn ConversationStore>,
        sender: Arc<dyn TemplateSender>,
        classifier: Arc<dyn Classifier>,
        deliveries: Arc<dyn DeliveryLog>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            store,
            sender,
            classifier,
            deliveries,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn classifier_name(&self) -> &'static str {
        self.classifier.name()
    }

    // ----- conversation creation -----

    /// Create a conversation from booking data, or return the existing one for the same
    /// guest phone and property. Only a new conversation gets a welcome template attempt.
    pub async fn create_conversation(&self, request: &CreateConversationRequest) -> Result<ConversationOutcome> {
        InputValidator::validate_conversation_request(request)?;
        let guest_phone = normalize_french(&request.guest_phone);

        let property = self
            .store
            .get_property(&request.property_id)
            .await?
            .ok_or_else(|| AirhostError::NotFound(format!("Property {}", request.property_id)))?;

        if let Some(host_id) = request.host_id.as_deref() {
            if host_id != property.host_id {
                return Err(AirhostError::Validation(format!(
                    "Property {} does not belong to host {host_id}",
                    property.id
                )));
            }
        }

        let guest_name = InputValidator::sanitize_text(&request.guest_name);
        let new_conversation = NewConversation {
            host_id: Some(property.host_id.clone()),
            property_id: Some(property.id.clone()),
            last_message: Some(format!("Nouvelle réservation créée pour {guest_name}")),
            guest_name,
            guest_phone,
            guest_email: request.guest_email.clone().filter(|e| !e.trim().is_empty()),
            check_in_date: request.check_in_date,
            check_out_date: request.check_out_date,
            unread_count: 0,
        };
        let (mut conversation, created) = self.store.get_or_insert_conversation(&new_conversation).await?;
        if !created {
            info!(conversation_id = %conversation.id, "Conversation already exists for guest");
            return Ok(ConversationOutcome {
                conversation,
                is_new: false,
                welcome: None,
            });
        }
        metrics::record_conversation_created("booking");
        info!(conversation_id = %conversation.id, property_id = %property.id, "Created conversation");

        let welcome = self
            .send_welcome(&conversation, &property, request.welcome_template_name.as_deref())
            .await
            .unwrap_or_else(|e| {
                warn!(conversation_id = %conversation.id, error = %e, "Welcome template step failed");
                WelcomeOutcome::failed(None, e.to_string())
            });
        metrics::record_template_send(welcome.status);

        if let Err(e) = self
            .store
            .set_welcome_status(&conversation.id, welcome.status, welcome.error.as_deref())
            .await
        {
            error!(conversation_id = %conversation.id, error = %e, "Failed to record welcome template status");
        }
        conversation.welcome_template_status = Some(welcome.status);
        conversation.welcome_template_error.clone_from(&welcome.error);

        Ok(ConversationOutcome {
            conversation,
            is_new: true,
            welcome: Some(welcome),
        })
    }

    async fn send_welcome(
        &self,
        conversation: &Conversation,
        property: &Property,
        requested_template: Option<&str>,
    ) -> Result<WelcomeOutcome> {
        let config = self.store.template_config(&property.host_id).await?;
        let Some(config) = config.filter(|c| c.auto_templates_enabled) else {
            debug!(host_id = %property.host_id, "Automatic templates disabled");
            return Ok(WelcomeOutcome::skipped());
        };

        let template_name = requested_template
            .or(config.welcome_template_name.as_deref())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or(&self.settings.default_welcome_template)
            .to_string();

        let Some(credentials) = self.usable_credentials(&property.host_id).await? else {
            warn!(host_id = %property.host_id, "No usable WhatsApp credentials, welcome template not sent");
            return Ok(WelcomeOutcome::failed(
                Some(template_name),
                "WhatsApp configuration missing or incomplete",
            ));
        };

        let message = TemplateMessage::new(
            to_whatsapp_recipient(&conversation.guest_phone),
            &template_name,
            config.welcome_template_language.as_deref(),
        );

        let whatsapp_message_id = match self.sender.send_template(&credentials, &message).await {
            Ok(id) => id,
            Err(e) => {
                warn!(conversation_id = %conversation.id, template = %template_name, error = %e, "Welcome template send failed");
                return Ok(WelcomeOutcome::failed(Some(template_name), e.to_string()));
            },
        };
        info!(conversation_id = %conversation.id, template = %template_name, %whatsapp_message_id, "Welcome template sent");

        let content = templates::render(
            &template_name,
            &TemplateVariables {
                guest_name: &conversation.guest_name,
                property_name: Some(&property.name),
                property_address: property.address.as_deref(),
            },
        );
        let sent_message = NewMessage {
            conversation_id: conversation.id.clone(),
            content,
            direction: Direction::Outbound,
            message_type: "template".to_string(),
            status: "sent".to_string(),
            whatsapp_message_id: Some(whatsapp_message_id.clone()),
            metadata: Some(json!({
                "template_name": template_name,
                "language": message.language,
            })),
        };
        if let Err(e) = self.store.insert_message(&sent_message).await {
            error!(conversation_id = %conversation.id, error = %e, "Template sent but not stored");
        }

        Ok(WelcomeOutcome {
            status: WelcomeStatus::Sent,
            template_name: Some(template_name),
            whatsapp_message_id: Some(whatsapp_message_id),
            error: None,
        })
    }

    /// Host credentials (or the most recent ones) if they look real
    async fn usable_credentials(&self, host_id: &str) -> Result<Option<WhatsAppConfig>> {
        let credentials = self.store.whatsapp_config_for_host(Some(host_id)).await?;
        Ok(credentials.filter(WhatsAppConfig::has_plausible_credentials))
    }

    // ----- manual template send -----

    pub async fn send_template(&self, request: &SendTemplateRequest) -> Result<SendTemplateResponse> {
        InputValidator::validate_id("host_id", &request.host_id)?;
        InputValidator::validate_phone(&request.to)?;
        InputValidator::validate_template_name(&request.template_name)?;

        let property = match request.property_id.as_deref() {
            Some(id) => Some(
                self.store
                    .get_property(id)
                    .await?
                    .ok_or_else(|| AirhostError::NotFound(format!("Property {id}")))?,
            ),
            None => None,
        };
        let guest_name = request.guest_name.as_deref().unwrap_or(DEFAULT_GUEST_NAME);
        let content = templates::render(
            &request.template_name,
            &TemplateVariables {
                guest_name,
                property_name: property.as_ref().map(|p| p.name.as_str()),
                property_address: property.as_ref().and_then(|p| p.address.as_deref()),
            },
        );

        if request.test_mode {
            info!(template = %request.template_name, "Template rendered in test mode");
            return Ok(SendTemplateResponse {
                template_name: request.template_name.clone(),
                content,
                test_mode: true,
                whatsapp_message_id: None,
            });
        }

        let credentials = self
            .usable_credentials(&request.host_id)
            .await?
            .ok_or_else(|| AirhostError::Validation("WhatsApp configuration missing or incomplete".to_string()))?;
        let language = self
            .store
            .template_config(&request.host_id)
            .await?
            .and_then(|c| c.welcome_template_language);

        let message = TemplateMessage::new(
            to_whatsapp_recipient(&normalize_french(&request.to)),
            &request.template_name,
            language.as_deref(),
        );
        let result = self.sender.send_template(&credentials, &message).await;
        metrics::record_template_send(if result.is_ok() { WelcomeStatus::Sent } else { WelcomeStatus::Failed });
        let whatsapp_message_id = result?;

        Ok(SendTemplateResponse {
            template_name: request.template_name.clone(),
            content,
            test_mode: false,
            whatsapp_message_id: Some(whatsapp_message_id),
        })
    }

    // ----- webhook -----

    /// Ingest every message of a webhook delivery. Per-message failures are counted, not
    /// propagated; only a payload from a foreign object is rejected.
    pub async fn handle_webhook(&self, payload: &WhatsAppWebhook) -> Result<WebhookReport> {
        if !payload.is_supported() {
            return Err(AirhostError::Validation(format!(
                "Unsupported webhook object: {}",
                payload.object.as_deref().unwrap_or("<none>")
            )));
        }

        let mut report = WebhookReport::default();
        for value in payload.message_values() {
            if !value.statuses.is_empty() {
                debug!(count = value.statuses.len(), "Ignoring delivery status updates");
            }

            for message in &value.messages {
                match self.claim_delivery(&message.id).await {
                    Ok(true) => {},
                    Ok(false) => {
                        metrics::record_webhook_message("duplicate");
                        report.skipped += 1;
                        continue;
                    },
                    Err(e) => {
                        error!(whatsapp_message_id = %message.id, error = %e, "Failed to claim WhatsApp message");
                        metrics::record_webhook_message("failed");
                        report.failed += 1;
                        continue;
                    },
                }

                match self.ingest_message(value, message).await {
                    Ok(conversation_id) => {
                        if let Err(e) = self.deliveries.assign_conversation(&message.id, &conversation_id) {
                            warn!(whatsapp_message_id = %message.id, error = %e, "Failed to update delivery cache");
                        }
                        metrics::record_webhook_message("processed");
                        report.processed += 1;
                    },
                    Err(e) => {
                        error!(whatsapp_message_id = %message.id, error = %e, "Failed to process WhatsApp message");
                        if let Err(e) = self.deliveries.forget(&message.id) {
                            warn!(whatsapp_message_id = %message.id, error = %e, "Failed to release delivery claim");
                        }
                        metrics::record_webhook_message("failed");
                        report.failed += 1;
                    },
                }
            }
        }

        info!(
            processed = report.processed,
            skipped = report.skipped,
            failed = report.failed,
            "Webhook processed"
        );
        Ok(report)
    }

    /// Claim a message id in the delivery log, then check the store for a copy that
    /// outlived its cache entry. Returns `false` for a message already ingested.
    async fn claim_delivery(&self, whatsapp_message_id: &str) -> Result<bool> {
        if !self.deliveries.mark_seen(whatsapp_message_id)? {
            return Ok(false);
        }
        match self.store.message_exists(whatsapp_message_id).await {
            Ok(false) => Ok(true),
            Ok(true) => {
                debug!(whatsapp_message_id, "Message already stored");
                Ok(false)
            },
            Err(e) => {
                if let Err(release) = self.deliveries.forget(whatsapp_message_id) {
                    warn!(whatsapp_message_id, error = %release, "Failed to release delivery claim");
                }
                Err(e)
            },
        }
    }

    /// Store one inbound message. Returns the conversation it was filed under.
    async fn ingest_message(&self, value: &WhatsAppValue, message: &WhatsAppMessage) -> Result<String> {
        let extracted = extract_message_content(message);
        let guest_phone = normalize_international(&message.from);
        let guest_name = value.contact_name(&message.from).unwrap_or(DEFAULT_GUEST_NAME);

        let conversation = match self.store.find_conversation(&guest_phone, None).await? {
            Some(conversation) => {
                self.store
                    .touch_conversation(&conversation.id, &extracted.content, true)
                    .await?;
                conversation
            },
            None => {
                let property = self
                    .property_for_number(value.metadata.phone_number_id.as_deref())
                    .await?
                    .ok_or_else(|| AirhostError::NotFound("Property for incoming conversation".to_string()))?;
                let (conversation, created) = self
                    .store
                    .get_or_insert_conversation(&NewConversation {
                        host_id: Some(property.host_id.clone()),
                        property_id: Some(property.id.clone()),
                        guest_name: InputValidator::sanitize_text(guest_name),
                        guest_phone: guest_phone.clone(),
                        guest_email: None,
                        check_in_date: None,
                        check_out_date: None,
                        last_message: Some(extracted.content.clone()),
                        unread_count: 1,
                    })
                    .await?;
                if created {
                    metrics::record_conversation_created("webhook");
                    info!(conversation_id = %conversation.id, property_id = %property.id, "Created conversation from WhatsApp");
                } else {
                    self.store
                        .touch_conversation(&conversation.id, &extracted.content, true)
                        .await?;
                }
                conversation
            },
        };

        let mut inbound = NewMessage::inbound(&conversation.id, &extracted.content, &extracted.message_type);
        inbound.whatsapp_message_id = Some(message.id.clone());
        inbound.metadata = Some(extracted.metadata);
        let stored = self.store.insert_message(&inbound).await?;
        debug!(conversation_id = %conversation.id, message_id = %stored.id, "Stored inbound message");

        if self.settings.analysis_enabled {
            if let Err(e) = self.analyze_conversation(&conversation, Some(&stored.id)).await {
                warn!(conversation_id = %conversation.id, error = %e, "Analysis failed; message kept");
            }
        }

        Ok(conversation.id)
    }

    /// Default property of the host owning the receiving number, else any property
    async fn property_for_number(&self, phone_number_id: Option<&str>) -> Result<Option<Property>> {
        if let Some(phone_number_id) = phone_number_id {
            let host_id = self
                .store
                .whatsapp_config_by_phone_number_id(phone_number_id)
                .await?
                .and_then(|config| config.host_id);
            if let Some(host_id) = host_id {
                if let Some(property) = self.store.default_property_for_host(&host_id).await? {
                    return Ok(Some(property));
                }
            }
        }
        self.store.any_property().await
    }

    // ----- analysis -----

    /// Classify a transcript without storing anything
    pub async fn classify(&self, history: &[ChatTurn]) -> Classification {
        let start = Instant::now();
        let classification = self.classifier.classify(history).await;
        metrics::record_classification(classification.tag, classification.source, start.elapsed());
        debug!(
            classifier = self.classifier.name(),
            tag = %classification.tag,
            confidence = classification.confidence,
            "Classified conversation"
        );
        classification
    }

    /// Classify the recent history of a conversation, store the analysis and open an
    /// emergency case for emergency tags.
    pub async fn analyze_conversation(
        &self,
        conversation: &Conversation,
        message_id: Option<&str>,
    ) -> Result<Classification> {
        let history: Vec<ChatTurn> = self
            .store
            .list_messages(&conversation.id, Some(self.settings.history_limit))
            .await?
            .iter()
            .map(ChatTurn::from)
            .collect();

        let classification = self.classify(&history).await;
        self.store
            .record_analysis(&conversation.id, message_id, &classification)
            .await?;

        if classification.tag.is_emergency() {
            let case = self
                .store
                .open_emergency_case(
                    &conversation.id,
                    conversation.host_id.as_deref(),
                    classification.tag.emergency_status().as_str(),
                    &classification.explanation,
                )
                .await?;
            warn!(
                conversation_id = %conversation.id,
                case_id = %case.id,
                tag = %classification.tag,
                "Emergency case opened"
            );
        }

        Ok(classification)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;
    use crate::cache::{DeliveryCache, MockDeliveryLog};
    use crate::classifier::{KeywordClassifier, MockClassifier};
    use crate::db::Database;
    use crate::models::{ConversationTag, NewTemplateConfig, NewWhatsAppConfig};
    use crate::repository::SqliteStore;
    use crate::whatsapp::MockTemplateSender;

    const PHONE_NUMBER_ID: &str = "604674832740532";

    struct Fixture {
        db: Database,
        host_id: String,
        property_id: String,
    }

    fn fixture(auto_templates: bool, credentials: bool) -> Fixture {
        seed(Database::in_memory().unwrap(), auto_templates, credentials)
    }

    fn seed(db: Database, auto_templates: bool, credentials: bool) -> Fixture {
        let host = db.insert_host("Alice", Some("alice@example.com")).unwrap();
        let property = db
            .insert_property(&host.id, "Studio Montmartre", Some("12 rue Lepic, Paris"), None)
            .unwrap();
        db.upsert_template_config(&NewTemplateConfig {
            host_id: host.id.clone(),
            auto_templates_enabled: auto_templates,
            welcome_template_name: Some("welcome_checkin".into()),
            welcome_template_language: None,
        })
        .unwrap();
        if credentials {
            db.upsert_whatsapp_config(&NewWhatsAppConfig {
                host_id: Some(host.id.clone()),
                phone_number_id: PHONE_NUMBER_ID.into(),
                access_token: "EAAG-long-enough-token".into(),
                business_account_id: None,
                webhook_verify_token: None,
                is_active: true,
            })
            .unwrap();
        }
        Fixture {
            db,
            host_id: host.id,
            property_id: property.id,
        }
    }

    fn service(fixture: &Fixture, sender: MockTemplateSender, classifier: Arc<dyn Classifier>) -> ConversationService {
        with_deliveries(fixture, sender, classifier, Arc::new(DeliveryCache::temporary().unwrap()))
    }

    fn with_deliveries(
        fixture: &Fixture,
        sender: MockTemplateSender,
        classifier: Arc<dyn Classifier>,
        deliveries: Arc<dyn DeliveryLog>,
    ) -> ConversationService {
        ConversationService::new(
            Arc::new(SqliteStore::new(fixture.db.clone())),
            Arc::new(sender),
            classifier,
            deliveries,
            ServiceSettings::default(),
        )
    }

    fn request(fixture: &Fixture) -> CreateConversationRequest {
        CreateConversationRequest {
            host_id: Some(fixture.host_id.clone()),
            guest_name: "Marie Dupont".into(),
            guest_phone: "06 12 34 56 78".into(),
            property_id: fixture.property_id.clone(),
            check_in_date: chrono::NaiveDate::from_ymd_opt(2025, 7, 1),
            check_out_date: chrono::NaiveDate::from_ymd_opt(2025, 7, 8),
            ..Default::default()
        }
    }

    fn text_webhook(id: &str, body: &str) -> WhatsAppWebhook {
        serde_json::from_value(json!({
            "object": "whatsapp_business_account",
            "entry": [{
                "id": "entry-1",
                "changes": [{
                    "field": "messages",
                    "value": {
                        "messaging_product": "whatsapp",
                        "metadata": { "display_phone_number": "33700000000", "phone_number_id": PHONE_NUMBER_ID },
                        "contacts": [{ "wa_id": "33612345678", "profile": { "name": "Marie" } }],
                        "messages": [{
                            "id": id,
                            "from": "33612345678",
                            "timestamp": "1718000000",
                            "type": "text",
                            "text": { "body": body }
                        }]
                    }
                }]
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_disabled_templates_never_send() {
        let fixture = fixture(false, true);
        let mut sender = MockTemplateSender::new();
        sender.expect_send_template().never();
        let service = service(&fixture, sender, Arc::new(KeywordClassifier::new()));

        let outcome = service.create_conversation(&request(&fixture)).await.unwrap();

        assert!(outcome.is_new);
        assert_eq!(outcome.welcome.unwrap().status, WelcomeStatus::Skipped);
        assert_eq!(outcome.conversation.guest_phone, "+33612345678");
        assert_eq!(
            outcome.conversation.last_message.as_deref(),
            Some("Nouvelle réservation créée pour Marie Dupont")
        );
    }

    #[tokio::test]
    async fn test_enabled_templates_send_once_and_store_message() {
        let fixture = fixture(true, true);
        let mut sender = MockTemplateSender::new();
        sender
            .expect_send_template()
            .times(1)
            .withf(|credentials, message| {
                credentials.phone_number_id == PHONE_NUMBER_ID
                    && message.to == "33612345678"
                    && message.template_name == "welcome_checkin"
                    && message.language == "fr"
            })
            .returning(|_, _| Ok("wamid.HBgLMzM2".to_string()));
        let service = service(&fixture, sender, Arc::new(KeywordClassifier::new()));

        let outcome = service.create_conversation(&request(&fixture)).await.unwrap();
        let welcome = outcome.welcome.unwrap();
        assert_eq!(welcome.status, WelcomeStatus::Sent);
        assert_eq!(welcome.whatsapp_message_id.as_deref(), Some("wamid.HBgLMzM2"));

        let messages = fixture.db.list_messages(&outcome.conversation.id, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].direction, Direction::Outbound);
        assert_eq!(messages[0].message_type, "template");
        assert!(messages[0].content.contains("Marie Dupont"));

        let stored = fixture.db.get_conversation(&outcome.conversation.id).unwrap().unwrap();
        assert_eq!(stored.welcome_template_status, Some(WelcomeStatus::Sent));
    }

    #[tokio::test]
    async fn test_existing_conversation_is_returned_without_send() {
        let fixture = fixture(true, true);
        let mut sender = MockTemplateSender::new();
        sender
            .expect_send_template()
            .times(1)
            .returning(|_, _| Ok("wamid.1".to_string()));
        let service = service(&fixture, sender, Arc::new(KeywordClassifier::new()));

        let first = service.create_conversation(&request(&fixture)).await.unwrap();
        let mut again = request(&fixture);
        again.guest_phone = "+33 6 12 34 56 78".into();
        let second = service.create_conversation(&again).await.unwrap();

        assert!(!second.is_new);
        assert!(second.welcome.is_none());
        assert_eq!(first.conversation.id, second.conversation.id);
        assert_eq!(fixture.db.list_conversations(None, false).unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_keeps_one_conversation() {
        let dir = tempfile::TempDir::new().unwrap();
        let db = Database::new(&dir.path().join("airhost.db").to_string_lossy()).unwrap();
        let fixture = seed(db, true, true);
        let mut sender = MockTemplateSender::new();
        sender
            .expect_send_template()
            .times(1)
            .returning(|_, _| Ok("wamid.WELCOME".to_string()));
        let service = Arc::new(service(&fixture, sender, Arc::new(KeywordClassifier::new())));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let service = Arc::clone(&service);
                let request = request(&fixture);
                tokio::spawn(async move { service.create_conversation(&request).await })
            })
            .collect();

        let mut ids = HashSet::new();
        let mut created = 0;
        for task in tasks {
            let outcome = task.await.unwrap().unwrap();
            if outcome.is_new {
                created += 1;
                assert_eq!(outcome.welcome.unwrap().status, WelcomeStatus::Sent);
            } else {
                assert!(outcome.welcome.is_none());
            }
            ids.insert(outcome.conversation.id);
        }

        assert_eq!(created, 1);
        assert_eq!(ids.len(), 1);
        assert_eq!(fixture.db.list_conversations(None, false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_placeholder_credentials_fail_without_api_call() {
        let fixture = fixture(true, false);
        fixture
            .db
            .upsert_whatsapp_config(&NewWhatsAppConfig {
                host_id: Some(fixture.host_id.clone()),
                phone_number_id: "123".into(),
                access_token: "token".into(),
                business_account_id: None,
                webhook_verify_token: None,
                is_active: true,
            })
            .unwrap();
        let mut sender = MockTemplateSender::new();
        sender.expect_send_template().never();
        let service = service(&fixture, sender, Arc::new(KeywordClassifier::new()));

        let outcome = service.create_conversation(&request(&fixture)).await.unwrap();
        let welcome = outcome.welcome.unwrap();
        assert_eq!(welcome.status, WelcomeStatus::Failed);
        assert_eq!(welcome.template_name.as_deref(), Some("welcome_checkin"));
    }

    #[tokio::test]
    async fn test_send_failure_keeps_conversation() {
        let fixture = fixture(true, true);
        let mut sender = MockTemplateSender::new();
        sender.expect_send_template().times(1).returning(|_, _| {
            Err(AirhostError::Upstream {
                service: "WhatsApp",
                status: 400,
                body: "template not approved".into(),
            })
        });
        let service = service(&fixture, sender, Arc::new(KeywordClassifier::new()));

        let outcome = service.create_conversation(&request(&fixture)).await.unwrap();
        assert_eq!(outcome.welcome.unwrap().status, WelcomeStatus::Failed);

        let stored = fixture.db.get_conversation(&outcome.conversation.id).unwrap().unwrap();
        assert_eq!(stored.welcome_template_status, Some(WelcomeStatus::Failed));
        assert!(stored.welcome_template_error.unwrap().contains("template not approved"));
    }

    #[tokio::test]
    async fn test_unknown_property_is_not_found() {
        let fixture = fixture(false, false);
        let service = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));
        let mut req = request(&fixture);
        req.property_id = "missing-property".into();

        let err = service.create_conversation(&req).await.unwrap_err();
        assert!(matches!(err, AirhostError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_booking_without_dates_is_rejected() {
        let fixture = fixture(true, true);
        let mut sender = MockTemplateSender::new();
        sender.expect_send_template().never();
        let service = service(&fixture, sender, Arc::new(KeywordClassifier::new()));
        let mut req = request(&fixture);
        req.check_out_date = None;

        let err = service.create_conversation(&req).await.unwrap_err();
        assert!(matches!(err, AirhostError::Validation(_)));
        assert!(fixture.db.list_conversations(None, false).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_request_is_rejected() {
        let fixture = fixture(false, false);
        let service = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));
        let mut req = request(&fixture);
        req.guest_name = "   ".into();

        let err = service.create_conversation(&req).await.unwrap_err();
        assert!(matches!(err, AirhostError::Validation(_)));
    }

    #[tokio::test]
    async fn test_webhook_creates_conversation_and_opens_emergency_case() {
        let fixture = fixture(false, true);
        let service = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));

        let report = service
            .handle_webhook(&text_webhook("wamid.A", "Il y a une fuite d'eau dans la salle de bain"))
            .await
            .unwrap();
        assert_eq!(report, WebhookReport { processed: 1, skipped: 0, failed: 0 });

        let conversation = fixture.db.find_conversation("+33612345678", None).unwrap().unwrap();
        assert_eq!(conversation.guest_name, "Marie");
        assert_eq!(conversation.property_id.as_deref(), Some(fixture.property_id.as_str()));
        assert_eq!(conversation.unread_count, 1);

        let analyses = fixture.db.list_analyses(&conversation.id).unwrap();
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].tag, ConversationTag::CriticalEmergency);
        assert_eq!(fixture.db.active_emergency_cases(None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_redelivery_is_skipped() {
        let fixture = fixture(false, true);
        let service = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));
        let payload = text_webhook("wamid.B", "Bonjour, merci !");

        service.handle_webhook(&payload).await.unwrap();
        let report = service.handle_webhook(&payload).await.unwrap();

        assert_eq!(report.skipped, 1);
        assert_eq!(report.processed, 0);
        let conversation = fixture.db.find_conversation("+33612345678", None).unwrap().unwrap();
        assert_eq!(fixture.db.list_messages(&conversation.id, None).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_appends_to_existing_conversation() {
        let fixture = fixture(false, true);
        let service = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));

        service.handle_webhook(&text_webhook("wamid.C1", "Bonjour")).await.unwrap();
        service.handle_webhook(&text_webhook("wamid.C2", "À quelle heure est le check-in ?")).await.unwrap();

        let conversation = fixture.db.find_conversation("+33612345678", None).unwrap().unwrap();
        assert_eq!(conversation.unread_count, 2);
        assert_eq!(conversation.last_message.as_deref(), Some("À quelle heure est le check-in ?"));
        assert_eq!(fixture.db.list_conversations(None, false).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_without_property_counts_failure() {
        let db = Database::in_memory().unwrap();
        let fixture = Fixture {
            db,
            host_id: String::new(),
            property_id: String::new(),
        };
        let cache = Arc::new(DeliveryCache::temporary().unwrap());
        let service = with_deliveries(
            &fixture,
            MockTemplateSender::new(),
            Arc::new(KeywordClassifier::new()),
            cache.clone(),
        );

        let report = service.handle_webhook(&text_webhook("wamid.D", "Bonjour")).await.unwrap();
        assert_eq!(report.failed, 1);
        // The claim was released, so a redelivery can be claimed again
        assert!(cache.mark_seen("wamid.D").unwrap());
    }

    #[tokio::test]
    async fn test_cache_failure_fails_only_that_message() {
        let fixture = fixture(false, true);
        let mut deliveries = MockDeliveryLog::new();
        deliveries
            .expect_mark_seen()
            .withf(|id| id.ends_with("BROKEN"))
            .returning(|_| Err(AirhostError::Cache("io error: disk full".into())));
        deliveries
            .expect_mark_seen()
            .withf(|id| id.ends_with(".OK"))
            .times(1)
            .returning(|_| Ok(true));
        deliveries.expect_assign_conversation().times(1).returning(|_, _| Ok(()));
        let service = with_deliveries(
            &fixture,
            MockTemplateSender::new(),
            Arc::new(KeywordClassifier::new()),
            Arc::new(deliveries),
        );

        let mut payload = text_webhook("wamid.BROKEN", "Bonjour");
        let mut second = payload.entry[0].changes[0].value.messages[0].clone();
        second.id = "wamid.OK".into();
        payload.entry[0].changes[0].value.messages.push(second);

        let report = service.handle_webhook(&payload).await.unwrap();
        assert_eq!(report, WebhookReport { processed: 1, skipped: 0, failed: 1 });

        let conversation = fixture.db.find_conversation("+33612345678", None).unwrap().unwrap();
        let messages = fixture.db.list_messages(&conversation.id, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].whatsapp_message_id.as_deref(), Some("wamid.OK"));
    }

    #[tokio::test]
    async fn test_stored_message_is_skipped_after_cache_loss() {
        let fixture = fixture(false, true);
        let payload = text_webhook("wamid.G", "Bonjour");

        let first = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));
        assert_eq!(first.handle_webhook(&payload).await.unwrap().processed, 1);

        // A fresh delivery cache, as after pruning or losing the cache directory
        let second = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));
        let report = second.handle_webhook(&payload).await.unwrap();
        assert_eq!(report, WebhookReport { processed: 0, skipped: 1, failed: 0 });

        let conversation = fixture.db.find_conversation("+33612345678", None).unwrap().unwrap();
        assert_eq!(fixture.db.list_messages(&conversation.id, None).unwrap().len(), 1);
        assert_eq!(conversation.unread_count, 1);
    }

    #[tokio::test]
    async fn test_foreign_object_is_rejected() {
        let fixture = fixture(false, false);
        let service = service(&fixture, MockTemplateSender::new(), Arc::new(KeywordClassifier::new()));
        let payload: WhatsAppWebhook = serde_json::from_value(json!({ "object": "page", "entry": [] })).unwrap();

        assert!(matches!(
            service.handle_webhook(&payload).await,
            Err(AirhostError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_analysis_disabled_skips_classifier() {
        let fixture = fixture(false, true);
        let mut classifier = MockClassifier::new();
        classifier.expect_classify().never();
        let service = ConversationService::new(
            Arc::new(SqliteStore::new(fixture.db.clone())),
            Arc::new(MockTemplateSender::new()),
            Arc::new(classifier),
            Arc::new(DeliveryCache::temporary().unwrap()),
            ServiceSettings {
                analysis_enabled: false,
                ..ServiceSettings::default()
            },
        );

        let report = service.handle_webhook(&text_webhook("wamid.E", "Il y a une fuite")).await.unwrap();
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_send_template_test_mode_renders_only() {
        let fixture = fixture(false, true);
        let mut sender = MockTemplateSender::new();
        sender.expect_send_template().never();
        let service = service(&fixture, sender, Arc::new(KeywordClassifier::new()));

        let response = service
            .send_template(&SendTemplateRequest {
                host_id: fixture.host_id.clone(),
                to: "0612345678".into(),
                template_name: "welcome_property_info".into(),
                guest_name: Some("Marie".into()),
                property_id: Some(fixture.property_id.clone()),
                test_mode: true,
            })
            .await
            .unwrap();

        assert!(response.test_mode);
        assert!(response.content.contains("Studio Montmartre"));
        assert!(response.whatsapp_message_id.is_none());
    }
}
