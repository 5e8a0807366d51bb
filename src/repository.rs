//! Storage seam for the messaging workflows.
//!
//! `ConversationStore` is implemented by [`SqliteStore`] (local database, versioned schema)
//! and by `supabase::SupabaseStore` (hosted PostgREST API).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::config::AppConfig;
use crate::db::Database;
use crate::error::{AirhostError, Result};
use crate::models::{
    AnalysisRecord, Classification, Conversation, EmergencyCase, Host, IntegrityReport, Message, NewConversation,
    NewMessage, NewTemplateConfig, NewWhatsAppConfig, Property, TemplateConfig, WelcomeStatus, WhatsAppConfig,
};
use crate::supabase::SupabaseStore;

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn get_property(&self, id: &str) -> Result<Option<Property>>;
    async fn default_property_for_host(&self, host_id: &str) -> Result<Option<Property>>;
    async fn any_property(&self) -> Result<Option<Property>>;

    async fn find_conversation(&self, guest_phone: &str, property_id: Option<&str>) -> Result<Option<Conversation>>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;
    /// Insert unless the guest already has a conversation at that property. The flag is
    /// `true` when this call created the row.
    async fn get_or_insert_conversation(&self, new_conversation: &NewConversation) -> Result<(Conversation, bool)>;
    async fn touch_conversation(&self, id: &str, last_message: &str, increment_unread: bool) -> Result<()>;
    async fn set_welcome_status(&self, id: &str, status: WelcomeStatus, error: Option<&str>) -> Result<()>;
    async fn list_conversations(&self, host_id: Option<&str>, needs_attention_only: bool) -> Result<Vec<Conversation>>;

    async fn insert_message(&self, new_message: &NewMessage) -> Result<Message>;
    async fn list_messages(&self, conversation_id: &str, limit: Option<usize>) -> Result<Vec<Message>>;
    /// Whether a message with this WhatsApp id is already stored
    async fn message_exists(&self, whatsapp_message_id: &str) -> Result<bool>;

    async fn whatsapp_config_for_host(&self, host_id: Option<&str>) -> Result<Option<WhatsAppConfig>>;
    async fn whatsapp_config_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<WhatsAppConfig>>;
    async fn template_config(&self, host_id: &str) -> Result<Option<TemplateConfig>>;

    async fn record_analysis(
        &self,
        conversation_id: &str,
        message_id: Option<&str>,
        classification: &Classification,
    ) -> Result<AnalysisRecord>;
    async fn open_emergency_case(
        &self,
        conversation_id: &str,
        host_id: Option<&str>,
        emergency_type: &str,
        description: &str,
    ) -> Result<EmergencyCase>;

    // Operator commands
    async fn insert_host(&self, name: &str, email: Option<&str>) -> Result<Host>;
    async fn insert_property(
        &self,
        host_id: &str,
        name: &str,
        address: Option<&str>,
        ai_instructions: Option<&str>,
    ) -> Result<Property>;
    async fn upsert_whatsapp_config(&self, config: &NewWhatsAppConfig) -> Result<WhatsAppConfig>;
    async fn upsert_template_config(&self, config: &NewTemplateConfig) -> Result<TemplateConfig>;
    async fn integrity_report(&self) -> Result<IntegrityReport>;
    async fn reconcile_conversations(&self) -> Result<usize>;
}

/// [`ConversationStore`] over the local SQLite database.
///
/// Queries run on the blocking thread pool so handlers never stall the runtime.
#[derive(Clone)]
pub struct SqliteStore {
    db: Database,
}

impl SqliteStore {
    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    pub const fn database(&self) -> &Database {
        &self.db
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| AirhostError::Other(format!("Database task failed: {e}")))?
    }
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(ToString::to_string)
}

#[async_trait]
impl ConversationStore for SqliteStore {
    async fn get_property(&self, id: &str) -> Result<Option<Property>> {
        let id = id.to_string();
        self.blocking(move |db| db.get_property(&id)).await
    }

    async fn default_property_for_host(&self, host_id: &str) -> Result<Option<Property>> {
        let host_id = host_id.to_string();
        self.blocking(move |db| db.default_property_for_host(&host_id)).await
    }

    async fn any_property(&self) -> Result<Option<Property>> {
        self.blocking(Database::any_property).await
    }

    async fn find_conversation(&self, guest_phone: &str, property_id: Option<&str>) -> Result<Option<Conversation>> {
        let phone = guest_phone.to_string();
        let property_id = owned(property_id);
        self.blocking(move |db| db.find_conversation(&phone, property_id.as_deref()))
            .await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let id = id.to_string();
        self.blocking(move |db| db.get_conversation(&id)).await
    }

    async fn get_or_insert_conversation(&self, new_conversation: &NewConversation) -> Result<(Conversation, bool)> {
        let new_conversation = new_conversation.clone();
        self.blocking(move |db| db.get_or_insert_conversation(&new_conversation))
            .await
    }

    async fn touch_conversation(&self, id: &str, last_message: &str, increment_unread: bool) -> Result<()> {
        let id = id.to_string();
        let last_message = last_message.to_string();
        self.blocking(move |db| db.touch_conversation(&id, &last_message, increment_unread))
            .await
    }

    async fn set_welcome_status(&self, id: &str, status: WelcomeStatus, error: Option<&str>) -> Result<()> {
        let id = id.to_string();
        let error = owned(error);
        self.blocking(move |db| db.set_welcome_status(&id, status, error.as_deref()))
            .await
    }

    async fn list_conversations(&self, host_id: Option<&str>, needs_attention_only: bool) -> Result<Vec<Conversation>> {
        let host_id = owned(host_id);
        self.blocking(move |db| db.list_conversations(host_id.as_deref(), needs_attention_only))
            .await
    }

    async fn insert_message(&self, new_message: &NewMessage) -> Result<Message> {
        let new_message = new_message.clone();
        self.blocking(move |db| db.insert_message(&new_message)).await
    }

    async fn list_messages(&self, conversation_id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.blocking(move |db| db.list_messages(&conversation_id, limit))
            .await
    }

    async fn message_exists(&self, whatsapp_message_id: &str) -> Result<bool> {
        let whatsapp_message_id = whatsapp_message_id.to_string();
        self.blocking(move |db| db.message_exists(&whatsapp_message_id))
            .await
    }

    async fn whatsapp_config_for_host(&self, host_id: Option<&str>) -> Result<Option<WhatsAppConfig>> {
        let host_id = owned(host_id);
        self.blocking(move |db| db.whatsapp_config_for_host(host_id.as_deref()))
            .await
    }

    async fn whatsapp_config_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<WhatsAppConfig>> {
        let phone_number_id = phone_number_id.to_string();
        self.blocking(move |db| db.whatsapp_config_by_phone_number_id(&phone_number_id))
            .await
    }

    async fn template_config(&self, host_id: &str) -> Result<Option<TemplateConfig>> {
        let host_id = host_id.to_string();
        self.blocking(move |db| db.template_config(&host_id)).await
    }

    async fn record_analysis(
        &self,
        conversation_id: &str,
        message_id: Option<&str>,
        classification: &Classification,
    ) -> Result<AnalysisRecord> {
        let conversation_id = conversation_id.to_string();
        let message_id = owned(message_id);
        let classification = classification.clone();
        self.blocking(move |db| db.record_analysis(&conversation_id, message_id.as_deref(), &classification))
            .await
    }

    async fn open_emergency_case(
        &self,
        conversation_id: &str,
        host_id: Option<&str>,
        emergency_type: &str,
        description: &str,
    ) -> Result<EmergencyCase> {
        let conversation_id = conversation_id.to_string();
        let host_id = owned(host_id);
        let emergency_type = emergency_type.to_string();
        let description = description.to_string();
        self.blocking(move |db| {
            db.open_emergency_case(&conversation_id, host_id.as_deref(), &emergency_type, &description)
        })
        .await
    }

    async fn insert_host(&self, name: &str, email: Option<&str>) -> Result<Host> {
        let name = name.to_string();
        let email = owned(email);
        self.blocking(move |db| db.insert_host(&name, email.as_deref())).await
    }

    async fn insert_property(
        &self,
        host_id: &str,
        name: &str,
        address: Option<&str>,
        ai_instructions: Option<&str>,
    ) -> Result<Property> {
        let host_id = host_id.to_string();
        let name = name.to_string();
        let address = owned(address);
        let ai_instructions = owned(ai_instructions);
        self.blocking(move |db| db.insert_property(&host_id, &name, address.as_deref(), ai_instructions.as_deref()))
            .await
    }

    async fn upsert_whatsapp_config(&self, config: &NewWhatsAppConfig) -> Result<WhatsAppConfig> {
        let config = config.clone();
        self.blocking(move |db| db.upsert_whatsapp_config(&config)).await
    }

    async fn upsert_template_config(&self, config: &NewTemplateConfig) -> Result<TemplateConfig> {
        let config = config.clone();
        self.blocking(move |db| db.upsert_template_config(&config)).await
    }

    async fn integrity_report(&self) -> Result<IntegrityReport> {
        self.blocking(Database::integrity_report).await
    }

    async fn reconcile_conversations(&self) -> Result<usize> {
        self.blocking(Database::reconcile_conversations).await
    }
}

/// Open the backend selected by `store.backend`
pub fn open_store(config: &AppConfig) -> Result<Arc<dyn ConversationStore>> {
    match config.store.backend.as_str() {
        "sqlite" => {
            let db = Database::with_pool_settings(
                &config.database.url,
                config.database.max_connections,
                config.database.connection_timeout_secs,
            )?;
            Ok(Arc::new(SqliteStore::new(db)))
        },
        "supabase" => {
            let store = SupabaseStore::from_config(&config.supabase)?;
            info!("Using Supabase store");
            Ok(Arc::new(store))
        },
        other => Err(AirhostError::InvalidConfig(format!("Unknown store backend: {other}"))),
    }
}
