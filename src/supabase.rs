//! [`ConversationStore`] over the Supabase PostgREST API.
//!
//! Rows are exchanged as JSON using the column names in `schema`. The hosted database has
//! no analysis trigger, so [`SupabaseStore::record_analysis`] patches the conversation itself.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::SupabaseConfig;
use crate::error::{AirhostError, Result};
use crate::models::{
    AnalysisRecord, Classification, Conversation, EmergencyCase, Host, IntegrityReport, Message, NewConversation,
    NewMessage, NewTemplateConfig, NewWhatsAppConfig, Property, TemplateConfig, WelcomeStatus, WhatsAppConfig,
};
use crate::repository::ConversationStore;
use crate::schema::{
    conversation_analysis, conversations, emergency_cases, hosts, messages, properties, whatsapp_config,
    whatsapp_template_config,
};

type Query = Vec<(&'static str, String)>;

fn eq(value: &str) -> String {
    format!("eq.{value}")
}

/// `eq.<value>` or `is.null`
fn eq_or_null(value: Option<&str>) -> String {
    value.map_or_else(|| "is.null".to_string(), eq)
}

#[derive(Clone)]
pub struct SupabaseStore {
    http: reqwest::Client,
    rest_url: String,
    service_key: String,
}

impl std::fmt::Debug for SupabaseStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseStore")
            .field("rest_url", &self.rest_url)
            .finish_non_exhaustive()
    }
}

impl SupabaseStore {
    pub fn new(url: &str, service_key: &str, timeout_secs: u64) -> Result<Self> {
        if url.trim().is_empty() || service_key.trim().is_empty() {
            return Err(AirhostError::InvalidConfig(
                "Supabase URL and service role key are required".to_string(),
            ));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            rest_url: format!("{}/rest/v1", url.trim_end_matches('/')),
            service_key: service_key.to_string(),
        })
    }

    pub fn from_config(config: &SupabaseConfig) -> Result<Self> {
        Self::new(
            config.url.as_deref().unwrap_or_default(),
            config.service_role_key.as_deref().unwrap_or_default(),
            config.timeout_secs,
        )
    }

    fn request(&self, method: reqwest::Method, table: &str) -> RequestBuilder {
        self.http
            .request(method, format!("{}/{table}", self.rest_url))
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AirhostError::Upstream {
            service: "Supabase",
            status: status.as_u16(),
            body,
        })
    }

    async fn select<T: DeserializeOwned>(&self, table: &str, mut query: Query) -> Result<Vec<T>> {
        if !query.iter().any(|(k, _)| *k == "select") {
            query.push(("select", "*".to_string()));
        }
        let response = self.request(reqwest::Method::GET, table).query(&query).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn select_one<T: DeserializeOwned>(&self, table: &str, mut query: Query) -> Result<Option<T>> {
        query.push(("limit", "1".to_string()));
        Ok(self.select(table, query).await?.into_iter().next())
    }

    async fn insert<B, T>(&self, table: &str, body: &B) -> Result<T>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .request(reqwest::Method::POST, table)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let rows: Vec<T> = Self::check(response).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AirhostError::Other(format!("Supabase returned no row for insert into {table}")))
    }

    async fn update<B, T>(&self, table: &str, query: Query, body: &B) -> Result<Vec<T>>
    where
        B: Serialize + Sync + ?Sized,
        T: DeserializeOwned,
    {
        let response = self
            .request(reqwest::Method::PATCH, table)
            .header("Prefer", "return=representation")
            .query(&query)
            .json(body)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn patch_conversation(&self, id: &str, body: &serde_json::Value) -> Result<()> {
        let updated: Vec<Conversation> = self
            .update(conversations::TABLE, vec![(conversations::ID, eq(id))], body)
            .await?;
        if updated.is_empty() {
            return Err(AirhostError::NotFound(format!("Conversation {id}")));
        }
        Ok(())
    }
}

#[async_trait]
impl ConversationStore for SupabaseStore {
    async fn get_property(&self, id: &str) -> Result<Option<Property>> {
        self.select_one(properties::TABLE, vec![(properties::ID, eq(id))]).await
    }

    async fn default_property_for_host(&self, host_id: &str) -> Result<Option<Property>> {
        self.select_one(
            properties::TABLE,
            vec![
                (properties::HOST_ID, eq(host_id)),
                ("order", format!("{}.asc", properties::CREATED_AT)),
            ],
        )
        .await
    }

    async fn any_property(&self) -> Result<Option<Property>> {
        self.select_one(properties::TABLE, vec![("order", format!("{}.asc", properties::CREATED_AT))])
            .await
    }

    async fn find_conversation(&self, guest_phone: &str, property_id: Option<&str>) -> Result<Option<Conversation>> {
        let mut query = vec![(conversations::GUEST_PHONE, eq(guest_phone))];
        match property_id {
            Some(property_id) => {
                query.push((conversations::PROPERTY_ID, eq(property_id)));
                query.push(("order", format!("{}.asc", conversations::CREATED_AT)));
            },
            None => query.push((
                "order",
                format!(
                    "{}.desc.nullslast,{}.desc",
                    conversations::LAST_MESSAGE_AT,
                    conversations::CREATED_AT
                ),
            )),
        }
        self.select_one(conversations::TABLE, query).await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        self.select_one(conversations::TABLE, vec![(conversations::ID, eq(id))]).await
    }

    async fn get_or_insert_conversation(&self, new_conversation: &NewConversation) -> Result<(Conversation, bool)> {
        let now = Utc::now();
        let body = json!({
            conversations::HOST_ID: new_conversation.host_id,
            conversations::PROPERTY_ID: new_conversation.property_id,
            conversations::GUEST_NAME: new_conversation.guest_name,
            conversations::GUEST_PHONE: new_conversation.guest_phone,
            conversations::GUEST_EMAIL: new_conversation.guest_email,
            conversations::CHECK_IN_DATE: new_conversation.check_in_date,
            conversations::CHECK_OUT_DATE: new_conversation.check_out_date,
            conversations::STATUS: "active",
            conversations::LAST_MESSAGE: new_conversation.last_message,
            conversations::LAST_MESSAGE_AT: new_conversation.last_message.as_ref().map(|_| now),
            conversations::UNREAD_COUNT: new_conversation.unread_count,
        });

        // Needs the unique (guest_phone, property_id) constraint on the hosted table
        let response = self
            .request(reqwest::Method::POST, conversations::TABLE)
            .query(&[(
                "on_conflict",
                format!("{},{}", conversations::GUEST_PHONE, conversations::PROPERTY_ID),
            )])
            .header("Prefer", "resolution=ignore-duplicates,return=representation")
            .json(&body)
            .send()
            .await?;
        let rows: Vec<Conversation> = Self::check(response).await?.json().await?;

        if let Some(conversation) = rows.into_iter().next() {
            debug!(conversation_id = %conversation.id, "Inserted conversation in Supabase");
            return Ok((conversation, true));
        }

        let existing = self
            .find_conversation(&new_conversation.guest_phone, new_conversation.property_id.as_deref())
            .await?
            .ok_or_else(|| AirhostError::Other("Supabase ignored a conversation insert without a conflict".to_string()))?;
        Ok((existing, false))
    }

    async fn touch_conversation(&self, id: &str, last_message: &str, increment_unread: bool) -> Result<()> {
        // PostgREST has no atomic increment; read then write
        let current = self
            .get_conversation(id)
            .await?
            .ok_or_else(|| AirhostError::NotFound(format!("Conversation {id}")))?;
        let unread = current.unread_count + i64::from(increment_unread);

        self.patch_conversation(
            id,
            &json!({
                conversations::LAST_MESSAGE: last_message,
                conversations::LAST_MESSAGE_AT: Utc::now(),
                conversations::UNREAD_COUNT: unread,
            }),
        )
        .await
    }

    async fn set_welcome_status(&self, id: &str, status: WelcomeStatus, error: Option<&str>) -> Result<()> {
        self.patch_conversation(
            id,
            &json!({
                conversations::WELCOME_TEMPLATE_STATUS: status.as_str(),
                conversations::WELCOME_TEMPLATE_ERROR: error,
            }),
        )
        .await
    }

    async fn list_conversations(&self, host_id: Option<&str>, needs_attention_only: bool) -> Result<Vec<Conversation>> {
        let mut query = vec![(
            "order",
            format!(
                "{}.desc,{}.desc.nullslast,{}.desc",
                conversations::PRIORITY_LEVEL,
                conversations::LAST_MESSAGE_AT,
                conversations::CREATED_AT
            ),
        )];
        if let Some(host_id) = host_id {
            query.push((conversations::HOST_ID, eq(host_id)));
        }
        if needs_attention_only {
            query.push((conversations::NEEDS_ATTENTION, "is.true".to_string()));
        }
        self.select(conversations::TABLE, query).await
    }

    async fn insert_message(&self, new_message: &NewMessage) -> Result<Message> {
        let mut body = serde_json::to_value(new_message)?;
        body[messages::CREATED_AT] = json!(Utc::now());
        self.insert(messages::TABLE, &body).await
    }

    async fn list_messages(&self, conversation_id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let mut query = vec![
            (messages::CONVERSATION_ID, eq(conversation_id)),
            ("order", format!("{}.desc", messages::CREATED_AT)),
        ];
        if let Some(limit) = limit {
            query.push(("limit", limit.to_string()));
        }
        let mut rows: Vec<Message> = self.select(messages::TABLE, query).await?;
        rows.reverse();
        Ok(rows)
    }

    async fn message_exists(&self, whatsapp_message_id: &str) -> Result<bool> {
        let row: Option<serde_json::Value> = self
            .select_one(
                messages::TABLE,
                vec![
                    (messages::WHATSAPP_MESSAGE_ID, eq(whatsapp_message_id)),
                    ("select", messages::ID.to_string()),
                ],
            )
            .await?;
        Ok(row.is_some())
    }

    async fn whatsapp_config_for_host(&self, host_id: Option<&str>) -> Result<Option<WhatsAppConfig>> {
        if let Some(host_id) = host_id {
            let config = self
                .select_one(
                    whatsapp_config::TABLE,
                    vec![
                        (whatsapp_config::HOST_ID, eq(host_id)),
                        (whatsapp_config::IS_ACTIVE, "is.true".to_string()),
                    ],
                )
                .await?;
            if config.is_some() {
                return Ok(config);
            }
            debug!(host_id, "No WhatsApp config for host, using most recent");
        }

        self.select_one(
            whatsapp_config::TABLE,
            vec![
                (whatsapp_config::IS_ACTIVE, "is.true".to_string()),
                ("order", format!("{}.desc", whatsapp_config::UPDATED_AT)),
            ],
        )
        .await
    }

    async fn whatsapp_config_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<WhatsAppConfig>> {
        self.select_one(
            whatsapp_config::TABLE,
            vec![
                (whatsapp_config::PHONE_NUMBER_ID, eq(phone_number_id)),
                ("order", format!("{}.desc", whatsapp_config::UPDATED_AT)),
            ],
        )
        .await
    }

    async fn template_config(&self, host_id: &str) -> Result<Option<TemplateConfig>> {
        self.select_one(
            whatsapp_template_config::TABLE,
            vec![(whatsapp_template_config::HOST_ID, eq(host_id))],
        )
        .await
    }

    async fn record_analysis(
        &self,
        conversation_id: &str,
        message_id: Option<&str>,
        classification: &Classification,
    ) -> Result<AnalysisRecord> {
        let now = Utc::now();
        let record: AnalysisRecord = self
            .insert(
                conversation_analysis::TABLE,
                &json!({
                    conversation_analysis::CONVERSATION_ID: conversation_id,
                    conversation_analysis::MESSAGE_ID: message_id,
                    conversation_analysis::TAG: classification.tag,
                    conversation_analysis::CONFIDENCE: classification.confidence,
                    conversation_analysis::EXPLANATION: classification.explanation,
                    conversation_analysis::RECOMMENDED_ACTION: classification.recommended_action,
                    conversation_analysis::SOURCE: classification.source,
                    conversation_analysis::NEEDS_ATTENTION: classification.needs_attention,
                    conversation_analysis::CREATED_AT: now,
                }),
            )
            .await?;

        self.patch_conversation(
            conversation_id,
            &json!({
                conversations::NEEDS_ATTENTION: classification.needs_attention,
                conversations::PRIORITY_LEVEL: classification.tag.priority_level(),
                conversations::EMERGENCY_STATUS: classification.tag.emergency_status(),
                conversations::AI_ANALYSIS_TYPE: classification.source,
                conversations::ANALYSIS_CONFIDENCE: classification.confidence,
                conversations::ANALYSIS_TIMESTAMP: now,
            }),
        )
        .await?;

        Ok(record)
    }

    async fn open_emergency_case(
        &self,
        conversation_id: &str,
        host_id: Option<&str>,
        emergency_type: &str,
        description: &str,
    ) -> Result<EmergencyCase> {
        self.insert(
            emergency_cases::TABLE,
            &json!({
                emergency_cases::CONVERSATION_ID: conversation_id,
                emergency_cases::HOST_ID: host_id,
                emergency_cases::EMERGENCY_TYPE: emergency_type,
                emergency_cases::DESCRIPTION: description,
                emergency_cases::STATUS: "active",
                emergency_cases::DETECTED_AT: Utc::now(),
            }),
        )
        .await
    }

    async fn insert_host(&self, name: &str, email: Option<&str>) -> Result<Host> {
        self.insert(
            hosts::TABLE,
            &json!({ hosts::NAME: name, hosts::EMAIL: email, hosts::CREATED_AT: Utc::now() }),
        )
        .await
    }

    async fn insert_property(
        &self,
        host_id: &str,
        name: &str,
        address: Option<&str>,
        ai_instructions: Option<&str>,
    ) -> Result<Property> {
        self.insert(
            properties::TABLE,
            &json!({
                properties::HOST_ID: host_id,
                properties::NAME: name,
                properties::ADDRESS: address,
                properties::AI_INSTRUCTIONS: ai_instructions,
                properties::CREATED_AT: Utc::now(),
            }),
        )
        .await
    }

    async fn upsert_whatsapp_config(&self, config: &NewWhatsAppConfig) -> Result<WhatsAppConfig> {
        let mut body = serde_json::to_value(config)?;
        body[whatsapp_config::UPDATED_AT] = json!(Utc::now());

        let filter = vec![(whatsapp_config::HOST_ID, eq_or_null(config.host_id.as_deref()))];
        let updated: Vec<WhatsAppConfig> = self.update(whatsapp_config::TABLE, filter, &body).await?;
        if let Some(existing) = updated.into_iter().next() {
            return Ok(existing);
        }
        self.insert(whatsapp_config::TABLE, &body).await
    }

    async fn upsert_template_config(&self, config: &NewTemplateConfig) -> Result<TemplateConfig> {
        let mut body = serde_json::to_value(config)?;
        body[whatsapp_template_config::UPDATED_AT] = json!(Utc::now());

        let response = self
            .request(reqwest::Method::POST, whatsapp_template_config::TABLE)
            .query(&[("on_conflict", whatsapp_template_config::HOST_ID)])
            .header("Prefer", "resolution=merge-duplicates,return=representation")
            .json(&body)
            .send()
            .await?;
        let rows: Vec<TemplateConfig> = Self::check(response).await?.json().await?;
        rows.into_iter()
            .next()
            .ok_or_else(|| AirhostError::Other("Supabase returned no template config".to_string()))
    }

    async fn integrity_report(&self) -> Result<IntegrityReport> {
        #[derive(serde::Deserialize)]
        struct IdRow {
            id: String,
            #[serde(default)]
            host_id: Option<String>,
            #[serde(default)]
            property_id: Option<String>,
        }

        let host_ids: HashSet<String> = self
            .select::<IdRow>(hosts::TABLE, vec![("select", hosts::ID.to_string())])
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();
        let property_rows: Vec<IdRow> = self
            .select(properties::TABLE, vec![("select", format!("{},{}", properties::ID, properties::HOST_ID))])
            .await?;
        let property_ids: HashSet<&str> = property_rows.iter().map(|row| row.id.as_str()).collect();
        let conversation_rows: Vec<IdRow> = self
            .select(
                conversations::TABLE,
                vec![("select", format!("{},{}", conversations::ID, conversations::PROPERTY_ID))],
            )
            .await?;
        let config_rows: Vec<IdRow> = self
            .select(
                whatsapp_config::TABLE,
                vec![("select", format!("{},{}", whatsapp_config::ID, whatsapp_config::HOST_ID))],
            )
            .await?;

        Ok(IntegrityReport {
            conversations_without_property: conversation_rows.iter().filter(|c| c.property_id.is_none()).count(),
            conversations_with_unknown_property: conversation_rows
                .iter()
                .filter(|c| c.property_id.as_deref().is_some_and(|p| !property_ids.contains(p)))
                .count(),
            properties_with_unknown_host: property_rows
                .iter()
                .filter(|p| p.host_id.as_ref().map_or(true, |h| !host_ids.contains(h)))
                .count(),
            configs_without_host: config_rows.iter().filter(|c| c.host_id.is_none()).count(),
        })
    }

    async fn reconcile_conversations(&self) -> Result<usize> {
        let mut changed = 0;

        let orphans: Vec<Conversation> = self
            .select(
                conversations::TABLE,
                vec![
                    (conversations::PROPERTY_ID, "is.null".to_string()),
                    (conversations::HOST_ID, "not.is.null".to_string()),
                ],
            )
            .await?;
        for conversation in orphans {
            let Some(host_id) = conversation.host_id.as_deref() else { continue };
            if let Some(property) = self.default_property_for_host(host_id).await? {
                match self
                    .patch_conversation(&conversation.id, &json!({ conversations::PROPERTY_ID: property.id }))
                    .await
                {
                    Ok(()) => changed += 1,
                    Err(AirhostError::Upstream { status: 409, .. }) => {
                        warn!(conversation_id = %conversation.id, "Guest already has a conversation at the default property");
                    },
                    Err(e) => return Err(e),
                }
            }
        }

        let hostless: Vec<Conversation> = self
            .select(
                conversations::TABLE,
                vec![
                    (conversations::HOST_ID, "is.null".to_string()),
                    (conversations::PROPERTY_ID, "not.is.null".to_string()),
                ],
            )
            .await?;
        for conversation in hostless {
            let Some(property_id) = conversation.property_id.as_deref() else { continue };
            if let Some(property) = self.get_property(property_id).await? {
                self.patch_conversation(&conversation.id, &json!({ conversations::HOST_ID: property.host_id }))
                    .await?;
                changed += 1;
            }
        }

        info!(changed, "Reconciled Supabase conversations");
        Ok(changed)
    }
}
