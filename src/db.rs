use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{AirhostError, Result};
use crate::models::{
    AnalysisRecord, Classification, Conversation, EmergencyCase, Host, IntegrityReport, Message, NewConversation,
    NewMessage, NewTemplateConfig, NewWhatsAppConfig, Property, TemplateConfig, WelcomeStatus, WhatsAppConfig,
};
use crate::schema::{
    conversation_analysis, conversations, emergency_cases, hosts, messages, properties, schema_migrations,
    whatsapp_config, whatsapp_template_config,
};

// Type alias for the database connection pool
pub type DbPool = Pool<SqliteConnectionManager>;
pub type DbConnection = r2d2::PooledConnection<SqliteConnectionManager>;

/// Ordered schema migrations. Versions are recorded in `schema_migrations` and never re-run.
const MIGRATIONS: &[(i64, &str, &str)] = &[
    (
        1,
        "create_core_tables",
        include_str!("../migrations/2025-06-01-000000_create_core_tables/up.sql"),
    ),
    (
        2,
        "whatsapp_config",
        include_str!("../migrations/2025-06-01-000001_whatsapp_config/up.sql"),
    ),
    (
        3,
        "conversation_analysis",
        include_str!("../migrations/2025-06-15-000000_conversation_analysis/up.sql"),
    ),
    (
        4,
        "unique_conversation_per_guest",
        include_str!("../migrations/2025-07-01-000000_unique_conversation_per_guest/up.sql"),
    ),
];

/// SQLite storage for hosts, properties, conversations and WhatsApp settings
#[derive(Clone)]
pub struct Database {
    pool: DbPool,
}

impl Database {
    /// Open (creating if needed) the database file and bring its schema up to date
    pub fn new(database_url: &str) -> Result<Self> {
        Self::with_pool_settings(database_url, 10, 30)
    }

    /// Like [`Database::new`] with explicit pool size and checkout timeout
    pub fn with_pool_settings(database_url: &str, max_connections: u32, timeout_secs: u64) -> Result<Self> {
        let path = database_url
            .strip_prefix("sqlite://")
            .or_else(|| database_url.strip_prefix("sqlite:"))
            .unwrap_or(database_url);

        // Create parent directory if it doesn't exist
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let manager = SqliteConnectionManager::file(path).with_init(|conn| {
            conn.pragma_update(None, "foreign_keys", true)?;
            conn.busy_timeout(Duration::from_secs(5))
        });
        let pool = Pool::builder()
            .max_size(max_connections)
            .connection_timeout(Duration::from_secs(timeout_secs))
            .build(manager)?;

        let database = Self { pool };
        database.run_migrations()?;
        info!(path, "Database ready");
        Ok(database)
    }

    /// Private in-memory database, used by tests and dry runs
    pub fn in_memory() -> Result<Self> {
        let manager = SqliteConnectionManager::memory().with_init(|conn| conn.pragma_update(None, "foreign_keys", true));
        // A single connection, since every in-memory connection is its own database
        let pool = Pool::builder().max_size(1).build(manager)?;
        let database = Self { pool };
        database.run_migrations()?;
        Ok(database)
    }

    /// Apply pending migrations. Returns the versions applied by this call.
    pub fn run_migrations(&self) -> Result<Vec<i64>> {
        let mut conn = self.get_connection()?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({} INTEGER PRIMARY KEY NOT NULL, {} TEXT NOT NULL, {} TEXT NOT NULL)",
            schema_migrations::TABLE,
            schema_migrations::VERSION,
            schema_migrations::NAME,
            schema_migrations::APPLIED_AT
        ))?;

        let mut applied = Vec::new();
        for (version, name, sql) in MIGRATIONS {
            let already: bool = conn.query_row(
                &format!(
                    "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?)",
                    schema_migrations::TABLE,
                    schema_migrations::VERSION
                ),
                params![version],
                |row| row.get(0),
            )?;
            if already {
                continue;
            }

            let tx = conn.transaction()?;
            tx.execute_batch(sql)?;
            tx.execute(
                &format!(
                    "INSERT INTO {} ({}, {}, {}) VALUES (?, ?, ?)",
                    schema_migrations::TABLE,
                    schema_migrations::VERSION,
                    schema_migrations::NAME,
                    schema_migrations::APPLIED_AT
                ),
                params![version, name, Utc::now()],
            )?;
            tx.commit()?;
            info!(version, name, "Applied migration");
            applied.push(*version);
        }

        Ok(applied)
    }

    /// Versions recorded in `schema_migrations`, ascending
    pub fn applied_migrations(&self) -> Result<Vec<i64>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM {} ORDER BY {} ASC",
            schema_migrations::VERSION,
            schema_migrations::TABLE,
            schema_migrations::VERSION
        ))?;
        let versions = stmt.query_map([], |row| row.get(0))?.collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(versions)
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> Result<DbConnection> {
        Ok(self.pool.get()?)
    }

    // ----- hosts & properties -----

    pub fn insert_host(&self, name: &str, email: Option<&str>) -> Result<Host> {
        let conn = self.get_connection()?;
        let host = Host {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            email: email.map(ToString::to_string),
            created_at: Utc::now(),
        };
        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}) VALUES (?, ?, ?, ?)",
                hosts::TABLE,
                hosts::ID,
                hosts::NAME,
                hosts::EMAIL,
                hosts::CREATED_AT
            ),
            params![host.id, host.name, host.email, host.created_at],
        )?;
        Ok(host)
    }

    pub fn insert_property(
        &self,
        host_id: &str,
        name: &str,
        address: Option<&str>,
        ai_instructions: Option<&str>,
    ) -> Result<Property> {
        let conn = self.get_connection()?;
        let property = Property {
            id: Uuid::new_v4().to_string(),
            host_id: host_id.to_string(),
            name: name.to_string(),
            address: address.map(ToString::to_string),
            ai_instructions: ai_instructions.map(ToString::to_string),
            created_at: Utc::now(),
        };
        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?, ?)",
                properties::TABLE,
                properties::ID,
                properties::HOST_ID,
                properties::NAME,
                properties::ADDRESS,
                properties::AI_INSTRUCTIONS,
                properties::CREATED_AT
            ),
            params![
                property.id,
                property.host_id,
                property.name,
                property.address,
                property.ai_instructions,
                property.created_at
            ],
        )?;
        Ok(property)
    }

    pub fn get_property(&self, id: &str) -> Result<Option<Property>> {
        let conn = self.get_connection()?;
        let property = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE {} = ?", properties::TABLE, properties::ID),
                params![id],
                map_property,
            )
            .optional()?;
        Ok(property)
    }

    /// The host's oldest property, used when an inbound message names no property
    pub fn default_property_for_host(&self, host_id: &str) -> Result<Option<Property>> {
        let conn = self.get_connection()?;
        let property = conn
            .query_row(
                &format!(
                    "SELECT * FROM {} WHERE {} = ? ORDER BY {} ASC LIMIT 1",
                    properties::TABLE,
                    properties::HOST_ID,
                    properties::CREATED_AT
                ),
                params![host_id],
                map_property,
            )
            .optional()?;
        Ok(property)
    }

    /// Oldest property of any host
    pub fn any_property(&self) -> Result<Option<Property>> {
        let conn = self.get_connection()?;
        let property = conn
            .query_row(
                &format!(
                    "SELECT * FROM {} ORDER BY {} ASC LIMIT 1",
                    properties::TABLE,
                    properties::CREATED_AT
                ),
                [],
                map_property,
            )
            .optional()?;
        Ok(property)
    }

    // ----- conversations -----

    /// Find a guest's conversation. With a property, match exactly; without one, take the
    /// most recently active conversation for that phone.
    pub fn find_conversation(&self, guest_phone: &str, property_id: Option<&str>) -> Result<Option<Conversation>> {
        let conn = self.get_connection()?;
        let conversation = match property_id {
            Some(property_id) => conn
                .query_row(
                    &format!(
                        "SELECT * FROM {} WHERE {} = ? AND {} = ? ORDER BY {} ASC LIMIT 1",
                        conversations::TABLE,
                        conversations::GUEST_PHONE,
                        conversations::PROPERTY_ID,
                        conversations::CREATED_AT
                    ),
                    params![guest_phone, property_id],
                    map_conversation,
                )
                .optional()?,
            None => conn
                .query_row(
                    &format!(
                        "SELECT * FROM {} WHERE {} = ? ORDER BY COALESCE({}, {}) DESC LIMIT 1",
                        conversations::TABLE,
                        conversations::GUEST_PHONE,
                        conversations::LAST_MESSAGE_AT,
                        conversations::CREATED_AT
                    ),
                    params![guest_phone],
                    map_conversation,
                )
                .optional()?,
        };
        Ok(conversation)
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.get_connection()?;
        let conversation = conn
            .query_row(
                &format!("SELECT * FROM {} WHERE {} = ?", conversations::TABLE, conversations::ID),
                params![id],
                map_conversation,
            )
            .optional()?;
        Ok(conversation)
    }

    /// Insert a conversation unless one already exists for the same guest phone and
    /// property. Returns the stored row and whether this call created it.
    ///
    /// The unique `(guest_phone, property_id)` index decides between concurrent callers.
    pub fn get_or_insert_conversation(&self, new_conversation: &NewConversation) -> Result<(Conversation, bool)> {
        let conn = self.get_connection()?;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let last_message_at = new_conversation.last_message.as_ref().map(|_| now);

        let inserted = conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}, {}) \
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT ({}, {}) DO NOTHING",
                conversations::TABLE,
                conversations::ID,
                conversations::HOST_ID,
                conversations::PROPERTY_ID,
                conversations::GUEST_NAME,
                conversations::GUEST_PHONE,
                conversations::GUEST_EMAIL,
                conversations::CHECK_IN_DATE,
                conversations::CHECK_OUT_DATE,
                conversations::LAST_MESSAGE,
                conversations::LAST_MESSAGE_AT,
                conversations::UNREAD_COUNT,
                conversations::CREATED_AT,
                conversations::GUEST_PHONE,
                conversations::PROPERTY_ID
            ),
            params![
                id,
                new_conversation.host_id,
                new_conversation.property_id,
                new_conversation.guest_name,
                new_conversation.guest_phone,
                new_conversation.guest_email,
                new_conversation.check_in_date,
                new_conversation.check_out_date,
                new_conversation.last_message,
                last_message_at,
                new_conversation.unread_count,
                now
            ],
        )?;
        drop(conn);

        if inserted == 0 {
            debug!(guest_phone = %new_conversation.guest_phone, "Conversation already exists");
            let existing = self
                .find_conversation(&new_conversation.guest_phone, new_conversation.property_id.as_deref())?
                .ok_or_else(|| AirhostError::Other("Conflicting conversation vanished".to_string()))?;
            return Ok((existing, false));
        }

        debug!(conversation_id = %id, "Inserted conversation");
        let conversation = self
            .get_conversation(&id)?
            .ok_or_else(|| AirhostError::Other("Failed to retrieve newly inserted conversation".to_string()))?;
        Ok((conversation, true))
    }

    /// Record a new last message, optionally bumping the unread counter
    pub fn touch_conversation(&self, id: &str, last_message: &str, increment_unread: bool) -> Result<()> {
        let conn = self.get_connection()?;
        let updated = conn.execute(
            &format!(
                "UPDATE {} SET {} = ?, {} = ?, {} = {} + ? WHERE {} = ?",
                conversations::TABLE,
                conversations::LAST_MESSAGE,
                conversations::LAST_MESSAGE_AT,
                conversations::UNREAD_COUNT,
                conversations::UNREAD_COUNT,
                conversations::ID
            ),
            params![last_message, Utc::now(), i64::from(increment_unread), id],
        )?;
        if updated == 0 {
            return Err(AirhostError::NotFound(format!("Conversation {id}")));
        }
        Ok(())
    }

    pub fn set_welcome_status(&self, id: &str, status: WelcomeStatus, error: Option<&str>) -> Result<()> {
        let conn = self.get_connection()?;
        conn.execute(
            &format!(
                "UPDATE {} SET {} = ?, {} = ? WHERE {} = ?",
                conversations::TABLE,
                conversations::WELCOME_TEMPLATE_STATUS,
                conversations::WELCOME_TEMPLATE_ERROR,
                conversations::ID
            ),
            params![status.as_str(), error, id],
        )?;
        Ok(())
    }

    /// Conversations ordered by priority then recency
    pub fn list_conversations(&self, host_id: Option<&str>, needs_attention_only: bool) -> Result<Vec<Conversation>> {
        let conn = self.get_connection()?;

        let mut query = format!("SELECT * FROM {} WHERE 1 = 1", conversations::TABLE);
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(host_id) = host_id {
            query.push_str(&format!(" AND {} = ?", conversations::HOST_ID));
            params.push(Box::new(host_id.to_string()));
        }
        if needs_attention_only {
            query.push_str(&format!(" AND {} = 1", conversations::NEEDS_ATTENTION));
        }
        query.push_str(&format!(
            " ORDER BY {} DESC, COALESCE({}, {}) DESC",
            conversations::PRIORITY_LEVEL,
            conversations::LAST_MESSAGE_AT,
            conversations::CREATED_AT
        ));

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), map_conversation)?;

        let mut results = Vec::new();
        for conversation in rows {
            results.push(conversation?);
        }
        Ok(results)
    }

    // ----- messages -----

    pub fn insert_message(&self, new_message: &NewMessage) -> Result<Message> {
        let conn = self.get_connection()?;
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: new_message.conversation_id.clone(),
            content: new_message.content.clone(),
            direction: new_message.direction,
            message_type: new_message.message_type.clone(),
            status: new_message.status.clone(),
            whatsapp_message_id: new_message.whatsapp_message_id.clone(),
            metadata: new_message.metadata.clone(),
            created_at: Utc::now(),
        };
        let metadata = message.metadata.as_ref().map(serde_json::to_string).transpose()?;

        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
                messages::TABLE,
                messages::ID,
                messages::CONVERSATION_ID,
                messages::CONTENT,
                messages::DIRECTION,
                messages::MESSAGE_TYPE,
                messages::STATUS,
                messages::WHATSAPP_MESSAGE_ID,
                messages::METADATA,
                messages::CREATED_AT
            ),
            params![
                message.id,
                message.conversation_id,
                message.content,
                message.direction.as_str(),
                message.message_type,
                message.status,
                message.whatsapp_message_id,
                metadata,
                message.created_at
            ],
        )?;
        Ok(message)
    }

    /// Messages of a conversation in chronological order; `limit` keeps the most recent ones
    pub fn list_messages(&self, conversation_id: &str, limit: Option<usize>) -> Result<Vec<Message>> {
        let conn = self.get_connection()?;
        let limit = limit.map_or(-1, |l| i64::try_from(l).unwrap_or(i64::MAX));

        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM (SELECT * FROM {} WHERE {} = ? ORDER BY {} DESC LIMIT ?) ORDER BY {} ASC",
            messages::TABLE,
            messages::CONVERSATION_ID,
            messages::CREATED_AT,
            messages::CREATED_AT
        ))?;
        let rows = stmt.query_map(params![conversation_id, limit], map_message)?;

        let mut results = Vec::new();
        for message in rows {
            results.push(message?);
        }
        Ok(results)
    }

    /// Whether a WhatsApp message id was already stored
    pub fn message_exists(&self, whatsapp_message_id: &str) -> Result<bool> {
        let conn = self.get_connection()?;
        let exists = conn.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE {} = ?)",
                messages::TABLE,
                messages::WHATSAPP_MESSAGE_ID
            ),
            params![whatsapp_message_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    // ----- WhatsApp settings -----

    /// Credentials for a host, falling back to the most recently updated row
    pub fn whatsapp_config_for_host(&self, host_id: Option<&str>) -> Result<Option<WhatsAppConfig>> {
        let conn = self.get_connection()?;

        if let Some(host_id) = host_id {
            let config = conn
                .query_row(
                    &format!(
                        "SELECT * FROM {} WHERE {} = ? AND {} = 1",
                        whatsapp_config::TABLE,
                        whatsapp_config::HOST_ID,
                        whatsapp_config::IS_ACTIVE
                    ),
                    params![host_id],
                    map_whatsapp_config,
                )
                .optional()?;
            if config.is_some() {
                return Ok(config);
            }
            debug!(host_id, "No WhatsApp config for host, using most recent");
        }

        let config = conn
            .query_row(
                &format!(
                    "SELECT * FROM {} WHERE {} = 1 ORDER BY {} DESC LIMIT 1",
                    whatsapp_config::TABLE,
                    whatsapp_config::IS_ACTIVE,
                    whatsapp_config::UPDATED_AT
                ),
                [],
                map_whatsapp_config,
            )
            .optional()?;
        Ok(config)
    }

    pub fn whatsapp_config_by_phone_number_id(&self, phone_number_id: &str) -> Result<Option<WhatsAppConfig>> {
        let conn = self.get_connection()?;
        let config = conn
            .query_row(
                &format!(
                    "SELECT * FROM {} WHERE {} = ? ORDER BY {} DESC LIMIT 1",
                    whatsapp_config::TABLE,
                    whatsapp_config::PHONE_NUMBER_ID,
                    whatsapp_config::UPDATED_AT
                ),
                params![phone_number_id],
                map_whatsapp_config,
            )
            .optional()?;
        Ok(config)
    }

    /// Insert or replace the credentials row of a host (or the global row when `host_id` is `None`)
    pub fn upsert_whatsapp_config(&self, new_config: &NewWhatsAppConfig) -> Result<WhatsAppConfig> {
        let conn = self.get_connection()?;
        let now = Utc::now();

        let existing_id: Option<String> = conn
            .query_row(
                &format!(
                    "SELECT {} FROM {} WHERE {} IS ?",
                    whatsapp_config::ID,
                    whatsapp_config::TABLE,
                    whatsapp_config::HOST_ID
                ),
                params![new_config.host_id],
                |row| row.get(0),
            )
            .optional()?;

        let id = if let Some(id) = existing_id {
            conn.execute(
                &format!(
                    "UPDATE {} SET {} = ?, {} = ?, {} = ?, {} = ?, {} = ?, {} = ? WHERE {} = ?",
                    whatsapp_config::TABLE,
                    whatsapp_config::PHONE_NUMBER_ID,
                    whatsapp_config::ACCESS_TOKEN,
                    whatsapp_config::BUSINESS_ACCOUNT_ID,
                    whatsapp_config::WEBHOOK_VERIFY_TOKEN,
                    whatsapp_config::IS_ACTIVE,
                    whatsapp_config::UPDATED_AT,
                    whatsapp_config::ID
                ),
                params![
                    new_config.phone_number_id,
                    new_config.access_token,
                    new_config.business_account_id,
                    new_config.webhook_verify_token,
                    new_config.is_active,
                    now,
                    id
                ],
            )?;
            id
        } else {
            let id = Uuid::new_v4().to_string();
            conn.execute(
                &format!(
                    "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    whatsapp_config::TABLE,
                    whatsapp_config::ID,
                    whatsapp_config::HOST_ID,
                    whatsapp_config::PHONE_NUMBER_ID,
                    whatsapp_config::ACCESS_TOKEN,
                    whatsapp_config::BUSINESS_ACCOUNT_ID,
                    whatsapp_config::WEBHOOK_VERIFY_TOKEN,
                    whatsapp_config::IS_ACTIVE,
                    whatsapp_config::UPDATED_AT
                ),
                params![
                    id,
                    new_config.host_id,
                    new_config.phone_number_id,
                    new_config.access_token,
                    new_config.business_account_id,
                    new_config.webhook_verify_token,
                    new_config.is_active,
                    now
                ],
            )?;
            id
        };

        Ok(WhatsAppConfig {
            id,
            host_id: new_config.host_id.clone(),
            phone_number_id: new_config.phone_number_id.clone(),
            access_token: new_config.access_token.clone(),
            business_account_id: new_config.business_account_id.clone(),
            webhook_verify_token: new_config.webhook_verify_token.clone(),
            is_active: new_config.is_active,
            updated_at: now,
        })
    }

    pub fn template_config(&self, host_id: &str) -> Result<Option<TemplateConfig>> {
        let conn = self.get_connection()?;
        let config = conn
            .query_row(
                &format!(
                    "SELECT * FROM {} WHERE {} = ?",
                    whatsapp_template_config::TABLE,
                    whatsapp_template_config::HOST_ID
                ),
                params![host_id],
                map_template_config,
            )
            .optional()?;
        Ok(config)
    }

    pub fn upsert_template_config(&self, new_config: &NewTemplateConfig) -> Result<TemplateConfig> {
        let conn = self.get_connection()?;
        conn.execute(
            &format!(
                "INSERT INTO {table} ({id}, {host}, {enabled}, {name}, {lang}, {updated}) VALUES (?, ?, ?, ?, ?, ?) \
                 ON CONFLICT({host}) DO UPDATE SET {enabled} = excluded.{enabled}, {name} = excluded.{name}, \
                 {lang} = excluded.{lang}, {updated} = excluded.{updated}",
                table = whatsapp_template_config::TABLE,
                id = whatsapp_template_config::ID,
                host = whatsapp_template_config::HOST_ID,
                enabled = whatsapp_template_config::AUTO_TEMPLATES_ENABLED,
                name = whatsapp_template_config::WELCOME_TEMPLATE_NAME,
                lang = whatsapp_template_config::WELCOME_TEMPLATE_LANGUAGE,
                updated = whatsapp_template_config::UPDATED_AT
            ),
            params![
                Uuid::new_v4().to_string(),
                new_config.host_id,
                new_config.auto_templates_enabled,
                new_config.welcome_template_name,
                new_config.welcome_template_language,
                Utc::now()
            ],
        )?;

        drop(conn);
        self.template_config(&new_config.host_id)?
            .ok_or_else(|| AirhostError::Other("Failed to retrieve template config".to_string()))
    }

    // ----- analysis -----

    /// Store a classification. The `trg_conversation_analysis_apply` trigger copies the
    /// attention flags onto the conversation.
    pub fn record_analysis(
        &self,
        conversation_id: &str,
        message_id: Option<&str>,
        classification: &Classification,
    ) -> Result<AnalysisRecord> {
        let conn = self.get_connection()?;
        let record = AnalysisRecord {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            message_id: message_id.map(ToString::to_string),
            tag: classification.tag,
            confidence: classification.confidence,
            explanation: Some(classification.explanation.clone()),
            recommended_action: Some(classification.recommended_action.clone()),
            source: classification.source,
            needs_attention: classification.needs_attention,
            created_at: Utc::now(),
        };

        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                conversation_analysis::TABLE,
                conversation_analysis::ID,
                conversation_analysis::CONVERSATION_ID,
                conversation_analysis::MESSAGE_ID,
                conversation_analysis::TAG,
                conversation_analysis::CONFIDENCE,
                conversation_analysis::EXPLANATION,
                conversation_analysis::RECOMMENDED_ACTION,
                conversation_analysis::SOURCE,
                conversation_analysis::NEEDS_ATTENTION,
                conversation_analysis::CREATED_AT
            ),
            params![
                record.id,
                record.conversation_id,
                record.message_id,
                record.tag.as_str(),
                record.confidence,
                record.explanation,
                record.recommended_action,
                record.source.as_str(),
                record.needs_attention,
                record.created_at
            ],
        )?;
        Ok(record)
    }

    pub fn list_analyses(&self, conversation_id: &str) -> Result<Vec<AnalysisRecord>> {
        let conn = self.get_connection()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT * FROM {} WHERE {} = ? ORDER BY {} ASC",
            conversation_analysis::TABLE,
            conversation_analysis::CONVERSATION_ID,
            conversation_analysis::CREATED_AT
        ))?;
        let rows = stmt.query_map(params![conversation_id], map_analysis)?;
        let mut results = Vec::new();
        for record in rows {
            results.push(record?);
        }
        Ok(results)
    }

    pub fn open_emergency_case(
        &self,
        conversation_id: &str,
        host_id: Option<&str>,
        emergency_type: &str,
        description: &str,
    ) -> Result<EmergencyCase> {
        let conn = self.get_connection()?;
        let case = EmergencyCase {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            host_id: host_id.map(ToString::to_string),
            emergency_type: emergency_type.to_string(),
            description: Some(description.to_string()),
            status: "active".to_string(),
            detected_at: Utc::now(),
            resolved_at: None,
        };
        conn.execute(
            &format!(
                "INSERT INTO {} ({}, {}, {}, {}, {}, {}, {}) VALUES (?, ?, ?, ?, ?, ?, ?)",
                emergency_cases::TABLE,
                emergency_cases::ID,
                emergency_cases::CONVERSATION_ID,
                emergency_cases::HOST_ID,
                emergency_cases::EMERGENCY_TYPE,
                emergency_cases::DESCRIPTION,
                emergency_cases::STATUS,
                emergency_cases::DETECTED_AT
            ),
            params![
                case.id,
                case.conversation_id,
                case.host_id,
                case.emergency_type,
                case.description,
                case.status,
                case.detected_at
            ],
        )?;
        Ok(case)
    }

    /// Emergency cases still open, newest first
    pub fn active_emergency_cases(&self, host_id: Option<&str>) -> Result<Vec<EmergencyCase>> {
        let conn = self.get_connection()?;
        let mut query = format!(
            "SELECT * FROM {} WHERE {} = 'active'",
            emergency_cases::TABLE,
            emergency_cases::STATUS
        );
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(host_id) = host_id {
            query.push_str(&format!(" AND {} = ?", emergency_cases::HOST_ID));
            params.push(Box::new(host_id.to_string()));
        }
        query.push_str(&format!(" ORDER BY {} DESC", emergency_cases::DETECTED_AT));

        let mut stmt = conn.prepare(&query)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(EmergencyCase {
                id: row.get(emergency_cases::ID)?,
                conversation_id: row.get(emergency_cases::CONVERSATION_ID)?,
                host_id: row.get(emergency_cases::HOST_ID)?,
                emergency_type: row.get(emergency_cases::EMERGENCY_TYPE)?,
                description: row.get(emergency_cases::DESCRIPTION)?,
                status: row.get(emergency_cases::STATUS)?,
                detected_at: row.get(emergency_cases::DETECTED_AT)?,
                resolved_at: row.get(emergency_cases::RESOLVED_AT)?,
            })
        })?;
        let mut results = Vec::new();
        for case in rows {
            results.push(case?);
        }
        Ok(results)
    }

    // ----- integrity -----

    /// Count rows breaking the conversation -> property -> host chain
    pub fn integrity_report(&self) -> Result<IntegrityReport> {
        let conn = self.get_connection()?;
        let count = |sql: String| -> Result<usize> {
            let n: i64 = conn.query_row(&sql, [], |row| row.get(0))?;
            Ok(usize::try_from(n).unwrap_or_default())
        };

        Ok(IntegrityReport {
            conversations_without_property: count(format!(
                "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                conversations::TABLE,
                conversations::PROPERTY_ID
            ))?,
            conversations_with_unknown_property: count(format!(
                "SELECT COUNT(*) FROM {c} WHERE {c}.{pid} IS NOT NULL \
                 AND NOT EXISTS (SELECT 1 FROM {p} WHERE {p}.{id} = {c}.{pid})",
                c = conversations::TABLE,
                pid = conversations::PROPERTY_ID,
                p = properties::TABLE,
                id = properties::ID
            ))?,
            properties_with_unknown_host: count(format!(
                "SELECT COUNT(*) FROM {p} WHERE NOT EXISTS (SELECT 1 FROM {h} WHERE {h}.{id} = {p}.{hid})",
                p = properties::TABLE,
                hid = properties::HOST_ID,
                h = hosts::TABLE,
                id = hosts::ID
            ))?,
            configs_without_host: count(format!(
                "SELECT COUNT(*) FROM {} WHERE {} IS NULL",
                whatsapp_config::TABLE,
                whatsapp_config::HOST_ID
            ))?,
        })
    }

    /// Attach orphan conversations to their host's default property, and fill in missing
    /// host ids from the property. Returns the number of rows changed.
    pub fn reconcile_conversations(&self) -> Result<usize> {
        let mut conn = self.get_connection()?;
        let tx = conn.transaction()?;

        // Orphans whose guest already has a conversation at that property stay unlinked
        let linked = tx.execute(
            &format!(
                "UPDATE OR IGNORE {c} SET {pid} = (SELECT {p}.{id} FROM {p} WHERE {p}.{phid} = {c}.{hid} \
                 ORDER BY {p}.{pcreated} ASC LIMIT 1) \
                 WHERE {pid} IS NULL AND {hid} IS NOT NULL \
                 AND EXISTS (SELECT 1 FROM {p} WHERE {p}.{phid} = {c}.{hid})",
                c = conversations::TABLE,
                pid = conversations::PROPERTY_ID,
                hid = conversations::HOST_ID,
                p = properties::TABLE,
                id = properties::ID,
                phid = properties::HOST_ID,
                pcreated = properties::CREATED_AT
            ),
            [],
        )?;

        let backfilled = tx.execute(
            &format!(
                "UPDATE {c} SET {hid} = (SELECT {p}.{phid} FROM {p} WHERE {p}.{id} = {c}.{pid}) \
                 WHERE {hid} IS NULL AND {pid} IS NOT NULL \
                 AND EXISTS (SELECT 1 FROM {p} WHERE {p}.{id} = {c}.{pid})",
                c = conversations::TABLE,
                pid = conversations::PROPERTY_ID,
                hid = conversations::HOST_ID,
                p = properties::TABLE,
                id = properties::ID,
                phid = properties::HOST_ID
            ),
            [],
        )?;

        tx.commit()?;
        info!(linked, backfilled, "Reconciled conversations");
        Ok(linked + backfilled)
    }
}

/// Read a text column and parse it into one of the model enums
fn parse_column<T>(row: &Row, column: &str) -> rusqlite::Result<T>
where
    T: FromStr<Err = AirhostError>,
{
    let raw: String = row.get(column)?;
    raw.parse().map_err(|e| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
    })
}

fn map_property(row: &Row) -> rusqlite::Result<Property> {
    Ok(Property {
        id: row.get(properties::ID)?,
        host_id: row.get(properties::HOST_ID)?,
        name: row.get(properties::NAME)?,
        address: row.get(properties::ADDRESS)?,
        ai_instructions: row.get(properties::AI_INSTRUCTIONS)?,
        created_at: row.get(properties::CREATED_AT)?,
    })
}

fn map_conversation(row: &Row) -> rusqlite::Result<Conversation> {
    let welcome_status: Option<String> = row.get(conversations::WELCOME_TEMPLATE_STATUS)?;
    Ok(Conversation {
        id: row.get(conversations::ID)?,
        host_id: row.get(conversations::HOST_ID)?,
        property_id: row.get(conversations::PROPERTY_ID)?,
        guest_name: row.get(conversations::GUEST_NAME)?,
        guest_phone: row.get(conversations::GUEST_PHONE)?,
        guest_email: row.get(conversations::GUEST_EMAIL)?,
        check_in_date: row.get(conversations::CHECK_IN_DATE)?,
        check_out_date: row.get(conversations::CHECK_OUT_DATE)?,
        status: row.get(conversations::STATUS)?,
        last_message: row.get(conversations::LAST_MESSAGE)?,
        last_message_at: row.get(conversations::LAST_MESSAGE_AT)?,
        unread_count: row.get(conversations::UNREAD_COUNT)?,
        emergency_status: parse_column(row, conversations::EMERGENCY_STATUS)?,
        priority_level: row.get(conversations::PRIORITY_LEVEL)?,
        needs_attention: row.get(conversations::NEEDS_ATTENTION)?,
        ai_analysis_type: row.get(conversations::AI_ANALYSIS_TYPE)?,
        analysis_confidence: row.get(conversations::ANALYSIS_CONFIDENCE)?,
        analysis_timestamp: row.get(conversations::ANALYSIS_TIMESTAMP)?,
        welcome_template_status: welcome_status.and_then(|s| s.parse().ok()),
        welcome_template_error: row.get(conversations::WELCOME_TEMPLATE_ERROR)?,
        created_at: row.get(conversations::CREATED_AT)?,
    })
}

fn map_message(row: &Row) -> rusqlite::Result<Message> {
    let metadata: Option<String> = row.get(messages::METADATA)?;
    Ok(Message {
        id: row.get(messages::ID)?,
        conversation_id: row.get(messages::CONVERSATION_ID)?,
        content: row.get(messages::CONTENT)?,
        direction: parse_column(row, messages::DIRECTION)?,
        message_type: row.get(messages::MESSAGE_TYPE)?,
        status: row.get(messages::STATUS)?,
        whatsapp_message_id: row.get(messages::WHATSAPP_MESSAGE_ID)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        created_at: row.get(messages::CREATED_AT)?,
    })
}

fn map_whatsapp_config(row: &Row) -> rusqlite::Result<WhatsAppConfig> {
    Ok(WhatsAppConfig {
        id: row.get(whatsapp_config::ID)?,
        host_id: row.get(whatsapp_config::HOST_ID)?,
        phone_number_id: row.get(whatsapp_config::PHONE_NUMBER_ID)?,
        access_token: row.get(whatsapp_config::ACCESS_TOKEN)?,
        business_account_id: row.get(whatsapp_config::BUSINESS_ACCOUNT_ID)?,
        webhook_verify_token: row.get(whatsapp_config::WEBHOOK_VERIFY_TOKEN)?,
        is_active: row.get(whatsapp_config::IS_ACTIVE)?,
        updated_at: row.get(whatsapp_config::UPDATED_AT)?,
    })
}

fn map_template_config(row: &Row) -> rusqlite::Result<TemplateConfig> {
    Ok(TemplateConfig {
        id: row.get(whatsapp_template_config::ID)?,
        host_id: row.get(whatsapp_template_config::HOST_ID)?,
        auto_templates_enabled: row.get(whatsapp_template_config::AUTO_TEMPLATES_ENABLED)?,
        welcome_template_name: row.get(whatsapp_template_config::WELCOME_TEMPLATE_NAME)?,
        welcome_template_language: row.get(whatsapp_template_config::WELCOME_TEMPLATE_LANGUAGE)?,
        updated_at: row.get(whatsapp_template_config::UPDATED_AT)?,
    })
}

fn map_analysis(row: &Row) -> rusqlite::Result<AnalysisRecord> {
    Ok(AnalysisRecord {
        id: row.get(conversation_analysis::ID)?,
        conversation_id: row.get(conversation_analysis::CONVERSATION_ID)?,
        message_id: row.get(conversation_analysis::MESSAGE_ID)?,
        tag: parse_column(row, conversation_analysis::TAG)?,
        confidence: row.get(conversation_analysis::CONFIDENCE)?,
        explanation: row.get(conversation_analysis::EXPLANATION)?,
        recommended_action: row.get(conversation_analysis::RECOMMENDED_ACTION)?,
        source: parse_column(row, conversation_analysis::SOURCE)?,
        needs_attention: row.get(conversation_analysis::NEEDS_ATTENTION)?,
        created_at: row.get(conversation_analysis::CREATED_AT)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AnalysisSource, ConversationTag, Direction, EmergencyStatus};

    fn seeded() -> (Database, Host, Property) {
        let db = Database::in_memory().unwrap();
        let host = db.insert_host("Sophie", Some("sophie@example.com")).unwrap();
        let property = db.insert_property(&host.id, "Studio Montmartre", None, None).unwrap();
        (db, host, property)
    }

    fn new_conversation(host: &Host, property: Option<&Property>, phone: &str) -> NewConversation {
        NewConversation {
            host_id: Some(host.id.clone()),
            property_id: property.map(|p| p.id.clone()),
            guest_name: "Marie".to_string(),
            guest_phone: phone.to_string(),
            guest_email: None,
            check_in_date: None,
            check_out_date: None,
            last_message: None,
            unread_count: 0,
        }
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::in_memory().unwrap();
        assert_eq!(db.applied_migrations().unwrap(), vec![1, 2, 3, 4]);
        assert!(db.run_migrations().unwrap().is_empty());
    }

    #[test]
    fn test_unique_index_migration_folds_duplicates() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("airhost.db");

        // A database at version 3 that already holds two conversations for one guest
        {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE schema_migrations (version INTEGER PRIMARY KEY NOT NULL, name TEXT NOT NULL, applied_at TEXT NOT NULL)",
            )
            .unwrap();
            for (version, name, sql) in &MIGRATIONS[..3] {
                conn.execute_batch(sql).unwrap();
                conn.execute(
                    "INSERT INTO schema_migrations (version, name, applied_at) VALUES (?, ?, ?)",
                    params![version, name, "2025-06-15T00:00:00+00:00"],
                )
                .unwrap();
            }
            conn.execute_batch(
                "INSERT INTO hosts (id, name, created_at) VALUES ('h1', 'Alice', '2025-06-01T00:00:00+00:00');
                 INSERT INTO properties (id, host_id, name, created_at) VALUES ('p1', 'h1', 'Studio', '2025-06-01T00:00:00+00:00');
                 INSERT INTO conversations (id, host_id, property_id, guest_name, guest_phone, created_at)
                     VALUES ('c-old', 'h1', 'p1', 'Marie', '+33612345678', '2025-06-02T00:00:00+00:00'),
                            ('c-new', 'h1', 'p1', 'Marie', '+33612345678', '2025-06-03T00:00:00+00:00');
                 INSERT INTO messages (id, conversation_id, content, direction, created_at)
                     VALUES ('m1', 'c-new', 'Bonjour', 'inbound', '2025-06-03T00:00:00+00:00');",
            )
            .unwrap();
        }

        let db = Database::new(&path.to_string_lossy()).unwrap();
        assert_eq!(db.applied_migrations().unwrap(), vec![1, 2, 3, 4]);

        let conversations = db.list_conversations(None, false).unwrap();
        assert_eq!(conversations.len(), 1);
        assert_eq!(conversations[0].id, "c-old");
        assert_eq!(db.list_messages("c-old", None).unwrap().len(), 1);
    }

    #[test]
    fn test_analysis_trigger_updates_conversation() {
        let (db, host, property) = seeded();
        let (conversation, _) = db.get_or_insert_conversation(&new_conversation(&host, Some(&property), "+33612345678")).unwrap();
        assert_eq!(conversation.priority_level, 1);
        assert!(!conversation.needs_attention);

        let classification = Classification::new(
            ConversationTag::CriticalEmergency,
            0.9,
            "fuite",
            "Intervenir",
            AnalysisSource::Keyword,
        );
        db.record_analysis(&conversation.id, None, &classification).unwrap();

        let updated = db.get_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(updated.priority_level, 5);
        assert!(updated.needs_attention);
        assert_eq!(updated.emergency_status, EmergencyStatus::Critical);
        assert_eq!(updated.ai_analysis_type.as_deref(), Some("keyword"));
        assert_eq!(db.list_analyses(&conversation.id).unwrap().len(), 1);
    }

    #[test]
    fn test_list_messages_keeps_latest_in_order() {
        let (db, host, property) = seeded();
        let (conversation, _) = db.get_or_insert_conversation(&new_conversation(&host, Some(&property), "+33612345678")).unwrap();
        for i in 0..5 {
            db.insert_message(&NewMessage::inbound(&conversation.id, &format!("m{i}"), "text")).unwrap();
        }
        let latest = db.list_messages(&conversation.id, Some(2)).unwrap();
        let contents: Vec<_> = latest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
        assert_eq!(latest[0].direction, Direction::Inbound);
    }

    #[test]
    fn test_touch_increments_unread() {
        let (db, host, property) = seeded();
        let (conversation, _) = db.get_or_insert_conversation(&new_conversation(&host, Some(&property), "+33612345678")).unwrap();
        db.touch_conversation(&conversation.id, "Bonjour", true).unwrap();
        db.touch_conversation(&conversation.id, "Encore", true).unwrap();
        let updated = db.get_conversation(&conversation.id).unwrap().unwrap();
        assert_eq!(updated.unread_count, 2);
        assert_eq!(updated.last_message.as_deref(), Some("Encore"));
        assert!(db.touch_conversation("missing", "x", false).is_err());
    }

    #[test]
    fn test_whatsapp_config_falls_back_to_latest() {
        let (db, host, _) = seeded();
        let other = db.insert_host("Other", None).unwrap();
        db.upsert_whatsapp_config(&NewWhatsAppConfig {
            host_id: Some(other.id.clone()),
            phone_number_id: "111111111111".into(),
            access_token: "token-of-other-host".into(),
            business_account_id: None,
            webhook_verify_token: None,
            is_active: true,
        })
        .unwrap();

        let found = db.whatsapp_config_for_host(Some(&host.id)).unwrap().unwrap();
        assert_eq!(found.host_id.as_deref(), Some(other.id.as_str()));

        let updated = db
            .upsert_whatsapp_config(&NewWhatsAppConfig {
                host_id: Some(other.id.clone()),
                phone_number_id: "222222222222".into(),
                access_token: "rotated-token-value".into(),
                business_account_id: None,
                webhook_verify_token: None,
                is_active: true,
            })
            .unwrap();
        let by_phone = db.whatsapp_config_by_phone_number_id("222222222222").unwrap().unwrap();
        assert_eq!(by_phone.id, updated.id);
    }

    #[test]
    fn test_reconcile_links_orphans() {
        let (db, host, property) = seeded();
        let (orphan, _) = db.get_or_insert_conversation(&new_conversation(&host, None, "+33600000000")).unwrap();
        assert_eq!(db.integrity_report().unwrap().conversations_without_property, 1);

        assert_eq!(db.reconcile_conversations().unwrap(), 1);
        let fixed = db.get_conversation(&orphan.id).unwrap().unwrap();
        assert_eq!(fixed.property_id.as_deref(), Some(property.id.as_str()));
        assert!(db.integrity_report().unwrap().is_clean());
    }
}
