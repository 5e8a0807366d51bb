//! Database schema definitions
//!
//! Table and column names shared by the SQLite store, the Supabase store and the
//! migrations under `migrations/`.

/// Hosts table schema
pub mod hosts {
    /// Table name
    pub const TABLE: &str = "hosts";
    /// Primary key column
    pub const ID: &str = "id";
    /// Display name column
    pub const NAME: &str = "name";
    /// Contact email column
    pub const EMAIL: &str = "email";
    /// Creation timestamp column
    pub const CREATED_AT: &str = "created_at";
}

/// Properties table schema
pub mod properties {
    /// Table name
    pub const TABLE: &str = "properties";
    /// Primary key column
    pub const ID: &str = "id";
    /// Owning host column
    pub const HOST_ID: &str = "host_id";
    /// Property name column
    pub const NAME: &str = "name";
    /// Street address column
    pub const ADDRESS: &str = "address";
    /// Assistant instructions column
    pub const AI_INSTRUCTIONS: &str = "ai_instructions";
    /// Creation timestamp column
    pub const CREATED_AT: &str = "created_at";
}

/// Conversations table schema
pub mod conversations {
    pub const TABLE: &str = "conversations";
    pub const ID: &str = "id";
    pub const HOST_ID: &str = "host_id";
    pub const PROPERTY_ID: &str = "property_id";
    pub const GUEST_NAME: &str = "guest_name";
    pub const GUEST_PHONE: &str = "guest_phone";
    pub const GUEST_EMAIL: &str = "guest_email";
    pub const CHECK_IN_DATE: &str = "check_in_date";
    pub const CHECK_OUT_DATE: &str = "check_out_date";
    pub const STATUS: &str = "status";
    pub const LAST_MESSAGE: &str = "last_message";
    pub const LAST_MESSAGE_AT: &str = "last_message_at";
    pub const UNREAD_COUNT: &str = "unread_count";
    pub const EMERGENCY_STATUS: &str = "emergency_status";
    pub const PRIORITY_LEVEL: &str = "priority_level";
    pub const NEEDS_ATTENTION: &str = "needs_attention";
    pub const AI_ANALYSIS_TYPE: &str = "ai_analysis_type";
    pub const ANALYSIS_CONFIDENCE: &str = "analysis_confidence";
    pub const ANALYSIS_TIMESTAMP: &str = "analysis_timestamp";
    pub const WELCOME_TEMPLATE_STATUS: &str = "welcome_template_status";
    pub const WELCOME_TEMPLATE_ERROR: &str = "welcome_template_error";
    pub const CREATED_AT: &str = "created_at";
}

/// Messages table schema
pub mod messages {
    /// Table name
    pub const TABLE: &str = "messages";
    /// Primary key column
    pub const ID: &str = "id";
    /// Parent conversation column
    pub const CONVERSATION_ID: &str = "conversation_id";
    /// Message text column
    pub const CONTENT: &str = "content";
    /// `inbound` or `outbound`
    pub const DIRECTION: &str = "direction";
    /// WhatsApp message type column
    pub const MESSAGE_TYPE: &str = "type";
    /// Delivery status column
    pub const STATUS: &str = "status";
    /// WhatsApp wamid column
    pub const WHATSAPP_MESSAGE_ID: &str = "whatsapp_message_id";
    /// JSON metadata column
    pub const METADATA: &str = "metadata";
    /// Creation timestamp column
    pub const CREATED_AT: &str = "created_at";
}

/// WhatsApp credentials table schema
pub mod whatsapp_config {
    pub const TABLE: &str = "whatsapp_config";
    pub const ID: &str = "id";
    pub const HOST_ID: &str = "host_id";
    pub const PHONE_NUMBER_ID: &str = "phone_number_id";
    pub const ACCESS_TOKEN: &str = "access_token";
    pub const BUSINESS_ACCOUNT_ID: &str = "business_account_id";
    pub const WEBHOOK_VERIFY_TOKEN: &str = "webhook_verify_token";
    pub const IS_ACTIVE: &str = "is_active";
    pub const UPDATED_AT: &str = "updated_at";
}

/// Template automation table schema
pub mod whatsapp_template_config {
    pub const TABLE: &str = "whatsapp_template_config";
    pub const ID: &str = "id";
    pub const HOST_ID: &str = "host_id";
    pub const AUTO_TEMPLATES_ENABLED: &str = "auto_templates_enabled";
    pub const WELCOME_TEMPLATE_NAME: &str = "welcome_template_name";
    pub const WELCOME_TEMPLATE_LANGUAGE: &str = "welcome_template_language";
    pub const UPDATED_AT: &str = "updated_at";
}

/// Classification results table schema
pub mod conversation_analysis {
    pub const TABLE: &str = "conversation_analysis";
    pub const ID: &str = "id";
    pub const CONVERSATION_ID: &str = "conversation_id";
    pub const MESSAGE_ID: &str = "message_id";
    pub const TAG: &str = "tag";
    pub const CONFIDENCE: &str = "confidence";
    pub const EXPLANATION: &str = "explanation";
    pub const RECOMMENDED_ACTION: &str = "recommended_action";
    pub const SOURCE: &str = "source";
    pub const NEEDS_ATTENTION: &str = "needs_attention";
    pub const CREATED_AT: &str = "created_at";
}

/// Emergency cases table schema
pub mod emergency_cases {
    pub const TABLE: &str = "emergency_cases";
    pub const ID: &str = "id";
    pub const CONVERSATION_ID: &str = "conversation_id";
    pub const HOST_ID: &str = "host_id";
    pub const EMERGENCY_TYPE: &str = "emergency_type";
    pub const DESCRIPTION: &str = "description";
    pub const STATUS: &str = "status";
    pub const DETECTED_AT: &str = "detected_at";
    pub const RESOLVED_AT: &str = "resolved_at";
}

/// Applied migrations ledger
pub mod schema_migrations {
    pub const TABLE: &str = "schema_migrations";
    pub const VERSION: &str = "version";
    pub const NAME: &str = "name";
    pub const APPLIED_AT: &str = "applied_at";
}
