//! Data models for conversations, messages and WhatsApp configuration
//!
//! Row types mirror the tables in `schema`; they double as the JSON shape exchanged with
//! Supabase, so nullable legacy columns deserialize through `null_as_default`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::AirhostError;

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// The six urgency labels attached to inbound guest messages.
///
/// Display strings are the French labels stored in the database and shown to hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConversationTag {
    /// Safety issue, serious outage, real emergency
    #[serde(rename = "Urgence critique")]
    CriticalEmergency,
    /// Aggressive tone, threats
    #[serde(rename = "Escalade comportementale")]
    BehavioralEscalation,
    /// Complaint or frustration
    #[serde(rename = "Client mécontent")]
    DissatisfiedGuest,
    /// Check-in/out, specific technical issue, custom request
    #[serde(rename = "Intervention hôte requise")]
    HostInterventionRequired,
    /// Nothing conclusive; a human should look
    #[serde(rename = "IA incertaine")]
    Uncertain,
    /// Routine message the assistant can answer
    #[serde(rename = "Réponse connue")]
    KnownAnswer,
}

impl ConversationTag {
    /// Every tag, most urgent first
    pub const ALL: [Self; 6] = [
        Self::CriticalEmergency,
        Self::BehavioralEscalation,
        Self::DissatisfiedGuest,
        Self::HostInterventionRequired,
        Self::Uncertain,
        Self::KnownAnswer,
    ];

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CriticalEmergency => "Urgence critique",
            Self::BehavioralEscalation => "Escalade comportementale",
            Self::DissatisfiedGuest => "Client mécontent",
            Self::HostInterventionRequired => "Intervention hôte requise",
            Self::Uncertain => "IA incertaine",
            Self::KnownAnswer => "Réponse connue",
        }
    }

    /// Numeric priority written to `conversations.priority_level` (5 is most urgent)
    #[must_use]
    pub const fn priority_level(&self) -> i64 {
        match self {
            Self::CriticalEmergency => 5,
            Self::BehavioralEscalation => 4,
            Self::DissatisfiedGuest | Self::HostInterventionRequired => 3,
            Self::Uncertain => 2,
            Self::KnownAnswer => 1,
        }
    }

    #[must_use]
    pub const fn priority(&self) -> Priority {
        match self {
            Self::CriticalEmergency => Priority::Urgent,
            Self::BehavioralEscalation | Self::DissatisfiedGuest => Priority::High,
            Self::HostInterventionRequired | Self::Uncertain => Priority::Medium,
            Self::KnownAnswer => Priority::Low,
        }
    }

    #[must_use]
    pub const fn emergency_status(&self) -> EmergencyStatus {
        match self {
            Self::CriticalEmergency => EmergencyStatus::Critical,
            Self::BehavioralEscalation => EmergencyStatus::Escalation,
            Self::DissatisfiedGuest => EmergencyStatus::Dissatisfied,
            Self::HostInterventionRequired | Self::Uncertain | Self::KnownAnswer => EmergencyStatus::Normal,
        }
    }

    /// Tags that open an `emergency_cases` row
    #[must_use]
    pub const fn is_emergency(&self) -> bool {
        matches!(self, Self::CriticalEmergency | Self::BehavioralEscalation | Self::DissatisfiedGuest)
    }

    /// Host-facing description used by the tag catalogue
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::CriticalEmergency => "Problème de sécurité, panne grave, situation d'urgence réelle",
            Self::BehavioralEscalation => "Ton agressif, menaces, comportement inapproprié",
            Self::DissatisfiedGuest => "Client exprimant une insatisfaction, plainte ou frustration",
            Self::HostInterventionRequired => {
                "Check-in/check-out, problèmes techniques spécifiques, demandes personnalisées"
            },
            Self::Uncertain => "Question complexe où l'IA n'est pas sûre de sa réponse",
            Self::KnownAnswer => "Question standard dont l'IA connaît la réponse",
        }
    }
}

impl fmt::Display for ConversationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationTag {
    type Err = AirhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|tag| tag.as_str() == s.trim())
            .ok_or_else(|| AirhostError::Validation(format!("Unknown conversation tag: {s}")))
    }
}

/// Coarse priority label derived from a tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Urgent,
}

/// Value of `conversations.emergency_status`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmergencyStatus {
    Critical,
    Escalation,
    Dissatisfied,
    #[default]
    Normal,
}

impl EmergencyStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Escalation => "escalation",
            Self::Dissatisfied => "dissatisfied",
            Self::Normal => "normal",
        }
    }
}

impl FromStr for EmergencyStatus {
    type Err = AirhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "escalation" => Ok(Self::Escalation),
            "dissatisfied" => Ok(Self::Dissatisfied),
            "normal" => Ok(Self::Normal),
            other => Err(AirhostError::Validation(format!("Unknown emergency status: {other}"))),
        }
    }
}

/// Which way a message travelled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    #[serde(alias = "incoming")]
    Inbound,
    #[serde(alias = "outgoing")]
    Outbound,
}

impl Direction {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    /// Speaker label used in transcripts
    #[must_use]
    pub const fn speaker(&self) -> &'static str {
        match self {
            Self::Inbound => "Guest",
            Self::Outbound => "Host",
        }
    }
}

impl FromStr for Direction {
    type Err = AirhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "inbound" | "incoming" => Ok(Self::Inbound),
            "outbound" | "outgoing" => Ok(Self::Outbound),
            other => Err(AirhostError::Validation(format!("Unknown message direction: {other}"))),
        }
    }
}

/// Result of the welcome template step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WelcomeStatus {
    Sent,
    Failed,
    Skipped,
}

impl WelcomeStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for WelcomeStatus {
    type Err = AirhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(AirhostError::Validation(format!("Unknown welcome status: {other}"))),
        }
    }
}

/// Where a classification came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisSource {
    /// Rule-based keyword lists
    Keyword,
    /// Chat-completion model
    Llm,
    /// Model answered but the answer was unusable
    Fallback,
}

impl AnalysisSource {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::Llm => "llm",
            Self::Fallback => "fallback",
        }
    }
}

impl FromStr for AnalysisSource {
    type Err = AirhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keyword" => Ok(Self::Keyword),
            "llm" => Ok(Self::Llm),
            "fallback" => Ok(Self::Fallback),
            other => Err(AirhostError::Validation(format!("Unknown analysis source: {other}"))),
        }
    }
}

/// A property owner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Host {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A rental unit owned by exactly one host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Property {
    pub id: String,
    pub host_id: String,
    pub name: String,
    #[serde(default)]
    pub address: Option<String>,
    /// Free-text instructions passed to the reply assistant
    #[serde(default)]
    pub ai_instructions: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A guest thread, keyed by normalized phone and property
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub host_id: Option<String>,
    /// Should always be set; `diagnose` reports rows where it is not
    #[serde(default)]
    pub property_id: Option<String>,
    pub guest_name: String,
    pub guest_phone: String,
    #[serde(default)]
    pub guest_email: Option<String>,
    #[serde(default)]
    pub check_in_date: Option<NaiveDate>,
    #[serde(default)]
    pub check_out_date: Option<NaiveDate>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default)]
    pub last_message: Option<String>,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub unread_count: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub emergency_status: EmergencyStatus,
    #[serde(default, deserialize_with = "null_as_default")]
    pub priority_level: i64,
    #[serde(default, deserialize_with = "null_as_default")]
    pub needs_attention: bool,
    #[serde(default)]
    pub ai_analysis_type: Option<String>,
    #[serde(default)]
    pub analysis_confidence: Option<f64>,
    #[serde(default)]
    pub analysis_timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub welcome_template_status: Option<WelcomeStatus>,
    #[serde(default)]
    pub welcome_template_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewConversation {
    pub host_id: Option<String>,
    pub property_id: Option<String>,
    pub guest_name: String,
    pub guest_phone: String,
    pub guest_email: Option<String>,
    pub check_in_date: Option<NaiveDate>,
    pub check_out_date: Option<NaiveDate>,
    pub last_message: Option<String>,
    pub unread_count: i64,
}

/// A stored chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub content: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub direction: Direction,
    #[serde(rename = "type", default, deserialize_with = "null_as_default")]
    pub message_type: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub status: String,
    #[serde(default)]
    pub whatsapp_message_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload for a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub content: String,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub message_type: String,
    pub status: String,
    pub whatsapp_message_id: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    /// An inbound guest message as received from the webhook
    #[must_use]
    pub fn inbound(conversation_id: &str, content: &str, message_type: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            direction: Direction::Inbound,
            message_type: message_type.to_string(),
            status: "received".to_string(),
            whatsapp_message_id: None,
            metadata: None,
        }
    }
}

/// One turn of a conversation as seen by the classifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub content: String,
    #[serde(default)]
    pub direction: Direction,
}

impl From<&Message> for ChatTurn {
    fn from(message: &Message) -> Self {
        Self {
            content: message.content.clone(),
            direction: message.direction,
        }
    }
}

/// Per-host WhatsApp Cloud API credentials
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatsAppConfig {
    pub id: String,
    #[serde(default)]
    pub host_id: Option<String>,
    pub phone_number_id: String,
    /// Older rows name this column `token`
    #[serde(alias = "token")]
    pub access_token: String,
    #[serde(default)]
    pub business_account_id: Option<String>,
    #[serde(default)]
    pub webhook_verify_token: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_active: bool,
    pub updated_at: DateTime<Utc>,
}

impl WhatsAppConfig {
    /// Credentials shorter than this are placeholders left by old setup scripts
    pub const MIN_CREDENTIAL_LEN: usize = 10;

    #[must_use]
    pub fn has_plausible_credentials(&self) -> bool {
        self.access_token.trim().len() >= Self::MIN_CREDENTIAL_LEN
            && self.phone_number_id.trim().len() >= Self::MIN_CREDENTIAL_LEN
    }
}

impl fmt::Debug for WhatsAppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WhatsAppConfig")
            .field("id", &self.id)
            .field("host_id", &self.host_id)
            .field("phone_number_id", &self.phone_number_id)
            .field("access_token", &"<redacted>")
            .field("business_account_id", &self.business_account_id)
            .field("is_active", &self.is_active)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

/// Upsert payload for `whatsapp_config`
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWhatsAppConfig {
    pub host_id: Option<String>,
    pub phone_number_id: String,
    pub access_token: String,
    pub business_account_id: Option<String>,
    pub webhook_verify_token: Option<String>,
    pub is_active: bool,
}

impl fmt::Debug for NewWhatsAppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewWhatsAppConfig")
            .field("host_id", &self.host_id)
            .field("phone_number_id", &self.phone_number_id)
            .field("access_token", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Per-host template automation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateConfig {
    pub id: String,
    pub host_id: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub auto_templates_enabled: bool,
    #[serde(default)]
    pub welcome_template_name: Option<String>,
    #[serde(default)]
    pub welcome_template_language: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Upsert payload for `whatsapp_template_config`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewTemplateConfig {
    pub host_id: String,
    pub auto_templates_enabled: bool,
    pub welcome_template_name: Option<String>,
    pub welcome_template_language: Option<String>,
}

/// Output of either classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Classification {
    pub needs_attention: bool,
    #[serde(rename = "conversationTag")]
    pub tag: ConversationTag,
    pub confidence: f64,
    pub explanation: String,
    pub recommended_action: String,
    pub priority: Priority,
    #[serde(default)]
    pub matched_keywords: Vec<String>,
    pub source: AnalysisSource,
}

impl Classification {
    #[must_use]
    pub fn new(
        tag: ConversationTag,
        confidence: f64,
        explanation: impl Into<String>,
        recommended_action: impl Into<String>,
        source: AnalysisSource,
    ) -> Self {
        Self {
            needs_attention: tag != ConversationTag::KnownAnswer,
            tag,
            confidence: confidence.clamp(0.0, 1.0),
            explanation: explanation.into(),
            recommended_action: recommended_action.into(),
            priority: tag.priority(),
            matched_keywords: Vec::new(),
            source,
        }
    }
}

/// A stored `conversation_analysis` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    pub tag: ConversationTag,
    pub confidence: f64,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub recommended_action: Option<String>,
    pub source: AnalysisSource,
    #[serde(default, deserialize_with = "null_as_default")]
    pub needs_attention: bool,
    pub created_at: DateTime<Utc>,
}

/// A stored `emergency_cases` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyCase {
    pub id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub host_id: Option<String>,
    pub emergency_type: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: String,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Body of `POST /conversations`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub host_id: Option<String>,
    pub guest_name: String,
    pub guest_phone: String,
    #[serde(default)]
    pub guest_email: Option<String>,
    pub property_id: String,
    #[serde(default)]
    pub check_in_date: Option<NaiveDate>,
    #[serde(default)]
    pub check_out_date: Option<NaiveDate>,
    /// Overrides the host's configured welcome template
    #[serde(default)]
    pub welcome_template_name: Option<String>,
}

/// What happened to the welcome template of a new conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WelcomeOutcome {
    pub status: WelcomeStatus,
    pub template_name: Option<String>,
    pub whatsapp_message_id: Option<String>,
    pub error: Option<String>,
}

impl WelcomeOutcome {
    #[must_use]
    pub const fn skipped() -> Self {
        Self {
            status: WelcomeStatus::Skipped,
            template_name: None,
            whatsapp_message_id: None,
            error: None,
        }
    }

    #[must_use]
    pub fn failed(template_name: Option<String>, error: impl Into<String>) -> Self {
        Self {
            status: WelcomeStatus::Failed,
            template_name,
            whatsapp_message_id: None,
            error: Some(error.into()),
        }
    }
}

/// Result of the conversation creation workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationOutcome {
    pub conversation: Conversation,
    pub is_new: bool,
    /// `None` for an existing conversation; no send is attempted for those
    pub welcome: Option<WelcomeOutcome>,
}

/// Ownership invariant violations found by `diagnose`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub conversations_without_property: usize,
    pub conversations_with_unknown_property: usize,
    pub properties_with_unknown_host: usize,
    pub configs_without_host: usize,
}

impl IntegrityReport {
    #[must_use]
    pub const fn is_clean(&self) -> bool {
        self.conversations_without_property == 0
            && self.conversations_with_unknown_property == 0
            && self.properties_with_unknown_host == 0
            && self.configs_without_host == 0
    }
}

/// Output format for exported transcripts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Comma-separated values format
    Csv,
    /// Plain text format
    Txt,
    /// JSON format
    Json,
}

impl OutputFormat {
    /// Get the file extension for this format
    #[must_use]
    pub const fn extension(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Txt => "txt",
            Self::Json => "json",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = AirhostError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "txt" => Ok(Self::Txt),
            "csv" => Ok(Self::Csv),
            "json" => Ok(Self::Json),
            other => Err(AirhostError::Validation(format!("Unknown output format: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trips_through_french_label() {
        for tag in ConversationTag::ALL {
            assert_eq!(tag.as_str().parse::<ConversationTag>().unwrap(), tag);
        }
        assert!("Urgent".parse::<ConversationTag>().is_err());
    }

    #[test]
    fn test_tag_serializes_as_label() {
        let json = serde_json::to_string(&ConversationTag::DissatisfiedGuest).unwrap();
        assert_eq!(json, "\"Client mécontent\"");
    }

    #[test]
    fn test_priority_mapping() {
        assert_eq!(ConversationTag::CriticalEmergency.priority_level(), 5);
        assert_eq!(ConversationTag::BehavioralEscalation.priority_level(), 4);
        assert_eq!(ConversationTag::HostInterventionRequired.priority_level(), 3);
        assert_eq!(ConversationTag::KnownAnswer.priority(), Priority::Low);
        assert!(ConversationTag::DissatisfiedGuest.is_emergency());
        assert!(!ConversationTag::Uncertain.is_emergency());
    }

    #[test]
    fn test_null_columns_use_defaults() {
        let json = serde_json::json!({
            "id": "c1",
            "guest_name": "Marie",
            "guest_phone": "+33612345678",
            "status": null,
            "unread_count": null,
            "emergency_status": null,
            "priority_level": null,
            "needs_attention": null,
            "created_at": "2025-06-01T10:00:00+00:00"
        });
        let conversation: Conversation = serde_json::from_value(json).unwrap();
        assert_eq!(conversation.unread_count, 0);
        assert_eq!(conversation.emergency_status, EmergencyStatus::Normal);
        assert!(conversation.property_id.is_none());
    }

    #[test]
    fn test_credentials_plausibility() {
        let mut config = WhatsAppConfig {
            id: "w1".into(),
            host_id: None,
            phone_number_id: "604674832740532".into(),
            access_token: "EAAG-long-enough-token".into(),
            business_account_id: None,
            webhook_verify_token: None,
            is_active: true,
            updated_at: Utc::now(),
        };
        assert!(config.has_plausible_credentials());
        config.access_token = "short".into();
        assert!(!config.has_plausible_credentials());
        assert!(!format!("{config:?}").contains("short"));
    }
}
