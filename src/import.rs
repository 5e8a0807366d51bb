//! Folding exported WhatsApp settings rows of every historical shape into the current
//! `whatsapp_config` / `whatsapp_template_config` schema.
//!
//! Old rows kept settings either in discrete columns or in a `config` JSON column (as an
//! object or as a JSON string), used `token` and `verification_token` for the credential
//! columns, and carried two template toggles.

use serde::Deserialize;
use serde_json::Value;

use crate::error::{AirhostError, Result};
use crate::models::{NewTemplateConfig, NewWhatsAppConfig};

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LegacyFields {
    #[serde(default)]
    pub phone_number_id: Option<String>,
    #[serde(default, alias = "token")]
    pub access_token: Option<String>,
    #[serde(default, alias = "verification_token")]
    pub webhook_verify_token: Option<String>,
    #[serde(default)]
    pub business_account_id: Option<String>,
    #[serde(default)]
    pub is_active: Option<bool>,
    #[serde(default)]
    pub send_welcome_template: Option<bool>,
    #[serde(default)]
    pub auto_templates_enabled: Option<bool>,
    #[serde(default, alias = "template_name")]
    pub welcome_template_name: Option<String>,
    #[serde(default, alias = "language")]
    pub welcome_template_language: Option<String>,
}

impl LegacyFields {
    /// Fill fields missing here from `other`
    fn or(self, other: Self) -> Self {
        Self {
            phone_number_id: self.phone_number_id.or(other.phone_number_id),
            access_token: self.access_token.or(other.access_token),
            webhook_verify_token: self.webhook_verify_token.or(other.webhook_verify_token),
            business_account_id: self.business_account_id.or(other.business_account_id),
            is_active: self.is_active.or(other.is_active),
            send_welcome_template: self.send_welcome_template.or(other.send_welcome_template),
            auto_templates_enabled: self.auto_templates_enabled.or(other.auto_templates_enabled),
            welcome_template_name: self.welcome_template_name.or(other.welcome_template_name),
            welcome_template_language: self.welcome_template_language.or(other.welcome_template_language),
        }
    }

    /// One toggle out of two: on only if every toggle present is on
    fn templates_enabled(&self) -> Option<bool> {
        match (self.auto_templates_enabled, self.send_welcome_template) {
            (None, None) => None,
            (a, s) => Some(a.unwrap_or(true) && s.unwrap_or(true)),
        }
    }
}

/// One exported settings row
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LegacyConfigRow {
    #[serde(default)]
    pub host_id: Option<String>,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(flatten)]
    pub fields: LegacyFields,
}

/// A row in the current schema's shape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportedConfig {
    pub whatsapp: Option<NewWhatsAppConfig>,
    pub template: Option<NewTemplateConfig>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

impl LegacyConfigRow {
    /// Normalize into the current schema. Credentials need both a phone number id and a
    /// token; template settings need a host.
    pub fn normalize(self) -> Result<ImportedConfig> {
        let embedded = match self.config {
            None | Some(Value::Null) => LegacyFields::default(),
            Some(Value::String(text)) if text.trim().is_empty() => LegacyFields::default(),
            Some(Value::String(text)) => serde_json::from_str(&text)?,
            Some(value @ Value::Object(_)) => serde_json::from_value(value)?,
            Some(other) => {
                return Err(AirhostError::Validation(format!(
                    "Unsupported config column value: {other}"
                )))
            },
        };
        let fields = self.fields.or(embedded);
        let host_id = non_blank(self.host_id);

        let template = match (&host_id, fields.templates_enabled()) {
            (Some(host_id), enabled) if enabled.is_some() || fields.welcome_template_name.is_some() => {
                Some(NewTemplateConfig {
                    host_id: host_id.clone(),
                    auto_templates_enabled: enabled.unwrap_or(false),
                    welcome_template_name: non_blank(fields.welcome_template_name.clone()),
                    welcome_template_language: non_blank(fields.welcome_template_language.clone()),
                })
            },
            _ => None,
        };

        let whatsapp = match (non_blank(fields.phone_number_id), non_blank(fields.access_token)) {
            (Some(phone_number_id), Some(access_token)) => Some(NewWhatsAppConfig {
                host_id,
                phone_number_id,
                access_token,
                business_account_id: non_blank(fields.business_account_id),
                webhook_verify_token: non_blank(fields.webhook_verify_token),
                is_active: fields.is_active.unwrap_or(true),
            }),
            _ => None,
        };

        Ok(ImportedConfig { whatsapp, template })
    }
}

/// Parse an export file holding one row or an array of rows
pub fn parse_rows(json: &str) -> Result<Vec<LegacyConfigRow>> {
    let value: Value = serde_json::from_str(json)?;
    let rows = match value {
        Value::Array(items) => items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<std::result::Result<Vec<_>, _>>()?,
        other => vec![serde_json::from_value(other)?],
    };
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discrete_columns_with_old_names() {
        let rows = parse_rows(
            r#"{"host_id": "h1", "phone_number_id": "604674832740532", "token": "EAAG-token-value",
                "verification_token": "verify", "send_welcome_template": true, "template_name": "welcome_checkin"}"#,
        )
        .unwrap();
        let imported = rows.into_iter().next().unwrap().normalize().unwrap();

        let whatsapp = imported.whatsapp.unwrap();
        assert_eq!(whatsapp.access_token, "EAAG-token-value");
        assert_eq!(whatsapp.webhook_verify_token.as_deref(), Some("verify"));
        assert!(whatsapp.is_active);

        let template = imported.template.unwrap();
        assert!(template.auto_templates_enabled);
        assert_eq!(template.welcome_template_name.as_deref(), Some("welcome_checkin"));
    }

    #[test]
    fn test_config_column_as_json_string() {
        let rows = parse_rows(
            r#"[{"host_id": "h2", "config": "{\"phone_number_id\": \"604674832740532\", \"access_token\": \"EAAG-token-value\"}"}]"#,
        )
        .unwrap();
        let imported = rows.into_iter().next().unwrap().normalize().unwrap();
        assert_eq!(imported.whatsapp.unwrap().phone_number_id, "604674832740532");
        assert!(imported.template.is_none());
    }

    #[test]
    fn test_conflicting_toggles_disable_templates() {
        let row: LegacyConfigRow = serde_json::from_str(
            r#"{"host_id": "h3", "config": {"auto_templates_enabled": true, "send_welcome_template": false}}"#,
        )
        .unwrap();
        let imported = row.normalize().unwrap();
        assert!(!imported.template.unwrap().auto_templates_enabled);
        assert!(imported.whatsapp.is_none());
    }

    #[test]
    fn test_columns_win_over_config_json() {
        let row: LegacyConfigRow = serde_json::from_str(
            r#"{"phone_number_id": "111111111111", "access_token": "column-token-value",
                "config": {"phone_number_id": "222222222222", "token": "json-token-value"}}"#,
        )
        .unwrap();
        let whatsapp = row.normalize().unwrap().whatsapp.unwrap();
        assert_eq!(whatsapp.phone_number_id, "111111111111");
        assert_eq!(whatsapp.access_token, "column-token-value");
        assert!(whatsapp.host_id.is_none());
    }
}
