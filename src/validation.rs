use chrono::NaiveDate;

use crate::error::{AirhostError, Result};
use crate::models::CreateConversationRequest;

fn invalid(message: impl Into<String>) -> AirhostError {
    AirhostError::Validation(message.into())
}

/// Validation utilities for input sanitization and edge case handling
#[derive(Debug, Copy, Clone)]
pub struct InputValidator;

impl InputValidator {
    /// Validate guest or host name
    pub fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(invalid("Name cannot be empty"));
        }

        if name.chars().count() > 100 {
            return Err(invalid("Name too long (max 100 characters)"));
        }

        if name.contains('\0') || name.contains('\r') || name.contains('\n') {
            return Err(invalid("Name contains invalid characters"));
        }

        Ok(())
    }

    /// Validate phone number format
    pub fn validate_phone(phone: &str) -> Result<()> {
        if phone.trim().is_empty() {
            return Err(invalid("Phone number cannot be empty"));
        }

        if phone
            .chars()
            .any(|c| !(c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | ' ' | '.')))
        {
            return Err(invalid("Phone number contains invalid characters"));
        }

        let digits_only = phone.chars().filter(char::is_ascii_digit).count();
        if !(7..=15).contains(&digits_only) {
            return Err(invalid("Phone number must be between 7 and 15 digits"));
        }

        if phone.trim_start().get(1..).is_some_and(|rest| rest.contains('+')) {
            return Err(invalid("Phone number may only start with +"));
        }

        Ok(())
    }

    /// Validate email format
    pub fn validate_email(email: &str) -> Result<()> {
        if email.trim().is_empty() {
            return Err(invalid("Email cannot be empty"));
        }

        if email.len() > 254 {
            return Err(invalid("Email too long (max 254 characters)"));
        }

        let Some((local_part, domain_part)) = email.split_once('@') else {
            return Err(invalid("Email must contain @ symbol"));
        };

        if domain_part.contains('@') {
            return Err(invalid("Email must have exactly one @ symbol"));
        }

        if local_part.is_empty() || local_part.len() > 64 {
            return Err(invalid("Email local part invalid"));
        }

        if domain_part.is_empty() || !domain_part.contains('.') {
            return Err(invalid("Email domain invalid"));
        }

        Ok(())
    }

    /// Validate stay dates. Both are required and check-in may not follow check-out.
    pub fn validate_stay(check_in: Option<NaiveDate>, check_out: Option<NaiveDate>) -> Result<()> {
        let (Some(check_in), Some(check_out)) = (check_in, check_out) else {
            return Err(invalid("Both check_in_date and check_out_date are required"));
        };

        if check_in > check_out {
            return Err(invalid("Check-in date cannot be after check-out date"));
        }

        let nights = (check_out - check_in).num_days();
        if nights > 365 {
            tracing::warn!(nights, "Unusually long stay");
        }

        Ok(())
    }

    /// Validate a WhatsApp template name (lowercase letters, digits, underscores)
    pub fn validate_template_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(invalid("Template name cannot be empty"));
        }

        if name.len() > 512 {
            return Err(invalid("Template name too long (max 512 characters)"));
        }

        if !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
        {
            return Err(invalid("Template name contains invalid characters"));
        }

        Ok(())
    }

    /// Validate an identifier coming from a request (UUID or legacy text id)
    pub fn validate_id(field: &str, id: &str) -> Result<()> {
        if id.trim().is_empty() {
            return Err(invalid(format!("{field} cannot be empty")));
        }

        if id.len() > 64 || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(invalid(format!("{field} is not a valid identifier")));
        }

        Ok(())
    }

    /// Validate the body of a conversation creation request
    pub fn validate_conversation_request(request: &CreateConversationRequest) -> Result<()> {
        Self::validate_name(&request.guest_name)?;
        Self::validate_phone(&request.guest_phone)?;
        Self::validate_id("property_id", &request.property_id)?;

        if let Some(host_id) = request.host_id.as_deref() {
            Self::validate_id("host_id", host_id)?;
        }
        if let Some(email) = request.guest_email.as_deref().filter(|e| !e.trim().is_empty()) {
            Self::validate_email(email)?;
        }
        if let Some(template) = request.welcome_template_name.as_deref() {
            Self::validate_template_name(template)?;
        }

        Self::validate_stay(request.check_in_date, request.check_out_date)
    }

    /// Sanitize text input
    #[must_use]
    pub fn sanitize_text(text: &str) -> String {
        text.chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t' || *c == '\r')
            .collect::<String>()
            .trim()
            .to_string()
    }
}
