//! Urgency tagging of guest messages.
//!
//! Two interchangeable implementations share the [`Classifier`] seam: the rule-based
//! [`KeywordClassifier`] and the model-backed [`LlmClassifier`]. Both always produce a
//! [`Classification`]; uncertainty is a tag, not an error.

mod keywords;
mod llm;

pub use keywords::KeywordClassifier;
pub use llm::{LlmClassifier, ANALYSIS_MAX_TOKENS};

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::{AirhostError, Result};
use crate::models::{ChatTurn, Classification, Direction};
use crate::openai::OpenAiClient;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    /// Tag the latest guest message of `history` (oldest turn first)
    async fn classify(&self, history: &[ChatTurn]) -> Classification;

    /// Short identifier for logs and metrics
    fn name(&self) -> &'static str;
}

/// Classifier selected by `analysis.classifier`. `llm` without an API key uses keywords.
pub fn from_config(config: &AppConfig) -> Result<Arc<dyn Classifier>> {
    match config.analysis.classifier.as_str() {
        "keyword" => Ok(Arc::new(KeywordClassifier::new())),
        "llm" => match OpenAiClient::from_config(&config.openai)? {
            Some(client) => {
                info!(model = client.model(), "Using model classifier");
                Ok(Arc::new(LlmClassifier::new(client)?.with_max_tokens(config.openai.max_tokens)))
            },
            None => {
                warn!("No OpenAI API key configured, using keyword classifier");
                Ok(Arc::new(KeywordClassifier::new()))
            },
        },
        other => Err(AirhostError::InvalidConfig(format!("Unknown classifier: {other}"))),
    }
}

/// The message a classification is about: the last inbound turn, else the last turn
pub(crate) fn latest_guest_message(history: &[ChatTurn]) -> Option<&ChatTurn> {
    history
        .iter()
        .rev()
        .find(|turn| turn.direction == Direction::Inbound)
        .or_else(|| history.last())
}

/// `Guest: ...` / `Host: ...` transcript, one turn per line
pub(crate) fn transcript(history: &[ChatTurn]) -> String {
    history
        .iter()
        .map(|turn| format!("{}: {}", turn.direction.speaker(), turn.content))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(content: &str, direction: Direction) -> ChatTurn {
        ChatTurn { content: content.to_string(), direction }
    }

    #[test]
    fn test_llm_without_key_uses_keywords() {
        let mut config = AppConfig::default();
        config.analysis.classifier = "llm".to_string();
        config.openai.api_key = None;
        assert_eq!(from_config(&config).unwrap().name(), "keyword");

        config.analysis.classifier = "bayes".to_string();
        assert!(from_config(&config).is_err());
    }

    #[test]
    fn test_latest_guest_message_skips_host_replies() {
        let history = vec![
            turn("Il y a une fuite", Direction::Inbound),
            turn("J'arrive", Direction::Outbound),
        ];
        assert_eq!(latest_guest_message(&history).unwrap().content, "Il y a une fuite");
        assert!(latest_guest_message(&[]).is_none());
    }

    #[test]
    fn test_transcript_labels_speakers() {
        let history = vec![turn("Bonjour", Direction::Inbound), turn("Bienvenue", Direction::Outbound)];
        assert_eq!(transcript(&history), "Guest: Bonjour\nHost: Bienvenue");
    }
}
