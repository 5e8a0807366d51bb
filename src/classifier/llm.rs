use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{latest_guest_message, transcript, Classifier, KeywordClassifier};
use crate::error::{AirhostError, Result};
use crate::models::{AnalysisSource, ChatTurn, Classification, ConversationTag};
use crate::openai::OpenAiClient;

pub const ANALYSIS_MAX_TOKENS: u32 = 200;

/// Confidence of the result returned when the model's answer is unusable
pub const UNPARSEABLE_CONFIDENCE: f64 = 0.5;

const SYSTEM_PROMPT: &str = "Tu es un système d'analyse de conversations pour des communications Airbnb \
entre un voyageur (Guest) et un hôte (Host). Analyse le dernier message du voyageur et classe la \
conversation avec exactement un de ces tags :
- \"Urgence critique\" : problème de sécurité, panne grave, situation d'urgence réelle
- \"Escalade comportementale\" : ton agressif, menaces, comportement inapproprié
- \"Client mécontent\" : insatisfaction, plainte ou frustration
- \"Intervention hôte requise\" : check-in/check-out, problème technique spécifique, demande personnalisée
- \"IA incertaine\" : question complexe dont tu n'es pas sûr de la réponse
- \"Réponse connue\" : question standard dont tu connais la réponse

Réponds uniquement avec un objet JSON de la forme :
{\"needsAttention\": boolean, \"conversationTag\": string, \"confidence\": nombre entre 0 et 1, \
\"explanation\": string, \"recommendedAction\": string}";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAnalysis {
    #[serde(default)]
    needs_attention: Option<bool>,
    #[serde(default)]
    conversation_tag: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    explanation: Option<String>,
    #[serde(default)]
    recommended_action: Option<String>,
}

/// GPT-backed tagger. Falls back to [`KeywordClassifier`] when the API cannot be reached.
#[derive(Debug, Clone)]
pub struct LlmClassifier {
    client: OpenAiClient,
    max_tokens: u32,
    fallback: KeywordClassifier,
    json_block: Regex,
}

impl LlmClassifier {
    pub fn new(client: OpenAiClient) -> Result<Self> {
        let json_block = Regex::new(r"\{[\s\S]*\}")
            .map_err(|e| AirhostError::Other(format!("Failed to compile JSON block regex: {e}")))?;
        Ok(Self {
            client,
            max_tokens: ANALYSIS_MAX_TOKENS,
            fallback: KeywordClassifier::new(),
            json_block,
        })
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    fn system_prompt(history: &[ChatTurn]) -> String {
        format!("{SYSTEM_PROMPT}\n\nConversation :\n{}", transcript(history))
    }

    /// Turn the model's raw text into a classification. Never fails.
    #[must_use]
    pub fn parse_response(&self, text: &str) -> Classification {
        let raw = serde_json::from_str::<RawAnalysis>(text.trim()).ok().or_else(|| {
            self.json_block
                .find(text)
                .and_then(|m| serde_json::from_str::<RawAnalysis>(m.as_str()).ok())
        });

        let Some(raw) = raw else {
            debug!("Model answer is not JSON");
            return Self::unparseable();
        };

        let Some(tag) = raw
            .conversation_tag
            .as_deref()
            .and_then(|label| label.parse::<ConversationTag>().ok())
        else {
            debug!(tag = ?raw.conversation_tag, "Model answer has no known tag");
            return Self::unparseable();
        };

        let mut classification = Classification::new(
            tag,
            raw.confidence.unwrap_or(UNPARSEABLE_CONFIDENCE),
            raw.explanation.unwrap_or_default(),
            raw.recommended_action.unwrap_or_default(),
            AnalysisSource::Llm,
        );
        // A positive answer the model still flags stays flagged
        if let Some(needs_attention) = raw.needs_attention {
            classification.needs_attention = needs_attention || tag != ConversationTag::KnownAnswer;
        }
        classification
    }

    fn unparseable() -> Classification {
        Classification::new(
            ConversationTag::Uncertain,
            UNPARSEABLE_CONFIDENCE,
            "Réponse de l'analyse illisible",
            "Vérifier le message manuellement",
            AnalysisSource::Fallback,
        )
    }
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, history: &[ChatTurn]) -> Classification {
        let user_message = latest_guest_message(history).map_or("Bonjour", |turn| turn.content.as_str());

        match self
            .client
            .complete(&Self::system_prompt(history), user_message, self.max_tokens, true)
            .await
        {
            Ok(text) => self.parse_response(&text),
            Err(e) => {
                warn!(error = %e, "LLM analysis failed, using keyword classifier");
                self.fallback.classify(history).await
            },
        }
    }

    fn name(&self) -> &'static str {
        "llm"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenAiConfig;
    use crate::models::Direction;

    fn classifier(base_url: &str) -> LlmClassifier {
        let client = OpenAiClient::from_config(&OpenAiConfig {
            api_key: Some("sk-test".to_string()),
            base_url: base_url.to_string(),
            model: "gpt-4o".to_string(),
            temperature: 0.7,
            max_tokens: 200,
            timeout_secs: 5,
        })
        .unwrap()
        .unwrap();
        LlmClassifier::new(client).unwrap()
    }

    #[test]
    fn test_parse_plain_json() {
        let result = classifier("http://localhost").parse_response(
            r#"{"needsAttention":true,"conversationTag":"Urgence critique","confidence":0.95,"explanation":"Fuite","recommendedAction":"Appeler un plombier"}"#,
        );
        assert_eq!(result.tag, ConversationTag::CriticalEmergency);
        assert_eq!(result.source, AnalysisSource::Llm);
        assert!((result.confidence - 0.95).abs() < f64::EPSILON);
        assert_eq!(result.recommended_action, "Appeler un plombier");
    }

    #[test]
    fn test_parse_json_wrapped_in_prose() {
        let result = classifier("http://localhost").parse_response(
            "Voici mon analyse :\n```json\n{\"conversationTag\":\"Réponse connue\",\"confidence\":0.8}\n```",
        );
        assert_eq!(result.tag, ConversationTag::KnownAnswer);
        assert!(!result.needs_attention);
    }

    #[test]
    fn test_parse_failure_is_uncertain() {
        let result = classifier("http://localhost").parse_response("Je ne sais pas");
        assert_eq!(result.tag, ConversationTag::Uncertain);
        assert_eq!(result.source, AnalysisSource::Fallback);
        assert!((result.confidence - UNPARSEABLE_CONFIDENCE).abs() < f64::EPSILON);

        let result = classifier("http://localhost").parse_response(r#"{"conversationTag":"Panique","confidence":0.9}"#);
        assert_eq!(result.tag, ConversationTag::Uncertain);

        let result = classifier("http://localhost").parse_response(r#"{"conversationTag":null}"#);
        assert_eq!(result.tag, ConversationTag::Uncertain);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let result = classifier("http://localhost").parse_response(r#"{"conversationTag":"Client mécontent","confidence":7}"#);
        assert!((result.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_classify_calls_chat_completions() {
        let mut server = mockito::Server::new_async().await;
        let body = serde_json::json!({
            "choices": [{"message": {"content": "{\"needsAttention\":true,\"conversationTag\":\"Intervention hôte requise\",\"confidence\":0.7,\"explanation\":\"Arrivée\",\"recommendedAction\":\"Envoyer le code\"}"}}]
        });
        let mock = server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::Regex("Quel est le code".to_string()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;

        let classifier = classifier(&server.url());
        let history = vec![ChatTurn { content: "Quel est le code du portail ?".into(), direction: Direction::Inbound }];
        let result = classifier.classify(&history).await;

        assert_eq!(result.tag, ConversationTag::HostInterventionRequired);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transport_failure_uses_keywords() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .create_async()
            .await;

        let classifier = classifier(&server.url());
        let history = vec![ChatTurn { content: "Il y a une fuite !".into(), direction: Direction::Inbound }];
        let result = classifier.classify(&history).await;

        assert_eq!(result.tag, ConversationTag::CriticalEmergency);
        assert_eq!(result.source, AnalysisSource::Keyword);
    }
}
