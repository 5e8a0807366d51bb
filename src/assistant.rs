//! Draft replies to guests.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::classifier::latest_guest_message;
use crate::models::ChatTurn;
use crate::openai::OpenAiClient;

pub const RESPONSE_MAX_TOKENS: u32 = 500;

const SYSTEM_PROMPT: &str = "Tu es un assistant virtuel pour un logement Airbnb. Analyse d'abord le message \
de l'invité pour comprendre son besoin, puis réponds de manière appropriée et personnalisée.";

const RULES: &str = "RÈGLES DE RÉPONSE :
- Réponds uniquement en français
- Pour les urgences : reconnais immédiatement le problème, exprime de l'empathie, propose des actions concrètes
- Pour les problèmes techniques : propose des solutions immédiates si possible, sinon assure que l'hôte sera contacté
- Sois professionnel mais empathique
- Évite les réponses génériques";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftReply {
    pub response: String,
    pub confidence: f64,
}

impl DraftReply {
    fn new(response: &str, confidence: f64) -> Self {
        Self { response: response.to_string(), confidence }
    }
}

/// (keywords, reply, confidence), first match wins
const CANNED: &[(&[&str], &str, f64)] = &[
    (
        &["wifi", "internet"],
        "Le code WiFi est affiché dans le logement, généralement près de la box internet ou sur le frigo. \
         Si vous ne le trouvez pas, n'hésitez pas à me le signaler.",
        0.9,
    ),
    (
        &["check-in", "arrivée", "clés", "clefs"],
        "Pour votre arrivée, vous recevrez les instructions détaillées 24h avant. Les clés se trouvent dans \
         la boîte sécurisée dont vous recevrez le code.",
        0.9,
    ),
    (
        &["parking", "stationnement", "garer"],
        "Les informations de stationnement sont dans le guide du logement. Un parking public se trouve à \
         proximité si nécessaire.",
        0.8,
    ),
    (
        &["restaurant", "manger"],
        "Vous trouverez nos restaurants préférés du quartier dans le guide du logement.",
        0.8,
    ),
    (
        &["transport", "métro", "bus", "gare"],
        "Le logement est bien desservi par les transports. La station la plus proche est indiquée dans le \
         guide avec les principales lignes.",
        0.8,
    ),
    (
        &["bonjour", "salut", "hello", "bonsoir"],
        "Bonjour ! Bienvenue dans notre logement. Comment puis-je vous aider ?",
        0.8,
    ),
    (
        &["merci"],
        "Je vous en prie ! N'hésitez pas si vous avez d'autres questions.",
        0.8,
    ),
    (
        &["?", "comment", "où", "quand", "pourquoi"],
        "Je comprends votre question. Pour vous donner une réponse précise, je vais transmettre votre \
         demande à votre hôte qui vous répondra rapidement.",
        0.6,
    ),
];

const DEFAULT_REPLY: &str = "Merci pour votre message. Votre hôte vous répondra dans les plus brefs délais.";

/// Drafts French replies with the chat model, or canned ones without it
#[derive(Debug, Clone, Default)]
pub struct ReplyAssistant {
    client: Option<OpenAiClient>,
}

impl ReplyAssistant {
    pub const fn new(client: Option<OpenAiClient>) -> Self {
        Self { client }
    }

    pub async fn draft_reply(&self, history: &[ChatTurn], instructions: Option<&str>) -> DraftReply {
        let Some(last) = latest_guest_message(history) else {
            return DraftReply::new("Bonjour ! Comment puis-je vous aider ?", 1.0);
        };

        let Some(client) = &self.client else {
            return canned_reply(&last.content);
        };

        let system_prompt = format!(
            "{SYSTEM_PROMPT}\n\nInstructions spécifiques pour ce logement :\n{}\n\n{RULES}\n\nConversation actuelle :\n{}\n\n\
             IMPORTANT : Lis attentivement le dernier message de l'invité et réponds de manière spécifique à sa situation :",
            instructions.unwrap_or_default(),
            crate::classifier::transcript(history),
        );

        match client.complete(&system_prompt, &last.content, RESPONSE_MAX_TOKENS, false).await {
            Ok(text) if !text.trim().is_empty() => DraftReply { response: text.trim().to_string(), confidence: 0.9 },
            Ok(_) => DraftReply::new("Désolé, je ne peux pas répondre pour le moment.", 0.9),
            Err(e) => {
                warn!(error = %e, "Reply drafting failed, using canned reply");
                canned_reply(&last.content)
            },
        }
    }
}

/// Keyword-picked reply used without a model
#[must_use]
pub fn canned_reply(message: &str) -> DraftReply {
    let lowered = message.to_lowercase();
    CANNED
        .iter()
        .find(|(keywords, _, _)| keywords.iter().any(|k| lowered.contains(k)))
        .map_or_else(
            || DraftReply::new(DEFAULT_REPLY, 0.5),
            |(_, reply, confidence)| DraftReply::new(reply, *confidence),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;

    #[test]
    fn test_canned_topics() {
        assert!(canned_reply("Quel est le mot de passe du WiFi ?").response.contains("WiFi"));
        assert!(canned_reply("Où puis-je me garer ?").response.contains("stationnement"));
        assert!((canned_reply("Bonsoir").confidence - 0.8).abs() < f64::EPSILON);
        assert!((canned_reply("Quand ?").confidence - 0.6).abs() < f64::EPSILON);
        assert_eq!(canned_reply("ok").response, DEFAULT_REPLY);
    }

    #[tokio::test]
    async fn test_empty_history_greets() {
        let reply = ReplyAssistant::default().draft_reply(&[], None).await;
        assert!((reply.confidence - 1.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_without_model_uses_canned_reply() {
        let history = vec![ChatTurn { content: "Merci pour tout".into(), direction: Direction::Inbound }];
        let reply = ReplyAssistant::default().draft_reply(&history, Some("Pas d'animaux")).await;
        assert!(reply.response.starts_with("Je vous en prie"));
    }
}
