use async_trait::async_trait;
use unicode_normalization::UnicodeNormalization;

use super::{latest_guest_message, Classifier};
use crate::models::{AnalysisSource, ChatTurn, Classification, ConversationTag};

const CRITICAL: &[&str] = &[
    "urgent",
    "fuite",
    "inondation",
    "panne",
    "cassé",
    "plus d'eau",
    "plus de chauffage",
    "incendie",
    "urgence",
    "inondé",
    "danger",
    "secours",
];

const BEHAVIORAL: &[&str] = &[
    "inacceptable",
    "remboursement",
    "avis négatif",
    "scandaleux",
    "arnaque",
    "menace",
    "avocat",
    "pourri",
    "justice",
];

const COMPLAINT: &[&str] = &[
    "déçu",
    "mécontent",
    "sale",
    "pas propre",
    "problème",
    "pas satisfait",
    "mauvais",
    "décevant",
    "nul",
    "horrible",
];

const POSITIVE: &[&str] = &["merci", "parfait", "excellent", "satisfait", "bien", "super", "impeccable", "génial"];

/// Confidence when no list matches
pub const FALLBACK_CONFIDENCE: f64 = 0.6;

struct Rule {
    keywords: &'static [&'static str],
    tag: ConversationTag,
    confidence: f64,
    explanation: &'static str,
    recommended_action: &'static str,
}

/// Checked in order; the first list with a hit wins.
const RULES: [Rule; 4] = [
    Rule {
        keywords: CRITICAL,
        tag: ConversationTag::CriticalEmergency,
        confidence: 0.9,
        explanation: "Mots-clés d'urgence détectés",
        recommended_action: "Intervention immédiate de l'hôte requise",
    },
    Rule {
        keywords: BEHAVIORAL,
        tag: ConversationTag::BehavioralEscalation,
        confidence: 0.85,
        explanation: "Ton agressif ou menaçant détecté",
        recommended_action: "Contacter l'hôte pour gérer la situation",
    },
    Rule {
        keywords: COMPLAINT,
        tag: ConversationTag::DissatisfiedGuest,
        confidence: 0.8,
        explanation: "Signes d'insatisfaction détectés",
        recommended_action: "Répondre avec empathie et proposer une solution",
    },
    Rule {
        keywords: POSITIVE,
        tag: ConversationTag::KnownAnswer,
        confidence: 0.9,
        explanation: "Message positif, aucune difficulté signalée",
        recommended_action: "Continuer la conversation normalement",
    },
];

/// Rule-based tagger over fixed French keyword lists.
///
/// Plain substring matching on the NFC-normalized, lower-cased message: no weighting,
/// no negation handling, no stemming.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordClassifier;

impl KeywordClassifier {
    pub const fn new() -> Self {
        Self
    }

    /// Classify a single message
    #[must_use]
    pub fn classify_text(&self, text: &str) -> Classification {
        let normalized = normalize(text);

        for rule in &RULES {
            let matched: Vec<String> = rule
                .keywords
                .iter()
                .filter(|keyword| normalized.contains(*keyword))
                .map(|keyword| (*keyword).to_string())
                .collect();

            if !matched.is_empty() {
                let mut classification = Classification::new(
                    rule.tag,
                    rule.confidence,
                    format!("{} : {}", rule.explanation, matched.join(", ")),
                    rule.recommended_action,
                    AnalysisSource::Keyword,
                );
                classification.matched_keywords = matched;
                return classification;
            }
        }

        Self::uncertain()
    }

    /// Result used when nothing matches
    #[must_use]
    pub fn uncertain() -> Classification {
        Classification::new(
            ConversationTag::Uncertain,
            FALLBACK_CONFIDENCE,
            "Aucun mot-clé reconnu, analyse incertaine",
            "Vérifier le message et répondre manuellement",
            AnalysisSource::Keyword,
        )
    }
}

fn normalize(text: &str) -> String {
    text.nfc().collect::<String>().to_lowercase().replace(['\u{2019}', '\u{2018}'], "'")
}

#[async_trait]
impl Classifier for KeywordClassifier {
    async fn classify(&self, history: &[ChatTurn]) -> Classification {
        latest_guest_message(history).map_or_else(Self::uncertain, |turn| self.classify_text(&turn.content))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Direction, Priority};

    #[test]
    fn test_water_leak_is_critical() {
        let result = KeywordClassifier::new().classify_text("Il y a une fuite d'eau dans la salle de bain");
        assert_eq!(result.tag, ConversationTag::CriticalEmergency);
        assert!((result.confidence - 0.9).abs() < f64::EPSILON);
        assert!(result.needs_attention);
        assert_eq!(result.priority, Priority::Urgent);
        assert_eq!(result.matched_keywords, vec!["fuite".to_string()]);
    }

    #[test]
    fn test_thanks_is_known_answer() {
        let result = KeywordClassifier::new().classify_text("merci, parfait");
        assert_eq!(result.tag, ConversationTag::KnownAnswer);
        assert!(!result.needs_attention);
    }

    #[test]
    fn test_unmatched_is_uncertain() {
        let result = KeywordClassifier::new().classify_text("Quel est le code du portail ?");
        assert_eq!(result.tag, ConversationTag::Uncertain);
        assert!((result.confidence - FALLBACK_CONFIDENCE).abs() < f64::EPSILON);
        assert!(result.needs_attention);
    }

    #[test]
    fn test_priority_order_critical_beats_positive() {
        let result = KeywordClassifier::new().classify_text("Merci mais c'est URGENT, plus de chauffage");
        assert_eq!(result.tag, ConversationTag::CriticalEmergency);
        assert!(result.matched_keywords.contains(&"plus de chauffage".to_string()));
    }

    #[test]
    fn test_behavioral_beats_complaint() {
        let result = KeywordClassifier::new().classify_text("Logement sale, je veux un remboursement");
        assert_eq!(result.tag, ConversationTag::BehavioralEscalation);
        assert!((result.confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_decomposed_accents_and_curly_apostrophe() {
        // "déçu" with combining accents
        let result = KeywordClassifier::new().classify_text("Tre\u{300}s de\u{301}c\u{327}u");
        assert_eq!(result.tag, ConversationTag::DissatisfiedGuest);

        let result = KeywordClassifier::new().classify_text("Il n\u{2019}y a plus d\u{2019}eau");
        assert_eq!(result.tag, ConversationTag::CriticalEmergency);
    }

    #[tokio::test]
    async fn test_classify_uses_latest_inbound_turn() {
        let history = vec![
            ChatTurn { content: "Merci beaucoup".into(), direction: Direction::Inbound },
            ChatTurn { content: "Avec plaisir".into(), direction: Direction::Outbound },
            ChatTurn { content: "La chambre est sale".into(), direction: Direction::Inbound },
        ];
        let result = KeywordClassifier::new().classify(&history).await;
        assert_eq!(result.tag, ConversationTag::DissatisfiedGuest);
        assert_eq!(KeywordClassifier::new().classify(&[]).await.tag, ConversationTag::Uncertain);
    }
}
