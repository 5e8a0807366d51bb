//! Welcome template catalogue and local rendering (used by test-mode sends).

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateInfo {
    pub name: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
}

pub const CATALOGUE: [TemplateInfo; 6] = [
    TemplateInfo {
        name: "hello_world",
        display_name: "Hello World (Meta)",
        description: "Modèle de démonstration fourni par Meta, en anglais",
    },
    TemplateInfo {
        name: "welcome_checkin",
        display_name: "Bienvenue et instructions d'arrivée",
        description: "Message de bienvenue avec informations d'arrivée",
    },
    TemplateInfo {
        name: "welcome_booking_confirmation",
        display_name: "Confirmation de réservation",
        description: "Confirmation de réservation avec détails",
    },
    TemplateInfo {
        name: "welcome_property_info",
        display_name: "Informations sur la propriété",
        description: "Informations détaillées sur la propriété",
    },
    TemplateInfo {
        name: "welcome_contact_host",
        display_name: "Contact hôte disponible",
        description: "Informations de contact de l'hôte",
    },
    TemplateInfo {
        name: "welcome_custom",
        display_name: "Message personnalisé",
        description: "Template personnalisable",
    },
];

#[must_use]
pub fn find(name: &str) -> Option<&'static TemplateInfo> {
    CATALOGUE.iter().find(|t| t.name == name)
}

/// Values substituted into a rendered template
#[derive(Debug, Clone, Default)]
pub struct TemplateVariables<'a> {
    pub guest_name: &'a str,
    pub property_name: Option<&'a str>,
    pub property_address: Option<&'a str>,
}

/// Render the French text of a template. Unknown names render as `welcome_custom`.
#[must_use]
pub fn render(template_name: &str, vars: &TemplateVariables<'_>) -> String {
    let guest = vars.guest_name;
    let property = vars.property_name.unwrap_or("notre propriété");

    match template_name {
        "hello_world" => "Hello World".to_string(),
        "welcome_checkin" => format!(
            "Bonjour {guest} !\n\nBienvenue dans {property} ! Votre réservation est confirmée.\n\n\
             Instructions d'arrivée :\n- Check-in possible dès 15h00\n\
             - Vous recevrez les codes d'accès 2h avant votre arrivée\n\n\
             En cas de question, n'hésitez pas à me contacter.\n\nExcellent séjour !"
        ),
        "welcome_booking_confirmation" => format!(
            "Bonjour {guest} !\n\nVotre réservation pour {property} est confirmée !\n\n\
             Adresse : {}\n\nCheck-in : 15h00 - Check-out : 11h00\n\
             Vous recevrez les détails d'arrivée 24h avant.\n\nÀ bientôt !",
            vars.property_address
                .filter(|a| !a.trim().is_empty())
                .unwrap_or("Coordonnées envoyées séparément")
        ),
        "welcome_property_info" => format!(
            "Bonjour {guest} !\n\nBienvenue dans {property} !\n\n\
             Informations importantes :\n- WiFi gratuit (codes dans le logement)\n\
             - Guide des recommandations locales disponible\n\
             - Règlement intérieur affiché dans le logement\n\nProfitez bien de votre séjour !"
        ),
        "welcome_contact_host" => format!(
            "Bonjour {guest} !\n\nJe suis votre hôte pour {property}.\n\n\
             Contact direct : ce numéro WhatsApp, 7j/7 de 8h à 22h.\n\
             Urgences : contact immédiat possible.\n\nN'hésitez pas à me poser toutes vos questions."
        ),
        _ => format!(
            "Bonjour {guest} !\n\nBienvenue dans {property} !\n\n\
             Votre hôte est disponible pour toute question.\n\nExcellent séjour !"
        ),
    }
}
