//! Tests for configuration defaults and validation

use airhost_rust::config::{AppConfig, OpenAiConfig, WhatsAppSettings};

#[test]
fn test_default_config_values() {
    let config = AppConfig::default();

    assert_eq!(config.database.url, "data/airhost.db");
    assert_eq!(config.database.max_connections, 10);
    assert_eq!(config.database.connection_timeout_secs, 30);
    assert_eq!(config.store.backend, "sqlite");
    assert_eq!(config.bind_address(), "0.0.0.0:3002");
}

#[test]
fn test_default_whatsapp_settings() {
    let config = AppConfig::default();

    assert_eq!(config.whatsapp.graph_api_base, "https://graph.facebook.com");
    assert_eq!(config.whatsapp.api_version, "v17.0");
    assert_eq!(config.whatsapp.default_welcome_template, "hello_world");
}

#[test]
fn test_default_analysis_uses_keywords() {
    let config = AppConfig::default();

    assert!(config.analysis.enabled);
    assert_eq!(config.analysis.classifier, "keyword");
    assert_eq!(config.analysis.history_limit, 10);
    assert!(config.openai.api_key.is_none());
    assert!(!config.llm_enabled());
}

#[test]
fn test_llm_enabled_needs_key() {
    let mut config = AppConfig::default();
    config.analysis.classifier = "llm".to_string();
    assert!(!config.llm_enabled());

    config.openai.api_key = Some(String::new());
    assert!(!config.llm_enabled());

    config.openai.api_key = Some("sk-test".to_string());
    assert!(config.llm_enabled());
}

#[test]
fn test_config_validation_success() {
    let config = AppConfig::default();
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_zero_max_connections() {
    let mut config = AppConfig::default();
    config.database.max_connections = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_invalid_log_level() {
    let mut config = AppConfig::default();
    config.logging.level = "invalid".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_valid_log_levels() {
    for level in ["trace", "debug", "info", "warn", "error"] {
        let mut config = AppConfig::default();
        config.logging.level = level.to_string();
        assert!(config.validate().is_ok(), "Failed for level: {level}");
    }
}

#[test]
fn test_config_validation_invalid_log_format() {
    let mut config = AppConfig::default();
    config.logging.format = "xml".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_unknown_backend() {
    let mut config = AppConfig::default();
    config.store.backend = "postgres".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_unknown_classifier() {
    let mut config = AppConfig::default();
    config.analysis.classifier = "bayes".to_string();
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_temperature_bounds() {
    let mut config = AppConfig::default();
    config.openai.temperature = 2.5;
    assert!(config.validate().is_err());

    config.openai.temperature = 0.0;
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_validation_empty_verify_token() {
    let mut config = AppConfig::default();
    config.whatsapp.verify_token = "  ".to_string();
    // Commands other than `serve` still load without a webhook token
    assert!(config.validate().is_ok());
    assert!(config.validate_for_server().is_err());

    config.whatsapp.verify_token = "d41d8cd98f00b204e980".to_string();
    assert!(config.validate_for_server().is_ok());
}

#[test]
fn test_default_verify_token_is_unset() {
    let config = AppConfig::default();
    assert!(config.whatsapp.verify_token.is_empty());
    assert!(config.validate_for_server().is_err());
}

#[test]
fn test_default_cache_retention() {
    let mut config = AppConfig::default();
    assert_eq!(config.cache.retention_hours, 72);

    config.cache.retention_hours = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_config_validation_zero_history_limit() {
    let mut config = AppConfig::default();
    config.analysis.history_limit = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_whatsapp_settings_clone() {
    let settings = WhatsAppSettings {
        verify_token: "verify".to_string(),
        graph_api_base: "http://localhost:1234".to_string(),
        api_version: "v19.0".to_string(),
        default_welcome_template: "welcome_checkin".to_string(),
        timeout_secs: 5,
    };
    let cloned = settings.clone();
    assert_eq!(settings.api_version, cloned.api_version);
}

#[test]
fn test_openai_config_debug_shows_model() {
    let config = OpenAiConfig {
        api_key: None,
        base_url: "https://api.openai.com/v1".to_string(),
        model: "gpt-4o".to_string(),
        temperature: 0.7,
        max_tokens: 200,
        timeout_secs: 30,
    };
    assert!(format!("{config:?}").contains("gpt-4o"));
}

#[test]
fn test_get_log_level_default() {
    let config = AppConfig::default();
    if std::env::var("RUST_LOG").is_err() {
        assert_eq!(config.get_log_level(), "info");
    }
}
