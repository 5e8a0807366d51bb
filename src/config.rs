use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

/// Application configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub supabase: SupabaseConfig,
    pub whatsapp: WhatsAppSettings,
    pub openai: OpenAiConfig,
    pub analysis: AnalysisConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file_path: Option<String>,
    pub format: String, // "json" or "text"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Which `ConversationStore` backend to use
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub backend: String, // "sqlite" or "supabase"
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupabaseConfig {
    pub url: Option<String>,
    pub service_role_key: Option<String>,
    pub timeout_secs: u64,
}

/// Process-wide WhatsApp settings. Per-host credentials live in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhatsAppSettings {
    pub verify_token: String,
    pub graph_api_base: String,
    pub api_version: String,
    pub default_welcome_template: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: Option<String>,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    pub enabled: bool,
    pub classifier: String, // "keyword" or "llm"
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: String,
    /// Delivery records older than this are pruned
    pub retention_hours: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig {
                url: "data/airhost.db".to_string(),
                max_connections: 10,
                connection_timeout_secs: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file_path: None,
                format: "text".to_string(),
            },
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3002,
            },
            store: StoreConfig {
                backend: "sqlite".to_string(),
            },
            supabase: SupabaseConfig {
                url: None,
                service_role_key: None,
                timeout_secs: 15,
            },
            whatsapp: WhatsAppSettings {
                verify_token: String::new(),
                graph_api_base: "https://graph.facebook.com".to_string(),
                api_version: "v17.0".to_string(),
                default_welcome_template: "hello_world".to_string(),
                timeout_secs: 15,
            },
            openai: OpenAiConfig {
                api_key: None,
                base_url: "https://api.openai.com/v1".to_string(),
                model: "gpt-4o".to_string(),
                temperature: 0.7,
                max_tokens: 200,
                timeout_secs: 30,
            },
            analysis: AnalysisConfig {
                enabled: true,
                classifier: "keyword".to_string(),
                history_limit: 10,
            },
            cache: CacheConfig {
                path: ".airhost_cache".to_string(),
                retention_hours: 72,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources with precedence
    pub fn load() -> Result<Self> {
        let defaults = Config::try_from(&AppConfig::default())
            .map_err(|e| anyhow::anyhow!("Failed to build default configuration: {}", e))?;

        let config = Config::builder()
            // Start with default values
            .add_source(defaults)
            // Add config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(File::with_name("airhost").required(false))
            // AIRHOST__WHATSAPP__VERIFY_TOKEN, AIRHOST__OPENAI__API_KEY, ...
            .add_source(Environment::with_prefix("AIRHOST").separator("__"))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        let app_config: AppConfig = config
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("Failed to deserialize configuration: {}", e))?;

        // Validate configuration
        app_config.validate()?;

        Ok(app_config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        // Validate database config
        if self.database.max_connections == 0 {
            return Err(anyhow::anyhow!("max_connections must be greater than 0"));
        }
        if self.database.connection_timeout_secs == 0 {
            return Err(anyhow::anyhow!("connection_timeout_secs must be greater than 0"));
        }

        // Validate logging config
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level: {}. Must be one of: {:?}",
                self.logging.level,
                valid_levels
            ));
        }

        let valid_formats = ["text", "json"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format: {}. Must be one of: {:?}",
                self.logging.format,
                valid_formats
            ));
        }

        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server.port must be greater than 0"));
        }

        // Validate store selection
        match self.store.backend.as_str() {
            "sqlite" => {},
            "supabase" => {
                if self.supabase.url.as_deref().map_or(true, str::is_empty) {
                    return Err(anyhow::anyhow!("supabase.url is required when store.backend = supabase"));
                }
                if self.supabase.service_role_key.as_deref().map_or(true, str::is_empty) {
                    return Err(anyhow::anyhow!(
                        "supabase.service_role_key is required when store.backend = supabase"
                    ));
                }
            },
            other => {
                return Err(anyhow::anyhow!(
                    "Invalid store backend: {}. Must be one of: [\"sqlite\", \"supabase\"]",
                    other
                ));
            },
        }

        // Validate WhatsApp settings
        if self.whatsapp.default_welcome_template.trim().is_empty() {
            return Err(anyhow::anyhow!("whatsapp.default_welcome_template cannot be empty"));
        }

        // Validate OpenAI settings
        if !(0.0..=2.0).contains(&self.openai.temperature) {
            return Err(anyhow::anyhow!("openai.temperature must be between 0 and 2"));
        }
        if self.openai.max_tokens == 0 {
            return Err(anyhow::anyhow!("openai.max_tokens must be greater than 0"));
        }

        // Validate analysis config
        let valid_classifiers = ["keyword", "llm"];
        if !valid_classifiers.contains(&self.analysis.classifier.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid classifier: {}. Must be one of: {:?}",
                self.analysis.classifier,
                valid_classifiers
            ));
        }
        if self.analysis.history_limit == 0 {
            return Err(anyhow::anyhow!("analysis.history_limit must be greater than 0"));
        }

        if self.cache.retention_hours == 0 {
            return Err(anyhow::anyhow!("cache.retention_hours must be greater than 0"));
        }

        Ok(())
    }

    /// [`AppConfig::validate`] plus the settings only the HTTP server needs
    pub fn validate_for_server(&self) -> Result<()> {
        self.validate()?;
        if self.whatsapp.verify_token.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "whatsapp.verify_token is required to serve the webhook (set AIRHOST__WHATSAPP__VERIFY_TOKEN)"
            ));
        }
        Ok(())
    }

    /// Get log level from environment or config
    pub fn get_log_level(&self) -> String {
        std::env::var("RUST_LOG").unwrap_or_else(|_| self.logging.level.clone())
    }

    /// Socket address the HTTP server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Whether the LLM classifier can actually be used
    pub fn llm_enabled(&self) -> bool {
        self.analysis.classifier == "llm" && self.openai.api_key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.database.url, "data/airhost.db");
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.server.port, 3002);
        assert_eq!(config.openai.model, "gpt-4o");
    }

    #[test]
    fn test_config_validation() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_server_requires_verify_token() {
        let mut config = AppConfig::default();
        assert!(config.whatsapp.verify_token.is_empty());
        assert!(config.validate_for_server().is_err());

        config.whatsapp.verify_token = "a-long-random-token".to_string();
        assert!(config.validate_for_server().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let mut config = AppConfig::default();
        config.database.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_supabase_requires_credentials() {
        let mut config = AppConfig::default();
        config.store.backend = "supabase".to_string();
        assert!(config.validate().is_err());

        config.supabase.url = Some("https://project.supabase.co".to_string());
        config.supabase.service_role_key = Some("service-key".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_llm_enabled_needs_key() {
        let mut config = AppConfig::default();
        config.analysis.classifier = "llm".to_string();
        assert!(!config.llm_enabled());
        config.openai.api_key = Some("sk-test".to_string());
        assert!(config.llm_enabled());
    }
}
