use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use airhost_rust::classifier::{self, Classifier};
use airhost_rust::config::AppConfig;
use airhost_rust::db::Database;
use airhost_rust::file_writer::write_transcript;
use airhost_rust::import::parse_rows;
use airhost_rust::logging::{init_logging, OperationTimer};
use airhost_rust::metrics;
use airhost_rust::models::{ChatTurn, CreateConversationRequest, Direction, NewTemplateConfig, NewWhatsAppConfig, OutputFormat};
use airhost_rust::repository::{open_store, ConversationStore};
use airhost_rust::server::{serve, AppState};
use airhost_rust::validation::InputValidator;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server (webhook, conversations, analysis)
    Serve {
        /// Port to listen on, overriding configuration
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Apply pending SQLite schema migrations
    Migrate,
    /// Tag a guest message with the configured classifier
    Classify {
        /// Message text
        text: String,
    },
    /// Create a conversation from booking data
    CreateConversation {
        /// Property the guest booked
        #[arg(long)]
        property_id: String,

        /// Guest name
        #[arg(short, long)]
        name: String,

        /// Guest phone number
        #[arg(long)]
        phone: String,

        /// Guest email
        #[arg(short, long)]
        email: Option<String>,

        /// Check-in date (YYYY-MM-DD)
        #[arg(long)]
        check_in: NaiveDate,

        /// Check-out date (YYYY-MM-DD)
        #[arg(long)]
        check_out: NaiveDate,

        /// Welcome template, overriding the host's configuration
        #[arg(short, long)]
        template: Option<String>,
    },
    /// Register a host
    AddHost {
        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        email: Option<String>,
    },
    /// Register a property for a host
    AddProperty {
        #[arg(long)]
        host_id: String,

        #[arg(short, long)]
        name: String,

        #[arg(short, long)]
        address: Option<String>,

        /// Free-text instructions for reply drafting
        #[arg(short, long)]
        instructions: Option<String>,
    },
    /// Store WhatsApp Cloud API credentials for a host
    SetWhatsappConfig {
        #[arg(long)]
        host_id: Option<String>,

        #[arg(long)]
        phone_number_id: String,

        #[arg(long, env = "AIRHOST_WHATSAPP_ACCESS_TOKEN", hide_env_values = true)]
        access_token: String,

        #[arg(long)]
        business_account_id: Option<String>,

        #[arg(long)]
        verify_token: Option<String>,

        /// Store the credentials as inactive
        #[arg(long)]
        inactive: bool,
    },
    /// Configure automatic welcome templates for a host
    SetTemplateConfig {
        #[arg(long)]
        host_id: String,

        /// Send a welcome template to new conversations
        #[arg(long, action = ArgAction::Set)]
        enabled: bool,

        #[arg(short, long)]
        template: Option<String>,

        #[arg(short, long)]
        language: Option<String>,
    },
    /// Import WhatsApp settings exported from older deployments
    ImportConfig {
        /// JSON file with one row or an array of rows
        file: PathBuf,

        /// Show what would be imported without writing
        #[arg(long)]
        dry_run: bool,
    },
    /// Report conversations and settings that break ownership rules
    Diagnose,
    /// Link conversations without a property to their host's default property
    Reconcile,
    /// Export a conversation transcript
    Export {
        /// Conversation id
        #[arg(short, long)]
        conversation: String,

        /// Output format (txt, csv or json)
        #[arg(short, long, default_value = "txt")]
        format: String,

        /// Number of messages per file
        #[arg(short, long)]
        lines: Option<usize>,

        /// Output directory
        #[arg(short, long, default_value = "./output")]
        output_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = AppConfig::load()?;

    // Initialize logging
    let _guard = init_logging(
        Some(&config.get_log_level()),
        config.logging.file_path.as_deref().map(Path::new),
        config.logging.format == "json",
    )?;
    metrics::describe();

    match cli.command {
        Commands::Serve { port } => run_server(config, port).await?,
        Commands::Migrate => migrate(&config)?,
        Commands::Classify { text } => classify(&config, text).await?,
        Commands::CreateConversation {
            property_id,
            name,
            phone,
            email,
            check_in,
            check_out,
            template,
        } => {
            let request = CreateConversationRequest {
                host_id: None,
                guest_name: name,
                guest_phone: phone,
                guest_email: email,
                property_id,
                check_in_date: Some(check_in),
                check_out_date: Some(check_out),
                welcome_template_name: template,
            };
            create_conversation(&config, &request).await?;
        },
        Commands::AddHost { name, email } => {
            InputValidator::validate_name(&name)?;
            if let Some(email) = email.as_deref() {
                InputValidator::validate_email(email)?;
            }
            let host = open_store(&config)?.insert_host(&name, email.as_deref()).await?;
            print_json(&host)?;
        },
        Commands::AddProperty {
            host_id,
            name,
            address,
            instructions,
        } => {
            InputValidator::validate_name(&name)?;
            let property = open_store(&config)?
                .insert_property(&host_id, &name, address.as_deref(), instructions.as_deref())
                .await?;
            print_json(&property)?;
        },
        Commands::SetWhatsappConfig {
            host_id,
            phone_number_id,
            access_token,
            business_account_id,
            verify_token,
            inactive,
        } => {
            let new_config = NewWhatsAppConfig {
                host_id,
                phone_number_id,
                access_token,
                business_account_id,
                webhook_verify_token: verify_token,
                is_active: !inactive,
            };
            let saved = open_store(&config)?.upsert_whatsapp_config(&new_config).await?;
            if !saved.has_plausible_credentials() {
                warn!("Stored credentials look like placeholders; welcome templates will fail");
            }
            println!("{saved:?}");
        },
        Commands::SetTemplateConfig {
            host_id,
            enabled,
            template,
            language,
        } => {
            if let Some(template) = template.as_deref() {
                InputValidator::validate_template_name(template)?;
            }
            let saved = open_store(&config)?
                .upsert_template_config(&NewTemplateConfig {
                    host_id,
                    auto_templates_enabled: enabled,
                    welcome_template_name: template,
                    welcome_template_language: language,
                })
                .await?;
            print_json(&saved)?;
        },
        Commands::ImportConfig { file, dry_run } => import_config(&config, &file, dry_run).await?,
        Commands::Diagnose => {
            let report = open_store(&config)?.integrity_report().await?;
            if report.is_clean() {
                info!("No ownership violations found");
            } else {
                warn!(?report, "Ownership violations found; run `reconcile` to repair conversations");
            }
            print_json(&report)?;
        },
        Commands::Reconcile => {
            let repaired = open_store(&config)?.reconcile_conversations().await?;
            info!(repaired, "Reconciled conversations");
            println!("{repaired} conversation(s) repaired");
        },
        Commands::Export {
            conversation,
            format,
            lines,
            output_dir,
        } => export_conversation(&config, &conversation, &format, lines, &output_dir).await?,
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_server(mut config: AppConfig, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate_for_server()?;

    let state = AppState::from_config(&config).context("Failed to initialize services")?;
    info!(
        store = %config.store.backend,
        classifier = state.service.classifier_name(),
        "Starting airhost server"
    );
    serve(&config.bind_address(), Arc::new(state)).await
}

fn migrate(config: &AppConfig) -> Result<()> {
    let timer = OperationTimer::new("migrate");
    let db = Database::with_pool_settings(
        &config.database.url,
        config.database.max_connections,
        config.database.connection_timeout_secs,
    )
    .context("Failed to open database")?;
    let applied = db.applied_migrations()?;
    timer.finish();
    println!("Schema at version {}", applied.last().copied().unwrap_or_default());
    Ok(())
}

async fn classify(config: &AppConfig, text: String) -> Result<()> {
    let classifier = classifier::from_config(config)?;
    let history = [ChatTurn {
        content: text,
        direction: Direction::Inbound,
    }];
    let classification = classifier.classify(&history).await;
    print_json(&classification)
}

async fn create_conversation(config: &AppConfig, request: &CreateConversationRequest) -> Result<()> {
    let state = AppState::from_config(config).context("Failed to initialize services")?;
    let outcome = state.service.create_conversation(request).await?;
    if outcome.is_new {
        info!(conversation_id = %outcome.conversation.id, "Conversation created");
    } else {
        info!(conversation_id = %outcome.conversation.id, "Conversation already existed");
    }
    print_json(&outcome)
}

async fn import_config(config: &AppConfig, file: &Path, dry_run: bool) -> Result<()> {
    let json = std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let rows = parse_rows(&json).context("Failed to parse settings export")?;
    info!(rows = rows.len(), "Importing WhatsApp settings");

    let store = if dry_run { None } else { Some(open_store(config)?) };
    let mut credentials = 0;
    let mut templates = 0;

    for (i, row) in rows.into_iter().enumerate() {
        let imported = match row.normalize() {
            Ok(imported) => imported,
            Err(e) => {
                warn!(row = i, error = %e, "Skipping unreadable row");
                continue;
            },
        };

        if imported.whatsapp.is_none() && imported.template.is_none() {
            warn!(row = i, "Row has neither credentials nor template settings");
            continue;
        }

        if let Some(whatsapp) = imported.whatsapp {
            credentials += 1;
            match &store {
                Some(store) => {
                    store.upsert_whatsapp_config(&whatsapp).await?;
                },
                None => println!("row {i}: credentials {whatsapp:?}"),
            }
        }
        if let Some(template) = imported.template {
            templates += 1;
            match &store {
                Some(store) => {
                    store.upsert_template_config(&template).await?;
                },
                None => println!("row {i}: template settings {template:?}"),
            }
        }
    }

    info!(credentials, templates, dry_run, "Import finished");
    Ok(())
}

async fn export_conversation(
    config: &AppConfig,
    conversation_id: &str,
    format: &str,
    lines: Option<usize>,
    output_dir: &Path,
) -> Result<()> {
    let output_format: OutputFormat = format.parse()?;
    let store = open_store(config)?;

    let conversation = store
        .get_conversation(conversation_id)
        .await?
        .with_context(|| format!("Conversation not found: {conversation_id}"))?;
    let messages = store.list_messages(conversation_id, None).await?;
    if messages.is_empty() {
        warn!(conversation_id, "Conversation has no messages");
        return Ok(());
    }

    let timestamp = Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let files = write_transcript(&conversation, &messages, output_format, output_dir, &timestamp, lines)?;
    for file in &files {
        info!(path = %file.display(), "Wrote transcript");
    }
    println!("Exported {} message(s) to {} file(s)", messages.len(), files.len());
    Ok(())
}
