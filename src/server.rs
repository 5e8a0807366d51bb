//! HTTP surface: WhatsApp webhook, conversation creation, analysis and admin reads.

use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use axum::extract::{FromRequest, Query, Request, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::assistant::{DraftReply, ReplyAssistant};
use crate::cache::DeliveryCache;
use crate::classifier;
use crate::config::AppConfig;
use crate::error::{AirhostError, Result};
use crate::models::{ChatTurn, Classification, Conversation, ConversationOutcome, ConversationTag, CreateConversationRequest};
use crate::openai::OpenAiClient;
use crate::repository::{open_store, ConversationStore};
use crate::service::{ConversationService, SendTemplateRequest, SendTemplateResponse, ServiceSettings, WebhookReport};
use crate::whatsapp::templates::{TemplateInfo, CATALOGUE};
use crate::whatsapp::{TemplateSender, WebhookVerifyQuery, WhatsAppClient, WhatsAppWebhook};

/// How often `serve` prunes the delivery cache
const PRUNE_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct AppState {
    pub service: ConversationService,
    pub assistant: ReplyAssistant,
    pub verify_token: String,
    deliveries: DeliveryCache,
    delivery_retention: chrono::Duration,
}

impl AppState {
    /// Wire the configured store, classifier, WhatsApp client and delivery cache
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        let store = open_store(config)?;
        let sender: Arc<dyn TemplateSender> = Arc::new(WhatsAppClient::from_settings(&config.whatsapp)?);
        Self::with_parts(config, store, sender)
    }

    /// Like [`AppState::from_config`] with an explicit store and sender
    pub fn with_parts(
        config: &AppConfig,
        store: Arc<dyn ConversationStore>,
        sender: Arc<dyn TemplateSender>,
    ) -> Result<Self> {
        let classifier = classifier::from_config(config)?;
        let deliveries = DeliveryCache::open(&config.cache.path)?;
        let assistant = ReplyAssistant::new(OpenAiClient::from_config(&config.openai)?);

        let state = Self {
            service: ConversationService::new(
                store,
                sender,
                classifier,
                Arc::new(deliveries.clone()),
                ServiceSettings::from_config(config),
            ),
            assistant,
            verify_token: config.whatsapp.verify_token.clone(),
            deliveries,
            delivery_retention: chrono::Duration::hours(i64::from(config.cache.retention_hours)),
        };
        state.prune_deliveries();
        Ok(state)
    }

    /// Drop delivery records older than `cache.retention_hours`. Returns how many went.
    pub fn prune_deliveries(&self) -> usize {
        match self.deliveries.prune_older_than(self.delivery_retention) {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "Pruned delivery cache");
                }
                removed
            },
            Err(e) => {
                error!(error = %e, "Failed to prune delivery cache");
                0
            },
        }
    }
}

/// JSON body extractor whose rejections use the `{"error": ...}` shape
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<T, S> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = axum::extract::rejection::JsonRejection>,
    S: Send + Sync,
{
    type Rejection = AirhostError;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state).await?;
        Ok(Self(value))
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhook/whatsapp", get(verify_webhook).post(handle_webhook))
        .route("/conversations", get(list_conversations).post(create_conversation))
        .route("/analyze", post(analyze))
        .route("/draft-response", post(draft_response))
        .route("/emergency-tags", get(emergency_tags))
        .route("/templates", get(list_templates))
        .route("/send-template", post(send_template))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(address: &str, state: Arc<AppState>) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    info!(address, "HTTP server listening");

    let pruning = Arc::clone(&state);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
        // The first tick fires at once and startup already pruned
        ticker.tick().await;
        loop {
            ticker.tick().await;
            pruning.prune_deliveries();
        }
    });

    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "classifier": state.service.classifier_name(),
    }))
}

async fn verify_webhook(
    State(state): State<Arc<AppState>>,
    Query(params): Query<WebhookVerifyQuery>,
) -> impl IntoResponse {
    let mode = params.mode.unwrap_or_default();
    let token = params.verify_token.unwrap_or_default();

    if mode != "subscribe" {
        warn!(mode, "Invalid webhook mode");
        return (StatusCode::FORBIDDEN, "Invalid mode".to_string());
    }

    if !state.verify_token.is_empty() && token == state.verify_token {
        info!("Webhook verification successful");
        (StatusCode::OK, params.challenge.unwrap_or_default())
    } else {
        warn!("Invalid verify token");
        (StatusCode::FORBIDDEN, "Invalid verify token".to_string())
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    ApiJson(payload): ApiJson<WhatsAppWebhook>,
) -> Result<Json<WebhookReport>> {
    let report = state.service.handle_webhook(&payload).await?;
    Ok(Json(report))
}

async fn create_conversation(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<CreateConversationRequest>,
) -> Result<(StatusCode, Json<ConversationOutcome>)> {
    let outcome = state.service.create_conversation(&request).await?;
    let status = if outcome.is_new { StatusCode::CREATED } else { StatusCode::OK };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Default, Deserialize)]
struct ConversationFilter {
    host_id: Option<String>,
    #[serde(default)]
    needs_attention: bool,
}

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<ConversationFilter>,
) -> Result<Json<Vec<Conversation>>> {
    let conversations = state
        .service
        .store()
        .list_conversations(filter.host_id.as_deref(), filter.needs_attention)
        .await?;
    Ok(Json(conversations))
}

#[derive(Debug, Deserialize)]
struct TranscriptRequest {
    messages: Vec<ChatTurn>,
    #[serde(default, alias = "customInstructions")]
    custom_instructions: Option<String>,
}

async fn analyze(State(state): State<Arc<AppState>>, ApiJson(request): ApiJson<TranscriptRequest>) -> Json<Classification> {
    Json(state.service.classify(&request.messages).await)
}

async fn draft_response(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<TranscriptRequest>,
) -> Json<DraftReply> {
    let reply = state
        .assistant
        .draft_reply(&request.messages, request.custom_instructions.as_deref())
        .await;
    Json(reply)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TagInfo {
    tag: ConversationTag,
    description: &'static str,
    priority_level: i64,
    emergency_status: &'static str,
}

async fn emergency_tags() -> Json<Vec<TagInfo>> {
    Json(
        ConversationTag::ALL
            .into_iter()
            .map(|tag| TagInfo {
                tag,
                description: tag.description(),
                priority_level: tag.priority_level(),
                emergency_status: tag.emergency_status().as_str(),
            })
            .collect(),
    )
}

async fn list_templates() -> Json<&'static [TemplateInfo]> {
    Json(&CATALOGUE)
}

async fn send_template(
    State(state): State<Arc<AppState>>,
    ApiJson(request): ApiJson<SendTemplateRequest>,
) -> Result<Json<SendTemplateResponse>> {
    Ok(Json(state.service.send_template(&request).await?))
}
