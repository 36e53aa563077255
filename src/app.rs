//! Application state, router, HTTP and WebSocket handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use crate::auth;
use crate::config::AppConfig;
use crate::db::PgStore;
use crate::ingest::{ingest_webhook, IngestError};
use crate::provider::ProviderClient;
use crate::realtime::{AgentSession, SessionRegistry};
use crate::store::{normalize_phone, AccountUpdate, MessageInsert, Store, StoreError};
use crate::types::{
    now_iso, AccountStatus, Agent, AgentRole, DeliveryStatus, Direction, MediaKind, Message,
    MessageContent, NewMessageEvent, WebhookAccount, WebhookLog,
};

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub realtime: SessionRegistry,
    pub provider: ProviderClient,
    pub config: AppConfig,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: AppConfig) -> Self {
        let provider = ProviderClient::new(&config.provider_base_url);
        Self {
            store,
            realtime: SessionRegistry::new(),
            provider,
            config,
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("not found")]
    NotFound,
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("upstream send failed: {0}")]
    Upstream(String),
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized => "unauthorized",
            ApiError::Forbidden => "forbidden",
            ApiError::NotFound => "not_found",
            ApiError::Validation(_) => "validation_error",
            ApiError::Conflict(_) => "conflict",
            ApiError::Upstream(_) => "upstream_error",
            ApiError::Internal => "internal_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = json!({ "error": { "code": self.error_code(), "message": self.to_string() } });
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Backend(msg) => {
                tracing::error!(error = %msg, "store backend failure");
                ApiError::Internal
            }
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

async fn auth_agent(state: &AppState, headers: &HeaderMap) -> Result<Agent, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    let agent_id = auth::verify_agent_token(&state.config.token_secret, &token)
        .ok_or(ApiError::Unauthorized)?;
    state
        .store
        .agent_by_id(&agent_id)
        .await?
        .ok_or(ApiError::Unauthorized)
}

async fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<Agent, ApiError> {
    let agent = auth_agent(state, headers).await?;
    if agent.role != AgentRole::Admin {
        return Err(ApiError::Forbidden);
    }
    Ok(agent)
}

async fn require_agent_role(state: &AppState, headers: &HeaderMap) -> Result<Agent, ApiError> {
    let agent = auth_agent(state, headers).await?;
    if agent.role != AgentRole::Agent {
        return Err(ApiError::Forbidden);
    }
    Ok(agent)
}

async fn require_entitled(
    state: &AppState,
    agent_id: &str,
    account_id: &str,
) -> Result<(), ApiError> {
    let accounts = state.store.agent_account_ids(agent_id).await?;
    if accounts.iter().any(|id| id == account_id) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

// ---------------------------------------------------------------------------
// inbound webhook

async fn webhook_event(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let api_key = params.get("apiKey").map(String::as_str).unwrap_or("");
    let signature = headers
        .get("x-webhook-signature")
        .and_then(|v| v.to_str().ok());

    match ingest_webhook(&state, api_key, signature, &body).await {
        Ok(_) => (StatusCode::OK, Json(json!({ "success": true }))),
        Err(err) => {
            let status = match &err {
                IngestError::InvalidApiKey | IngestError::InvalidSignature => {
                    StatusCode::UNAUTHORIZED
                }
                IngestError::AccountInactive => StatusCode::FORBIDDEN,
                IngestError::Malformed(_) => StatusCode::BAD_REQUEST,
                IngestError::Store(store_err) => {
                    tracing::error!(error = %store_err, "webhook ingestion store failure");
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
            (status, Json(json!({ "error": err.to_string() })))
        }
    }
}

// ---------------------------------------------------------------------------
// auth

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterBody {
    name: String,
    email: String,
    password: String,
}

/// Bootstrap registration: open only while no agent exists yet, and the first
/// account created is the admin.
async fn register(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RegisterBody>,
) -> Result<Json<Value>, ApiError> {
    if body.name.trim().is_empty() || body.email.trim().is_empty() || body.password.len() < 6 {
        return Err(ApiError::Validation(
            "name, email and a password of at least 6 characters are required".to_string(),
        ));
    }
    if !state.store.list_agents().await?.is_empty() {
        return Err(ApiError::Forbidden);
    }

    let password_hash = auth::hash_password(&body.password).ok_or(ApiError::Internal)?;
    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        name: body.name.trim().to_string(),
        email: body.email.trim().to_lowercase(),
        password_hash,
        role: AgentRole::Admin,
        created_at: now_iso(),
        last_signed_in: now_iso(),
    };
    state.store.create_agent(&agent).await?;

    let token = auth::sign_agent_token(
        &state.config.token_secret,
        &agent.id,
        state.config.token_ttl_seconds,
    )
    .ok_or(ApiError::Internal)?;
    Ok(Json(json!({ "success": true, "token": token, "agent": agent })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody {
    email: String,
    password: String,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> Result<Json<Value>, ApiError> {
    let agent = state
        .store
        .agent_by_email(&body.email.trim().to_lowercase())
        .await?
        .ok_or(ApiError::Unauthorized)?;
    if !auth::verify_password(&body.password, &agent.password_hash) {
        return Err(ApiError::Unauthorized);
    }

    let token = auth::sign_agent_token(
        &state.config.token_secret,
        &agent.id,
        state.config.token_ttl_seconds,
    )
    .ok_or(ApiError::Internal)?;
    if let Err(err) = state.store.touch_agent_sign_in(&agent.id, &now_iso()).await {
        tracing::warn!(agent_id = %agent.id, error = %err, "failed to record sign-in time");
    }
    Ok(Json(json!({ "success": true, "token": token, "agent": agent })))
}

async fn me(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = auth_agent(&state, &headers).await?;
    Ok(Json(json!({ "agent": agent })))
}

// ---------------------------------------------------------------------------
// webhook accounts (admin)

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccountBody {
    name: String,
    api_key: Option<String>,
    webhook_secret: Option<String>,
    phone_number: Option<String>,
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAccountBody>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation("name is required".to_string()));
    }

    let account = WebhookAccount {
        id: Uuid::new_v4().to_string(),
        name: body.name.trim().to_string(),
        api_key: body
            .api_key
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        webhook_secret: body
            .webhook_secret
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string()),
        phone_number: body.phone_number.unwrap_or_default(),
        status: AccountStatus::Active,
        messages_sent: 0,
        messages_received: 0,
        created_at: now_iso(),
        updated_at: now_iso(),
    };
    state.store.create_account(&account).await?;
    // the secret is shown once here; account serialization never includes it
    let api_key = account.api_key.clone();
    let webhook_secret = account.webhook_secret.clone();
    Ok(Json(json!({
        "success": true,
        "account": account,
        "apiKey": api_key,
        "webhookSecret": webhook_secret,
    })))
}

async fn list_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let accounts = state.store.list_accounts().await?;
    Ok(Json(json!({ "accounts": accounts })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAccountBody {
    name: Option<String>,
    phone_number: Option<String>,
    status: Option<String>,
    webhook_secret: Option<String>,
}

async fn update_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<UpdateAccountBody>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let status = match &body.status {
        Some(raw) => Some(
            AccountStatus::parse(raw)
                .ok_or_else(|| ApiError::Validation(format!("unknown status '{raw}'")))?,
        ),
        None => None,
    };
    let update = AccountUpdate {
        name: body.name,
        phone_number: body.phone_number,
        status,
        webhook_secret: body.webhook_secret,
        api_key: None,
    };
    state.store.update_account(&account_id, &update).await?;
    Ok(Json(json!({ "success": true })))
}

async fn delete_account(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    state.store.delete_account(&account_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn regenerate_api_key(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let api_key = Uuid::new_v4().simple().to_string();
    let update = AccountUpdate {
        api_key: Some(api_key.clone()),
        ..AccountUpdate::default()
    };
    state.store.update_account(&account_id, &update).await?;
    Ok(Json(json!({ "success": true, "apiKey": api_key })))
}

async fn account_logs(
    State(state): State<Arc<AppState>>,
    Path(account_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let limit = params
        .get("limit")
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(100);
    let logs = state
        .store
        .webhook_logs_for_account(&account_id, limit)
        .await?;
    Ok(Json(json!({ "logs": logs })))
}

// ---------------------------------------------------------------------------
// agents and entitlements (admin)

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgentBody {
    name: String,
    email: String,
    password: String,
    role: Option<String>,
}

async fn create_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAgentBody>,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    if body.name.trim().is_empty() || body.email.trim().is_empty() || body.password.len() < 6 {
        return Err(ApiError::Validation(
            "name, email and a password of at least 6 characters are required".to_string(),
        ));
    }
    let role = match &body.role {
        Some(raw) => AgentRole::parse(raw)
            .ok_or_else(|| ApiError::Validation(format!("unknown role '{raw}'")))?,
        None => AgentRole::Agent,
    };

    let password_hash = auth::hash_password(&body.password).ok_or(ApiError::Internal)?;
    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        name: body.name.trim().to_string(),
        email: body.email.trim().to_lowercase(),
        password_hash,
        role,
        created_at: now_iso(),
        last_signed_in: now_iso(),
    };
    state.store.create_agent(&agent).await?;
    Ok(Json(json!({ "success": true, "agent": agent })))
}

async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    let agents = state.store.list_agents().await?;
    Ok(Json(json!({ "agents": agents })))
}

async fn link_agent(
    State(state): State<Arc<AppState>>,
    Path((agent_id, account_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    state
        .store
        .link_agent_account(&agent_id, &account_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn unlink_agent(
    State(state): State<Arc<AppState>>,
    Path((agent_id, account_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    require_admin(&state, &headers).await?;
    state
        .store
        .unlink_agent_account(&agent_id, &account_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn my_accounts(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = auth_agent(&state, &headers).await?;
    let mut accounts = Vec::new();
    for account_id in state.store.agent_account_ids(&agent.id).await? {
        if let Some(account) = state.store.account_by_id(&account_id).await? {
            accounts.push(account);
        }
    }
    Ok(Json(json!({ "accounts": accounts })))
}

// ---------------------------------------------------------------------------
// conversations (agent)

async fn list_conversations(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    let account_ids = state.store.agent_account_ids(&agent.id).await?;
    if account_ids.is_empty() {
        return Ok(Json(json!({ "conversations": [] })));
    }
    let conversations = state
        .store
        .conversations_for_accounts(&account_ids, params.get("search").map(String::as_str))
        .await?;
    Ok(Json(json!({ "conversations": conversations })))
}

async fn load_entitled_conversation(
    state: &AppState,
    agent: &Agent,
    conversation_id: &str,
) -> Result<crate::types::Conversation, ApiError> {
    let conversation = state
        .store
        .conversation_by_id(conversation_id)
        .await?
        .ok_or(ApiError::NotFound)?;
    require_entitled(state, &agent.id, &conversation.account_id).await?;
    Ok(conversation)
}

async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    let conversation = load_entitled_conversation(&state, &agent, &conversation_id).await?;
    Ok(Json(json!({ "conversation": conversation })))
}

async fn delete_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    load_entitled_conversation(&state, &agent, &conversation_id).await?;
    state.store.delete_conversation(&conversation_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn claim_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    load_entitled_conversation(&state, &agent, &conversation_id).await?;
    state
        .store
        .claim_conversation(&conversation_id, &agent.id, &now_iso())
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn release_conversation(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    load_entitled_conversation(&state, &agent, &conversation_id).await?;
    state.store.release_conversation(&conversation_id).await?;
    Ok(Json(json!({ "success": true })))
}

async fn mark_viewed(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    load_entitled_conversation(&state, &agent, &conversation_id).await?;
    state
        .store
        .mark_conversation_viewed(&conversation_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    load_entitled_conversation(&state, &agent, &conversation_id).await?;
    state.store.mark_conversation_read(&conversation_id).await?;
    Ok(Json(json!({ "success": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomerNameBody {
    customer_name: String,
}

async fn update_customer_name(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<CustomerNameBody>,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    load_entitled_conversation(&state, &agent, &conversation_id).await?;
    state
        .store
        .update_customer_name(&conversation_id, body.customer_name.trim())
        .await?;
    Ok(Json(json!({ "success": true })))
}

async fn list_messages(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    load_entitled_conversation(&state, &agent, &conversation_id).await?;
    let messages = state
        .store
        .messages_for_conversation(&conversation_id)
        .await?;
    Ok(Json(json!({ "messages": messages })))
}

// ---------------------------------------------------------------------------
// outbound send

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendMessageBody {
    content: String,
    message_type: Option<String>,
    media_url: Option<String>,
}

fn outbound_content(body: &SendMessageBody) -> Result<MessageContent, ApiError> {
    let message_type = body.message_type.as_deref().unwrap_or("text");
    if message_type == "text" {
        let text = body.content.trim();
        if text.is_empty() {
            return Err(ApiError::Validation("content is required".to_string()));
        }
        return Ok(MessageContent::Text {
            body: text.to_string(),
        });
    }
    let kind = MediaKind::parse(message_type)
        .ok_or_else(|| ApiError::Validation(format!("unsupported message type '{message_type}'")))?;
    let url = body
        .media_url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| ApiError::Validation("mediaUrl is required for media sends".to_string()))?;
    let caption = body.content.trim();
    Ok(MessageContent::Media {
        kind,
        url: Some(url.to_string()),
        caption: if caption.is_empty() {
            None
        } else {
            Some(caption.to_string())
        },
    })
}

/// Send through the provider first, journal after: a failed send must never be
/// recorded as a delivered outbound message.
async fn dispatch_outbound(
    state: &AppState,
    account: &WebhookAccount,
    conversation: &crate::types::Conversation,
    agent: &Agent,
    content: MessageContent,
) -> Result<Message, ApiError> {
    let receipt = match &content {
        MessageContent::Text { body } => state
            .provider
            .send_text(&account.api_key, &conversation.customer_phone, body)
            .await,
        MessageContent::Media { kind, url, caption } => {
            state
                .provider
                .send_media(
                    &account.api_key,
                    &conversation.customer_phone,
                    *kind,
                    url.as_deref().unwrap_or(""),
                    caption.as_deref().unwrap_or(""),
                )
                .await
        }
        _ => return Err(ApiError::Validation("unsupported outbound content".to_string())),
    }
    .map_err(|err| {
        tracing::warn!(
            account_id = %account.id,
            conversation_id = %conversation.id,
            error = %err,
            "outbound send failed"
        );
        ApiError::Upstream(err.to_string())
    })?;

    let now = now_iso();
    let preview = content.preview();
    let message = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        direction: Direction::Outbound,
        content: if preview.is_empty() {
            None
        } else {
            Some(preview.clone())
        },
        media_url: content.media_url(),
        media_type: content.media_kind().map(|k| k.as_str().to_string()),
        body: content,
        from_number: if account.phone_number.is_empty() {
            None
        } else {
            Some(account.phone_number.clone())
        },
        to_number: Some(conversation.customer_phone.clone()),
        agent_id: Some(agent.id.clone()),
        status: DeliveryStatus::Sent,
        external_id: receipt.message_id,
        timestamp: now.clone(),
    };

    if state.store.insert_message(&message).await? == MessageInsert::Inserted {
        state.store.touch_conversation(&conversation.id, &now).await?;
        state.store.increment_messages_sent(&account.id).await?;

        let log = WebhookLog {
            id: Uuid::new_v4().to_string(),
            account_id: account.id.clone(),
            direction: Direction::Outbound,
            from_number: message.from_number.clone(),
            to_number: message.to_number.clone(),
            message: message.content.clone(),
            metadata: None,
            status: "sent".to_string(),
            timestamp: now.clone(),
        };
        if let Err(err) = state.store.append_webhook_log(&log).await {
            tracing::warn!(account_id = %account.id, error = %err, "audit log write failed");
        }

        let event = NewMessageEvent::from_message(&account.id, &message);
        state
            .realtime
            .broadcast_new_message(&account.id, &event)
            .await;
    }

    Ok(message)
}

async fn send_message(
    State(state): State<Arc<AppState>>,
    Path(conversation_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    let conversation = load_entitled_conversation(&state, &agent, &conversation_id).await?;
    let account = state
        .store
        .account_by_id(&conversation.account_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let content = outbound_content(&body)?;
    let message = dispatch_outbound(&state, &account, &conversation, &agent, content).await?;
    Ok(Json(json!({ "success": true, "messageId": message.id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartChatBody {
    account_id: String,
    phone_number: String,
    initial_message: String,
}

async fn start_chat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<StartChatBody>,
) -> Result<Json<Value>, ApiError> {
    let agent = require_agent_role(&state, &headers).await?;
    require_entitled(&state, &agent.id, &body.account_id).await?;
    let account = state
        .store
        .account_by_id(&body.account_id)
        .await?
        .ok_or(ApiError::NotFound)?;

    let normalized = normalize_phone(&body.phone_number)
        .ok_or_else(|| ApiError::Validation("phone number has no digits".to_string()))?;
    if body.initial_message.trim().is_empty() {
        return Err(ApiError::Validation("initial message is required".to_string()));
    }

    let (conversation, _created) = state
        .store
        .find_or_create_conversation(&account.id, &body.phone_number, &normalized, "", &now_iso())
        .await?;

    let content = MessageContent::Text {
        body: body.initial_message.trim().to_string(),
    };
    let message = dispatch_outbound(&state, &account, &conversation, &agent, content).await?;

    // best effort: the conversation may already be claimed by a teammate
    if let Err(err) = state
        .store
        .claim_conversation(&conversation.id, &agent.id, &now_iso())
        .await
    {
        tracing::debug!(conversation_id = %conversation.id, error = %err, "claim after send skipped");
    }

    Ok(Json(json!({
        "success": true,
        "conversationId": conversation.id,
        "messageId": message.id,
    })))
}

// ---------------------------------------------------------------------------
// realtime

#[derive(Debug, Deserialize)]
struct EventEnvelopeIn {
    event: String,
    #[serde(default)]
    data: Value,
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, mut rx) = state.realtime.register().await;
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let send_task = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if ws_sender.send(WsMessage::Text(payload.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = ws_receiver.next().await {
        let text = match message {
            WsMessage::Text(text) => text.to_string(),
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let Ok(envelope) = serde_json::from_str::<EventEnvelopeIn>(&text) else {
            continue;
        };

        if envelope.event.as_str() != "agent:join" {
            continue;
        }

        let token = envelope
            .data
            .get("token")
            .and_then(Value::as_str)
            .unwrap_or("");
        match authenticate_session(&state, token).await {
            Some(session) => {
                let accounts: Vec<String> = session.entitlements.iter().cloned().collect();
                tracing::info!(agent_id = %session.agent_id, client_id, "agent session opened");
                state.realtime.authenticate(client_id, session.clone()).await;
                state
                    .realtime
                    .emit_to_client(
                        client_id,
                        "agent:joined",
                        json!({
                            "agentId": session.agent_id,
                            "agentName": session.agent_name,
                            "accounts": accounts,
                        }),
                    )
                    .await;
            }
            None => {
                state
                    .realtime
                    .emit_to_client(
                        client_id,
                        "auth:error",
                        json!({ "message": "invalid session token" }),
                    )
                    .await;
                // auth failure closes the connection; reconnect is client-driven
                break;
            }
        }
    }

    state.realtime.remove(client_id).await;
    send_task.abort();
}

async fn authenticate_session(state: &Arc<AppState>, token: &str) -> Option<AgentSession> {
    let agent_id = auth::verify_agent_token(&state.config.token_secret, token)?;
    let agent = state.store.agent_by_id(&agent_id).await.ok().flatten()?;
    let entitlements = state.store.agent_account_ids(&agent.id).await.ok()?;
    Some(AgentSession {
        agent_id: agent.id,
        agent_name: agent.name,
        entitlements: entitlements.into_iter().collect(),
    })
}

// ---------------------------------------------------------------------------

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhook", post(webhook_event))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        .route("/api/auth/me", get(me))
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route(
            "/api/accounts/{account_id}",
            patch(update_account).delete(delete_account),
        )
        .route(
            "/api/accounts/{account_id}/regenerate-key",
            post(regenerate_api_key),
        )
        .route("/api/accounts/{account_id}/logs", get(account_logs))
        .route("/api/agents", get(list_agents).post(create_agent))
        .route("/api/agents/me/accounts", get(my_accounts))
        .route(
            "/api/agents/{agent_id}/accounts/{account_id}",
            post(link_agent).delete(unlink_agent),
        )
        .route(
            "/api/conversations",
            get(list_conversations).post(start_chat),
        )
        .route(
            "/api/conversations/{conversation_id}",
            get(get_conversation).delete(delete_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/claim",
            post(claim_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/release",
            post(release_conversation),
        )
        .route(
            "/api/conversations/{conversation_id}/viewed",
            post(mark_viewed),
        )
        .route(
            "/api/conversations/{conversation_id}/read",
            post(mark_read),
        )
        .route(
            "/api/conversations/{conversation_id}/customer-name",
            patch(update_customer_name),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(list_messages).post(send_message),
        )
        .route("/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run(config: AppConfig) {
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let port = config.port;
    let state = Arc::new(AppState::new(Arc::new(PgStore::new(db)), config));
    let app = build_router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    tracing::info!(%addr, "inbox server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
