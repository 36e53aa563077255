//! Inbound webhook ingestion.
//!
//! One call per provider message event: authenticate the tenant, classify the
//! payload, deduplicate against redelivery, resolve the conversation, persist,
//! bump counters atomically, notify connected sessions, acknowledge. The
//! provider-facing contract is 2xx for everything except auth and validation
//! failures; business conditions like duplicates must never trigger provider
//! retries.

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::app::AppState;
use crate::auth::{sha256_hex, verify_webhook_signature};
use crate::classify::{parse_envelope, InboundMessage};
use crate::store::{normalize_phone, MessageInsert, StoreError};
use crate::types::{
    now_iso, AccountStatus, DeliveryStatus, Direction, Message, NewMessageEvent, WebhookAccount,
    WebhookLog,
};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid api key")]
    InvalidApiKey,
    #[error("invalid webhook signature")]
    InvalidSignature,
    #[error("account is inactive")]
    AccountInactive,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("store failure: {0}")]
    Store(#[from] StoreError),
}

/// Terminal pipeline outcomes that acknowledge success to the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Accepted {
        conversation_id: String,
        message_id: String,
    },
    /// Redelivery of an already-applied message: acknowledged, no side effects.
    Duplicate { external_id: String },
}

pub async fn ingest_webhook(
    state: &AppState,
    api_key: &str,
    signature: Option<&str>,
    body: &[u8],
) -> Result<IngestOutcome, IngestError> {
    // 1. authenticate
    let account = state
        .store
        .account_by_api_key(api_key)
        .await?
        .ok_or_else(|| {
            tracing::warn!(
                api_key_digest = %sha256_hex(api_key),
                "webhook with unknown api key"
            );
            IngestError::InvalidApiKey
        })?;

    if !verify_webhook_signature(&account.webhook_secret, signature) {
        tracing::warn!(account_id = %account.id, "webhook signature mismatch");
        return Err(IngestError::InvalidSignature);
    }

    if account.status != AccountStatus::Active {
        return Err(IngestError::AccountInactive);
    }

    // 2. classify
    let payload: Value = serde_json::from_slice(body)
        .map_err(|_| IngestError::Malformed("body is not valid json".to_string()))?;
    let inbound = parse_envelope(&payload).map_err(|e| IngestError::Malformed(e.to_string()))?;

    let normalized = normalize_phone(&inbound.from)
        .ok_or_else(|| IngestError::Malformed("sender has no digits".to_string()))?;

    // 3. dedup point check (the insert below closes the race with a
    //    constraint conflict for redeliveries that pass this concurrently)
    let duplicate = match &inbound.external_id {
        Some(external_id) => state
            .store
            .message_by_external_id(external_id)
            .await?
            .is_some(),
        None => false,
    };

    // 4. audit log, duplicates included; a failed audit write never loses a
    //    live customer message
    append_audit_log(state, &account, &payload, &inbound, duplicate).await;

    if duplicate {
        let external_id = inbound.external_id.clone().unwrap_or_default();
        tracing::info!(account_id = %account.id, external_id = %external_id, "duplicate webhook skipped");
        return Ok(IngestOutcome::Duplicate { external_id });
    }

    // 5. resolve conversation
    let now = now_iso();
    let (conversation, created) = state
        .store
        .find_or_create_conversation(
            &account.id,
            &inbound.from,
            &normalized,
            &inbound.push_name,
            &now,
        )
        .await?;
    if created {
        tracing::info!(
            account_id = %account.id,
            conversation_id = %conversation.id,
            "new conversation"
        );
    }

    // 6. persist
    let preview = inbound.content.preview();
    let message = Message {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation.id.clone(),
        direction: Direction::Inbound,
        content: if preview.is_empty() {
            None
        } else {
            Some(preview)
        },
        media_url: inbound.content.media_url(),
        media_type: inbound.content.media_kind().map(|k| k.as_str().to_string()),
        body: inbound.content.clone(),
        from_number: Some(inbound.from.clone()),
        to_number: if account.phone_number.is_empty() {
            None
        } else {
            Some(account.phone_number.clone())
        },
        agent_id: None,
        status: DeliveryStatus::Delivered,
        external_id: inbound.external_id.clone(),
        timestamp: now.clone(),
    };

    if state.store.insert_message(&message).await? == MessageInsert::DuplicateExternalId {
        // lost a redelivery race after the point check; same as a duplicate
        let external_id = inbound.external_id.clone().unwrap_or_default();
        tracing::info!(account_id = %account.id, external_id = %external_id, "duplicate insert resolved as no-op");
        return Ok(IngestOutcome::Duplicate { external_id });
    }

    // 7.–8. atomic counter updates
    state
        .store
        .record_inbound_activity(&conversation.id, &now)
        .await?;
    state.store.increment_messages_received(&account.id).await?;

    // 9. notify; never blocks or fails the acknowledgement
    let event = NewMessageEvent::from_message(&account.id, &message);
    state
        .realtime
        .broadcast_new_message(&account.id, &event)
        .await;

    Ok(IngestOutcome::Accepted {
        conversation_id: conversation.id,
        message_id: message.id,
    })
}

async fn append_audit_log(
    state: &AppState,
    account: &WebhookAccount,
    payload: &Value,
    inbound: &InboundMessage,
    duplicate: bool,
) {
    let preview = inbound.content.preview();
    let log = WebhookLog {
        id: Uuid::new_v4().to_string(),
        account_id: account.id.clone(),
        direction: Direction::Inbound,
        from_number: Some(inbound.from.clone()),
        to_number: if account.phone_number.is_empty() {
            None
        } else {
            Some(account.phone_number.clone())
        },
        message: if preview.is_empty() {
            None
        } else {
            Some(preview)
        },
        metadata: serde_json::to_string(payload).ok(),
        status: if duplicate { "duplicate" } else { "received" }.to_string(),
        timestamp: now_iso(),
    };
    if let Err(err) = state.store.append_webhook_log(&log).await {
        tracing::warn!(account_id = %account.id, error = %err, "audit log write failed");
    }
}
