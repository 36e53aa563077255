//! End-to-end ingestion pipeline tests over the in-memory store.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;

use inbox_server::app::AppState;
use inbox_server::config::AppConfig;
use inbox_server::ingest::{ingest_webhook, IngestError, IngestOutcome};
use inbox_server::realtime::AgentSession;
use inbox_server::store::{MemoryStore, Store};
use inbox_server::types::{now_iso, AccountStatus, Direction, WebhookAccount};

fn test_config() -> AppConfig {
    AppConfig {
        port: 0,
        database_url: String::new(),
        token_secret: "test-secret".to_string(),
        token_ttl_seconds: 3600,
        provider_base_url: "http://127.0.0.1:1".to_string(),
    }
}

fn test_account(id: &str) -> WebhookAccount {
    WebhookAccount {
        id: id.to_string(),
        name: format!("Tenant {id}"),
        api_key: format!("key-{id}"),
        webhook_secret: format!("secret-{id}"),
        phone_number: "5511988880000".to_string(),
        status: AccountStatus::Active,
        messages_sent: 0,
        messages_received: 0,
        created_at: now_iso(),
        updated_at: now_iso(),
    }
}

async fn state_with_accounts(accounts: &[WebhookAccount]) -> (Arc<AppState>, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    for account in accounts {
        store.create_account(account).await.unwrap();
    }
    let state = Arc::new(AppState::new(store.clone(), test_config()));
    (state, store)
}

fn text_envelope(external_id: Option<&str>, from: &str, text: &str) -> Vec<u8> {
    let mut key = json!({ "remoteJid": format!("{from}@s.whatsapp.net"), "fromMe": false });
    if let Some(id) = external_id {
        key["id"] = json!(id);
    }
    serde_json::to_vec(&json!({
        "event": "messages.received",
        "data": {
            "messages": {
                "key": key,
                "pushName": "Customer",
                "messageTimestamp": 1719999999,
                "message": { "conversation": text }
            }
        }
    }))
    .unwrap()
}

fn session(agent_id: &str, accounts: &[&str]) -> AgentSession {
    AgentSession {
        agent_id: agent_id.to_string(),
        agent_name: agent_id.to_string(),
        entitlements: accounts.iter().map(|a| a.to_string()).collect::<HashSet<_>>(),
    }
}

#[tokio::test]
async fn end_to_end_inbound_flow_with_idempotent_replay() {
    let account = test_account("acc-1");
    let (state, store) = state_with_accounts(&[account.clone()]).await;

    let (client, mut rx) = state.realtime.register().await;
    state
        .realtime
        .authenticate(client, session("agent-1", &["acc-1"]))
        .await;

    let body = text_envelope(Some("wam.123"), "5551230000", "Hello");
    let outcome = ingest_webhook(&state, &account.api_key, Some(&account.webhook_secret), &body)
        .await
        .unwrap();
    let IngestOutcome::Accepted {
        conversation_id, ..
    } = outcome
    else {
        panic!("first delivery must be accepted");
    };

    let conversation = store
        .conversation_by_id(&conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.account_id, "acc-1");
    assert_eq!(conversation.customer_phone, "5551230000");
    assert_eq!(conversation.unread_count, 1);
    assert!(conversation.is_new);

    let messages = store
        .messages_for_conversation(&conversation_id)
        .await
        .unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content.as_deref(), Some("Hello"));
    assert_eq!(messages[0].direction, Direction::Inbound);
    assert_eq!(messages[0].external_id.as_deref(), Some("wam.123"));

    let stored_account = store.account_by_id("acc-1").await.unwrap().unwrap();
    assert_eq!(stored_account.messages_received, 1);

    let push = rx.try_recv().unwrap();
    assert!(push.contains("new_message"));
    assert!(push.contains(&conversation_id));

    // identical redelivery: acknowledged, no new rows, no counters, no push
    let replay = ingest_webhook(&state, &account.api_key, Some(&account.webhook_secret), &body)
        .await
        .unwrap();
    assert_eq!(
        replay,
        IngestOutcome::Duplicate {
            external_id: "wam.123".to_string()
        }
    );
    assert_eq!(
        store
            .messages_for_conversation(&conversation_id)
            .await
            .unwrap()
            .len(),
        1
    );
    let conversation = store
        .conversation_by_id(&conversation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(conversation.unread_count, 1);
    let stored_account = store.account_by_id("acc-1").await.unwrap().unwrap();
    assert_eq!(stored_account.messages_received, 1);
    assert!(rx.try_recv().is_err());

    // the audit trail keeps both deliveries, duplicate included
    let logs = store.webhook_logs_for_account("acc-1", 10).await.unwrap();
    assert_eq!(logs.len(), 2);
    assert!(logs.iter().any(|l| l.status == "duplicate"));
    assert!(logs.iter().any(|l| l.status == "received"));
}

#[tokio::test]
async fn cosmetically_different_identifiers_share_one_conversation() {
    let account = test_account("acc-1");
    let (state, store) = state_with_accounts(&[account.clone()]).await;

    let first = text_envelope(Some("wam.1"), "+1 555-123-4567", "first");
    let second = text_envelope(Some("wam.2"), "15551234567", "second");
    ingest_webhook(&state, &account.api_key, Some(&account.webhook_secret), &first)
        .await
        .unwrap();
    ingest_webhook(&state, &account.api_key, Some(&account.webhook_secret), &second)
        .await
        .unwrap();

    let conversations = store
        .conversations_for_accounts(&["acc-1".to_string()], None)
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].unread_count, 2);
    // raw identifier stays as first seen
    assert_eq!(conversations[0].customer_phone, "+1 555-123-4567");
}

#[tokio::test]
async fn wrong_signature_is_rejected_with_zero_side_effects() {
    let account = test_account("acc-1");
    let (state, store) = state_with_accounts(&[account.clone()]).await;

    let body = text_envelope(Some("wam.1"), "5551230000", "Hello");
    let err = ingest_webhook(&state, &account.api_key, Some("not-the-secret"), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidSignature));

    assert!(store
        .conversations_for_accounts(&["acc-1".to_string()], None)
        .await
        .unwrap()
        .is_empty());
    let stored_account = store.account_by_id("acc-1").await.unwrap().unwrap();
    assert_eq!(stored_account.messages_received, 0);
    assert!(store
        .webhook_logs_for_account("acc-1", 10)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn missing_signature_is_rejected() {
    let account = test_account("acc-1");
    let (state, _store) = state_with_accounts(&[account.clone()]).await;
    let body = text_envelope(Some("wam.1"), "5551230000", "Hello");
    let err = ingest_webhook(&state, &account.api_key, None, &body)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidSignature));
}

#[tokio::test]
async fn unknown_api_key_and_inactive_account_are_distinct() {
    let mut inactive = test_account("acc-1");
    inactive.status = AccountStatus::Inactive;
    let (state, _store) = state_with_accounts(&[inactive.clone()]).await;

    let body = text_envelope(Some("wam.1"), "5551230000", "Hello");
    let err = ingest_webhook(&state, "no-such-key", Some("whatever"), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, IngestError::InvalidApiKey));

    let err = ingest_webhook(
        &state,
        &inactive.api_key,
        Some(&inactive.webhook_secret),
        &body,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, IngestError::AccountInactive));
}

#[tokio::test]
async fn malformed_payloads_are_client_errors() {
    let account = test_account("acc-1");
    let (state, _store) = state_with_accounts(&[account.clone()]).await;

    let err = ingest_webhook(
        &state,
        &account.api_key,
        Some(&account.webhook_secret),
        b"not json",
    )
    .await
    .unwrap_err();
    assert!(matches!(err, IngestError::Malformed(_)));

    let no_sender = serde_json::to_vec(&json!({
        "data": { "messages": { "message": { "conversation": "hi" } } }
    }))
    .unwrap();
    let err = ingest_webhook(
        &state,
        &account.api_key,
        Some(&account.webhook_secret),
        &no_sender,
    )
    .await
    .unwrap_err();
    assert!(matches!(err, IngestError::Malformed(_)));
}

#[tokio::test]
async fn missing_external_id_processes_every_delivery() {
    let account = test_account("acc-1");
    let (state, store) = state_with_accounts(&[account.clone()]).await;

    let body = text_envelope(None, "5551230000", "no id here");
    for _ in 0..2 {
        let outcome = ingest_webhook(&state, &account.api_key, Some(&account.webhook_secret), &body)
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
    }

    let conversations = store
        .conversations_for_accounts(&["acc-1".to_string()], None)
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].unread_count, 2);
    assert_eq!(
        store
            .messages_for_conversation(&conversations[0].id)
            .await
            .unwrap()
            .len(),
        2
    );
}

#[tokio::test]
async fn concurrent_bursts_never_lose_unread_increments() {
    let account = test_account("acc-1");
    let (state, store) = state_with_accounts(&[account.clone()]).await;

    let mut handles = Vec::new();
    for i in 0..3 {
        let state = state.clone();
        let api_key = account.api_key.clone();
        let secret = account.webhook_secret.clone();
        handles.push(tokio::spawn(async move {
            let body = text_envelope(Some(&format!("wam.{i}")), "5551230000", "burst");
            ingest_webhook(&state, &api_key, Some(&secret), &body)
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        assert!(matches!(
            handle.await.unwrap(),
            IngestOutcome::Accepted { .. }
        ));
    }

    let conversations = store
        .conversations_for_accounts(&["acc-1".to_string()], None)
        .await
        .unwrap();
    assert_eq!(conversations.len(), 1);
    assert_eq!(conversations[0].unread_count, 3);
    let stored_account = store.account_by_id("acc-1").await.unwrap().unwrap();
    assert_eq!(stored_account.messages_received, 3);
}

#[tokio::test]
async fn pushes_are_scoped_to_entitled_sessions() {
    let account_a = test_account("acc-A");
    let account_b = test_account("acc-B");
    let (state, _store) = state_with_accounts(&[account_a.clone(), account_b.clone()]).await;

    let (client_a, mut rx_a) = state.realtime.register().await;
    let (client_b, mut rx_b) = state.realtime.register().await;
    state
        .realtime
        .authenticate(client_a, session("agent-a", &["acc-A"]))
        .await;
    state
        .realtime
        .authenticate(client_b, session("agent-b", &["acc-B"]))
        .await;

    let body = text_envelope(Some("wam.1"), "5551230000", "for A only");
    ingest_webhook(
        &state,
        &account_a.api_key,
        Some(&account_a.webhook_secret),
        &body,
    )
    .await
    .unwrap();

    let push = rx_a.try_recv().unwrap();
    assert!(push.contains("acc-A"));
    assert!(rx_b.try_recv().is_err());
}
