//! The abstract relational store behind the pipeline.
//!
//! Two implementations: `PgStore` (src/db.rs) for production and `MemoryStore`
//! here for tests and database-less development. Counter updates and the two
//! uniqueness checks (message external id, conversation identity key) are
//! atomic inside the store, never read-modify-write in callers.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::types::{Agent, Conversation, Message, WebhookAccount, WebhookLog};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend failure: {0}")]
    Backend(String),
    #[error("record not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
}

/// Result of a message insert. A duplicate external id is a normal outcome,
/// not an error: it is the canonical dedup signal for redelivered webhooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageInsert {
    Inserted,
    DuplicateExternalId,
}

#[derive(Debug, Clone, Default)]
pub struct AccountUpdate {
    pub name: Option<String>,
    pub phone_number: Option<String>,
    pub status: Option<crate::types::AccountStatus>,
    pub webhook_secret: Option<String>,
    pub api_key: Option<String>,
}

/// Strip everything that is not an ASCII digit, so cosmetically different
/// representations of the same phone number collapse to one identity.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let digits = raw
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>();
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // accounts
    async fn create_account(&self, account: &WebhookAccount) -> Result<(), StoreError>;
    async fn account_by_id(&self, id: &str) -> Result<Option<WebhookAccount>, StoreError>;
    async fn account_by_api_key(&self, api_key: &str)
        -> Result<Option<WebhookAccount>, StoreError>;
    async fn list_accounts(&self) -> Result<Vec<WebhookAccount>, StoreError>;
    async fn update_account(&self, id: &str, update: &AccountUpdate) -> Result<(), StoreError>;
    async fn delete_account(&self, id: &str) -> Result<(), StoreError>;
    async fn increment_messages_received(&self, account_id: &str) -> Result<(), StoreError>;
    async fn increment_messages_sent(&self, account_id: &str) -> Result<(), StoreError>;

    // agents and entitlements
    async fn create_agent(&self, agent: &Agent) -> Result<(), StoreError>;
    async fn agent_by_id(&self, id: &str) -> Result<Option<Agent>, StoreError>;
    async fn agent_by_email(&self, email: &str) -> Result<Option<Agent>, StoreError>;
    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;
    async fn touch_agent_sign_in(&self, id: &str, at: &str) -> Result<(), StoreError>;
    async fn link_agent_account(&self, agent_id: &str, account_id: &str)
        -> Result<(), StoreError>;
    async fn unlink_agent_account(
        &self,
        agent_id: &str,
        account_id: &str,
    ) -> Result<(), StoreError>;
    async fn agent_account_ids(&self, agent_id: &str) -> Result<Vec<String>, StoreError>;

    // conversations
    /// Resolve the conversation for (account, normalized phone), creating it if
    /// absent. Concurrent first messages must converge on one row: the store
    /// treats an identity-key conflict as a lookup, never a failure. Returns
    /// the conversation and whether it was created by this call.
    async fn find_or_create_conversation(
        &self,
        account_id: &str,
        raw_phone: &str,
        normalized: &str,
        name_hint: &str,
        now: &str,
    ) -> Result<(Conversation, bool), StoreError>;
    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError>;
    async fn conversations_for_accounts(
        &self,
        account_ids: &[String],
        search: Option<&str>,
    ) -> Result<Vec<Conversation>, StoreError>;
    /// Inbound arrival: set `last_message_at` and bump `unread_count` by one in
    /// a single atomic store-side update.
    async fn record_inbound_activity(
        &self,
        conversation_id: &str,
        at: &str,
    ) -> Result<(), StoreError>;
    /// Outbound send: refresh `last_message_at` only.
    async fn touch_conversation(&self, conversation_id: &str, at: &str)
        -> Result<(), StoreError>;
    async fn mark_conversation_viewed(&self, id: &str) -> Result<(), StoreError>;
    async fn mark_conversation_read(&self, id: &str) -> Result<(), StoreError>;
    async fn claim_conversation(
        &self,
        id: &str,
        agent_id: &str,
        at: &str,
    ) -> Result<(), StoreError>;
    async fn release_conversation(&self, id: &str) -> Result<(), StoreError>;
    async fn update_customer_name(&self, id: &str, name: &str) -> Result<(), StoreError>;
    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError>;

    // messages
    async fn message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError>;
    async fn insert_message(&self, message: &Message) -> Result<MessageInsert, StoreError>;
    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError>;

    // audit
    async fn append_webhook_log(&self, log: &WebhookLog) -> Result<(), StoreError>;
    async fn webhook_logs_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookLog>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    accounts: HashMap<String, WebhookAccount>,
    agents: HashMap<String, Agent>,
    links: HashSet<(String, String)>,
    conversations: HashMap<String, Conversation>,
    // (account_id, normalized phone) -> conversation id
    conversation_keys: HashMap<(String, String), String>,
    messages: HashMap<String, Message>,
    // external id -> message id
    message_external_ids: HashMap<String, String>,
    webhook_logs: Vec<WebhookLog>,
}

/// In-memory store. All maps live behind one `RwLock`; every mutation takes the
/// write lock, which makes counter bumps and the check-then-insert sequences
/// atomic exactly where the pipeline needs them to be.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_account(&self, account: &WebhookAccount) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner
            .accounts
            .values()
            .any(|a| a.api_key == account.api_key || a.webhook_secret == account.webhook_secret)
        {
            return Err(StoreError::Conflict(
                "api key or webhook secret already in use".to_string(),
            ));
        }
        inner.accounts.insert(account.id.clone(), account.clone());
        Ok(())
    }

    async fn account_by_id(&self, id: &str) -> Result<Option<WebhookAccount>, StoreError> {
        Ok(self.inner.read().await.accounts.get(id).cloned())
    }

    async fn account_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<WebhookAccount>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .accounts
            .values()
            .find(|a| a.api_key == api_key)
            .cloned())
    }

    async fn list_accounts(&self) -> Result<Vec<WebhookAccount>, StoreError> {
        let mut accounts: Vec<_> = self.inner.read().await.accounts.values().cloned().collect();
        accounts.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(accounts)
    }

    async fn update_account(&self, id: &str, update: &AccountUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(key) = &update.api_key {
            if inner
                .accounts
                .values()
                .any(|a| a.id != id && a.api_key == *key)
            {
                return Err(StoreError::Conflict("api key already in use".to_string()));
            }
        }
        let account = inner.accounts.get_mut(id).ok_or(StoreError::NotFound)?;
        if let Some(name) = &update.name {
            account.name = name.clone();
        }
        if let Some(phone) = &update.phone_number {
            account.phone_number = phone.clone();
        }
        if let Some(status) = update.status {
            account.status = status;
        }
        if let Some(secret) = &update.webhook_secret {
            account.webhook_secret = secret.clone();
        }
        if let Some(key) = &update.api_key {
            account.api_key = key.clone();
        }
        account.updated_at = crate::types::now_iso();
        Ok(())
    }

    async fn delete_account(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.conversations.values().any(|c| c.account_id == id) {
            return Err(StoreError::Conflict(
                "account still has conversations; deactivate instead".to_string(),
            ));
        }
        inner.accounts.remove(id).ok_or(StoreError::NotFound)?;
        inner.links.retain(|(_, account_id)| account_id != id);
        Ok(())
    }

    async fn increment_messages_received(&self, account_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or(StoreError::NotFound)?;
        account.messages_received += 1;
        account.updated_at = crate::types::now_iso();
        Ok(())
    }

    async fn increment_messages_sent(&self, account_id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let account = inner
            .accounts
            .get_mut(account_id)
            .ok_or(StoreError::NotFound)?;
        account.messages_sent += 1;
        account.updated_at = crate::types::now_iso();
        Ok(())
    }

    async fn create_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if inner.agents.values().any(|a| a.email == agent.email) {
            return Err(StoreError::Conflict("email already registered".to_string()));
        }
        inner.agents.insert(agent.id.clone(), agent.clone());
        Ok(())
    }

    async fn agent_by_id(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self.inner.read().await.agents.get(id).cloned())
    }

    async fn agent_by_email(&self, email: &str) -> Result<Option<Agent>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .agents
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut agents: Vec<_> = self.inner.read().await.agents.values().cloned().collect();
        agents.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(agents)
    }

    async fn touch_agent_sign_in(&self, id: &str, at: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let agent = inner.agents.get_mut(id).ok_or(StoreError::NotFound)?;
        agent.last_signed_in = at.to_string();
        Ok(())
    }

    async fn link_agent_account(
        &self,
        agent_id: &str,
        account_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.agents.contains_key(agent_id) || !inner.accounts.contains_key(account_id) {
            return Err(StoreError::NotFound);
        }
        inner
            .links
            .insert((agent_id.to_string(), account_id.to_string()));
        Ok(())
    }

    async fn unlink_agent_account(
        &self,
        agent_id: &str,
        account_id: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner
            .links
            .remove(&(agent_id.to_string(), account_id.to_string()));
        Ok(())
    }

    async fn agent_account_ids(&self, agent_id: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.read().await;
        let mut ids: Vec<_> = inner
            .links
            .iter()
            .filter(|(a, _)| a == agent_id)
            .map(|(_, account_id)| account_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn find_or_create_conversation(
        &self,
        account_id: &str,
        raw_phone: &str,
        normalized: &str,
        name_hint: &str,
        now: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        let mut inner = self.inner.write().await;
        let key = (account_id.to_string(), normalized.to_string());
        if let Some(existing_id) = inner.conversation_keys.get(&key) {
            let conversation = inner
                .conversations
                .get(existing_id)
                .cloned()
                .ok_or_else(|| StoreError::Backend("dangling conversation key".to_string()))?;
            return Ok((conversation, false));
        }

        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            account_id: account_id.to_string(),
            customer_phone: raw_phone.to_string(),
            customer_phone_normalized: normalized.to_string(),
            customer_name: if name_hint.is_empty() {
                raw_phone.to_string()
            } else {
                name_hint.to_string()
            },
            last_message_at: now.to_string(),
            unread_count: 0,
            is_new: true,
            claimed_by: None,
            claimed_at: None,
            created_at: now.to_string(),
        };
        inner.conversation_keys.insert(key, conversation.id.clone());
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok((conversation, true))
    }

    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        Ok(self.inner.read().await.conversations.get(id).cloned())
    }

    async fn conversations_for_accounts(
        &self,
        account_ids: &[String],
        search: Option<&str>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let inner = self.inner.read().await;
        let needle = search.map(str::to_lowercase).unwrap_or_default();
        let mut conversations: Vec<_> = inner
            .conversations
            .values()
            .filter(|c| account_ids.contains(&c.account_id))
            .filter(|c| {
                needle.is_empty()
                    || c.customer_name.to_lowercase().contains(&needle)
                    || c.customer_phone.contains(&needle)
            })
            .cloned()
            .collect();
        conversations.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        Ok(conversations)
    }

    async fn record_inbound_activity(
        &self,
        conversation_id: &str,
        at: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        conversation.last_message_at = at.to_string();
        conversation.unread_count += 1;
        Ok(())
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner
            .conversations
            .get_mut(conversation_id)
            .ok_or(StoreError::NotFound)?;
        conversation.last_message_at = at.to_string();
        Ok(())
    }

    async fn mark_conversation_viewed(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        conversation.is_new = false;
        Ok(())
    }

    async fn mark_conversation_read(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        conversation.unread_count = 0;
        Ok(())
    }

    async fn claim_conversation(
        &self,
        id: &str,
        agent_id: &str,
        at: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        if let Some(holder) = &conversation.claimed_by {
            if holder != agent_id {
                return Err(StoreError::Conflict(
                    "conversation already claimed".to_string(),
                ));
            }
        }
        conversation.claimed_by = Some(agent_id.to_string());
        conversation.claimed_at = Some(at.to_string());
        Ok(())
    }

    async fn release_conversation(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        conversation.claimed_by = None;
        conversation.claimed_at = None;
        Ok(())
    }

    async fn update_customer_name(&self, id: &str, name: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.get_mut(id).ok_or(StoreError::NotFound)?;
        conversation.customer_name = name.to_string();
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let conversation = inner.conversations.remove(id).ok_or(StoreError::NotFound)?;
        inner.conversation_keys.remove(&(
            conversation.account_id.clone(),
            conversation.customer_phone_normalized.clone(),
        ));
        let removed: Vec<_> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == id)
            .map(|m| (m.id.clone(), m.external_id.clone()))
            .collect();
        for (message_id, external_id) in removed {
            inner.messages.remove(&message_id);
            if let Some(external_id) = external_id {
                inner.message_external_ids.remove(&external_id);
            }
        }
        Ok(())
    }

    async fn message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .message_external_ids
            .get(external_id)
            .and_then(|id| inner.messages.get(id))
            .cloned())
    }

    async fn insert_message(&self, message: &Message) -> Result<MessageInsert, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(external_id) = &message.external_id {
            if inner.message_external_ids.contains_key(external_id) {
                return Ok(MessageInsert::DuplicateExternalId);
            }
            inner
                .message_external_ids
                .insert(external_id.clone(), message.id.clone());
        }
        inner.messages.insert(message.id.clone(), message.clone());
        Ok(MessageInsert::Inserted)
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let inner = self.inner.read().await;
        let mut messages: Vec<_> = inner
            .messages
            .values()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(messages)
    }

    async fn append_webhook_log(&self, log: &WebhookLog) -> Result<(), StoreError> {
        self.inner.write().await.webhook_logs.push(log.clone());
        Ok(())
    }

    async fn webhook_logs_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookLog>, StoreError> {
        let inner = self.inner.read().await;
        let mut logs: Vec<_> = inner
            .webhook_logs
            .iter()
            .filter(|l| l.account_id == account_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        logs.truncate(limit);
        Ok(logs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        now_iso, AccountStatus, DeliveryStatus, Direction, MessageContent, WebhookAccount,
    };

    fn account(id: &str) -> WebhookAccount {
        WebhookAccount {
            id: id.to_string(),
            name: "Test Tenant".to_string(),
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

    fn text_message(conversation_id: &str, external_id: Option<&str>) -> Message {
        Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            direction: Direction::Inbound,
            content: Some("hi".to_string()),
            body: MessageContent::Text {
                body: "hi".to_string(),
            },
            media_url: None,
            media_type: None,
            from_number: Some("5551230000".to_string()),
            to_number: None,
            agent_id: None,
            status: DeliveryStatus::Delivered,
            external_id: external_id.map(str::to_string),
            timestamp: now_iso(),
        }
    }

    #[tokio::test]
    async fn find_or_create_collapses_normalized_identities() {
        let store = MemoryStore::new();
        store.create_account(&account("acc-1")).await.unwrap();

        let normalized = normalize_phone("+1 555-123-4567").unwrap();
        let (first, created) = store
            .find_or_create_conversation("acc-1", "+1 555-123-4567", &normalized, "", &now_iso())
            .await
            .unwrap();
        assert!(created);

        let normalized_again = normalize_phone("15551234567").unwrap();
        assert_eq!(normalized, normalized_again);
        let (second, created) = store
            .find_or_create_conversation("acc-1", "15551234567", &normalized_again, "", &now_iso())
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(first.id, second.id);
        // raw phone stays as first seen
        assert_eq!(second.customer_phone, "+1 555-123-4567");
    }

    #[tokio::test]
    async fn duplicate_external_id_insert_is_signaled_not_stored() {
        let store = MemoryStore::new();
        let first = text_message("conv-1", Some("wam.1"));
        assert_eq!(
            store.insert_message(&first).await.unwrap(),
            MessageInsert::Inserted
        );

        let replay = text_message("conv-1", Some("wam.1"));
        assert_eq!(
            store.insert_message(&replay).await.unwrap(),
            MessageInsert::DuplicateExternalId
        );
        assert_eq!(
            store.messages_for_conversation("conv-1").await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn messages_without_external_id_are_never_deduplicated() {
        let store = MemoryStore::new();
        store
            .insert_message(&text_message("conv-1", None))
            .await
            .unwrap();
        store
            .insert_message(&text_message("conv-1", None))
            .await
            .unwrap();
        assert_eq!(
            store.messages_for_conversation("conv-1").await.unwrap().len(),
            2
        );
    }

    #[tokio::test]
    async fn concurrent_inbound_activity_never_loses_increments() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.create_account(&account("acc-1")).await.unwrap();
        let (conversation, _) = store
            .find_or_create_conversation("acc-1", "5551230000", "5551230000", "", &now_iso())
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let store = store.clone();
            let id = conversation.id.clone();
            handles.push(tokio::spawn(async move {
                store.record_inbound_activity(&id, &now_iso()).await.unwrap();
                store.increment_messages_received("acc-1").await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let conversation = store
            .conversation_by_id(&conversation.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(conversation.unread_count, 3);
        let account = store.account_by_id("acc-1").await.unwrap().unwrap();
        assert_eq!(account.messages_received, 3);
    }

    #[tokio::test]
    async fn delete_conversation_cascades_messages() {
        let store = MemoryStore::new();
        store.create_account(&account("acc-1")).await.unwrap();
        let (conversation, _) = store
            .find_or_create_conversation("acc-1", "5551230000", "5551230000", "", &now_iso())
            .await
            .unwrap();
        store
            .insert_message(&text_message(&conversation.id, Some("wam.1")))
            .await
            .unwrap();

        store.delete_conversation(&conversation.id).await.unwrap();
        assert!(store
            .conversation_by_id(&conversation.id)
            .await
            .unwrap()
            .is_none());
        assert!(store
            .message_by_external_id("wam.1")
            .await
            .unwrap()
            .is_none());
        // identity key is freed for a future first message
        let (_, created) = store
            .find_or_create_conversation("acc-1", "5551230000", "5551230000", "", &now_iso())
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_released() {
        let store = MemoryStore::new();
        store.create_account(&account("acc-1")).await.unwrap();
        let (conversation, _) = store
            .find_or_create_conversation("acc-1", "5551230000", "5551230000", "", &now_iso())
            .await
            .unwrap();

        store
            .claim_conversation(&conversation.id, "agent-1", &now_iso())
            .await
            .unwrap();
        let err = store
            .claim_conversation(&conversation.id, "agent-2", &now_iso())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        store.release_conversation(&conversation.id).await.unwrap();
        store
            .claim_conversation(&conversation.id, "agent-2", &now_iso())
            .await
            .unwrap();
    }

    #[test]
    fn normalize_phone_strips_punctuation() {
        assert_eq!(
            normalize_phone("+1 (234) 567-8900").as_deref(),
            Some("12345678900")
        );
        assert_eq!(normalize_phone("no digits here"), None);
    }
}
