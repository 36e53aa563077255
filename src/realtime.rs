//! Connected agent sessions and the push fan-out.
//!
//! One process owns the registry; scaling to multiple ingestion replicas would
//! mean replacing this with a pub/sub layer keyed by account. Sessions that are
//! not connected simply miss pushes: the conversation list is the durable
//! source of truth and clients reconcile on their next fetch.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use crate::types::NewMessageEvent;

/// An authenticated agent session. Entitlements are captured at join time and
/// not refreshed while the socket stays open; a reconnect picks up new links.
#[derive(Debug, Clone)]
pub struct AgentSession {
    pub agent_id: String,
    pub agent_name: String,
    pub entitlements: HashSet<String>,
}

#[derive(Default)]
struct RealtimeState {
    clients: HashMap<usize, mpsc::UnboundedSender<String>>,
    agents: HashMap<usize, AgentSession>,
}

#[derive(Default)]
pub struct SessionRegistry {
    state: Mutex<RealtimeState>,
    next_client_id: AtomicUsize,
}

pub fn event_payload<T: Serialize>(event: &str, data: T) -> Option<String> {
    serde_json::to_string(&json!({ "event": event, "data": data })).ok()
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly connected socket. The returned receiver is drained by
    /// the connection's send task.
    pub async fn register(&self) -> (usize, mpsc::UnboundedReceiver<String>) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = mpsc::unbounded_channel::<String>();
        self.state.lock().await.clients.insert(client_id, tx);
        (client_id, rx)
    }

    /// Promote a connection to an authenticated agent session.
    pub async fn authenticate(&self, client_id: usize, session: AgentSession) {
        let mut state = self.state.lock().await;
        if state.clients.contains_key(&client_id) {
            state.agents.insert(client_id, session);
        }
    }

    pub async fn remove(&self, client_id: usize) {
        let mut state = self.state.lock().await;
        state.clients.remove(&client_id);
        state.agents.remove(&client_id);
    }

    pub async fn connected_agents(&self) -> usize {
        self.state.lock().await.agents.len()
    }

    pub async fn emit_to_client<T: Serialize>(&self, client_id: usize, event: &str, data: T) {
        let Some(payload) = event_payload(event, data) else {
            return;
        };
        let tx = {
            let state = self.state.lock().await;
            state.clients.get(&client_id).cloned()
        };
        if let Some(sender) = tx {
            let _ = sender.send(payload);
        }
    }

    /// Push a `new_message` event to every connected session entitled to the
    /// account. Senders are cloned out under the lock and used after it is
    /// dropped, so a disconnect cannot race an in-flight broadcast. Returns
    /// how many sessions were addressed.
    pub async fn broadcast_new_message(&self, account_id: &str, event: &NewMessageEvent) -> usize {
        let Some(payload) = event_payload("new_message", event) else {
            return 0;
        };
        let senders = {
            let state = self.state.lock().await;
            state
                .agents
                .iter()
                .filter(|(_, session)| session.entitlements.contains(account_id))
                .filter_map(|(client_id, _)| state.clients.get(client_id).cloned())
                .collect::<Vec<_>>()
        };
        let mut delivered = 0;
        for sender in senders {
            // A send failure means the socket is already closing; its cleanup
            // removes the registration.
            if sender.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        tracing::debug!(account_id, delivered, "broadcast new_message");
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PushMessage, now_iso};

    fn event(account_id: &str) -> NewMessageEvent {
        NewMessageEvent {
            conversation_id: "conv-1".to_string(),
            account_id: account_id.to_string(),
            message: PushMessage {
                sender: "5551230000".to_string(),
                content: "hi".to_string(),
                message_type: "text".to_string(),
                media_url: None,
                timestamp: now_iso(),
            },
        }
    }

    fn session(agent_id: &str, accounts: &[&str]) -> AgentSession {
        AgentSession {
            agent_id: agent_id.to_string(),
            agent_name: agent_id.to_string(),
            entitlements: accounts.iter().map(|a| a.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_only_entitled_sessions() {
        let registry = SessionRegistry::new();
        let (client_a, mut rx_a) = registry.register().await;
        let (client_b, mut rx_b) = registry.register().await;
        registry.authenticate(client_a, session("agent-a", &["acc-A"])).await;
        registry.authenticate(client_b, session("agent-b", &["acc-B"])).await;

        let delivered = registry.broadcast_new_message("acc-A", &event("acc-A")).await;
        assert_eq!(delivered, 1);

        let payload = rx_a.try_recv().unwrap();
        assert!(payload.contains("new_message"));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn unauthenticated_connections_receive_nothing() {
        let registry = SessionRegistry::new();
        let (_client, mut rx) = registry.register().await;
        let delivered = registry.broadcast_new_message("acc-A", &event("acc-A")).await;
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_sessions_stop_receiving() {
        let registry = SessionRegistry::new();
        let (client, mut rx) = registry.register().await;
        registry.authenticate(client, session("agent-a", &["acc-A"])).await;
        registry.remove(client).await;

        let delivered = registry.broadcast_new_message("acc-A", &event("acc-A")).await;
        assert_eq!(delivered, 0);
        assert!(rx.try_recv().is_err());
    }
}
