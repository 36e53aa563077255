//! Postgres implementation of the store.
//!
//! Runtime-checked queries; the two uniqueness guarantees the pipeline leans on
//! (message external id, conversation identity key) live in the schema, and
//! inserts treat a constraint conflict as the dedup/lookup signal. Counters are
//! moved with `SET x = x + 1` updates so concurrent webhook bursts never lose
//! increments.

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::store::{AccountUpdate, MessageInsert, Store, StoreError};
use crate::types::{
    now_iso, AccountStatus, Agent, AgentRole, Conversation, DeliveryStatus, Direction, Message,
    MessageContent, WebhookAccount, WebhookLog,
};

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn parse_account_row(row: PgRow) -> WebhookAccount {
    WebhookAccount {
        id: row.get("id"),
        name: row.get("name"),
        api_key: row.get("api_key"),
        webhook_secret: row.get("webhook_secret"),
        phone_number: row.get("phone_number"),
        status: AccountStatus::parse(&row.get::<String, _>("status"))
            .unwrap_or(AccountStatus::Inactive),
        messages_sent: row.get("messages_sent"),
        messages_received: row.get("messages_received"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

fn parse_agent_row(row: PgRow) -> Agent {
    Agent {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role: AgentRole::parse(&row.get::<String, _>("role")).unwrap_or(AgentRole::Agent),
        created_at: row.get("created_at"),
        last_signed_in: row.get("last_signed_in"),
    }
}

fn parse_conversation_row(row: PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        account_id: row.get("account_id"),
        customer_phone: row.get("customer_phone"),
        customer_phone_normalized: row.get("customer_phone_normalized"),
        customer_name: row.get("customer_name"),
        last_message_at: row.get("last_message_at"),
        unread_count: row.get("unread_count"),
        is_new: row.get("is_new"),
        claimed_by: row.get("claimed_by"),
        claimed_at: row.get("claimed_at"),
        created_at: row.get("created_at"),
    }
}

fn parse_message_row(row: PgRow) -> Message {
    let content: Option<String> = row.get("content");
    let body = serde_json::from_str::<MessageContent>(&row.get::<String, _>("body"))
        .unwrap_or(MessageContent::Text {
            body: content.clone().unwrap_or_default(),
        });
    Message {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        direction: Direction::parse(&row.get::<String, _>("direction"))
            .unwrap_or(Direction::Inbound),
        content,
        body,
        media_url: row.get("media_url"),
        media_type: row.get("media_type"),
        from_number: row.get("from_number"),
        to_number: row.get("to_number"),
        agent_id: row.get("agent_id"),
        status: DeliveryStatus::parse(&row.get::<String, _>("status"))
            .unwrap_or(DeliveryStatus::Delivered),
        external_id: row.get("external_id"),
        timestamp: row.get("timestamp"),
    }
}

fn parse_webhook_log_row(row: PgRow) -> WebhookLog {
    WebhookLog {
        id: row.get("id"),
        account_id: row.get("account_id"),
        direction: Direction::parse(&row.get::<String, _>("direction"))
            .unwrap_or(Direction::Inbound),
        from_number: row.get("from_number"),
        to_number: row.get("to_number"),
        message: row.get("message"),
        metadata: row.get("metadata"),
        status: row.get("status"),
        timestamp: row.get("timestamp"),
    }
}

const ACCOUNT_COLUMNS: &str = "id, name, api_key, webhook_secret, phone_number, status, \
     messages_sent, messages_received, created_at, updated_at";

const CONVERSATION_COLUMNS: &str = "id, account_id, customer_phone, customer_phone_normalized, \
     customer_name, last_message_at, unread_count, is_new, claimed_by, claimed_at, created_at";

const MESSAGE_COLUMNS: &str = "id, conversation_id, direction, content, body, media_url, \
     media_type, from_number, to_number, agent_id, status, external_id, timestamp";

#[async_trait]
impl Store for PgStore {
    async fn create_account(&self, account: &WebhookAccount) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO webhook_accounts \
             (id, name, api_key, webhook_secret, phone_number, status, messages_sent, messages_received, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10)",
        )
        .bind(&account.id)
        .bind(&account.name)
        .bind(&account.api_key)
        .bind(&account.webhook_secret)
        .bind(&account.phone_number)
        .bind(account.status.as_str())
        .bind(account.messages_sent)
        .bind(account.messages_received)
        .bind(&account.created_at)
        .bind(&account.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("api key or webhook secret already in use".to_string())
            }
            other => backend(other),
        })?;
        Ok(())
    }

    async fn account_by_id(&self, id: &str) -> Result<Option<WebhookAccount>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM webhook_accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(parse_account_row))
    }

    async fn account_by_api_key(
        &self,
        api_key: &str,
    ) -> Result<Option<WebhookAccount>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM webhook_accounts WHERE api_key = $1"
        ))
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(parse_account_row))
    }

    async fn list_accounts(&self) -> Result<Vec<WebhookAccount>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM webhook_accounts ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(parse_account_row).collect())
    }

    async fn update_account(&self, id: &str, update: &AccountUpdate) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_accounts SET \
             name = COALESCE($1, name), \
             phone_number = COALESCE($2, phone_number), \
             status = COALESCE($3, status), \
             webhook_secret = COALESCE($4, webhook_secret), \
             api_key = COALESCE($5, api_key), \
             updated_at = $6 \
             WHERE id = $7",
        )
        .bind(&update.name)
        .bind(&update.phone_number)
        .bind(update.status.map(|s| s.as_str()))
        .bind(&update.webhook_secret)
        .bind(&update.api_key)
        .bind(now_iso())
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("api key already in use".to_string())
            }
            other => backend(other),
        })?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_account(&self, id: &str) -> Result<(), StoreError> {
        let has_conversations = sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS (SELECT 1 FROM conversations WHERE account_id = $1)",
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await
        .map_err(backend)?;
        if has_conversations {
            return Err(StoreError::Conflict(
                "account still has conversations; deactivate instead".to_string(),
            ));
        }
        let result = sqlx::query("DELETE FROM webhook_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn increment_messages_received(&self, account_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_accounts SET messages_received = messages_received + 1, updated_at = $1 \
             WHERE id = $2",
        )
        .bind(now_iso())
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn increment_messages_sent(&self, account_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE webhook_accounts SET messages_sent = messages_sent + 1, updated_at = $1 \
             WHERE id = $2",
        )
        .bind(now_iso())
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn create_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agents (id, name, email, password_hash, role, created_at, last_signed_in) \
             VALUES ($1,$2,$3,$4,$5,$6,$7)",
        )
        .bind(&agent.id)
        .bind(&agent.name)
        .bind(&agent.email)
        .bind(&agent.password_hash)
        .bind(agent.role.as_str())
        .bind(&agent.created_at)
        .bind(&agent.last_signed_in)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                StoreError::Conflict("email already registered".to_string())
            }
            other => backend(other),
        })?;
        Ok(())
    }

    async fn agent_by_id(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, email, password_hash, role, created_at, last_signed_in \
             FROM agents WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(parse_agent_row))
    }

    async fn agent_by_email(&self, email: &str) -> Result<Option<Agent>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, email, password_hash, role, created_at, last_signed_in \
             FROM agents WHERE email = $1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(parse_agent_row))
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, email, password_hash, role, created_at, last_signed_in \
             FROM agents ORDER BY created_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(parse_agent_row).collect())
    }

    async fn touch_agent_sign_in(&self, id: &str, at: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE agents SET last_signed_in = $1 WHERE id = $2")
            .bind(at)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn link_agent_account(
        &self,
        agent_id: &str,
        account_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO agent_accounts (agent_id, account_id) VALUES ($1, $2) \
             ON CONFLICT (agent_id, account_id) DO NOTHING",
        )
        .bind(agent_id)
        .bind(account_id)
        .execute(&self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound,
            other => backend(other),
        })?;
        Ok(())
    }

    async fn unlink_agent_account(
        &self,
        agent_id: &str,
        account_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM agent_accounts WHERE agent_id = $1 AND account_id = $2")
            .bind(agent_id)
            .bind(account_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn agent_account_ids(&self, agent_id: &str) -> Result<Vec<String>, StoreError> {
        sqlx::query_scalar::<_, String>(
            "SELECT account_id FROM agent_accounts WHERE agent_id = $1 ORDER BY account_id",
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)
    }

    async fn find_or_create_conversation(
        &self,
        account_id: &str,
        raw_phone: &str,
        normalized: &str,
        name_hint: &str,
        now: &str,
    ) -> Result<(Conversation, bool), StoreError> {
        let customer_name = if name_hint.is_empty() {
            raw_phone
        } else {
            name_hint
        };
        // Insert-on-conflict-fetch: two racing first messages both execute the
        // insert, exactly one wins, both read the surviving row back.
        let inserted = sqlx::query(
            "INSERT INTO conversations \
             (id, account_id, customer_phone, customer_phone_normalized, customer_name, \
              last_message_at, unread_count, is_new, claimed_by, claimed_at, created_at) \
             VALUES ($1,$2,$3,$4,$5,$6,0,TRUE,NULL,NULL,$7) \
             ON CONFLICT (account_id, customer_phone_normalized) DO NOTHING",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(account_id)
        .bind(raw_phone)
        .bind(normalized)
        .bind(customer_name)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(backend)?
        .rows_affected()
            > 0;

        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE account_id = $1 AND customer_phone_normalized = $2"
        ))
        .bind(account_id)
        .bind(normalized)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .ok_or_else(|| StoreError::Backend("conversation vanished after upsert".to_string()))?;

        Ok((parse_conversation_row(row), inserted))
    }

    async fn conversation_by_id(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(parse_conversation_row))
    }

    async fn conversations_for_accounts(
        &self,
        account_ids: &[String],
        search: Option<&str>,
    ) -> Result<Vec<Conversation>, StoreError> {
        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{s}%"));
        let rows = sqlx::query(&format!(
            "SELECT {CONVERSATION_COLUMNS} FROM conversations \
             WHERE account_id = ANY($1::text[]) \
               AND ($2::text IS NULL OR customer_name ILIKE $2 OR customer_phone LIKE $2) \
             ORDER BY last_message_at DESC"
        ))
        .bind(account_ids)
        .bind(pattern)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(parse_conversation_row).collect())
    }

    async fn record_inbound_activity(
        &self,
        conversation_id: &str,
        at: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE conversations SET last_message_at = $1, unread_count = unread_count + 1 \
             WHERE id = $2",
        )
        .bind(at)
        .bind(conversation_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn touch_conversation(
        &self,
        conversation_id: &str,
        at: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET last_message_at = $1 WHERE id = $2")
            .bind(at)
            .bind(conversation_id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_conversation_viewed(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET is_new = FALSE WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn mark_conversation_read(&self, id: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET unread_count = 0 WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn claim_conversation(
        &self,
        id: &str,
        agent_id: &str,
        at: &str,
    ) -> Result<(), StoreError> {
        // The WHERE clause makes the claim exclusive without a read-then-write.
        let result = sqlx::query(
            "UPDATE conversations SET claimed_by = $1, claimed_at = $2 \
             WHERE id = $3 AND (claimed_by IS NULL OR claimed_by = $1)",
        )
        .bind(agent_id)
        .bind(at)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            let exists = sqlx::query_scalar::<_, bool>(
                "SELECT EXISTS (SELECT 1 FROM conversations WHERE id = $1)",
            )
            .bind(id)
            .fetch_one(&self.pool)
            .await
            .map_err(backend)?;
            return Err(if exists {
                StoreError::Conflict("conversation already claimed".to_string())
            } else {
                StoreError::NotFound
            });
        }
        Ok(())
    }

    async fn release_conversation(&self, id: &str) -> Result<(), StoreError> {
        let result =
            sqlx::query("UPDATE conversations SET claimed_by = NULL, claimed_at = NULL WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await
                .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn update_customer_name(&self, id: &str, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE conversations SET customer_name = $1 WHERE id = $2")
            .bind(name)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn delete_conversation(&self, id: &str) -> Result<(), StoreError> {
        // messages go with it via ON DELETE CASCADE
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn message_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE external_id = $1"
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?;
        Ok(row.map(parse_message_row))
    }

    async fn insert_message(&self, message: &Message) -> Result<MessageInsert, StoreError> {
        let body = serde_json::to_string(&message.body)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        let result = sqlx::query(
            "INSERT INTO messages \
             (id, conversation_id, direction, content, body, media_url, media_type, \
              from_number, to_number, agent_id, status, external_id, timestamp) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13) \
             ON CONFLICT (external_id) WHERE external_id IS NOT NULL DO NOTHING",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.direction.as_str())
        .bind(&message.content)
        .bind(&body)
        .bind(&message.media_url)
        .bind(&message.media_type)
        .bind(&message.from_number)
        .bind(&message.to_number)
        .bind(&message.agent_id)
        .bind(message.status.as_str())
        .bind(&message.external_id)
        .bind(&message.timestamp)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        if result.rows_affected() == 0 {
            return Ok(MessageInsert::DuplicateExternalId);
        }
        Ok(MessageInsert::Inserted)
    }

    async fn messages_for_conversation(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = $1 \
             ORDER BY timestamp ASC"
        ))
        .bind(conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(parse_message_row).collect())
    }

    async fn append_webhook_log(&self, log: &WebhookLog) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO webhook_logs \
             (id, account_id, direction, from_number, to_number, message, metadata, status, timestamp) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9)",
        )
        .bind(&log.id)
        .bind(&log.account_id)
        .bind(log.direction.as_str())
        .bind(&log.from_number)
        .bind(&log.to_number)
        .bind(&log.message)
        .bind(&log.metadata)
        .bind(&log.status)
        .bind(&log.timestamp)
        .execute(&self.pool)
        .await
        .map_err(backend)?;
        Ok(())
    }

    async fn webhook_logs_for_account(
        &self,
        account_id: &str,
        limit: usize,
    ) -> Result<Vec<WebhookLog>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, account_id, direction, from_number, to_number, message, metadata, status, timestamp \
             FROM webhook_logs WHERE account_id = $1 ORDER BY timestamp DESC LIMIT $2",
        )
        .bind(account_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(rows.into_iter().map(parse_webhook_log_row).collect())
    }
}
