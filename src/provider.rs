//! Outbound send client for the messaging provider.
//!
//! Thin request/response wrapper; retry policy deliberately lives with the
//! caller (there is none in core scope). A failed send surfaces as an error so
//! the message is never journaled as if it had gone out.

use serde_json::{json, Value};
use thiserror::Error;

use crate::types::MediaKind;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider rejected send ({status}): {body}")]
    Api { status: u16, body: String },
}

/// What a successful send gives back. The provider message id, when present,
/// becomes the journaled message's external id.
#[derive(Debug, Clone)]
pub struct SendReceipt {
    pub message_id: Option<String>,
}

#[derive(Clone)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProviderClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn send_text(
        &self,
        api_key: &str,
        to: &str,
        message: &str,
    ) -> Result<SendReceipt, ProviderError> {
        self.post(
            api_key,
            "/api/send-text",
            json!({ "to": to, "message": message }),
        )
        .await
    }

    pub async fn send_media(
        &self,
        api_key: &str,
        to: &str,
        kind: MediaKind,
        media_url: &str,
        caption: &str,
    ) -> Result<SendReceipt, ProviderError> {
        let (path, url_field) = match kind {
            MediaKind::Image | MediaKind::Sticker => ("/api/send-image", "image_url"),
            MediaKind::Video => ("/api/send-video", "video_url"),
            MediaKind::Audio => ("/api/send-audio", "audio_url"),
            MediaKind::Document => ("/api/send-document", "document_url"),
        };
        let mut body = json!({ "to": to, "caption": caption });
        body[url_field] = json!(media_url);
        self.post(api_key, path, body).await
    }

    async fn post(
        &self,
        api_key: &str,
        path: &str,
        body: Value,
    ) -> Result<SendReceipt, ProviderError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ProviderError::Request(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api { status, body });
        }

        let payload = response.json::<Value>().await.unwrap_or_else(|_| json!({}));
        Ok(SendReceipt {
            message_id: provider_message_id(&payload),
        })
    }
}

fn provider_message_id(payload: &Value) -> Option<String> {
    let data = payload.get("data")?;
    if let Some(id) = data.get("msgId") {
        if let Some(id) = id.as_str() {
            return Some(id.to_string());
        }
        if let Some(id) = id.as_i64() {
            return Some(id.to_string());
        }
    }
    data.get("key")
        .and_then(|k| k.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_id_extraction_handles_both_shapes() {
        assert_eq!(
            provider_message_id(&json!({ "data": { "msgId": "wam.9" } })).as_deref(),
            Some("wam.9")
        );
        assert_eq!(
            provider_message_id(&json!({ "data": { "msgId": 42 } })).as_deref(),
            Some("42")
        );
        assert_eq!(
            provider_message_id(&json!({ "data": { "key": { "id": "wam.10" } } })).as_deref(),
            Some("wam.10")
        );
        assert_eq!(provider_message_id(&json!({ "success": true })), None);
    }
}
