//! Provider payload classification.
//!
//! Turns the provider's nested webhook envelope into a normalized inbound
//! message. Classification is total: unrecognized kinds degrade to an
//! empty-text message instead of failing the webhook call.

use serde_json::Value;
use thiserror::Error;

use crate::types::{MediaKind, MessageContent};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("envelope carries no message object")]
    MissingMessage,
    #[error("message carries no sender")]
    MissingSender,
}

/// A provider message after envelope extraction and content classification.
/// `external_id` is optional: the pipeline accepts messages without one but can
/// never deduplicate them.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub external_id: Option<String>,
    pub from: String,
    pub push_name: String,
    pub view_once: bool,
    pub quoted_id: Option<String>,
    pub provider_timestamp: Option<i64>,
    pub content: MessageContent,
}

/// Extract one inbound message from a webhook envelope of the shape
/// `{event, data: {messages: {key, pushName, messageTimestamp, message}}}`.
pub fn parse_envelope(payload: &Value) -> Result<InboundMessage, EnvelopeError> {
    let event = payload
        .get("data")
        .and_then(|d| d.get("messages"))
        .ok_or(EnvelopeError::MissingMessage)?;

    let key = event.get("key").cloned().unwrap_or_else(|| Value::Null);
    let from = key
        .get("remoteJid")
        .and_then(Value::as_str)
        .map(|jid| jid.split('@').next().unwrap_or(jid).trim().to_string())
        .filter(|jid| !jid.is_empty())
        .ok_or(EnvelopeError::MissingSender)?;

    let external_id = key
        .get("id")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string);

    let push_name = event
        .get("pushName")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();

    let provider_timestamp = event.get("messageTimestamp").and_then(Value::as_i64);

    let raw_message = event.get("message").cloned().unwrap_or_else(|| Value::Null);
    let (message, view_once) = unwrap_view_once(&raw_message);

    let quoted_id = message
        .get("extendedTextMessage")
        .and_then(|m| m.get("contextInfo"))
        .or_else(|| {
            message
                .as_object()
                .and_then(|obj| obj.values().find_map(|v| v.get("contextInfo")))
        })
        .and_then(|ctx| ctx.get("stanzaId"))
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(InboundMessage {
        external_id,
        from,
        push_name,
        view_once,
        quoted_id,
        provider_timestamp,
        content: classify(&message),
    })
}

/// View-once media arrives wrapped in an extra envelope layer.
fn unwrap_view_once(message: &Value) -> (Value, bool) {
    for wrapper in ["viewOnceMessage", "viewOnceMessageV2"] {
        if let Some(inner) = message.get(wrapper).and_then(|w| w.get("message")) {
            return (inner.clone(), true);
        }
    }
    (message.clone(), false)
}

/// Classify a provider message object into tagged content. Total: anything
/// unrecognized comes back as empty text.
pub fn classify(message: &Value) -> MessageContent {
    if let Some(body) = message.get("conversation").and_then(Value::as_str) {
        return MessageContent::Text {
            body: body.trim().to_string(),
        };
    }

    if let Some(text) = message
        .get("extendedTextMessage")
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
    {
        return MessageContent::Text {
            body: text.trim().to_string(),
        };
    }

    for (field, kind) in [
        ("imageMessage", MediaKind::Image),
        ("videoMessage", MediaKind::Video),
        ("audioMessage", MediaKind::Audio),
        ("documentMessage", MediaKind::Document),
        ("stickerMessage", MediaKind::Sticker),
    ] {
        if let Some(media) = message.get(field) {
            return MessageContent::Media {
                kind,
                url: media
                    .get("url")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                caption: media
                    .get("caption")
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|c| !c.is_empty())
                    .map(str::to_string),
            };
        }
    }

    if let Some(location) = message.get("locationMessage") {
        return MessageContent::Location {
            latitude: location
                .get("degreesLatitude")
                .and_then(Value::as_f64)
                .unwrap_or_default(),
            longitude: location
                .get("degreesLongitude")
                .and_then(Value::as_f64)
                .unwrap_or_default(),
            name: location
                .get("name")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(str::to_string),
        };
    }

    if let Some(contact) = message.get("contactMessage") {
        return classify_contact(contact);
    }

    if let Some(first) = message
        .get("contactsArrayMessage")
        .and_then(|m| m.get("contacts"))
        .and_then(Value::as_array)
        .and_then(|contacts| contacts.first())
    {
        return classify_contact(first);
    }

    if let Some(poll) = message.get("pollCreationMessage") {
        return MessageContent::Poll {
            question: poll
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_string(),
            options: poll
                .get("options")
                .and_then(Value::as_array)
                .map(|options| {
                    options
                        .iter()
                        .filter_map(|o| o.get("optionName").and_then(Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        };
    }

    MessageContent::Text {
        body: String::new(),
    }
}

fn classify_contact(contact: &Value) -> MessageContent {
    let name = contact
        .get("displayName")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    let phone = contact
        .get("vcard")
        .and_then(Value::as_str)
        .and_then(vcard_phone);
    MessageContent::Contact { name, phone }
}

/// Pull the first TEL value out of a vcard blob.
fn vcard_phone(vcard: &str) -> Option<String> {
    vcard
        .lines()
        .find(|line| line.trim_start().starts_with("TEL"))
        .and_then(|line| line.splitn(2, ':').nth(1))
        .map(|phone| phone.trim().to_string())
        .filter(|phone| !phone.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(message: Value) -> Value {
        json!({
            "event": "messages.received",
            "data": {
                "messages": {
                    "key": {
                        "remoteJid": "5551230000@s.whatsapp.net",
                        "fromMe": false,
                        "id": "wam.123"
                    },
                    "pushName": "Alice",
                    "messageTimestamp": 1719999999,
                    "message": message
                }
            }
        })
    }

    #[test]
    fn plain_text_passes_through_verbatim() {
        let parsed = parse_envelope(&envelope(json!({ "conversation": "Hello" }))).unwrap();
        assert_eq!(parsed.external_id.as_deref(), Some("wam.123"));
        assert_eq!(parsed.from, "5551230000");
        assert_eq!(parsed.push_name, "Alice");
        assert_eq!(
            parsed.content,
            MessageContent::Text {
                body: "Hello".to_string()
            }
        );
    }

    #[test]
    fn extended_text_is_text() {
        let content = classify(&json!({
            "extendedTextMessage": { "text": "see this link", "contextInfo": { "stanzaId": "wam.9" } }
        }));
        assert_eq!(
            content,
            MessageContent::Text {
                body: "see this link".to_string()
            }
        );
    }

    #[test]
    fn quoted_reference_is_captured() {
        let parsed = parse_envelope(&envelope(json!({
            "extendedTextMessage": { "text": "replying", "contextInfo": { "stanzaId": "wam.9" } }
        })))
        .unwrap();
        assert_eq!(parsed.quoted_id.as_deref(), Some("wam.9"));
    }

    #[test]
    fn media_kinds_extract_url_and_caption() {
        let content = classify(&json!({
            "imageMessage": { "url": "https://cdn.example/a.jpg", "caption": "receipt" }
        }));
        assert_eq!(
            content,
            MessageContent::Media {
                kind: MediaKind::Image,
                url: Some("https://cdn.example/a.jpg".to_string()),
                caption: Some("receipt".to_string()),
            }
        );

        let sticker = classify(&json!({ "stickerMessage": { "url": "https://cdn.example/s.webp" } }));
        assert_eq!(sticker.message_type(), "sticker");
        assert_eq!(sticker.preview(), "");
    }

    #[test]
    fn location_renders_with_and_without_name() {
        let named = classify(&json!({
            "locationMessage": { "degreesLatitude": -23.55, "degreesLongitude": -46.63, "name": "Office" }
        }));
        assert_eq!(named.preview(), "Location: -23.55, -46.63 (Office)");

        let bare = classify(&json!({
            "locationMessage": { "degreesLatitude": 1.0, "degreesLongitude": 2.0 }
        }));
        assert_eq!(bare.preview(), "Location: 1, 2");
    }

    #[test]
    fn contact_extracts_phone_from_vcard() {
        let content = classify(&json!({
            "contactMessage": {
                "displayName": "Maria",
                "vcard": "BEGIN:VCARD\nVERSION:3.0\nFN:Maria\nTEL;type=CELL:+55 11 99999-0000\nEND:VCARD"
            }
        }));
        assert_eq!(content.preview(), "Contact: Maria (+55 11 99999-0000)");
    }

    #[test]
    fn contacts_array_uses_first_entry() {
        let content = classify(&json!({
            "contactsArrayMessage": {
                "contacts": [
                    { "displayName": "First", "vcard": "TEL:111" },
                    { "displayName": "Second", "vcard": "TEL:222" }
                ]
            }
        }));
        assert_eq!(content.preview(), "Contact: First (111)");
    }

    #[test]
    fn poll_renders_question() {
        let content = classify(&json!({
            "pollCreationMessage": {
                "name": "Lunch today?",
                "options": [ { "optionName": "yes" }, { "optionName": "no" } ]
            }
        }));
        assert_eq!(content.preview(), "Poll: Lunch today?");
        assert_eq!(
            content,
            MessageContent::Poll {
                question: "Lunch today?".to_string(),
                options: vec!["yes".to_string(), "no".to_string()],
            }
        );
    }

    #[test]
    fn unrecognized_kind_falls_back_to_empty_text() {
        let content = classify(&json!({ "reactionMessage": { "text": "👍" } }));
        assert_eq!(
            content,
            MessageContent::Text {
                body: String::new()
            }
        );
    }

    #[test]
    fn view_once_wrapper_is_unwrapped_and_flagged() {
        let parsed = parse_envelope(&envelope(json!({
            "viewOnceMessage": {
                "message": { "imageMessage": { "url": "https://cdn.example/v.jpg" } }
            }
        })))
        .unwrap();
        assert!(parsed.view_once);
        assert_eq!(parsed.content.message_type(), "image");
    }

    #[test]
    fn missing_provider_id_is_signaled_not_fatal() {
        let payload = json!({
            "data": {
                "messages": {
                    "key": { "remoteJid": "5551230000@s.whatsapp.net" },
                    "message": { "conversation": "hi" }
                }
            }
        });
        let parsed = parse_envelope(&payload).unwrap();
        assert!(parsed.external_id.is_none());
    }

    #[test]
    fn missing_sender_is_malformed() {
        let payload = json!({ "data": { "messages": { "message": { "conversation": "hi" } } } });
        assert_eq!(parse_envelope(&payload), Err(EnvelopeError::MissingSender));
    }

    #[test]
    fn missing_message_object_is_malformed() {
        assert_eq!(
            parse_envelope(&json!({ "event": "messages.received" })),
            Err(EnvelopeError::MissingMessage)
        );
    }
}
