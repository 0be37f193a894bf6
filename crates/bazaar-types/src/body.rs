use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminator stored in the `message_type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    ProductMention,
    System,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::ProductMention => "product_mention",
            Self::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "product_mention" => Some(Self::ProductMention),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

/// Message body as stored (JSON) and sent over the wire. Each message row
/// carries exactly one variant, selected by `message_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MessageBody {
    Text { text: String },
    ProductMention(ProductMention),
    System { text: String },
}

/// Structured payload for a `product_mention` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductMention {
    pub product_id: Uuid,
    pub name: String,
    pub price: f64,
    pub image_url: Option<String>,
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Text { .. } => MessageKind::Text,
            Self::ProductMention(_) => MessageKind::ProductMention,
            Self::System { .. } => MessageKind::System,
        }
    }

    /// Decode a stored body. A payload that doesn't match its declared kind
    /// degrades to a text body wrapping the raw string rather than failing.
    pub fn from_stored(kind: &str, raw: &str) -> Self {
        let parsed: Option<Self> = serde_json::from_str(raw).ok();
        match (MessageKind::parse(kind), parsed) {
            (Some(k), Some(body)) if body.kind() == k => body,
            _ => Self::Text {
                text: raw.to_string(),
            },
        }
    }

    /// Encode for storage. Serialization of these variants cannot fail.
    pub fn to_stored(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Plain-text rendering, used for previews and log lines.
    pub fn preview(&self) -> String {
        match self {
            Self::Text { text } | Self::System { text } => text.clone(),
            Self::ProductMention(m) => format!("[{}] ${:.2}", m.name, m.price),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_product_mention() {
        let body = MessageBody::ProductMention(ProductMention {
            product_id: Uuid::new_v4(),
            name: "Vintage lamp".into(),
            price: 45.0,
            image_url: None,
        });
        let stored = body.to_stored();
        assert_eq!(MessageBody::from_stored("product_mention", &stored), body);
    }

    #[test]
    fn malformed_payload_degrades_to_text() {
        let body = MessageBody::from_stored("product_mention", "not json at all");
        assert_eq!(
            body,
            MessageBody::Text {
                text: "not json at all".into()
            }
        );
    }

    #[test]
    fn kind_mismatch_degrades_to_text() {
        // Valid JSON, but declared kind disagrees with the payload tag.
        let stored = MessageBody::System {
            text: "offer accepted".into(),
        }
        .to_stored();
        let body = MessageBody::from_stored("text", &stored);
        assert!(matches!(body, MessageBody::Text { .. }));
    }
}
