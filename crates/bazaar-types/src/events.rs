use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::{MessageResponse, NegotiationResponse};

/// Events pushed to clients over the WebSocket gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, email: String },

    /// A message was appended to a conversation
    MessageCreate { message: MessageResponse },

    /// Messages in a conversation were marked read by `reader_id`
    MessagesRead {
        conversation_id: Uuid,
        reader_id: Uuid,
    },

    /// A buyer opened a price negotiation (targeted at the seller)
    NegotiationCreate { negotiation: NegotiationResponse },

    /// A negotiation was accepted or rejected (targeted at the buyer)
    NegotiationUpdate { negotiation: NegotiationResponse },
}

impl GatewayEvent {
    /// Returns the conversation_id if this event is scoped to a conversation.
    /// Scoped events are only forwarded to clients subscribed to it; `None`
    /// means the event is delivered through targeted per-user channels only.
    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            Self::MessageCreate { message } => Some(message.conversation_id),
            Self::MessagesRead {
                conversation_id, ..
            } => Some(*conversation_id),
            _ => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Replace the set of conversations this client receives events for.
    /// Targeted events (negotiations, notification pokes) arrive regardless.
    Subscribe { conversation_ids: Vec<Uuid> },
}
