use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;
use uuid::Uuid;

use bazaar_db::models::{ConversationRow, MessageRow};
use bazaar_db::parse_timestamp;
use bazaar_types::api::{Claims, MessageResponse, SendMessageRequest};
use bazaar_types::body::MessageBody;
use bazaar_types::events::GatewayEvent;

use crate::error::ApiError;
use crate::{parse_uuid, AppState};

/// Stored row -> wire DTO. The body is re-parsed defensively: a malformed
/// payload renders as plain text instead of failing the listing.
pub(crate) fn message_response(row: MessageRow) -> MessageResponse {
    let body = MessageBody::from_stored(&row.message_type, &row.body);
    MessageResponse {
        id: parse_uuid(&row.id, "message id"),
        conversation_id: parse_uuid(&row.conversation_id, "conversation_id"),
        sender_id: parse_uuid(&row.sender_id, "sender_id"),
        sender_name: row.sender_name,
        message_type: body.kind(),
        body,
        is_read: row.is_read,
        created_at: parse_timestamp(&row.created_at),
    }
}

fn require_participant(
    conversation: &ConversationRow,
    user_id: &str,
) -> Result<(), ApiError> {
    if conversation.buyer_id != user_id && conversation.seller_id != user_id {
        return Err(ApiError::Forbidden(
            "you are not part of this conversation".into(),
        ));
    }
    Ok(())
}

fn participants(conversation: &ConversationRow) -> Vec<Uuid> {
    vec![
        parse_uuid(&conversation.buyer_id, "buyer_id"),
        parse_uuid(&conversation.seller_id, "seller_id"),
    ]
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match &req.body {
        MessageBody::Text { text } if text.trim().is_empty() => {
            return Err(ApiError::Validation("message cannot be empty".into()));
        }
        MessageBody::System { .. } => {
            // System messages are synthesized by the negotiation workflow only.
            return Err(ApiError::Validation(
                "system messages cannot be sent directly".into(),
            ));
        }
        _ => {}
    }

    let dispatcher = state.dispatcher.clone();
    let message_id = Uuid::new_v4();

    let (row, recipients) = crate::blocking(state, move |db| {
        let cid = conversation_id.to_string();
        let sender = claims.sub.to_string();

        let conversation = db
            .get_conversation(&cid)?
            .ok_or_else(|| ApiError::NotFound("conversation not found".into()))?;
        require_participant(&conversation, &sender)?;

        db.insert_message(&message_id.to_string(), &cid, &sender, &req.body)?;
        let row = db
            .get_message(&message_id.to_string())?
            .ok_or_else(|| anyhow::anyhow!("message missing after insert"))?;

        Ok((row, participants(&conversation)))
    })
    .await?;

    let response = message_response(row);
    dispatcher
        .publish_to_conversation(
            conversation_id,
            &recipients,
            GatewayEvent::MessageCreate {
                message: response.clone(),
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(response)))
}

/// Opening a conversation: returns its messages in insertion order and marks
/// everything addressed to the reader as read.
pub async fn list_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let dispatcher = state.dispatcher.clone();
    let reader_id = claims.sub;

    let (rows, recipients, flipped) = crate::blocking(state, move |db| {
        let cid = conversation_id.to_string();
        let reader = claims.sub.to_string();

        let conversation = db
            .get_conversation(&cid)?
            .ok_or_else(|| ApiError::NotFound("conversation not found".into()))?;
        require_participant(&conversation, &reader)?;

        let flipped = db.mark_conversation_read(&cid, &reader)?;
        let rows = db.list_messages(&cid)?;
        Ok((rows, participants(&conversation), flipped))
    })
    .await?;

    if flipped > 0 {
        dispatcher
            .publish_to_conversation(
                conversation_id,
                &recipients,
                GatewayEvent::MessagesRead {
                    conversation_id,
                    reader_id,
                },
            )
            .await;
    }

    let messages: Vec<MessageResponse> = rows.into_iter().map(message_response).collect();
    Ok(Json(messages))
}

/// Bulk action: every unread message addressed to the caller becomes read.
/// Emits a MessagesRead event per affected conversation so open clients
/// (counterpart read receipts, the caller's other sessions) refresh.
pub async fn mark_all_read(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let dispatcher = state.dispatcher.clone();
    let reader_id = claims.sub;

    let (updated, conversation_ids) = crate::blocking(state, move |db| {
        Ok(db.mark_all_read(&claims.sub.to_string())?)
    })
    .await?;

    for cid in &conversation_ids {
        let conversation_id = parse_uuid(cid, "conversation_id");
        dispatcher
            .publish_to_conversation(
                conversation_id,
                &[reader_id],
                GatewayEvent::MessagesRead {
                    conversation_id,
                    reader_id,
                },
            )
            .await;
    }

    Ok(Json(json!({ "updated": updated })))
}
