use axum::{
    extract::State, http::StatusCode, response::IntoResponse, Extension, Json,
};
use uuid::Uuid;

use bazaar_db::models::ConversationListRow;
use bazaar_db::parse_timestamp;
use bazaar_types::api::{Claims, ConversationResponse, StartConversationRequest};

use crate::error::ApiError;
use crate::{parse_uuid, AppState};

fn list_row_response(row: ConversationListRow) -> ConversationResponse {
    ConversationResponse {
        id: parse_uuid(&row.id, "conversation id"),
        buyer_id: parse_uuid(&row.buyer_id, "buyer_id"),
        seller_id: parse_uuid(&row.seller_id, "seller_id"),
        product_id: row.product_id.as_deref().map(|p| parse_uuid(p, "product_id")),
        counterpart_name: row.counterpart_name,
        product_name: row.product_name,
        last_message_at: parse_timestamp(&row.last_message_at),
        created_at: parse_timestamp(&row.created_at),
    }
}

/// Contact-seller entry point: returns the existing conversation for the
/// (buyer, seller, product) triple or creates one.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.seller_id == claims.sub {
        return Err(ApiError::Validation(
            "you cannot start a conversation with yourself".into(),
        ));
    }

    let row = crate::blocking(state, move |db| {
        let buyer = claims.sub.to_string();
        let seller = req.seller_id.to_string();
        let product = req.product_id.map(|p| p.to_string());

        db.get_user_by_id(&seller)?
            .ok_or_else(|| ApiError::NotFound("seller not found".into()))?;

        let product_name = match &product {
            Some(pid) => Some(
                db.get_product(pid)?
                    .ok_or_else(|| ApiError::NotFound("product not found".into()))?
                    .name,
            ),
            None => None,
        };

        let conversation = db.find_or_create_conversation(
            &Uuid::new_v4().to_string(),
            &buyer,
            &seller,
            product.as_deref(),
        )?;
        let counterpart_name = db.resolve_display_name(&seller)?;

        Ok(ConversationListRow {
            id: conversation.id,
            buyer_id: conversation.buyer_id,
            seller_id: conversation.seller_id,
            product_id: conversation.product_id,
            counterpart_name,
            product_name,
            last_message_at: conversation.last_message_at,
            created_at: conversation.created_at,
        })
    })
    .await?;

    Ok((StatusCode::CREATED, Json(list_row_response(row))))
}

/// The requesting user's conversations, newest activity first.
pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = crate::blocking(state, move |db| {
        Ok(db.list_conversations(&claims.sub.to_string())?)
    })
    .await?;

    let conversations: Vec<ConversationResponse> =
        rows.into_iter().map(list_row_response).collect();
    Ok(Json(conversations))
}
