use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use bazaar_db::models::{NegotiationRow, ResolveOutcome};
use bazaar_db::parse_timestamp;
use bazaar_types::api::{
    Claims, NegotiationDecision, NegotiationResponse, NegotiationStatus, ProposePriceRequest,
    ResolveNegotiationRequest,
};
use bazaar_types::events::GatewayEvent;

use crate::error::ApiError;
use crate::messages::message_response;
use crate::{parse_uuid, AppState};

pub(crate) fn negotiation_response(row: NegotiationRow) -> NegotiationResponse {
    NegotiationResponse {
        id: parse_uuid(&row.id, "negotiation id"),
        product_id: parse_uuid(&row.product_id, "product_id"),
        product_name: row.product_name,
        buyer_id: parse_uuid(&row.buyer_id, "buyer_id"),
        buyer_name: row.buyer_name,
        seller_id: parse_uuid(&row.seller_id, "seller_id"),
        original_price: row.original_price,
        proposed_price: row.proposed_price,
        message: row.message,
        status: NegotiationStatus::parse(&row.status).unwrap_or(NegotiationStatus::Pending),
        created_at: parse_timestamp(&row.created_at),
        updated_at: parse_timestamp(&row.updated_at),
    }
}

/// Proposal preconditions, checked before any row is written: a positive
/// finite price and distinct parties.
fn validate_proposal(
    proposed_price: f64,
    buyer_id: &str,
    seller_id: &str,
) -> Result<(), ApiError> {
    if !(proposed_price > 0.0) || !proposed_price.is_finite() {
        return Err(ApiError::Validation(
            "proposed price must be positive".into(),
        ));
    }
    if buyer_id == seller_id {
        return Err(ApiError::Validation(
            "you cannot make an offer on your own product".into(),
        ));
    }
    Ok(())
}

/// Buyer proposes a price against a product. The product's listed price is
/// captured as original_price at proposal time.
pub async fn propose_price(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ProposePriceRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let dispatcher = state.dispatcher.clone();

    let row = crate::blocking(state, move |db| {
        let buyer = claims.sub.to_string();
        let product = db
            .get_product(&req.product_id.to_string())?
            .ok_or_else(|| ApiError::NotFound("product not found".into()))?;

        validate_proposal(req.proposed_price, &buyer, &product.seller_id)?;

        let id = Uuid::new_v4().to_string();
        db.insert_negotiation(
            &id,
            &product.id,
            &buyer,
            &product.seller_id,
            product.price,
            req.proposed_price,
            req.message.as_deref(),
        )?;
        Ok(db.get_negotiation(&id)?
            .ok_or_else(|| anyhow::anyhow!("negotiation missing after insert"))?)
    })
    .await?;

    let response = negotiation_response(row);
    dispatcher
        .send_to_user(
            response.seller_id,
            GatewayEvent::NegotiationCreate {
                negotiation: response.clone(),
            },
        )
        .await;

    Ok((StatusCode::CREATED, Json(response)))
}

pub async fn list_negotiations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = crate::blocking(state, move |db| {
        Ok(db.list_negotiations_for_user(&claims.sub.to_string())?)
    })
    .await?;

    let negotiations: Vec<NegotiationResponse> =
        rows.into_iter().map(negotiation_response).collect();
    Ok(Json(negotiations))
}

/// Seller accepts or rejects. The transition is one-shot: a second resolve is
/// a 409, and the synthesized system message is written exactly once, in the
/// same storage transaction as the status change.
pub async fn resolve_negotiation(
    State(state): State<AppState>,
    Path(negotiation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ResolveNegotiationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let dispatcher = state.dispatcher.clone();
    let accept = matches!(req.decision, NegotiationDecision::Accept);

    let (row, system_message, conversation_id) = crate::blocking(state, move |db| {
        let outcome = db.resolve_negotiation(
            &negotiation_id.to_string(),
            &claims.sub.to_string(),
            accept,
            &Uuid::new_v4().to_string(),
            &Uuid::new_v4().to_string(),
        )?;

        let (conversation_id, system_message_id) = match outcome {
            ResolveOutcome::Resolved {
                conversation_id,
                system_message_id,
            } => (conversation_id, system_message_id),
            ResolveOutcome::AlreadyResolved => {
                return Err(ApiError::Conflict("negotiation already resolved".into()))
            }
            ResolveOutcome::NotSeller => {
                return Err(ApiError::Forbidden(
                    "only the seller can resolve this negotiation".into(),
                ))
            }
            ResolveOutcome::NotFound => {
                return Err(ApiError::NotFound("negotiation not found".into()))
            }
        };

        let row = db
            .get_negotiation(&negotiation_id.to_string())?
            .ok_or_else(|| anyhow::anyhow!("negotiation missing after resolve"))?;
        let message = db
            .get_message(&system_message_id)?
            .ok_or_else(|| anyhow::anyhow!("system message missing after resolve"))?;

        Ok((row, message, conversation_id))
    })
    .await?;

    let response = negotiation_response(row);
    let message = message_response(system_message);

    // The buyer learns the outcome both ways: a targeted negotiation update
    // and the system message in the conversation.
    dispatcher
        .send_to_user(
            response.buyer_id,
            GatewayEvent::NegotiationUpdate {
                negotiation: response.clone(),
            },
        )
        .await;
    dispatcher
        .publish_to_conversation(
            parse_uuid(&conversation_id, "conversation_id"),
            &[response.buyer_id, response.seller_id],
            GatewayEvent::MessageCreate { message },
        )
        .await;

    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;

    // validate_proposal gates insert_negotiation in propose_price, so a
    // rejection here means no row is ever written.

    #[test]
    fn zero_and_negative_prices_fail_validation() {
        for price in [0.0, -1.0, -250.0] {
            let err = validate_proposal(price, "buyer", "seller").unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)), "price {price}");
        }
    }

    #[test]
    fn non_finite_prices_fail_validation() {
        for price in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = validate_proposal(price, "buyer", "seller").unwrap_err();
            assert!(matches!(err, ApiError::Validation(_)));
        }
    }

    #[test]
    fn offers_on_own_product_fail_validation() {
        let err = validate_proposal(50.0, "same-user", "same-user").unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
    }

    #[test]
    fn positive_price_between_distinct_parties_passes() {
        assert!(validate_proposal(80.0, "buyer", "seller").is_ok());
    }
}
