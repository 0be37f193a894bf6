use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use serde_json::json;
use uuid::Uuid;

use bazaar_db::models::CartItemRow;
use bazaar_types::api::{AddCartItemRequest, CartItemResponse, Claims};

use crate::error::ApiError;
use crate::{parse_uuid, AppState};

fn cart_item_response(row: CartItemRow) -> CartItemResponse {
    CartItemResponse {
        id: parse_uuid(&row.id, "cart item id"),
        product_id: parse_uuid(&row.product_id, "product_id"),
        product_name: row.product_name,
        price: row.price,
        image_url: row.image_url,
        quantity: row.quantity,
    }
}

/// Adding a product already in the cart adds to its quantity; the row-per-
/// (user, product) constraint is absorbed by the upsert.
pub async fn add_item(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddCartItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.quantity == 0 {
        return Err(ApiError::Validation("quantity must be at least 1".into()));
    }

    let rows = crate::blocking(state, move |db| {
        let user = claims.sub.to_string();
        let pid = req.product_id.to_string();
        db.get_product(&pid)?
            .ok_or_else(|| ApiError::NotFound("product not found".into()))?;

        db.upsert_cart_item(&Uuid::new_v4().to_string(), &user, &pid, req.quantity)?;
        Ok(db.list_cart(&user)?)
    })
    .await?;

    let items: Vec<CartItemResponse> = rows.into_iter().map(cart_item_response).collect();
    Ok((StatusCode::CREATED, Json(items)))
}

pub async fn list_items(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = crate::blocking(state, move |db| Ok(db.list_cart(&claims.sub.to_string())?))
        .await?;

    let items: Vec<CartItemResponse> = rows.into_iter().map(cart_item_response).collect();
    Ok(Json(items))
}

pub async fn remove_item(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = crate::blocking(state, move |db| {
        Ok(db.remove_cart_item(&claims.sub.to_string(), &product_id.to_string())?)
    })
    .await?;

    if removed == 0 {
        return Err(ApiError::NotFound("item not in cart".into()));
    }
    Ok(Json(json!({ "removed": removed })))
}

pub async fn clear(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = crate::blocking(state, move |db| {
        Ok(db.clear_cart(&claims.sub.to_string())?)
    })
    .await?;

    Ok(Json(json!({ "removed": removed })))
}
