use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use bazaar_db::models::ProductRow;
use bazaar_db::parse_timestamp;
use bazaar_types::api::{Claims, CreateProductRequest, ProductResponse};

use crate::error::ApiError;
use crate::{parse_uuid, AppState};

pub(crate) fn product_response(row: ProductRow) -> ProductResponse {
    ProductResponse {
        id: parse_uuid(&row.id, "product id"),
        seller_id: parse_uuid(&row.seller_id, "seller_id"),
        name: row.name,
        description: row.description,
        price: row.price,
        image_url: row.image_url,
        created_at: parse_timestamp(&row.created_at),
    }
}

pub async fn create_product(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateProductRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.name.trim().is_empty() {
        return Err(ApiError::Validation("product name is required".into()));
    }
    if !(req.price > 0.0) || !req.price.is_finite() {
        return Err(ApiError::Validation("price must be positive".into()));
    }

    let row = crate::blocking(state, move |db| {
        let seller_id = claims.sub.to_string();
        let is_seller = db
            .get_profile(&seller_id)?
            .map(|p| p.is_seller)
            .unwrap_or(false);
        if !is_seller {
            return Err(ApiError::Forbidden(
                "only seller accounts can list products".into(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        db.insert_product(
            &id,
            &seller_id,
            req.name.trim(),
            req.description.as_deref(),
            req.price,
            req.image_url.as_deref(),
        )?;
        db.get_product(&id)?
            .ok_or_else(|| ApiError::NotFound("product not found".into()))
    })
    .await?;

    Ok((StatusCode::CREATED, Json(product_response(row))))
}

pub async fn list_products(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = crate::blocking(state, move |db| Ok(db.list_products()?)).await?;
    let products: Vec<ProductResponse> = rows.into_iter().map(product_response).collect();
    Ok(Json(products))
}

pub async fn get_product(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let row = crate::blocking(state, move |db| {
        db.get_product(&product_id.to_string())?
            .ok_or_else(|| ApiError::NotFound("product not found".into()))
    })
    .await?;

    Ok(Json(product_response(row)))
}
