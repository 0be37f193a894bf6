use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use uuid::Uuid;

use bazaar_db::models::ReviewRow;
use bazaar_db::parse_timestamp;
use bazaar_types::api::{Claims, CreateReviewRequest, ReviewResponse};

use crate::error::ApiError;
use crate::{parse_uuid, AppState};

fn review_response(row: ReviewRow) -> ReviewResponse {
    ReviewResponse {
        id: parse_uuid(&row.id, "review id"),
        product_id: parse_uuid(&row.product_id, "product_id"),
        user_id: parse_uuid(&row.user_id, "user_id"),
        reviewer_name: row.reviewer_name,
        rating: row.rating,
        comment: row.comment,
        created_at: parse_timestamp(&row.created_at),
    }
}

/// One review per (product, user); a duplicate is a 409, not a fault.
pub async fn create_review(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateReviewRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(1..=5).contains(&req.rating) {
        return Err(ApiError::Validation("rating must be 1-5".into()));
    }

    let rows = crate::blocking(state, move |db| {
        let pid = product_id.to_string();
        db.get_product(&pid)?
            .ok_or_else(|| ApiError::NotFound("product not found".into()))?;

        let inserted = db.insert_review(
            &Uuid::new_v4().to_string(),
            &pid,
            &claims.sub.to_string(),
            req.rating,
            req.comment.as_deref(),
        )?;
        if !inserted {
            return Err(ApiError::Conflict(
                "you have already reviewed this product".into(),
            ));
        }
        Ok(db.list_reviews(&pid)?)
    })
    .await?;

    let reviews: Vec<ReviewResponse> = rows.into_iter().map(review_response).collect();
    Ok((StatusCode::CREATED, Json(reviews)))
}

pub async fn list_reviews(
    State(state): State<AppState>,
    Path(product_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let rows = crate::blocking(state, move |db| {
        Ok(db.list_reviews(&product_id.to_string())?)
    })
    .await?;

    let reviews: Vec<ReviewResponse> = rows.into_iter().map(review_response).collect();
    Ok(Json(reviews))
}
