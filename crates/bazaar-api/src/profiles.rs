use axum::{extract::State, response::IntoResponse, Extension, Json};

use bazaar_db::models::ProfileRow;
use bazaar_types::api::{Claims, ProfileResponse, UpdateProfileRequest};

use crate::error::ApiError;
use crate::{parse_uuid, AppState};

fn profile_response(row: ProfileRow) -> ProfileResponse {
    ProfileResponse {
        user_id: parse_uuid(&row.user_id, "user_id"),
        full_name: row.full_name,
        email: row.email,
        phone: row.phone,
        is_seller: row.is_seller,
        address: row.address,
    }
}

/// Own profile, created lazily if this is the first authenticated access.
pub async fn get_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let row = crate::blocking(state, move |db| {
        db.ensure_profile(&claims.sub.to_string(), &claims.email, None)?;
        db.get_profile(&claims.sub.to_string())?
            .ok_or_else(|| ApiError::NotFound("profile not found".into()))
    })
    .await?;

    Ok(Json(profile_response(row)))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(name) = &req.full_name {
        if name.trim().is_empty() {
            return Err(ApiError::Validation("name cannot be empty".into()));
        }
    }

    let row = crate::blocking(state, move |db| {
        let user_id = claims.sub.to_string();
        db.ensure_profile(&user_id, &claims.email, None)?;
        db.update_profile(
            &user_id,
            req.full_name.as_deref(),
            req.phone.as_deref(),
            req.is_seller,
            req.address.as_deref(),
        )?;
        db.get_profile(&user_id)?
            .ok_or_else(|| ApiError::NotFound("profile not found".into()))
    })
    .await?;

    Ok(Json(profile_response(row)))
}
