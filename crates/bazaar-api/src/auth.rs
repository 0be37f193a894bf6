use std::sync::Arc;

use argon2::{
    password_hash::{rand_core::OsRng, SaltString},
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
};
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use jsonwebtoken::{encode, EncodingKey, Header};
use uuid::Uuid;

use bazaar_db::Database;
use bazaar_gateway::dispatcher::Dispatcher;
use bazaar_types::api::{
    Claims, LoginRequest, LoginResponse, RegisterRequest, RegisterResponse,
};

use crate::error::ApiError;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    /// Shared with the gateway, which checks conversation membership on
    /// Subscribe.
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub dispatcher: Dispatcher,
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.email.contains('@') || req.email.len() < 3 {
        return Err(ApiError::Validation("a valid email is required".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation(
            "password must be at least 8 characters".into(),
        ));
    }

    let jwt_secret = state.jwt_secret.clone();
    let user_id = Uuid::new_v4();
    let email = req.email.clone();

    crate::blocking(state, move |db| {
        if db.get_user_by_email(&req.email)?.is_some() {
            return Err(ApiError::Conflict("email already registered".into()));
        }

        // Hash password with Argon2id
        let salt = SaltString::generate(&mut OsRng);
        let password_hash = Argon2::default()
            .hash_password(req.password.as_bytes(), &salt)
            .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?
            .to_string();

        db.create_user(&user_id.to_string(), &req.email, &password_hash)?;
        db.ensure_profile(&user_id.to_string(), &req.email, req.full_name.as_deref())?;

        Ok(())
    })
    .await?;

    let token = create_token(&jwt_secret, user_id, &email)?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let jwt_secret = state.jwt_secret.clone();

    let (user_id, email) = crate::blocking(state, move |db| {
        let user = db
            .get_user_by_email(&req.email)?
            .ok_or(ApiError::Unauthorized)?;

        let parsed_hash = PasswordHash::new(&user.password)
            .map_err(|e| anyhow::anyhow!("stored hash unreadable: {}", e))?;
        Argon2::default()
            .verify_password(req.password.as_bytes(), &parsed_hash)
            .map_err(|_| ApiError::Unauthorized)?;

        // Lazy profile creation on first authenticated access
        db.ensure_profile(&user.id, &user.email, None)?;

        let user_id: Uuid = user
            .id
            .parse()
            .map_err(|e| anyhow::anyhow!("corrupt user id '{}': {}", user.id, e))?;
        Ok((user_id, user.email))
    })
    .await?;

    let token = create_token(&jwt_secret, user_id, &email)?;

    Ok(Json(LoginResponse {
        user_id,
        email,
        token,
    }))
}

fn create_token(secret: &str, user_id: Uuid, email: &str) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user_id,
        email: email.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(30)).timestamp() as usize,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| anyhow::anyhow!("token encoding failed: {}", e))?;

    Ok(token)
}
