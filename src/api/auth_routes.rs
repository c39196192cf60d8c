//! Authentication endpoints and the bearer-token extractor

use super::{ApiError, ApiResult, AppState};
use crate::auth;
use crate::model::{User, UserRole};
use axum::extract::{FromRequestParts, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Routes under `/api/auth`.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/me", get(me))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
    #[serde(default = "default_role")]
    role: UserRole,
}

fn default_role() -> UserRole {
    UserRole::Operator
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    access_token: String,
    token_type: &'static str,
}

#[derive(Debug, Serialize)]
struct UserResponse {
    id: Uuid,
    username: String,
    email: String,
    role: UserRole,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            role: user.role,
            is_active: user.is_active,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

async fn register(
    State(state): State<AppState>,
    Json(body): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<UserResponse>)> {
    if body.username.trim().is_empty() || body.password.is_empty() {
        return Err(ApiError::bad_request("Username and password are required"));
    }
    let hash = auth::hash_password(&body.password)?;
    let user = state
        .store
        .create_user(body.username.trim(), body.email.trim(), hash, body.role)?;
    Ok((StatusCode::CREATED, Json(user.into())))
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginRequest>,
) -> ApiResult<Json<TokenResponse>> {
    let user = state
        .store
        .find_user_by_username(&body.username)
        .filter(|u| auth::verify_password(&body.password, &u.password_hash))
        .ok_or_else(|| {
            ApiError::new(StatusCode::UNAUTHORIZED, "Incorrect username or password")
        })?;
    if !user.is_active {
        return Err(ApiError::new(StatusCode::UNAUTHORIZED, "User is inactive"));
    }
    let access_token = auth::create_access_token(&state.settings, user.id, &user.username)?;
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer",
    }))
}

async fn me(user: AuthUser) -> Json<UserResponse> {
    Json(user.0.into())
}

/// Extractor for the authenticated user behind a `Bearer` token.
pub struct AuthUser(pub User);

#[axum::async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "Not authenticated"))?;
        let user_id = auth::decode_token(&state.settings, token)?;
        let user = state
            .store
            .get_user(user_id)
            .map_err(|_| ApiError::new(StatusCode::UNAUTHORIZED, "User not found"))?;
        if !user.is_active {
            return Err(ApiError::new(StatusCode::UNAUTHORIZED, "User is inactive"));
        }
        Ok(AuthUser(user))
    }
}
