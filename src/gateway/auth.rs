//! Minimal account endpoints.
//!
//! `POST /api/auth/register` and `POST /api/auth/login`. Passwords are
//! argon2-hashed at rest; login issues a JWT carrying the user id and
//! tenant. Credential failures are reported uniformly as 401 without
//! revealing which part was wrong.

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::post, Json, Router};
use serde::{Deserialize, Serialize};

use argon2::password_hash::{rand_core::OsRng, PasswordHash, SaltString};
use argon2::{Argon2, PasswordHasher, PasswordVerifier};
use jsonwebtoken::{encode, EncodingKey, Header};

use crate::database::{UserRecord, UserStoreError};
use crate::error::ApiError;
use crate::AppState;

/// Auth routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
}

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID).
    pub sub: String,
    /// Expiration time (Unix timestamp).
    pub exp: i64,
    /// Issued at (Unix timestamp).
    pub iat: i64,
    /// Optional tenant ID for multi-tenancy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
}

/// Register a new account.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !req.email.contains('@') {
        return Err(ApiError::validation("invalid email address"));
    }
    if req.password.len() < 8 {
        return Err(ApiError::validation(
            "password must be at least 8 characters",
        ));
    }

    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| {
            tracing::error!(error = %e, "Password hashing failed");
            ApiError::internal("registration failed")
        })?
        .to_string();

    let user = UserRecord {
        id: uuid::Uuid::new_v4().to_string(),
        email: req.email.to_lowercase(),
        password_hash,
        tenant_id: req.tenant_id,
        created_at: chrono::Utc::now(),
    };

    match state.users.create_user(&user).await {
        Ok(()) => Ok((
            StatusCode::CREATED,
            Json(RegisterResponse {
                user_id: user.id,
                email: user.email,
            }),
        )),
        Err(UserStoreError::Duplicate) => Err(ApiError::conflict("email already registered")),
        Err(UserStoreError::Other(e)) => {
            tracing::error!(error = %e, "User creation failed");
            Err(ApiError::internal("registration failed"))
        }
    }
}

/// Log in and receive a JWT.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = state
        .users
        .get_by_email(&req.email.to_lowercase())
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "User lookup failed");
            ApiError::internal("login failed")
        })?
        .ok_or_else(ApiError::unauthorized)?;

    let parsed = PasswordHash::new(&user.password_hash).map_err(|e| {
        tracing::error!(error = %e, "Stored password hash unreadable");
        ApiError::internal("login failed")
    })?;
    if Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed)
        .is_err()
    {
        return Err(ApiError::unauthorized());
    }

    let expiry_secs = state.config.gateway.token_expiry_secs;
    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        sub: user.id,
        exp: now + i64::try_from(expiry_secs).unwrap_or(i64::MAX),
        iat: now,
        tenant_id: user.tenant_id,
    };
    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(state.config.gateway.jwt_secret.as_bytes()),
    )
    .map_err(|e| {
        tracing::error!(error = %e, "JWT signing failed");
        ApiError::internal("login failed")
    })?;

    Ok(Json(LoginResponse {
        token,
        token_type: "Bearer",
        expires_in: expiry_secs,
    }))
}
