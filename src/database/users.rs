//! Minimal account store behind the auth endpoints.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{PgPool, Row};
use std::sync::Arc;

use crate::breaker::sql::SqlBreaker;

/// Stored account.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub id: String,
    pub email: String,
    pub password_hash: String,
    pub tenant_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum UserStoreError {
    #[error("email already registered")]
    Duplicate,
    #[error("user store error: {0}")]
    Other(String),
}

/// Account lookups and registration.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn create_user(&self, user: &UserRecord) -> Result<(), UserStoreError>;

    async fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>, UserStoreError>;
}

/// PostgreSQL-backed user store.
#[derive(Debug, Clone)]
pub struct PgUserStore {
    pool: PgPool,
    breaker: SqlBreaker,
}

impl PgUserStore {
    #[must_use]
    pub fn new(pool: PgPool, breaker: SqlBreaker) -> Self {
        Self { pool, breaker }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn create_user(&self, user: &UserRecord) -> Result<(), UserStoreError> {
        let pool = self.pool.clone();
        let u = user.clone();
        let result = self
            .breaker
            .execute(|| async move {
                sqlx::query(
                    "INSERT INTO users (id, email, password_hash, tenant_id, created_at) \
                     VALUES ($1, $2, $3, $4, $5)",
                )
                .bind(&u.id)
                .bind(&u.email)
                .bind(&u.password_hash)
                .bind(&u.tenant_id)
                .bind(u.created_at)
                .execute(&pool)
                .await
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) => {
                let is_duplicate = e
                    .into_inner()
                    .and_then(|inner| inner.as_database_error().map(|db| db.is_unique_violation()))
                    .unwrap_or(false);
                if is_duplicate {
                    Err(UserStoreError::Duplicate)
                } else {
                    Err(UserStoreError::Other("user insert failed".to_string()))
                }
            }
        }
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>, UserStoreError> {
        let pool = self.pool.clone();
        let email = email.to_string();
        let row = self
            .breaker
            .execute(|| async move {
                sqlx::query(
                    "SELECT id, email, password_hash, tenant_id, created_at \
                     FROM users WHERE email = $1",
                )
                .bind(&email)
                .fetch_optional(&pool)
                .await
            })
            .await
            .map_err(|e| UserStoreError::Other(e.to_string()))?;

        row.map(|row| {
            Ok(UserRecord {
                id: row.try_get("id").map_err(|e| UserStoreError::Other(e.to_string()))?,
                email: row
                    .try_get("email")
                    .map_err(|e| UserStoreError::Other(e.to_string()))?,
                password_hash: row
                    .try_get("password_hash")
                    .map_err(|e| UserStoreError::Other(e.to_string()))?,
                tenant_id: row
                    .try_get("tenant_id")
                    .map_err(|e| UserStoreError::Other(e.to_string()))?,
                created_at: row
                    .try_get("created_at")
                    .map_err(|e| UserStoreError::Other(e.to_string()))?,
            })
        })
        .transpose()
    }
}

/// In-memory user store for tests and embedded runs.
#[derive(Debug, Default)]
pub struct MemoryUserStore {
    users: Mutex<Vec<UserRecord>>,
}

impl MemoryUserStore {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl UserStore for MemoryUserStore {
    async fn create_user(&self, user: &UserRecord) -> Result<(), UserStoreError> {
        let mut users = self.users.lock();
        if users.iter().any(|u| u.email == user.email) {
            return Err(UserStoreError::Duplicate);
        }
        users.push(user.clone());
        Ok(())
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<UserRecord>, UserStoreError> {
        Ok(self.users.lock().iter().find(|u| u.email == email).cloned())
    }
}
