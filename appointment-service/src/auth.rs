//! Accounts, bearer sessions and role checks.
//!
//! Passwords are stored as argon2 PHC strings. A login issues an opaque
//! random token that is looked up on every request; there is no refresh,
//! the client logs in again once the session expires.

use std::sync::Arc;
use std::time::Duration;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use shared::{Identity, Role};
use tracing::{debug, info};

use crate::api::AppState;
use crate::clock::Clock;
use crate::error::{ServiceError, StoreError, UniqueKey};
use crate::store::{bounded, AccountStore, NewUser, SessionRecord};

const TOKEN_LENGTH: usize = 48;
const INVALID_CREDENTIALS: &str = "invalid credentials";

#[derive(Debug, Clone, PartialEq)]
pub struct LoginSession {
    pub identity: Identity,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Promotion {
    Created(Identity),
    Promoted(Identity),
}

pub struct AuthService {
    accounts: Arc<dyn AccountStore>,
    clock: Arc<dyn Clock>,
    session_ttl: chrono::Duration,
    store_timeout: Duration,
    hasher: Argon2<'static>,
}

impl AuthService {
    pub fn new(
        accounts: Arc<dyn AccountStore>,
        clock: Arc<dyn Clock>,
        session_ttl: chrono::Duration,
        store_timeout: Duration,
        params: Params,
    ) -> Self {
        Self {
            accounts,
            clock,
            session_ttl,
            store_timeout,
            hasher: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        }
    }

    /// Creates a patient account. Self-registration never grants admin.
    pub async fn register(&self, username: &str, password: &str) -> Result<Identity, ServiceError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(ServiceError::validation("username and password are required"));
        }

        let password_hash = self.hash_password(password).await?;
        let user = NewUser {
            username: username.to_string(),
            password_hash,
            role: Role::Patient,
        };

        match bounded(self.store_timeout, self.accounts.insert_user(user)).await {
            Ok(record) => {
                info!("Registered patient {}", record.username);
                Ok(record.identity())
            }
            Err(StoreError::Duplicate(UniqueKey::Username)) => {
                Err(ServiceError::conflict("username already exists"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Unknown usernames and wrong passwords fail with the same message.
    pub async fn login(&self, username: &str, password: &str) -> Result<LoginSession, ServiceError> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(ServiceError::validation("username and password are required"));
        }

        let user = bounded(self.store_timeout, self.accounts.find_user(username))
            .await?
            .ok_or_else(|| ServiceError::Unauthorized(INVALID_CREDENTIALS.to_string()))?;
        if !self.verify_password(&user.password_hash, password).await? {
            return Err(ServiceError::Unauthorized(INVALID_CREDENTIALS.to_string()));
        }

        let session = SessionRecord {
            token: new_token(),
            user_id: user.id,
            expires_at: self.clock.now() + self.session_ttl,
        };
        bounded(self.store_timeout, self.accounts.insert_session(session.clone())).await?;
        debug!("Issued session for {}", user.username);

        Ok(LoginSession {
            identity: user.identity(),
            token: session.token,
            expires_at: session.expires_at,
        })
    }

    /// Resolves a bearer token. Expired sessions are removed on sight.
    pub async fn identify(&self, token: &str) -> Result<Option<Identity>, ServiceError> {
        let Some((session, user)) = bounded(self.store_timeout, self.accounts.find_session(token)).await? else {
            return Ok(None);
        };

        if session.expires_at <= self.clock.now() {
            bounded(self.store_timeout, self.accounts.delete_session(token)).await?;
            return Ok(None);
        }
        Ok(Some(user.identity()))
    }

    pub async fn logout(&self, token: &str) -> Result<(), ServiceError> {
        bounded(self.store_timeout, self.accounts.delete_session(token)).await?;
        Ok(())
    }

    /// Grants admin to `username`, optionally resetting its password. An
    /// unknown user is created when a password is supplied.
    pub async fn promote_admin(&self, username: &str, password: Option<&str>) -> Result<Promotion, ServiceError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(ServiceError::validation("username is required"));
        }
        let password_hash = match password.filter(|p| !p.is_empty()) {
            Some(p) => Some(self.hash_password(p).await?),
            None => None,
        };

        match bounded(self.store_timeout, self.accounts.find_user(username)).await? {
            Some(user) => {
                let updated = bounded(
                    self.store_timeout,
                    self.accounts.update_user(user.id, Role::Admin, password_hash),
                )
                .await?;
                info!("Promoted {} to admin", updated.username);
                Ok(Promotion::Promoted(updated.identity()))
            }
            None => {
                let Some(password_hash) = password_hash else {
                    return Err(ServiceError::not_found(
                        "user not found; provide a password to create it",
                    ));
                };
                let user = NewUser {
                    username: username.to_string(),
                    password_hash,
                    role: Role::Admin,
                };
                let created = bounded(self.store_timeout, self.accounts.insert_user(user)).await?;
                info!("Created admin {}", created.username);
                Ok(Promotion::Created(created.identity()))
            }
        }
    }

    async fn hash_password(&self, password: &str) -> Result<String, ServiceError> {
        let hasher = self.hasher.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut rand::rngs::OsRng);
            hasher
                .hash_password(password.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|e| ServiceError::Internal(format!("password hashing failed: {e}")))
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("password hashing task failed: {e}")))?
    }

    async fn verify_password(&self, stored: &str, password: &str) -> Result<bool, ServiceError> {
        let hasher = self.hasher.clone();
        let stored = stored.to_string();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let parsed = PasswordHash::new(&stored)
                .map_err(|e| ServiceError::Internal(format!("stored password hash is invalid: {e}")))?;
            Ok(hasher.verify_password(password.as_bytes(), &parsed).is_ok())
        })
        .await
        .map_err(|e| ServiceError::Internal(format!("password verification task failed: {e}")))?
    }
}

fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LENGTH)
        .map(char::from)
        .collect()
}

fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn require_role(identity: Identity, role: Role) -> Result<Identity, ServiceError> {
    if identity.role == role {
        Ok(identity)
    } else {
        Err(ServiceError::Forbidden("forbidden, you do not have access".to_string()))
    }
}

/// Any signed-in user, with the token that identified them.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub identity: Identity,
    pub token: String,
}

#[derive(Debug, Clone)]
pub struct AdminUser(pub Identity);

#[derive(Debug, Clone)]
pub struct PatientUser(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| ServiceError::Unauthorized("unauthorized, no token provided".to_string()))?
            .to_string();
        let identity = state
            .auth
            .identify(&token)
            .await?
            .ok_or_else(|| ServiceError::Unauthorized("invalid or expired token".to_string()))?;
        Ok(Self { identity, token })
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth = Authenticated::from_request_parts(parts, state).await?;
        require_role(auth.identity, Role::Admin).map(AdminUser)
    }
}

#[async_trait]
impl FromRequestParts<AppState> for PatientUser {
    type Rejection = ServiceError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let auth = Authenticated::from_request_parts(parts, state).await?;
        require_role(auth.identity, Role::Patient).map(PatientUser)
    }
}
