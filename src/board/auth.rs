//! Password hashing, bearer sessions and the access guards used by the
//! route handlers.
//!
//! Guards are plain predicates over the caller and the resource; handlers
//! turn a `false` into `ApiError::Forbidden`.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};

use super::api::{ApiError, SharedState};
use super::db::DbHandle;
use super::models::{Comment, Project, Task, User};
use crate::errors::BoardError;

/// Hex-encoded SHA-256 of `salt || password`.
pub fn hash_password(password: &str, salt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn verify_password(password: &str, salt: &str, expected_hash: &str) -> bool {
    hash_password(password, salt) == expected_hash
}

/// Fresh random salt for a new password.
pub fn new_salt() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Fresh random session token.
pub fn new_session_token() -> String {
    format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    )
}

/// Lowercased, trimmed email; `None` if it is obviously not an address.
pub fn normalize_email(email: &str) -> Option<String> {
    let email = email.trim().to_lowercase();
    let (local, domain) = email.split_once('@')?;
    if local.is_empty() || domain.is_empty() || domain.contains('@') || email.contains(' ') {
        return None;
    }
    Some(email)
}

pub fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}

// ── Access guards ─────────────────────────────────────────────────────

pub fn can_view_project(user: &User, project: &Project, is_member: bool) -> bool {
    user.is_admin() || project.owner_id == user.id || is_member
}

pub fn can_manage_project(user: &User, project: &Project) -> bool {
    user.is_admin() || project.owner_id == user.id
}

pub fn can_edit_task(user: &User, task: &Task, project: &Project) -> bool {
    user.is_admin()
        || project.owner_id == user.id
        || task.creator_id == user.id
        || task.assignee_id == Some(user.id)
}

pub fn can_edit_comment(user: &User, comment: &Comment) -> bool {
    user.is_admin() || comment.author_id == Some(user.id)
}

/// Resolve a session token to its user, or fail with `Unauthenticated`.
pub async fn session_user(db: &DbHandle, token: String) -> anyhow::Result<User> {
    db.call(move |db| db.get_session_user(&token))
        .await?
        .ok_or_else(|| BoardError::Unauthenticated("Session expired or invalid".into()).into())
}

// ── Extractor ─────────────────────────────────────────────────────────

/// The authenticated caller, resolved from `Authorization: Bearer <token>`.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub token: String,
}

impl AuthUser {
    pub fn require_admin(&self) -> Result<(), ApiError> {
        if self.user.is_admin() {
            Ok(())
        } else {
            Err(ApiError::Forbidden("Admin access required".into()))
        }
    }
}

impl FromRequestParts<SharedState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| BoardError::Unauthenticated("Missing bearer token".into()))?;
        let user = session_user(&state.db, token.clone()).await?;
        Ok(AuthUser { user, token })
    }
}
