//! Auth user persistence.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Auth record written by the `addAuthUserToDB` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    #[serde(rename = "_id")]
    pub id: String,
    pub u_id: String,
    pub username: String,
    pub email: String,
    /// Already hashed by the signup flow
    pub password: String,
    pub avatar_color: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("auth user already exists: {0}")]
    Duplicate(String),

    #[error("auth user store unavailable: {0}")]
    Unavailable(String),
}

/// Document store for auth users.
#[async_trait]
pub trait AuthUserRepository: Send + Sync {
    async fn create_auth_user(&self, user: AuthUser) -> Result<(), RepositoryError>;

    async fn find_by_username(&self, username: &str) -> Result<Option<AuthUser>, RepositoryError>;
}

/// In-memory auth user store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryAuthUserRepository {
    users: RwLock<HashMap<String, AuthUser>>,
}

impl InMemoryAuthUserRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.users.read().map(|u| u.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl AuthUserRepository for InMemoryAuthUserRepository {
    async fn create_auth_user(&self, user: AuthUser) -> Result<(), RepositoryError> {
        let mut users = self
            .users
            .write()
            .map_err(|_| RepositoryError::Unavailable("lock poisoned".into()))?;

        let key = user.username.to_lowercase();
        if users.contains_key(&key) {
            return Err(RepositoryError::Duplicate(user.username));
        }
        users.insert(key, user);
        Ok(())
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<AuthUser>, RepositoryError> {
        let users = self
            .users
            .read()
            .map_err(|_| RepositoryError::Unavailable("lock poisoned".into()))?;
        Ok(users.get(&username.to_lowercase()).cloned())
    }
}

#[cfg(test)]
pub(crate) fn test_user(username: &str) -> AuthUser {
    AuthUser {
        id: format!("auth-{username}"),
        u_id: "12345".into(),
        username: username.into(),
        email: format!("{username}@example.com"),
        password: "$2a$10$hash".into(),
        avatar_color: "red".into(),
        created_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn usernames_are_unique_case_insensitively() {
        let repo = InMemoryAuthUserRepository::new();
        repo.create_auth_user(test_user("alice")).await.unwrap();

        let err = repo.create_auth_user(test_user("Alice")).await.unwrap_err();
        assert!(matches!(err, RepositoryError::Duplicate(_)));
        assert_eq!(repo.len(), 1);

        let found = repo.find_by_username("ALICE").await.unwrap().unwrap();
        assert_eq!(found.email, "alice@example.com");
    }

    #[test]
    fn auth_user_uses_document_field_names() {
        let json = serde_json::to_value(test_user("bob")).unwrap();
        assert_eq!(json["_id"], "auth-bob");
        assert_eq!(json["uId"], "12345");
        assert_eq!(json["avatarColor"], "red");
    }
}
