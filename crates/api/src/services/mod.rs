//! External collaborators consumed by workers.

pub mod auth;

pub use auth::{AuthUser, AuthUserRepository, InMemoryAuthUserRepository, RepositoryError};
