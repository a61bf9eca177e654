//! Queue processors.

pub mod auth;

pub use auth::AuthWorker;
