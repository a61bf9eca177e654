//! Application queues.

pub mod auth;

pub use auth::{AUTH_QUEUE, AuthJob, AuthQueue};
