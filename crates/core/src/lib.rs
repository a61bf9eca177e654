//! `chatty-core`: identifiers and validation shared by the queue layer and the API.
//!
//! This crate has no infrastructure concerns (no I/O, no async runtime).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{JobId, JobName, QueueName};
