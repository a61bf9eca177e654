//! HTTP application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backing store, queue registry and application queues
//! - `routes/`: HTTP routes + handlers
//! - `errors.rs`: consistent error responses

use std::sync::Arc;

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use chatty_queue::QueueRegistry;

pub mod errors;
pub mod routes;
pub mod services;

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(registry: Arc<QueueRegistry>) -> Router {
    Router::new()
        .route("/health", get(routes::system::health))
        .nest("/queues", routes::queues::router())
        .layer(ServiceBuilder::new().layer(Extension(registry)))
}
