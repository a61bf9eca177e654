//! HTTP API: server wiring, the queue board and the application queues.

pub mod app;
pub mod config;
pub mod queues;
pub mod services;
pub mod workers;
