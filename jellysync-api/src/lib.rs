//! HTTP API for jellysync: webhook intake, status API and health probes.

pub mod http;

pub use http::{create_router, AppState};
