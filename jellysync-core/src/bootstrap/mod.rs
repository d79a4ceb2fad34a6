//! Startup wiring: configuration, database, service graph.

pub mod config;
pub mod database;
pub mod services;

pub use config::load_config;
pub use database::{init_database, run_migrations};
pub use services::{init_services, Services};
