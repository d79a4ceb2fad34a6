//! Core library for jellysync: keeps per-user playback state (watched
//! status, position, favorites, ratings, play counts, stream selections)
//! consistent across a fleet of media servers that share storage but keep
//! separate databases.
//!
//! The pipeline: inbound webhooks are parsed into sync intents, fanned out
//! into a durable SQLite-backed queue, and a background worker applies each
//! one to its target peer through a typed REST client, with cooldown-based
//! loop suppression and read-before-write skips.

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod peer;
pub mod repository;
pub mod service;

pub use config::Config;
pub use error::{Error, Result};

#[cfg(test)]
pub(crate) mod test_support;
