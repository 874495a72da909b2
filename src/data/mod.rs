//! Data layer module
//!
//! Handles all data persistence:
//! - SQLite database operations
//! - Account, delivery, publish and syndication models

mod database;
mod models;

pub use database::{Database, LeaseOutcome, PollStart};
pub use models::*;

#[cfg(test)]
mod database_test;
