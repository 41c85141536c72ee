//! Persistence layer - durable key/value storage

mod database;

pub use database::Database;
