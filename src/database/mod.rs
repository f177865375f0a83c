//! # Database Layer
//!
//! Connection pool construction and schema migrations. All coordination
//! between worker processes happens through the tables these migrations
//! create; there are no in-memory cross-process locks anywhere in the crate.

pub mod connection;
pub mod migrations;

pub use connection::DatabaseConnection;
pub use migrations::DatabaseMigrations;
