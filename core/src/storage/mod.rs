//! Storage layer for Tern Mail

pub mod database;
pub mod migrations;
pub mod persist;

pub use database::{Database, MailCounts, PurgeReport, ThreadSummary};
pub use migrations::MigrationManager;
pub use persist::BatchReport;
