//! Persistence layer — libSQL-backed storage for the job aggregate.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{Database, ExtraWorkClaim};
