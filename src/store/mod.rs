//! Persistence layer: libSQL-backed storage for conversations, leads, and
//! the outbound campaign.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
