//! Persistence layer: libSQL-backed seen index, backlog and summarizer state.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
