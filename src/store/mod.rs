//! Persistence layer: the `Database` trait, the libSQL backend, and the
//! schema migrations.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::Database;
