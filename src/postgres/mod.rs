// ABOUTME: PostgreSQL adapter for the transfer engine
// ABOUTME: Exports connection management, catalog introspection and the session implementation

pub mod catalog;
pub mod connection;
pub mod session;

pub use catalog::{list_tables, TableInfo};
pub use connection::{connect, connect_with_retry};
pub use session::{PgConnector, PgSession};
