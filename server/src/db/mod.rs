//! Database module: Postgres connection pool and the persistent storage
//! adapter built on top of it.

pub mod checkpoint;
mod pool;
mod postgres;

pub use pool::*;
pub use postgres::PostgresAdapter;
