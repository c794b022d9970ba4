//! SQLite-backed graph store: the server-side implementation of
//! `inbetweenies_core::store`'s capability-bundle traits.

mod error;
mod pool;
mod schema;
mod sqlite_store;

pub use error::{Result, StoreError};
pub use pool::create_pool;
pub use sqlite_store::SqliteGraphStore;
