//! Client-side pieces of Inbetweenies sync: a file-backed local graph store,
//! an HTTP sync client, and a sync state manager.

pub mod error;
pub mod file_store;
pub mod scheduler;
pub mod state;
pub mod sync_client;

pub use error::{Result, SyncError};
pub use file_store::FileGraphStore;
pub use scheduler::{Scheduler, SyncEvent};
pub use state::SyncStateManager;
pub use sync_client::{SyncClient, SyncProgress};
