//! The sync protocol handler (C6).

mod handler;

pub use handler::{handle_sync, search_entities};
