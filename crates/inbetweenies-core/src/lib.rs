//! Pure model, versioning, conflict-resolution, and wire-protocol logic for
//! Inbetweenies sync. No I/O lives here; storage backends and transports are
//! implemented downstream in `inbetweenies-store`, `inbetweenies-client`, and
//! `inbetweenies-server` against the traits in [`store`].

pub mod conflict;
pub mod delta;
pub mod error;
pub mod models;
pub mod protocol;
pub mod search;
pub mod store;
pub mod version;

pub use error::{CoreError, Result};
