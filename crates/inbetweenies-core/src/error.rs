//! Error types shared by every layer of the sync core.

use thiserror::Error;

/// Result alias used throughout `inbetweenies-core`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised while building or validating the entity/relationship model,
/// or while running the pure version/conflict/delta algorithms.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown relationship type: {0}")]
    UnknownRelationshipType(String),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("relationship {relationship_type} is not valid from {from_type} to {to_type}")]
    InvalidRelationship {
        relationship_type: String,
        from_type: String,
        to_type: String,
    },

    #[error("malformed version string: {0}")]
    MalformedVersion(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
