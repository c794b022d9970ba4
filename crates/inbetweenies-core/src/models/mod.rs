//! The shared data model: entities, relationships, and sync bookkeeping.

mod entity;
mod relationship;
mod sync_metadata;

pub use entity::{Entity, EntityType, SourceType};
pub use relationship::{EntityRelationship, RelationshipType};
pub use sync_metadata::{ChangeType, PendingChange, SyncMetadata, VectorClock};
