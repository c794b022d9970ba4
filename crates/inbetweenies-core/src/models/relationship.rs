//! Relationship model: a directed, typed edge between two specific entity
//! versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::entity::EntityType;
use crate::error::{CoreError, Result};

/// Types of edges between entities. Closed set, same rule as `EntityType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    LocatedIn,
    Controls,
    ConnectsTo,
    PartOf,
    Manages,
    DocumentedBy,
    ProcedureFor,
    TriggeredBy,
    DependsOn,
    ContainedIn,
    Monitors,
    Automates,
}

impl RelationshipType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationshipType::LocatedIn => "located_in",
            RelationshipType::Controls => "controls",
            RelationshipType::ConnectsTo => "connects_to",
            RelationshipType::PartOf => "part_of",
            RelationshipType::Manages => "manages",
            RelationshipType::DocumentedBy => "documented_by",
            RelationshipType::ProcedureFor => "procedure_for",
            RelationshipType::TriggeredBy => "triggered_by",
            RelationshipType::DependsOn => "depends_on",
            RelationshipType::ContainedIn => "contained_in",
            RelationshipType::Monitors => "monitors",
            RelationshipType::Automates => "automates",
        }
    }

    /// The entity type pairs this relationship type is allowed to connect,
    /// `(from, to)`. An empty list means every combination is rejected —
    /// `depends_on` and `contained_in` are named by the enum but have no
    /// rows in the table yet, so they are currently always invalid (I3).
    fn valid_pairs(&self) -> &'static [(EntityType, EntityType)] {
        use EntityType::*;
        match self {
            RelationshipType::LocatedIn => &[
                (Device, Room),
                (Device, Zone),
                (Room, Zone),
                (Room, Home),
                (Zone, Home),
            ],
            RelationshipType::Controls => &[
                (Device, Device),
                (Automation, Device),
                (Schedule, Device),
                (Schedule, Automation),
            ],
            RelationshipType::ConnectsTo => &[
                (Room, Room),
                (Door, Room),
                (Window, Room),
                (Zone, Zone),
            ],
            RelationshipType::PartOf => &[(Room, Home), (Zone, Home), (Device, Zone)],
            RelationshipType::DocumentedBy => &[
                (Device, Manual),
                (Device, Procedure),
                (Home, Manual),
                (Room, Note),
            ],
            RelationshipType::ProcedureFor => &[(Procedure, Device), (Procedure, Home)],
            RelationshipType::TriggeredBy => &[(Automation, Device), (Automation, Schedule)],
            RelationshipType::Manages => &[(Automation, Device), (Schedule, Automation)],
            RelationshipType::Monitors => &[
                (Device, Room),
                (Device, Zone),
                (Automation, Device),
            ],
            RelationshipType::Automates => &[
                (Automation, Device),
                (Automation, Room),
                (Automation, Zone),
            ],
            RelationshipType::DependsOn => &[],
            RelationshipType::ContainedIn => &[],
        }
    }

    /// Is `from -> to` a permitted pair for this relationship type? This is
    /// the full authority (P3) — no other path may create a relationship
    /// that this rejects.
    pub fn is_valid_for(&self, from: EntityType, to: EntityType) -> bool {
        self.valid_pairs().contains(&(from, to))
    }
}

impl std::str::FromStr for RelationshipType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "located_in" => RelationshipType::LocatedIn,
            "controls" => RelationshipType::Controls,
            "connects_to" => RelationshipType::ConnectsTo,
            "part_of" => RelationshipType::PartOf,
            "manages" => RelationshipType::Manages,
            "documented_by" => RelationshipType::DocumentedBy,
            "procedure_for" => RelationshipType::ProcedureFor,
            "triggered_by" => RelationshipType::TriggeredBy,
            "depends_on" => RelationshipType::DependsOn,
            "contained_in" => RelationshipType::ContainedIn,
            "monitors" => RelationshipType::Monitors,
            "automates" => RelationshipType::Automates,
            other => return Err(CoreError::UnknownRelationshipType(other.to_string())),
        })
    }
}

impl std::fmt::Display for RelationshipType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A directed, typed edge anchored at specific entity versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityRelationship {
    pub id: Uuid,
    pub from_entity_id: Uuid,
    pub from_entity_version: String,
    pub to_entity_id: Uuid,
    pub to_entity_version: String,
    pub relationship_type: RelationshipType,
    #[serde(default)]
    pub properties: Value,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EntityRelationship {
    /// Validate and construct a relationship between two entities, checking
    /// the relationship_valid table (§4.1 / I3) before allowing creation.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        from_entity_id: Uuid,
        from_entity_version: impl Into<String>,
        from_entity_type: EntityType,
        to_entity_id: Uuid,
        to_entity_version: impl Into<String>,
        to_entity_type: EntityType,
        relationship_type: RelationshipType,
        properties: Value,
        user_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        if !relationship_type.is_valid_for(from_entity_type, to_entity_type) {
            return Err(CoreError::InvalidRelationship {
                relationship_type: relationship_type.to_string(),
                from_type: from_entity_type.to_string(),
                to_type: to_entity_type.to_string(),
            });
        }

        Ok(EntityRelationship {
            id: Uuid::new_v4(),
            from_entity_id,
            from_entity_version: from_entity_version.into(),
            to_entity_id,
            to_entity_version: to_entity_version.into(),
            relationship_type,
            properties,
            user_id,
            created_at: now,
            updated_at: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn located_in_device_to_room_is_valid() {
        assert!(RelationshipType::LocatedIn.is_valid_for(EntityType::Device, EntityType::Room));
        assert!(!RelationshipType::LocatedIn.is_valid_for(EntityType::Home, EntityType::Room));
    }

    #[test]
    fn unlisted_pairs_are_rejected_even_for_named_variants() {
        assert!(!RelationshipType::DependsOn.is_valid_for(EntityType::Device, EntityType::Device));
        assert!(!RelationshipType::ContainedIn.is_valid_for(EntityType::Room, EntityType::Home));
    }

    #[test]
    fn create_rejects_invalid_pair() {
        let now = Utc::now();
        let err = EntityRelationship::create(
            Uuid::new_v4(),
            "v1",
            EntityType::Home,
            Uuid::new_v4(),
            "v1",
            EntityType::Room,
            RelationshipType::LocatedIn,
            json!({}),
            None,
            now,
        );
        assert!(err.is_err());
    }
}
