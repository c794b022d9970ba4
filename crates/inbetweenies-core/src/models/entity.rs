//! Entity model: a versioned node in the shared knowledge graph.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Types of entities in the knowledge graph. Closed set — an unknown string
/// is a validation error, not a new variant (see `FromStr`/`Deserialize`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Home,
    Room,
    Device,
    Zone,
    Door,
    Window,
    Procedure,
    Manual,
    Note,
    Schedule,
    Automation,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Home => "home",
            EntityType::Room => "room",
            EntityType::Device => "device",
            EntityType::Zone => "zone",
            EntityType::Door => "door",
            EntityType::Window => "window",
            EntityType::Procedure => "procedure",
            EntityType::Manual => "manual",
            EntityType::Note => "note",
            EntityType::Schedule => "schedule",
            EntityType::Automation => "automation",
        }
    }
}

impl std::str::FromStr for EntityType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "home" => EntityType::Home,
            "room" => EntityType::Room,
            "device" => EntityType::Device,
            "zone" => EntityType::Zone,
            "door" => EntityType::Door,
            "window" => EntityType::Window,
            "procedure" => EntityType::Procedure,
            "manual" => EntityType::Manual,
            "note" => EntityType::Note,
            "schedule" => EntityType::Schedule,
            "automation" => EntityType::Automation,
            other => return Err(CoreError::UnknownEntityType(other.to_string())),
        })
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an entity's data originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Homekit,
    Matter,
    Manual,
    Imported,
    Generated,
}

/// A versioned node in the knowledge graph.
///
/// `(id, version)` together are the primary key — entities are never
/// mutated in place, only superseded by a new version with `id` unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub version: String,
    pub entity_type: EntityType,
    pub name: String,
    #[serde(default)]
    pub content: Value,
    pub source_type: SourceType,
    pub user_id: Option<String>,
    #[serde(default)]
    pub parent_versions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Content payload limits (I5): keeps a single entity version bounded so a
/// runaway client can't bloat the store or the wire payload.
const MAX_CONTENT_BYTES: usize = 64 * 1024;
const MAX_CONTENT_DEPTH: usize = 10;

impl Entity {
    /// Build the version string for a change made by `user_id` at `now`.
    ///
    /// Format: `<ISO-8601 UTC timestamp>Z-<user_id>`, matching
    /// `^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d+)?Z-.+$`.
    pub fn new_version(now: DateTime<Utc>, user_id: &str) -> String {
        format!("{}Z-{}", now.format("%Y-%m-%dT%H:%M:%S%.f"), user_id)
    }

    /// Split a version string back into its timestamp and user_id parts.
    pub fn parse_version(version: &str) -> Result<(DateTime<Utc>, &str)> {
        let (ts, user_id) = version
            .split_once("Z-")
            .ok_or_else(|| CoreError::MalformedVersion(version.to_string()))?;
        if user_id.is_empty() {
            return Err(CoreError::MalformedVersion(version.to_string()));
        }
        let ts = format!("{}Z", ts);
        let parsed = DateTime::parse_from_rfc3339(&ts)
            .map_err(|_| CoreError::MalformedVersion(version.to_string()))?;
        Ok((parsed.with_timezone(&Utc), user_id))
    }

    /// Create a brand-new root entity (no parent versions).
    pub fn create(
        entity_type: EntityType,
        name: impl Into<String>,
        content: Value,
        source_type: SourceType,
        user_id: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_content(&content)?;
        let user_id = user_id.into();
        let entity = Entity {
            id: Uuid::new_v4(),
            version: Self::new_version(now, &user_id),
            entity_type,
            name: name.into(),
            content,
            source_type,
            user_id: Some(user_id),
            parent_versions: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        Ok(entity)
    }

    /// Create a new version of this entity (L4): `id` is preserved, the
    /// prior version becomes the sole parent, and content is merged
    /// top-level (new keys override, others are kept).
    pub fn create_child(
        &self,
        user_id: impl Into<String>,
        content_changes: Value,
        name: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let merged_content = match (&self.content, &content_changes) {
            (Value::Object(base), Value::Object(changes)) => {
                let mut merged = base.clone();
                for (k, v) in changes {
                    merged.insert(k.clone(), v.clone());
                }
                Value::Object(merged)
            }
            (_, Value::Null) => self.content.clone(),
            _ => content_changes,
        };
        validate_content(&merged_content)?;

        let user_id = user_id.into();

        Ok(Entity {
            id: self.id,
            version: Self::new_version(now, &user_id),
            entity_type: self.entity_type,
            name: name.unwrap_or_else(|| self.name.clone()),
            content: merged_content,
            source_type: self.source_type,
            user_id: Some(user_id),
            parent_versions: vec![self.version.clone()],
            created_at: now,
            updated_at: now,
        })
    }
}

fn validate_content(content: &Value) -> Result<()> {
    let serialized =
        serde_json::to_vec(content).map_err(|e| CoreError::Validation(e.to_string()))?;
    if serialized.len() > MAX_CONTENT_BYTES {
        return Err(CoreError::Validation(format!(
            "content exceeds {} bytes",
            MAX_CONTENT_BYTES
        )));
    }
    if depth(content) > MAX_CONTENT_DEPTH {
        return Err(CoreError::Validation(format!(
            "content nesting exceeds {} levels",
            MAX_CONTENT_DEPTH
        )));
    }
    Ok(())
}

fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn version_round_trips() {
        let now = Utc::now();
        let v = Entity::new_version(now, "user-1");
        let (parsed, user_id) = Entity::parse_version(&v).unwrap();
        assert_eq!(user_id, "user-1");
        assert_eq!(parsed.timestamp_millis(), now.timestamp_millis());
    }

    #[test]
    fn malformed_version_rejected() {
        assert!(Entity::parse_version("not-a-version").is_err());
        assert!(Entity::parse_version("2024-01-01T00:00:00Z-").is_err());
    }

    #[test]
    fn create_child_preserves_id_and_sets_single_parent() {
        let now = Utc::now();
        let e = Entity::create(
            EntityType::Device,
            "Lamp",
            json!({"power": "on"}),
            SourceType::Manual,
            "alice",
            now,
        )
        .unwrap();

        let child = e
            .create_child("bob", json!({"power": "off"}), None, now)
            .unwrap();

        assert_eq!(child.id, e.id);
        assert_eq!(child.parent_versions, vec![e.version.clone()]);
        assert_eq!(child.content["power"], "off");
    }

    #[test]
    fn content_over_budget_is_rejected() {
        let now = Utc::now();
        let huge = "x".repeat(MAX_CONTENT_BYTES + 1);
        let err = Entity::create(
            EntityType::Note,
            "Big",
            json!({"blob": huge}),
            SourceType::Manual,
            "alice",
            now,
        );
        assert!(err.is_err());
    }
}
