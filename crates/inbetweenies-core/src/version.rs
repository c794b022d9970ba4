//! Version manager: version history, common-ancestor search, version trees,
//! diffing and merging (C3). Pure computation — no I/O, no suspension.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::models::Entity;

/// One node of a reconstructed version tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionNode {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub children: Vec<VersionNode>,
}

/// A change to a single top-level content key, as produced by
/// `calculate_version_diff`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentChange {
    Added { value: Value },
    Removed { value: Value },
    Modified { old_value: Value, new_value: Value },
}

/// Difference between two versions of the same entity, top-level only.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VersionDiff {
    pub version_change: Option<(String, String)>,
    pub name_change: Option<(String, String)>,
    pub content_changes: HashMap<String, ContentChange>,
}

/// Summary of a version tree, for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionTreeSummary {
    pub roots: Vec<VersionNode>,
    pub total_versions: usize,
}

/// Get the ordered version history of an entity (ascending by
/// `created_at`). The caller supplies every known version; this is pure
/// sorting/selection, the I/O lives in the store.
pub fn get_version_history(mut versions: Vec<Entity>) -> Vec<Entity> {
    versions.sort_by_key(|e| e.created_at);
    versions
}

/// Walk from `version` back through its recorded parents within `versions`,
/// returning the set of ancestor version strings (including `version`
/// itself).
fn ancestors(version: &str, by_version: &HashMap<&str, &Entity>) -> HashSet<String> {
    let mut seen = HashSet::new();
    let mut stack = vec![version.to_string()];
    while let Some(v) = stack.pop() {
        if !seen.insert(v.clone()) {
            continue;
        }
        if let Some(entity) = by_version.get(v.as_str()) {
            for parent in &entity.parent_versions {
                stack.push(parent.clone());
            }
        }
    }
    seen
}

/// Find the most recent version reachable as an ancestor of both `a` and
/// `b`. Returns `None` if the two histories are disjoint within `versions`.
pub fn find_common_ancestor(versions: &[Entity], a: &str, b: &str) -> Option<String> {
    let by_version: HashMap<&str, &Entity> =
        versions.iter().map(|e| (e.version.as_str(), e)).collect();

    let ancestors_a = ancestors(a, &by_version);
    let ancestors_b = ancestors(b, &by_version);

    ancestors_a
        .intersection(&ancestors_b)
        .filter_map(|v| by_version.get(v.as_str()).map(|e| (v, e.created_at)))
        .max_by_key(|(_, created_at)| *created_at)
        .map(|(v, _)| v.clone())
}

/// Build the version DAG for an entity id out of every known version.
/// Roots are versions whose parents are not present in `versions`.
pub fn calculate_version_tree(versions: &[Entity]) -> VersionTreeSummary {
    let by_version: HashMap<&str, &Entity> =
        versions.iter().map(|e| (e.version.as_str(), e)).collect();

    let mut children_of: HashMap<&str, Vec<&Entity>> = HashMap::new();
    let mut roots: Vec<&Entity> = Vec::new();

    for entity in versions {
        if entity.parent_versions.is_empty()
            || !entity
                .parent_versions
                .iter()
                .any(|p| by_version.contains_key(p.as_str()))
        {
            roots.push(entity);
        }
        for parent in &entity.parent_versions {
            children_of.entry(parent.as_str()).or_default().push(entity);
        }
    }
    roots.sort_by_key(|e| e.created_at);

    fn build(entity: &Entity, children_of: &HashMap<&str, Vec<&Entity>>) -> VersionNode {
        let mut kids: Vec<VersionNode> = children_of
            .get(entity.version.as_str())
            .into_iter()
            .flatten()
            .map(|c| build(c, children_of))
            .collect();
        kids.sort_by_key(|n| n.created_at);
        VersionNode {
            version: entity.version.clone(),
            created_at: entity.created_at,
            children: kids,
        }
    }

    let tree_roots = roots.iter().map(|e| build(e, &children_of)).collect();

    VersionTreeSummary {
        roots: tree_roots,
        total_versions: versions.len(),
    }
}

/// Compare two versions of the same entity id, top-level content keys only.
pub fn calculate_version_diff(old: &Entity, new: &Entity) -> VersionDiff {
    let mut diff = VersionDiff {
        version_change: Some((old.version.clone(), new.version.clone())),
        name_change: if old.name != new.name {
            Some((old.name.clone(), new.name.clone()))
        } else {
            None
        },
        content_changes: HashMap::new(),
    };

    let empty = Map::new();
    let old_map = old.content.as_object().unwrap_or(&empty);
    let new_map = new.content.as_object().unwrap_or(&empty);

    for (key, old_value) in old_map {
        match new_map.get(key) {
            None => {
                diff.content_changes.insert(
                    key.clone(),
                    ContentChange::Removed {
                        value: old_value.clone(),
                    },
                );
            }
            Some(new_value) if new_value != old_value => {
                diff.content_changes.insert(
                    key.clone(),
                    ContentChange::Modified {
                        old_value: old_value.clone(),
                        new_value: new_value.clone(),
                    },
                );
            }
            _ => {}
        }
    }
    for (key, new_value) in new_map {
        if !old_map.contains_key(key) {
            diff.content_changes.insert(
                key.clone(),
                ContentChange::Added {
                    value: new_value.clone(),
                },
            );
        }
    }

    diff
}

/// Merge a set of divergent versions into a single new version: base is the
/// oldest input, content/name overlay newer inputs' top-level keys, and the
/// result's parent_versions is the union of every input's version.
pub fn merge_versions(mut inputs: Vec<Entity>, now: DateTime<Utc>) -> Option<Entity> {
    if inputs.is_empty() {
        return None;
    }
    inputs.sort_by_key(|e| e.created_at);

    let base = inputs[0].clone();
    let most_recent = inputs.last().unwrap().clone();

    let mut merged_content = base.content.as_object().cloned().unwrap_or_default();
    for entity in &inputs[1..] {
        if let Some(map) = entity.content.as_object() {
            for (k, v) in map {
                merged_content.insert(k.clone(), v.clone());
            }
        }
    }

    let parent_versions: Vec<String> = inputs.iter().map(|e| e.version.clone()).collect();

    Some(Entity {
        id: base.id,
        version: Entity::new_version(now, "system-merge"),
        entity_type: base.entity_type,
        name: most_recent.name.clone(),
        content: Value::Object(merged_content),
        source_type: base.source_type,
        user_id: Some("system-merge".to_string()),
        parent_versions,
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use serde_json::json;

    fn make(id: uuid::Uuid, version: &str, parents: Vec<&str>, created_at: DateTime<Utc>) -> Entity {
        Entity {
            id,
            version: version.to_string(),
            entity_type: crate::models::EntityType::Device,
            name: "Lamp".to_string(),
            content: json!({}),
            source_type: SourceType::Manual,
            user_id: None,
            parent_versions: parents.into_iter().map(|s| s.to_string()).collect(),
            created_at,
            updated_at: created_at,
        }
    }

    #[test]
    fn common_ancestor_found_via_shared_history() {
        let id = uuid::Uuid::new_v4();
        let t0 = Utc::now();
        let root = make(id, "v0", vec![], t0);
        let a = make(id, "v1a", vec!["v0"], t0 + chrono::Duration::seconds(1));
        let b = make(id, "v1b", vec!["v0"], t0 + chrono::Duration::seconds(2));

        let versions = vec![root, a, b];
        let ancestor = find_common_ancestor(&versions, "v1a", "v1b");
        assert_eq!(ancestor.as_deref(), Some("v0"));
    }

    #[test]
    fn disjoint_histories_have_no_common_ancestor() {
        let id = uuid::Uuid::new_v4();
        let t0 = Utc::now();
        let a = make(id, "va", vec![], t0);
        let b = make(id, "vb", vec![], t0);
        let versions = vec![a, b];
        assert!(find_common_ancestor(&versions, "va", "vb").is_none());
    }

    #[test]
    fn merge_versions_unions_parents_and_overlays_content() {
        let id = uuid::Uuid::new_v4();
        let t0 = Utc::now();
        let mut a = make(id, "va", vec!["v0"], t0);
        a.content = json!({"power": "off", "color": "red"});
        let mut b = make(id, "vb", vec!["v0"], t0 + chrono::Duration::seconds(5));
        b.content = json!({"power": "on"});

        let merged = merge_versions(vec![a.clone(), b.clone()], t0 + chrono::Duration::seconds(10))
            .unwrap();

        assert_eq!(merged.id, id);
        assert_eq!(merged.content["power"], "on");
        assert_eq!(merged.content["color"], "red");
        assert!(merged.parent_versions.contains(&"va".to_string()));
        assert!(merged.parent_versions.contains(&"vb".to_string()));
    }
}
