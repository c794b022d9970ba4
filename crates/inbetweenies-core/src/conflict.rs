//! Conflict resolver (C4): strategies for reconciling two divergent
//! versions of the same entity. Pure computation — no I/O, no suspension.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::models::{Entity, EntityType};

/// How a conflict should be (or was) resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    LastWriteWins,
    Merge,
    Manual,
    Custom,
    ClientWins,
    ServerWins,
}

/// One field-level disagreement surfaced by a `Merge` resolution that fell
/// back to taking the local value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConflict {
    pub key: String,
    pub local_value: Value,
    pub remote_value: Value,
    pub resolution: String,
}

/// A conflict queued for a human to resolve (the `Manual` strategy).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualConflict {
    pub id: uuid::Uuid,
    pub entity_id: uuid::Uuid,
    pub local: Entity,
    pub remote: Entity,
    pub queued_at: DateTime<Utc>,
}

/// Outcome of `ConflictResolver::resolve`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: ConflictStrategy,
    pub resolved_entity: Option<Entity>,
    pub requires_manual: bool,
    pub merge_conflicts: Option<Vec<MergeConflict>>,
}

/// A per-entity-type custom conflict rule. Returning `None` means the rule
/// declines and last-write-wins should be used instead.
pub type CustomRule = fn(&Entity, &Entity, DateTime<Utc>) -> Option<Entity>;

/// Resolves conflicts between a local and a remote version of an entity
/// using a configurable strategy, with optional per-entity-type overrides.
pub struct ConflictResolver {
    custom_rules: HashMap<EntityType, CustomRule>,
    pending_manual: Vec<ManualConflict>,
}

impl ConflictResolver {
    pub fn new() -> Self {
        let mut resolver = Self {
            custom_rules: HashMap::new(),
            pending_manual: Vec::new(),
        };
        resolver.register_custom_rule(EntityType::Device, device_conflict_rule);
        resolver.register_custom_rule(EntityType::Automation, automation_conflict_rule);
        resolver
    }

    pub fn register_custom_rule(&mut self, entity_type: EntityType, rule: CustomRule) {
        self.custom_rules.insert(entity_type, rule);
    }

    pub fn pending_manual_resolutions(&self) -> &[ManualConflict] {
        &self.pending_manual
    }

    pub fn resolve_manual(&mut self, id: uuid::Uuid) -> Option<ManualConflict> {
        let idx = self.pending_manual.iter().position(|c| c.id == id)?;
        Some(self.pending_manual.remove(idx))
    }

    pub fn resolve(
        &mut self,
        local: &Entity,
        remote: &Entity,
        strategy: ConflictStrategy,
        now: DateTime<Utc>,
    ) -> Resolution {
        match strategy {
            ConflictStrategy::LastWriteWins => self.last_write_wins(local, remote),
            ConflictStrategy::ClientWins => Resolution {
                strategy,
                resolved_entity: Some(local.clone()),
                requires_manual: false,
                merge_conflicts: None,
            },
            ConflictStrategy::ServerWins => Resolution {
                strategy,
                resolved_entity: Some(remote.clone()),
                requires_manual: false,
                merge_conflicts: None,
            },
            ConflictStrategy::Merge => self.merge(local, remote, now),
            ConflictStrategy::Custom => self.apply_custom_rule(local, remote, now),
            ConflictStrategy::Manual => {
                let conflict = ManualConflict {
                    id: uuid::Uuid::new_v4(),
                    entity_id: local.id,
                    local: local.clone(),
                    remote: remote.clone(),
                    queued_at: now,
                };
                self.pending_manual.push(conflict);
                Resolution {
                    strategy,
                    resolved_entity: None,
                    requires_manual: true,
                    merge_conflicts: None,
                }
            }
        }
    }

    fn last_write_wins(&self, local: &Entity, remote: &Entity) -> Resolution {
        let winner = pick_most_recent(local, remote);
        Resolution {
            strategy: ConflictStrategy::LastWriteWins,
            resolved_entity: Some(winner.clone()),
            requires_manual: false,
            merge_conflicts: None,
        }
    }

    fn merge(&self, local: &Entity, remote: &Entity, now: DateTime<Utc>) -> Resolution {
        let empty = Map::new();
        let local_map = local.content.as_object().unwrap_or(&empty);
        let remote_map = remote.content.as_object().unwrap_or(&empty);

        let (merged_map, conflicts) = merge_dicts(local_map, remote_map);

        let most_recent = pick_most_recent(local, remote);
        let mut parent_versions = vec![local.version.clone(), remote.version.clone()];
        parent_versions.dedup();

        let merged = Entity {
            id: local.id,
            version: Entity::new_version(now, "sync-merge"),
            entity_type: local.entity_type,
            name: most_recent.name.clone(),
            content: Value::Object(merged_map),
            source_type: local.source_type,
            user_id: Some("sync-merge".to_string()),
            parent_versions,
            created_at: now,
            updated_at: now,
        };

        Resolution {
            strategy: ConflictStrategy::Merge,
            resolved_entity: Some(merged),
            requires_manual: false,
            merge_conflicts: if conflicts.is_empty() {
                None
            } else {
                Some(conflicts)
            },
        }
    }

    fn apply_custom_rule(&self, local: &Entity, remote: &Entity, now: DateTime<Utc>) -> Resolution {
        if let Some(rule) = self.custom_rules.get(&local.entity_type) {
            if let Some(resolved) = rule(local, remote, now) {
                if is_stable(&resolved, local, remote) {
                    return Resolution {
                        strategy: ConflictStrategy::Custom,
                        resolved_entity: Some(resolved),
                        requires_manual: false,
                        merge_conflicts: None,
                    };
                }
            }
        }
        // Rule declined (returned None) or produced an unstable result:
        // fall back to last-write-wins, same as the original's
        // exception-catches-to-LWW path translated into a Result-free
        // Option return.
        self.last_write_wins(local, remote)
    }
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// A custom rule's result must keep `id` unchanged and its parent_versions
/// a superset of both inputs, or it is rejected in favor of LWW.
fn is_stable(resolved: &Entity, local: &Entity, remote: &Entity) -> bool {
    resolved.id == local.id
        && resolved.parent_versions.contains(&local.version)
        && resolved.parent_versions.contains(&remote.version)
}

fn pick_most_recent<'a>(local: &'a Entity, remote: &'a Entity) -> &'a Entity {
    if local.updated_at != remote.updated_at {
        if local.updated_at > remote.updated_at {
            local
        } else {
            remote
        }
    } else if local.created_at != remote.created_at {
        if local.created_at > remote.created_at {
            local
        } else {
            remote
        }
    } else if local.version >= remote.version {
        local
    } else {
        remote
    }
}

/// Key-wise merge of two JSON objects: matching values are kept, keys
/// present on only one side are taken as-is, nested objects present on
/// both sides recurse, and any other disagreement takes the local value
/// and records a `MergeConflict`.
fn merge_dicts(local: &Map<String, Value>, remote: &Map<String, Value>) -> (Map<String, Value>, Vec<MergeConflict>) {
    let mut merged = Map::new();
    let mut conflicts = Vec::new();

    let mut keys: Vec<&String> = local.keys().chain(remote.keys()).collect();
    keys.sort();
    keys.dedup();

    for key in keys {
        match (local.get(key), remote.get(key)) {
            (Some(l), Some(r)) if l == r => {
                merged.insert(key.clone(), l.clone());
            }
            (Some(l), None) => {
                merged.insert(key.clone(), l.clone());
            }
            (None, Some(r)) => {
                merged.insert(key.clone(), r.clone());
            }
            (Some(Value::Object(lm)), Some(Value::Object(rm))) => {
                let (nested, mut nested_conflicts) = merge_dicts(lm, rm);
                merged.insert(key.clone(), Value::Object(nested));
                conflicts.append(&mut nested_conflicts);
            }
            (Some(l), Some(r)) => {
                merged.insert(key.clone(), l.clone());
                conflicts.push(MergeConflict {
                    key: key.clone(),
                    local_value: l.clone(),
                    remote_value: r.clone(),
                    resolution: "used_local".to_string(),
                });
            }
            (None, None) => unreachable!("key came from one of the two maps"),
        }
    }

    (merged, conflicts)
}

/// Device conflict rule: union the `capabilities` array if both sides have
/// one, otherwise fall through to last-write-wins (signalled by `None`).
fn device_conflict_rule(local: &Entity, remote: &Entity, now: DateTime<Utc>) -> Option<Entity> {
    let local_caps = local.content.get("capabilities")?.as_array()?;
    let remote_caps = remote.content.get("capabilities")?.as_array()?;

    let mut union: Vec<Value> = local_caps.clone();
    for cap in remote_caps {
        if !union.contains(cap) {
            union.push(cap.clone());
        }
    }

    let mut content = local.content.as_object().cloned().unwrap_or_default();
    content.insert("capabilities".to_string(), Value::Array(union));

    Some(Entity {
        id: local.id,
        version: Entity::new_version(now, "sync-merge"),
        entity_type: local.entity_type,
        name: pick_most_recent(local, remote).name.clone(),
        content: Value::Object(content),
        source_type: local.source_type,
        user_id: Some("sync-merge".to_string()),
        parent_versions: vec![local.version.clone(), remote.version.clone()],
        created_at: now,
        updated_at: now,
    })
}

/// Automation conflict rule: prefer whichever side has `enabled: true`,
/// otherwise fall through to last-write-wins.
fn automation_conflict_rule(local: &Entity, remote: &Entity, now: DateTime<Utc>) -> Option<Entity> {
    let local_enabled = local.content.get("enabled").and_then(Value::as_bool);
    let remote_enabled = remote.content.get("enabled").and_then(Value::as_bool);

    let winner = match (local_enabled, remote_enabled) {
        (Some(true), _) => local,
        (_, Some(true)) => remote,
        _ => return None,
    };

    Some(Entity {
        id: local.id,
        version: Entity::new_version(now, "sync-merge"),
        entity_type: local.entity_type,
        name: winner.name.clone(),
        content: winner.content.clone(),
        source_type: local.source_type,
        user_id: Some("sync-merge".to_string()),
        parent_versions: vec![local.version.clone(), remote.version.clone()],
        created_at: now,
        updated_at: now,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceType;
    use serde_json::json;

    fn entity(content: Value, updated_at: DateTime<Utc>) -> Entity {
        Entity {
            id: uuid::Uuid::new_v4(),
            version: Entity::new_version(updated_at, "u"),
            entity_type: EntityType::Device,
            name: "Lamp".to_string(),
            content,
            source_type: SourceType::Manual,
            user_id: None,
            parent_versions: vec![],
            created_at: updated_at,
            updated_at,
        }
    }

    #[test]
    fn last_write_wins_picks_more_recent_updated_at() {
        let t0 = Utc::now();
        let local = entity(json!({"power": "off"}), t0);
        let remote = entity(json!({"power": "on"}), t0 + chrono::Duration::seconds(1));

        let mut resolver = ConflictResolver::new();
        let resolution = resolver.resolve(&local, &remote, ConflictStrategy::LastWriteWins, t0);
        assert_eq!(resolution.resolved_entity.unwrap().content["power"], "on");
    }

    #[test]
    fn merge_keeps_disjoint_keys_and_records_conflict_on_overlap() {
        let t0 = Utc::now();
        let local = entity(json!({"power": "off", "color": "red"}), t0);
        let mut remote = entity(json!({"power": "on", "local": true}), t0);
        remote.id = local.id;

        let mut resolver = ConflictResolver::new();
        let resolution = resolver.resolve(&local, &remote, ConflictStrategy::Merge, t0);
        let merged = resolution.resolved_entity.unwrap();
        assert_eq!(merged.content["color"], "red");
        assert_eq!(merged.content["local"], true);
        assert_eq!(merged.content["power"], "off"); // conflicting key keeps local
        assert_eq!(resolution.merge_conflicts.unwrap().len(), 1);
    }

    #[test]
    fn manual_strategy_queues_and_reports_requires_manual() {
        let t0 = Utc::now();
        let local = entity(json!({}), t0);
        let remote = entity(json!({}), t0);
        let mut resolver = ConflictResolver::new();
        let resolution = resolver.resolve(&local, &remote, ConflictStrategy::Manual, t0);
        assert!(resolution.requires_manual);
        assert!(resolution.resolved_entity.is_none());
        assert_eq!(resolver.pending_manual_resolutions().len(), 1);
    }

    #[test]
    fn device_custom_rule_unions_capabilities() {
        let t0 = Utc::now();
        let id = uuid::Uuid::new_v4();
        let mut local = entity(json!({"capabilities": ["on_off", "dim"]}), t0);
        local.id = id;
        let mut remote = entity(json!({"capabilities": ["dim", "color"]}), t0);
        remote.id = id;

        let mut resolver = ConflictResolver::new();
        let resolution = resolver.resolve(&local, &remote, ConflictStrategy::Custom, t0);
        let caps = resolution.resolved_entity.unwrap().content["capabilities"]
            .as_array()
            .unwrap()
            .clone();
        assert_eq!(caps.len(), 3);
    }
}
