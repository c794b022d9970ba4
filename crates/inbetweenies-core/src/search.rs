//! Search scoring (§4.2.1): pure ranking logic shared by every `GraphSearch`
//! backend. Backends fetch candidate entities; this module scores and
//! sorts them.

use serde::{Deserialize, Serialize};

use crate::models::Entity;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub entity: Entity,
    pub score: f64,
}

const FUZZY_THRESHOLD: f64 = 0.8;

/// Score a single entity against `query`. `query == "*"` matches everything
/// at the minimum score so a wildcard search still ranks stably.
pub fn score_entity(entity: &Entity, query: &str) -> Option<f64> {
    if query == "*" {
        return Some(0.0);
    }

    let query_lower = query.to_lowercase();
    let name_lower = entity.name.to_lowercase();

    let mut score = 0.0;
    let mut matched = false;

    if name_lower == query_lower {
        score += 2.0;
        matched = true;
    } else if name_lower.contains(&query_lower) {
        score += 1.5;
        matched = true;
    }

    let content_str = entity.content.to_string().to_lowercase();
    if content_str.contains(&query_lower) {
        score += 1.0;
        matched = true;
    }

    let ratio = strsim::jaro(&name_lower, &query_lower);
    if ratio >= FUZZY_THRESHOLD {
        score += ratio;
        matched = true;
    }

    matched.then_some(score)
}

/// Score and rank a candidate list, keeping at most `limit` results.
pub fn rank(entities: Vec<Entity>, query: &str, limit: usize) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = entities
        .into_iter()
        .filter_map(|entity| {
            score_entity(&entity, query).map(|score| SearchResult { entity, score })
        })
        .collect();

    results.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    results.truncate(limit);
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EntityType, SourceType};
    use chrono::Utc;
    use serde_json::json;

    fn entity(name: &str, content: serde_json::Value) -> Entity {
        let now = Utc::now();
        Entity {
            id: uuid::Uuid::new_v4(),
            version: Entity::new_version(now, "u"),
            entity_type: EntityType::Device,
            name: name.to_string(),
            content,
            source_type: SourceType::Manual,
            user_id: None,
            parent_versions: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn wildcard_matches_everything() {
        let e = entity("Anything", json!({}));
        assert_eq!(score_entity(&e, "*"), Some(0.0));
    }

    #[test]
    fn exact_name_match_outscores_substring_match() {
        let exact = entity("Lamp", json!({}));
        let partial = entity("Kitchen Lamp Controller", json!({}));
        let exact_score = score_entity(&exact, "lamp").unwrap();
        let partial_score = score_entity(&partial, "lamp").unwrap();
        assert!(exact_score > partial_score);
    }

    #[test]
    fn content_substring_contributes_score() {
        let e = entity("Device", json!({"note": "smells like rain"}));
        assert!(score_entity(&e, "rain").is_some());
    }

    #[test]
    fn rank_truncates_to_limit() {
        let entities = (0..5).map(|i| entity(&format!("Lamp {i}"), json!({}))).collect();
        let results = rank(entities, "lamp", 2);
        assert_eq!(results.len(), 2);
    }
}
