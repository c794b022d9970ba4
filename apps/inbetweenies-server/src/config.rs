//! Configuration for the Inbetweenies sync server.

use serde::Deserialize;
use std::env;

use inbetweenies_core::conflict::ConflictStrategy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Server-side knobs for the sync protocol handler that spec.md leaves as
/// implementation choices: §4.6 names `merge` as the strategy the handler
/// invokes on a diverging fast-forward, which is the default here but made
/// configurable; §4.2's graph traversal routes need a hop bound.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    pub conflict_strategy: ConflictStrategy,
    pub max_traversal_depth: usize,
}

fn parse_conflict_strategy(s: &str) -> ConflictStrategy {
    match s {
        "last_write_wins" => ConflictStrategy::LastWriteWins,
        "manual" => ConflictStrategy::Manual,
        "custom" => ConflictStrategy::Custom,
        "client_wins" => ConflictStrategy::ClientWins,
        "server_wins" => ConflictStrategy::ServerWins,
        _ => ConflictStrategy::Merge,
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite:./inbetweenies.db".to_string(),
            },
            sync: SyncConfig {
                conflict_strategy: ConflictStrategy::Merge,
                max_traversal_depth: 6,
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .unwrap_or(8080),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite:./inbetweenies.db".to_string()),
            },
            sync: SyncConfig {
                conflict_strategy: parse_conflict_strategy(
                    &env::var("SYNC_CONFLICT_STRATEGY").unwrap_or_else(|_| "merge".to_string()),
                ),
                max_traversal_depth: env::var("SYNC_MAX_TRAVERSAL_DEPTH")
                    .unwrap_or_else(|_| "6".to_string())
                    .parse()
                    .unwrap_or(6),
            },
        })
    }
}
