use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::credentials::fmt_ts;

const RESOLVE_CACHE_TTL: Duration = Duration::from_secs(60);

pub const BUILTIN_COMBOS: &[(&str, &[&str])] = &[
    ("kiro-opus-4-6", &["claude-opus-4.6"]),
    ("kiro-opus-4-5", &["claude-opus-4.5"]),
    ("kiro-sonnet-4-5", &["claude-sonnet-4.5"]),
    ("kiro-sonnet-4", &["claude-sonnet-4"]),
    ("kiro-haiku-4-5", &["claude-haiku-4.5"]),
    ("kiro-haiku", &["claude-haiku-4.5"]),
    ("kiro-auto", &["auto-kiro"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingKind {
    Alias,
    Combo,
}

impl MappingKind {
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "alias" => Some(MappingKind::Alias),
            "combo" => Some(MappingKind::Combo),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MappingKind::Alias => "alias",
            MappingKind::Combo => "combo",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMapping {
    pub name: String,
    pub kind: MappingKind,
    pub targets: Vec<String>,
    pub is_builtin: bool,
}

/// Outcome of resolving a client-facing model name, computed once per request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Alias(String),
    /// Ordered failover list: first success wins.
    Combo(Vec<String>),
    /// No mapping; the name goes upstream unchanged.
    Passthrough(String),
}

impl ResolvedTarget {
    pub fn targets(&self) -> Vec<&str> {
        match self {
            ResolvedTarget::Alias(t) | ResolvedTarget::Passthrough(t) => vec![t.as_str()],
            ResolvedTarget::Combo(ts) => ts.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_combo(&self) -> bool {
        matches!(self, ResolvedTarget::Combo(_))
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MappingError {
    #[error("mapping name must not be empty")]
    EmptyName,
    #[error("alias mappings take exactly one target, got {0}")]
    AliasArity(usize),
    #[error("combo mappings need at least one target")]
    EmptyCombo,
    #[error("builtin mapping {0} cannot be removed")]
    Builtin(String),
    #[error("store error: {0}")]
    Store(String),
}

struct CachedResolution {
    at: Instant,
    target: ResolvedTarget,
}

/// Persistent mapping table plus a short-lived resolution cache that is
/// dropped on every write made through this store.
#[derive(Clone)]
pub struct MappingStore {
    pool: Pool<Sqlite>,
    cache: Arc<DashMap<String, CachedResolution>>,
}

impl MappingStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS model_mappings (
                name TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                targets TEXT NOT NULL,
                is_builtin INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let store = Self {
            pool,
            cache: Arc::new(DashMap::new()),
        };
        store.seed_builtins().await?;
        Ok(store)
    }

    async fn seed_builtins(&self) -> Result<(), String> {
        let now = fmt_ts(Utc::now());
        for (name, targets) in BUILTIN_COMBOS {
            let targets_json = serde_json::to_string(targets).map_err(|e| e.to_string())?;
            sqlx::query(
                r#"INSERT INTO model_mappings (name, kind, targets, is_builtin, updated_at)
                   VALUES (?, 'combo', ?, 1, ?)
                   ON CONFLICT(name) DO UPDATE SET targets = excluded.targets, updated_at = excluded.updated_at
                   WHERE model_mappings.is_builtin = 1"#,
            )
            .bind(name)
            .bind(&targets_json)
            .bind(&now)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        }
        Ok(())
    }

    pub async fn resolve(&self, requested: &str) -> Result<ResolvedTarget, String> {
        if let Some(hit) = self.cache.get(requested) {
            if hit.at.elapsed() < RESOLVE_CACHE_TTL {
                return Ok(hit.target.clone());
            }
        }

        let target = match self.get(requested).await? {
            Some(mapping) => resolve_mapping(requested, mapping),
            None => ResolvedTarget::Passthrough(requested.to_string()),
        };
        self.cache.insert(
            requested.to_string(),
            CachedResolution {
                at: Instant::now(),
                target: target.clone(),
            },
        );
        Ok(target)
    }

    pub async fn get(&self, name: &str) -> Result<Option<ModelMapping>, String> {
        let row = sqlx::query(
            "SELECT name, kind, targets, is_builtin FROM model_mappings WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        row.map(|r| row_to_mapping(&r)).transpose()
    }

    pub async fn list(&self) -> Result<Vec<ModelMapping>, String> {
        let rows = sqlx::query(
            "SELECT name, kind, targets, is_builtin FROM model_mappings ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        rows.iter().map(row_to_mapping).collect()
    }

    /// Creates or replaces an operator mapping. Writing over a builtin name
    /// keeps its builtin flag.
    pub async fn set(
        &self,
        name: &str,
        kind: MappingKind,
        targets: Vec<String>,
    ) -> Result<ModelMapping, MappingError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(MappingError::EmptyName);
        }
        let targets: Vec<String> = targets
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        match kind {
            MappingKind::Alias if targets.len() != 1 => {
                return Err(MappingError::AliasArity(targets.len()));
            }
            MappingKind::Combo if targets.is_empty() => return Err(MappingError::EmptyCombo),
            _ => {}
        }

        let targets_json =
            serde_json::to_string(&targets).map_err(|e| MappingError::Store(e.to_string()))?;
        sqlx::query(
            r#"INSERT INTO model_mappings (name, kind, targets, is_builtin, updated_at)
               VALUES (?, ?, ?, 0, ?)
               ON CONFLICT(name) DO UPDATE SET kind = excluded.kind, targets = excluded.targets, updated_at = excluded.updated_at"#,
        )
        .bind(name)
        .bind(kind.as_str())
        .bind(&targets_json)
        .bind(fmt_ts(Utc::now()))
        .execute(&self.pool)
        .await
        .map_err(|e| MappingError::Store(e.to_string()))?;
        self.invalidate();

        self.get(name)
            .await
            .map_err(MappingError::Store)?
            .ok_or_else(|| MappingError::Store("mapping vanished after write".to_string()))
    }

    pub async fn remove(&self, name: &str) -> Result<bool, MappingError> {
        let existing = self.get(name).await.map_err(MappingError::Store)?;
        match existing {
            None => Ok(false),
            Some(m) if m.is_builtin => Err(MappingError::Builtin(m.name)),
            Some(_) => {
                let result =
                    sqlx::query("DELETE FROM model_mappings WHERE name = ? AND is_builtin = 0")
                        .bind(name)
                        .execute(&self.pool)
                        .await
                        .map_err(|e| MappingError::Store(e.to_string()))?;
                self.invalidate();
                Ok(result.rows_affected() > 0)
            }
        }
    }

    /// Drops cached resolutions, e.g. after another instance changed mappings.
    pub fn invalidate(&self) {
        self.cache.clear();
    }
}

fn resolve_mapping(requested: &str, mapping: ModelMapping) -> ResolvedTarget {
    match mapping.kind {
        MappingKind::Alias => match mapping.targets.into_iter().next() {
            Some(target) => ResolvedTarget::Alias(target),
            None => ResolvedTarget::Passthrough(requested.to_string()),
        },
        MappingKind::Combo if mapping.targets.is_empty() => {
            ResolvedTarget::Passthrough(requested.to_string())
        }
        MappingKind::Combo => ResolvedTarget::Combo(mapping.targets),
    }
}

fn row_to_mapping(row: &sqlx::sqlite::SqliteRow) -> Result<ModelMapping, String> {
    let kind_raw: String = row.try_get("kind").map_err(|e| e.to_string())?;
    let kind = MappingKind::from_str(&kind_raw)
        .ok_or_else(|| format!("invalid mapping kind: {kind_raw}"))?;
    let targets_raw: String = row.try_get("targets").map_err(|e| e.to_string())?;
    let targets: Vec<String> = serde_json::from_str(&targets_raw).map_err(|e| e.to_string())?;
    Ok(ModelMapping {
        name: row.try_get("name").map_err(|e| e.to_string())?,
        kind,
        targets,
        is_builtin: row.try_get::<i32, _>("is_builtin").map_err(|e| e.to_string())? == 1,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(kind: MappingKind, targets: &[&str]) -> ModelMapping {
        ModelMapping {
            name: "m".to_string(),
            kind,
            targets: targets.iter().map(|t| t.to_string()).collect(),
            is_builtin: false,
        }
    }

    #[test]
    fn alias_resolves_to_single_target() {
        let resolved = resolve_mapping("m", mapping(MappingKind::Alias, &["up-1"]));
        assert_eq!(resolved, ResolvedTarget::Alias("up-1".to_string()));
        assert_eq!(resolved.targets(), vec!["up-1"]);
    }

    #[test]
    fn combo_keeps_target_order() {
        let resolved = resolve_mapping("m", mapping(MappingKind::Combo, &["a", "b", "c"]));
        assert!(resolved.is_combo());
        assert_eq!(resolved.targets(), vec!["a", "b", "c"]);
    }

    #[test]
    fn empty_combo_degrades_to_passthrough() {
        let resolved = resolve_mapping("m", mapping(MappingKind::Combo, &[]));
        assert_eq!(resolved, ResolvedTarget::Passthrough("m".to_string()));
    }
}
