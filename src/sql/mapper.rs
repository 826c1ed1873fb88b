//! Column mapping resolution
//!
//! Destination tables are populated through an explicit dictionary of
//! (column, JSON path) pairs. A table with zero mappings must never be
//! populated, so an empty dictionary result is a per-resource fatal error.
//! Dictionary metadata does not change mid-run, so resolutions are cached.

use std::collections::HashMap;
use std::sync::Arc;

use log::debug;
use sqlx::SqlitePool;
use tokio::sync::Mutex;

use crate::error::{SyncError, SyncResult};

/// One projected column: destination column name plus the dotted JSON path
/// that feeds it.
#[derive(Debug, Clone)]
pub struct ColumnRule {
    pub column: String,
    pub json_path: String,
}

/// Ordered, non-empty projection for one destination table.
#[derive(Debug)]
pub struct ColumnMapping {
    pub rules: Vec<ColumnRule>,
}

/// Resolves and caches column mappings for the duration of a run.
#[derive(Default)]
pub struct ColumnMapper {
    cache: Mutex<HashMap<String, Arc<ColumnMapping>>>,
}

impl ColumnMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn resolve(&self, pool: &SqlitePool, table: &str) -> SyncResult<Arc<ColumnMapping>> {
        let mut cache = self.cache.lock().await;
        if let Some(mapping) = cache.get(table) {
            return Ok(mapping.clone());
        }

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name, json_name FROM api_dictionary WHERE table_name = ?",
        )
        .bind(table)
        .fetch_all(pool)
        .await
        .map_err(|e| SyncError::catalog_with_source("mapping dictionary lookup failed", e))?;

        if rows.is_empty() {
            return Err(SyncError::Mapping {
                table: table.to_string(),
            });
        }

        let mapping = Arc::new(ColumnMapping {
            rules: rows
                .into_iter()
                .map(|(column, json_path)| ColumnRule { column, json_path })
                .collect(),
        });

        debug!(
            "Resolved {} column mappings for {}",
            mapping.rules.len(),
            table
        );
        cache.insert(table.to_string(), mapping.clone());
        Ok(mapping)
    }
}
