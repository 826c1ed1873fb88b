//! Page ingestion
//!
//! Projects fetched JSON records into destination rows through a column
//! mapping. All projected values are carried as text, truncated to the
//! destination column width; no type coercion is attempted. Each page is
//! inserted in its own transaction, and the first page of a run clears the
//! table for full-refresh semantics.

use std::sync::Arc;

use async_trait::async_trait;
use log::info;
use serde_json::Value;
use sqlx::{QueryBuilder, SqlitePool};

use crate::api::fetcher::{Page, PageSink};
use crate::error::{SyncError, SyncResult};
use crate::sql::mapper::ColumnMapping;

/// Declared width of destination text columns.
pub const MAX_TEXT_WIDTH: usize = 100;

/// Rows bound per INSERT statement, inside the page transaction.
const INSERT_CHUNK: usize = 50;

/// Persists pages for one resource's destination table.
pub struct Ingestor {
    pool: SqlitePool,
    table: String,
    quoted_table: String,
    mapping: Arc<ColumnMapping>,
}

impl Ingestor {
    pub fn new(pool: SqlitePool, table: &str, mapping: Arc<ColumnMapping>) -> SyncResult<Self> {
        let quoted_table = quote_ident(table)?;
        for rule in &mapping.rules {
            quote_ident(&rule.column)?;
        }
        Ok(Self {
            pool,
            table: table.to_string(),
            quoted_table,
            mapping,
        })
    }

    /// Insert one page of records. `first_page` clears the table first;
    /// the delete and all inserts commit atomically.
    pub async fn ingest(&self, records: &[Value], first_page: bool) -> SyncResult<u64> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| self.ingest_error(e, records))?;

        if first_page {
            let deleted = sqlx::query(&format!("DELETE FROM {}", self.quoted_table))
                .execute(&mut *tx)
                .await
                .map_err(|e| self.ingest_error(e, records))?;
            info!(
                "Cleared {} rows from {} before first page",
                deleted.rows_affected(),
                self.table
            );
        }

        let mut inserted = 0u64;
        for chunk in records.chunks(INSERT_CHUNK) {
            let mut builder = QueryBuilder::new(format!("INSERT INTO {} (", self.quoted_table));
            let mut columns = builder.separated(", ");
            for rule in &self.mapping.rules {
                // Validated in the constructor.
                columns.push(quote_ident(&rule.column)?);
            }
            builder.push(") ");

            builder.push_values(chunk, |mut row, record| {
                for rule in &self.mapping.rules {
                    row.push_bind(project(record, &rule.json_path));
                }
            });

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .map_err(|e| self.ingest_error(e, records))?;
            inserted += result.rows_affected();
        }

        tx.commit()
            .await
            .map_err(|e| self.ingest_error(e, records))?;

        info!("{} rows inserted into {}", inserted, self.table);
        Ok(inserted)
    }

    fn ingest_error(&self, err: sqlx::Error, records: &[Value]) -> SyncError {
        SyncError::Ingest {
            table: self.table.clone(),
            message: err.to_string(),
            payload: payload_sample(records),
        }
    }
}

#[async_trait]
impl PageSink for Ingestor {
    async fn handle(&mut self, page: &Page) -> SyncResult<u64> {
        self.ingest(&page.records, page.is_first()).await
    }
}

/// Walk a dotted path into the record and render the value as text,
/// bounded by the destination column width. Missing paths and JSON nulls
/// become SQL NULL.
fn project(record: &Value, json_path: &str) -> Option<String> {
    let mut current = record;
    for segment in json_path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        Value::Null => None,
        Value::String(s) => Some(truncate(s)),
        other => Some(truncate(&other.to_string())),
    }
}

fn truncate(value: &str) -> String {
    value.chars().take(MAX_TEXT_WIDTH).collect()
}

/// Table and column names come from catalogue metadata, not user input,
/// but they are still interpolated into SQL and so are held to a strict
/// character set.
fn quote_ident(name: &str) -> SyncResult<String> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(SyncError::config(format!(
            "invalid identifier in mapping metadata: {name:?}"
        )));
    }
    Ok(format!("\"{name}\""))
}
