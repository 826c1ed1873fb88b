//! Destination store access
//!
//! Column-mapping resolution and page ingestion against the tenant's
//! destination database.

pub mod ingest;
pub mod mapper;

pub use ingest::{Ingestor, MAX_TEXT_WIDTH};
pub use mapper::{ColumnMapper, ColumnMapping, ColumnRule};
