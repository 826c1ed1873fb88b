//! Tenant catalogue store
//!
//! Read-only lookups against the catalogue database: per-tenant access
//! credentials and the ordered resource list for a run-group. Consumed once
//! per run.

use std::time::Duration;

use log::{info, warn};
use sqlx::SqlitePool;

use crate::error::{SyncError, SyncResult};

/// Everything a run needs to reach the tenant's systems: OAuth endpoint,
/// API root, tenant database, SFTP drop and mail settings. Loaded once,
/// immutable for the run's duration.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AccessInfo {
    pub url: String,
    pub grant_type: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub root_url: String,
    pub database_name: String,
    pub day_offset: i64,
    pub ftp_host: String,
    pub ftp_user: String,
    pub ftp_pass: String,
    pub ftp_remote_path: String,
    pub ftp_local_path: String,
    pub smtp_host: String,
    pub smtp_user: String,
    pub smtp_pass: String,
    pub email_sender: String,
    pub email_recipients: String,
}

impl AccessInfo {
    /// Recipient column holds a `;`-separated list.
    pub fn recipient_list(&self) -> Vec<String> {
        self.email_recipients
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// One remote endpoint mapped to one destination table.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResourceSpec {
    pub table_name: String,
    pub endpoint: String,
    pub filter: String,
    pub batch_size: i64,
}

/// Read-only client for the catalogue database.
pub struct CatalogStore {
    pool: SqlitePool,
    prod: String,
}

impl CatalogStore {
    const LOOKUP_ATTEMPTS: u32 = 3;

    pub async fn connect(url: &str, prod: &str) -> SyncResult<Self> {
        let pool = SqlitePool::connect(url)
            .await
            .map_err(|e| SyncError::catalog_with_source("cannot open catalogue database", e))?;
        Ok(Self {
            pool,
            prod: prod.to_string(),
        })
    }

    pub fn from_pool(pool: SqlitePool, prod: &str) -> Self {
        Self {
            pool,
            prod: prod.to_string(),
        }
    }

    /// Access credentials for one tenant. The catalogue sits on a shared
    /// server, so lookups retry a few times with a linear backoff before
    /// the run is declared dead.
    pub async fn access_info(&self, customer: &str) -> SyncResult<AccessInfo> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.query_access_info(customer).await {
                Ok(Some(info)) => {
                    info!("Access info retrieved for customer {}", customer);
                    return Ok(info);
                }
                Ok(None) => {
                    return Err(SyncError::catalog(format!(
                        "no customer info found for {customer}"
                    )));
                }
                Err(err) if attempt < Self::LOOKUP_ATTEMPTS => {
                    let delay = Duration::from_secs(2 * attempt as u64);
                    warn!(
                        "Catalogue lookup attempt {} failed ({}), retrying in {:?}",
                        attempt, err, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(SyncError::catalog_with_source(
                        format!("access info lookup failed after {attempt} attempts"),
                        err,
                    ));
                }
            }
        }
    }

    async fn query_access_info(&self, customer: &str) -> Result<Option<AccessInfo>, sqlx::Error> {
        sqlx::query_as::<_, AccessInfo>(
            r#"SELECT url, grant_type, client_id, client_secret, scope, root_url,
                      database_name, day_offset, ftp_host, ftp_user, ftp_pass,
                      ftp_remote_path, ftp_local_path, smtp_host, smtp_user,
                      smtp_pass, email_sender, email_recipients
               FROM customer_info
               WHERE customer = ? AND prod = ?"#,
        )
        .bind(customer)
        .bind(&self.prod)
        .fetch_optional(&self.pool)
        .await
    }

    /// Ordered resource list for a run-group. A run-group naming a single
    /// table (recognized by `single_table_prefix`) selects just that table
    /// out of the `ALL` group instead.
    pub async fn resource_specs(
        &self,
        run_group: &str,
        single_table_prefix: &str,
    ) -> SyncResult<Vec<ResourceSpec>> {
        let single_table = !single_table_prefix.is_empty()
            && run_group
                .to_uppercase()
                .starts_with(&single_table_prefix.to_uppercase());

        let query = if single_table {
            sqlx::query_as::<_, ResourceSpec>(
                r#"SELECT table_name, endpoint, filter, batch_size
                   FROM api_list
                   WHERE dir = 'Outbound' AND run_group = 'ALL' AND table_name = ?
                   ORDER BY endpoint"#,
            )
            .bind(run_group.to_string())
        } else {
            sqlx::query_as::<_, ResourceSpec>(
                r#"SELECT table_name, endpoint, filter, batch_size
                   FROM api_list
                   WHERE dir = 'Outbound' AND run_group = ?
                   ORDER BY endpoint"#,
            )
            .bind(run_group.to_string())
        };

        let specs = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| SyncError::catalog_with_source("resource list lookup failed", e))?;

        info!("Retrieved {} resources for run-group {}", specs.len(), run_group);
        Ok(specs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One pooled connection: pooled in-memory databases are otherwise
    /// independent per connection.
    async fn memory_pool() -> SqlitePool {
        sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn seeded_store() -> CatalogStore {
        let pool = memory_pool().await;
        sqlx::query(
            r#"CREATE TABLE customer_info (
                customer TEXT, prod TEXT, url TEXT, grant_type TEXT,
                client_id TEXT, client_secret TEXT, scope TEXT, root_url TEXT,
                database_name TEXT, day_offset INTEGER, ftp_host TEXT,
                ftp_user TEXT, ftp_pass TEXT, ftp_remote_path TEXT,
                ftp_local_path TEXT, smtp_host TEXT, smtp_user TEXT,
                smtp_pass TEXT, email_sender TEXT, email_recipients TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            r#"CREATE TABLE api_list (
                dir TEXT, run_group TEXT, table_name TEXT,
                endpoint TEXT, filter TEXT, batch_size INTEGER
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();

        sqlx::query(
            r#"INSERT INTO customer_info VALUES (
                'DEMO', 'N', 'https://login.example/token', 'client_credentials',
                'cid', 'secret', 'api://scope/.default', 'https://api.example/v2',
                'DEMO_DB', 0, 'sftp.example', 'u', 'p', '/drop/MasterData/',
                '/var/cis', 'smtp.example', 'mailer', 'mailpass',
                'noreply@example.com', 'ops@example.com;dev@example.com'
            )"#,
        )
        .execute(&pool)
        .await
        .unwrap();

        for (group, table, endpoint) in [
            ("ALL", "HFSITEM", "items"),
            ("ALL", "HFSCUST", "customers"),
            ("NIGHTLY", "HFSORDER", "orders"),
        ] {
            sqlx::query("INSERT INTO api_list VALUES ('Outbound', ?, ?, ?, 'N', 100)")
                .bind(group)
                .bind(table)
                .bind(endpoint)
                .execute(&pool)
                .await
                .unwrap();
        }

        CatalogStore::from_pool(pool, "N")
    }

    #[tokio::test]
    async fn access_info_round_trip() {
        let store = seeded_store().await;
        let info = store.access_info("DEMO").await.unwrap();
        assert_eq!(info.database_name, "DEMO_DB");
        assert_eq!(
            info.recipient_list(),
            vec!["ops@example.com".to_string(), "dev@example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn unknown_customer_is_a_catalog_error() {
        let store = seeded_store().await;
        let err = store.access_info("NOBODY").await.unwrap_err();
        assert!(matches!(err, SyncError::Catalog { .. }));
    }

    #[tokio::test]
    async fn resource_specs_filter_by_group_ordered_by_endpoint() {
        let store = seeded_store().await;
        let specs = store.resource_specs("ALL", "HFS").await.unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].endpoint, "customers");
        assert_eq!(specs[1].endpoint, "items");
    }

    #[tokio::test]
    async fn single_table_group_selects_one_table_from_all() {
        let store = seeded_store().await;
        let specs = store.resource_specs("HFSITEM", "HFS").await.unwrap();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].table_name, "HFSITEM");
    }
}
