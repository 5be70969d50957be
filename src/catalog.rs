//! Relational catalog access: candidate scan queries and backup
//! registration.
//!
//! The catalog is the source of truth for what content exists (`upload`)
//! and what has already been backed up (`backup`). Candidates are rows in
//! `upload` with no matching `backup` row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use tokio::task::JoinHandle;

use crate::error::{CatalogError, ConnectSnafu, QuerySnafu, RegisterSnafu};

/// One pending upload row from the candidate scan.
#[derive(Debug, Clone)]
pub struct UploadRow {
    pub id: String,
    pub source_cid: String,
    pub content_cid: String,
    pub user_id: String,
}

/// Catalog operations the pipeline needs.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// Count uploads inserted at or after `since` that have no backup yet.
    /// Informational only, logged once at startup.
    async fn count_pending(&self, since: DateTime<Utc>) -> Result<i64, CatalogError>;

    /// Fetch one page of pending uploads inside `[from, to)`, ordered by
    /// insertion time ascending.
    async fn fetch_page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<UploadRow>, CatalogError>;

    /// Record that `upload_id` has been durably backed up at `url`.
    ///
    /// Idempotent: a second registration for the same upload overwrites the
    /// stored URL instead of failing.
    async fn register_backup(
        &self,
        upload_id: &str,
        url: &str,
        registered_at: DateTime<Utc>,
    ) -> Result<(), CatalogError>;

    /// Release the connection.
    async fn close(&self);
}

const COUNT_PENDING_SQL: &str = "\
    SELECT COUNT(*) \
    FROM upload u \
    LEFT JOIN backup b ON u.id = b.upload_id \
    WHERE u.inserted_at >= $1 \
    AND b.url IS NULL";

const FETCH_PAGE_SQL: &str = "\
    SELECT u.id::TEXT, u.source_cid, u.content_cid, u.user_id::TEXT \
    FROM upload u \
    LEFT JOIN backup b ON u.id = b.upload_id \
    WHERE u.inserted_at >= $1 \
    AND u.inserted_at < $2 \
    AND b.url IS NULL \
    ORDER BY u.inserted_at ASC \
    OFFSET $3 \
    LIMIT $4";

const REGISTER_SQL: &str = "\
    INSERT INTO backup (upload_id, url, inserted_at) \
    VALUES ($1, $2, $3) \
    ON CONFLICT (upload_id) DO UPDATE SET url = $2";

/// Postgres-backed catalog.
pub struct PgCatalog {
    client: tokio_postgres::Client,
    driver: JoinHandle<()>,
}

impl PgCatalog {
    /// Connect to the catalog database.
    pub async fn connect(database_url: &str) -> Result<Self, CatalogError> {
        let (client, connection) = tokio_postgres::connect(database_url, tokio_postgres::NoTls)
            .await
            .context(ConnectSnafu)?;

        // The connection future drives the socket; it must be polled for
        // the client to make progress.
        let driver = tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::error!(error = %e, "catalog connection error");
            }
        });

        Ok(Self { client, driver })
    }
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn count_pending(&self, since: DateTime<Utc>) -> Result<i64, CatalogError> {
        let row = self
            .client
            .query_one(COUNT_PENDING_SQL, &[&since])
            .await
            .context(QuerySnafu)?;
        Ok(row.get(0))
    }

    async fn fetch_page(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<UploadRow>, CatalogError> {
        let rows = self
            .client
            .query(FETCH_PAGE_SQL, &[&from, &to, &offset, &limit])
            .await
            .context(QuerySnafu)?;

        Ok(rows
            .into_iter()
            .map(|row| UploadRow {
                id: row.get(0),
                source_cid: row.get(1),
                content_cid: row.get(2),
                user_id: row.get(3),
            })
            .collect())
    }

    async fn register_backup(
        &self,
        upload_id: &str,
        url: &str,
        registered_at: DateTime<Utc>,
    ) -> Result<(), CatalogError> {
        self.client
            .execute(REGISTER_SQL, &[&upload_id, &url, &registered_at])
            .await
            .context(RegisterSnafu { upload_id })?;
        Ok(())
    }

    async fn close(&self) {
        self.driver.abort();
    }
}
