//! Tender persistence: the `TenderStore` seam, a Postgres backend and an in-memory backend.

use async_trait::async_trait;
use bidbase_core::{FilterStats, NewTender, NewTenderDocument, Tender, TenderDocument, TenderPage, TenderSearchParams};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

mod memory;
mod postgres;
pub mod query;

pub use memory::MemoryTenderStore;
pub use postgres::{connect_pool, PgTenderStore};
pub use query::{compile_predicates, Predicate};

/// Facet lists are cut to the most frequent values.
pub const FACET_LIMIT: usize = 50;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("constraint violated: {0}")]
    Constraint(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenderHeadline {
    pub ocid: String,
    pub title: String,
}

/// Operator snapshot used by `bidbase check`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreOverview {
    pub tender_count: u64,
    pub document_count: u64,
    pub recent_tenders: Vec<Tender>,
    pub sample_with_documents: Option<TenderHeadline>,
}

/// Everything the sync job and the HTTP surface need from storage.
///
/// Methods that interpret "now" take it explicitly so a page query, its count query
/// and the facet counts of one request agree on the active/closed boundary.
#[async_trait]
pub trait TenderStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Insert new tenders; existing rows only refresh title, description, end date and value.
    async fn upsert_tenders(&self, batch: &[NewTender]) -> Result<u64, StoreError>;

    /// Insert or fully refresh documents keyed by `(tender_ocid, document_id)`.
    async fn upsert_documents(&self, batch: &[NewTenderDocument]) -> Result<u64, StoreError>;

    async fn search_tenders(
        &self,
        params: &TenderSearchParams,
        now: DateTime<Utc>,
    ) -> Result<TenderPage, StoreError>;

    async fn filter_stats(&self, now: DateTime<Utc>) -> Result<FilterStats, StoreError>;

    async fn get_tender(&self, ocid: &str) -> Result<Option<Tender>, StoreError>;

    /// Documents of one tender in insertion order.
    async fn tender_documents(&self, ocid: &str) -> Result<Vec<TenderDocument>, StoreError>;

    /// Keep the lowest-id row of every `(tender_ocid, document_id)` group; returns rows removed.
    async fn cleanup_duplicate_documents(&self) -> Result<u64, StoreError>;

    async fn overview(&self, recent: usize) -> Result<StoreOverview, StoreError>;
}
