//! Store contract shared by the reconciliation engine, the orchestrator and the API.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use leadsync_core::{LeadRecord, SyncRunLog};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("corrupt stored row: {0}")]
    Corrupt(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One write inside a chunk. A chunk never carries two writes for the same record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeadWrite {
    Insert(LeadRecord),
    Replace(LeadRecord),
}

impl LeadWrite {
    pub fn record(&self) -> &LeadRecord {
        match self {
            LeadWrite::Insert(record) | LeadWrite::Replace(record) => record,
        }
    }
}

/// Filters for the paginated lead listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LeadQuery {
    pub page: usize,
    pub limit: usize,
    pub policy_status: Option<String>,
    pub search: Option<String>,
    /// Inclusive lower bound on `createdDate`, compared as text.
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl Default for LeadQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 50,
            policy_status: None,
            search: None,
            date_from: None,
            date_to: None,
        }
    }
}

impl LeadQuery {
    pub const MAX_LIMIT: usize = 500;

    pub fn page(&self) -> usize {
        self.page.max(1)
    }

    pub fn limit(&self) -> usize {
        self.limit.clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> usize {
        (self.page() - 1) * self.limit()
    }

    pub(crate) fn search_term(&self) -> Option<&str> {
        self.search.as_deref().map(str::trim).filter(|s| !s.is_empty())
    }

    pub(crate) fn status_filter(&self) -> Option<&str> {
        self.policy_status.as_deref().filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub limit: usize,
    pub total: u64,
    pub pages: u64,
}

impl Pagination {
    pub fn new(query: &LeadQuery, total: u64) -> Self {
        let limit = query.limit();
        Self {
            page: query.page(),
            limit,
            total,
            pages: total.div_ceil(limit as u64),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeadPage {
    pub leads: Vec<LeadRecord>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub status: String,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadStats {
    pub total_records: u64,
    pub distinct_proposals: u64,
    pub duplicate_versions: u64,
    pub status_counts: Vec<StatusCount>,
    pub recent: Vec<LeadRecord>,
    pub last_run: Option<SyncRunLog>,
}

/// A proposal number that has been ingested more than once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DuplicateGroup {
    pub proposal_number: String,
    pub versions: u32,
    pub first_imported_at: DateTime<Utc>,
    pub last_imported_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PurgeCounts {
    pub leads: u64,
    pub run_logs: u64,
}

pub const RECENT_LEADS: usize = 10;

#[async_trait]
pub trait LeadStore: Send + Sync {
    /// Latest record per proposal number, for the keys that exist.
    async fn current_records(&self, proposal_numbers: &[String]) -> StoreResult<HashMap<String, LeadRecord>>;

    /// Highest stored version number per proposal number; absent keys have none.
    async fn latest_versions(&self, proposal_numbers: &[String]) -> StoreResult<HashMap<String, u32>>;

    /// Apply one chunk of writes atomically.
    async fn write_chunk(&self, writes: &[LeadWrite]) -> StoreResult<()>;

    /// All versions of one proposal number, oldest first, history included.
    async fn lead_versions(&self, proposal_number: &str) -> StoreResult<Vec<LeadRecord>>;

    async fn list_leads(&self, query: &LeadQuery) -> StoreResult<LeadPage>;

    async fn export_leads(&self) -> StoreResult<Vec<LeadRecord>>;

    async fn stats(&self) -> StoreResult<LeadStats>;

    async fn duplicate_summary(&self, limit: usize) -> StoreResult<Vec<DuplicateGroup>>;

    async fn append_run_log(&self, log: &SyncRunLog) -> StoreResult<()>;

    /// Most recent runs first.
    async fn recent_run_logs(&self, limit: usize) -> StoreResult<Vec<SyncRunLog>>;

    /// Operator-confirmed wipe of every lead and run log.
    async fn purge(&self) -> StoreResult<PurgeCounts>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_defaults_and_clamps() {
        let query = LeadQuery::default();
        assert_eq!((query.page(), query.limit(), query.offset()), (1, 50, 0));

        let query = LeadQuery {
            page: 0,
            limit: 10_000,
            ..LeadQuery::default()
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.limit(), LeadQuery::MAX_LIMIT);

        let query = LeadQuery {
            page: 3,
            limit: 20,
            search: Some("   ".into()),
            ..LeadQuery::default()
        };
        assert_eq!(query.offset(), 40);
        assert_eq!(query.search_term(), None);
    }

    #[test]
    fn pagination_rounds_pages_up() {
        let query = LeadQuery {
            limit: 20,
            ..LeadQuery::default()
        };
        assert_eq!(Pagination::new(&query, 41).pages, 3);
        assert_eq!(Pagination::new(&query, 0).pages, 0);
    }
}
