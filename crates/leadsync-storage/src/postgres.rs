//! PostgreSQL-backed lead store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use leadsync_core::{HistoryEntry, LeadFields, LeadRecord, RunError, SyncRunLog};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::leads::{
    DuplicateGroup, LeadPage, LeadQuery, LeadStats, LeadStore, LeadWrite, Pagination, PurgeCounts,
    StatusCount, StoreError, StoreResult, RECENT_LEADS,
};

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const LEAD_COLUMNS: &str =
    "id, version_number, is_duplicate_version, fields, history, imported_at, created_at, last_updated_at";

// List views never ship the history payload.
const LIST_COLUMNS: &str = "id, version_number, is_duplicate_version, fields, '[]'::jsonb AS history, \
     imported_at, created_at, last_updated_at";

const RUN_COLUMNS: &str = "run_id, run_time, finished_at, policy, messages_scanned, records_created, \
     records_updated, records_unchanged, duplicate_versions, rows_skipped, status, errors, files_processed";

#[derive(Debug, Clone)]
pub struct PgLeadStore {
    pool: PgPool,
}

impl PgLeadStore {
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

fn version_to_db(version: u32) -> i32 {
    i32::try_from(version).unwrap_or(i32::MAX)
}

fn count_from_db(value: i64) -> u64 {
    u64::try_from(value).unwrap_or_default()
}

fn lead_from_row(row: &PgRow) -> StoreResult<LeadRecord> {
    let Json(fields): Json<LeadFields> = row.try_get("fields")?;
    let Json(history): Json<Vec<HistoryEntry>> = row.try_get("history")?;
    let version: i32 = row.try_get("version_number")?;
    let version_number = u32::try_from(version)
        .map_err(|_| StoreError::Corrupt(format!("invalid version number {version}")))?;
    Ok(LeadRecord {
        id: row.try_get("id")?,
        version_number,
        is_duplicate_version: row.try_get("is_duplicate_version")?,
        fields,
        history,
        imported_at: row.try_get("imported_at")?,
        created_at: row.try_get("created_at")?,
        last_updated_at: row.try_get("last_updated_at")?,
    })
}

fn run_log_from_row(row: &PgRow) -> StoreResult<SyncRunLog> {
    let status: String = row.try_get("status")?;
    let policy: String = row.try_get("policy")?;
    let Json(errors): Json<Vec<RunError>> = row.try_get("errors")?;
    let Json(files_processed): Json<Vec<String>> = row.try_get("files_processed")?;
    let count = |column: &str| -> StoreResult<usize> {
        let value: i64 = row.try_get(column)?;
        Ok(usize::try_from(value).unwrap_or_default())
    };
    Ok(SyncRunLog {
        run_id: row.try_get("run_id")?,
        run_time: row.try_get("run_time")?,
        finished_at: row.try_get("finished_at")?,
        policy: policy.parse().map_err(StoreError::Corrupt)?,
        messages_scanned: count("messages_scanned")?,
        records_created: count("records_created")?,
        records_updated: count("records_updated")?,
        records_unchanged: count("records_unchanged")?,
        duplicate_versions: count("duplicate_versions")?,
        rows_skipped: count("rows_skipped")?,
        status: status.parse().map_err(StoreError::Corrupt)?,
        errors,
        files_processed,
    })
}

fn escape_like(term: &str) -> String {
    let mut out = String::with_capacity(term.len());
    for c in term.chars() {
        if matches!(c, '\\' | '%' | '_') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

fn push_filters(qb: &mut QueryBuilder<'_, Postgres>, query: &LeadQuery) {
    if let Some(status) = query.status_filter() {
        qb.push(" AND fields->>'policyStatus' = ")
            .push_bind(status.to_string());
    }
    if let Some(term) = query.search_term() {
        let pattern = format!("%{}%", escape_like(term));
        qb.push(" AND (proposal_number ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR fields->>'proposerName' ILIKE ")
            .push_bind(pattern.clone())
            .push(" OR fields->>'intermediaryName' ILIKE ")
            .push_bind(pattern)
            .push(")");
    }
    if let Some(from) = query.date_from.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND fields->>'createdDate' >= ").push_bind(from.to_string());
    }
    if let Some(to) = query.date_to.as_deref().filter(|s| !s.is_empty()) {
        qb.push(" AND fields->>'createdDate' <= ").push_bind(to.to_string());
    }
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn current_records(&self, proposal_numbers: &[String]) -> StoreResult<HashMap<String, LeadRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT DISTINCT ON (proposal_number) {LEAD_COLUMNS}
              FROM leads
             WHERE proposal_number = ANY($1)
             ORDER BY proposal_number, version_number DESC
            "#
        ))
        .bind(proposal_numbers)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in &rows {
            let record = lead_from_row(row)?;
            out.insert(record.proposal_number().to_string(), record);
        }
        Ok(out)
    }

    async fn latest_versions(&self, proposal_numbers: &[String]) -> StoreResult<HashMap<String, u32>> {
        let rows = sqlx::query(
            r#"
            SELECT proposal_number, MAX(version_number) AS latest
              FROM leads
             WHERE proposal_number = ANY($1)
             GROUP BY proposal_number
            "#,
        )
        .bind(proposal_numbers)
        .fetch_all(&self.pool)
        .await?;

        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let latest: i32 = row.try_get("latest")?;
            let latest = u32::try_from(latest)
                .map_err(|_| StoreError::Corrupt(format!("invalid version number {latest}")))?;
            out.insert(row.try_get("proposal_number")?, latest);
        }
        Ok(out)
    }

    async fn write_chunk(&self, writes: &[LeadWrite]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        for write in writes {
            match write {
                LeadWrite::Insert(record) => {
                    sqlx::query(
                        r#"
                        INSERT INTO leads (id, proposal_number, version_number, is_duplicate_version,
                                           fields, history, imported_at, created_at, last_updated_at)
                        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                        "#,
                    )
                    .bind(record.id)
                    .bind(record.proposal_number())
                    .bind(version_to_db(record.version_number))
                    .bind(record.is_duplicate_version)
                    .bind(Json(&record.fields))
                    .bind(Json(&record.history))
                    .bind(record.imported_at)
                    .bind(record.created_at)
                    .bind(record.last_updated_at)
                    .execute(&mut *tx)
                    .await?;
                }
                LeadWrite::Replace(record) => {
                    let result = sqlx::query(
                        r#"
                        UPDATE leads
                           SET version_number = $2,
                               is_duplicate_version = $3,
                               fields = $4,
                               history = $5,
                               imported_at = $6,
                               last_updated_at = $7
                         WHERE id = $1
                        "#,
                    )
                    .bind(record.id)
                    .bind(version_to_db(record.version_number))
                    .bind(record.is_duplicate_version)
                    .bind(Json(&record.fields))
                    .bind(Json(&record.history))
                    .bind(record.imported_at)
                    .bind(record.last_updated_at)
                    .execute(&mut *tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        // Dropping the transaction rolls the chunk back.
                        return Err(StoreError::Corrupt(format!("no record with id {}", record.id)));
                    }
                }
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn lead_versions(&self, proposal_number: &str) -> StoreResult<Vec<LeadRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {LEAD_COLUMNS} FROM leads WHERE proposal_number = $1 ORDER BY version_number"
        ))
        .bind(proposal_number)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lead_from_row).collect()
    }

    async fn list_leads(&self, query: &LeadQuery) -> StoreResult<LeadPage> {
        let mut count_qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM leads WHERE TRUE");
        push_filters(&mut count_qb, query);
        let total: i64 = count_qb.build_query_scalar().fetch_one(&self.pool).await?;

        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {LIST_COLUMNS} FROM leads WHERE TRUE"));
        push_filters(&mut qb, query);
        qb.push(" ORDER BY last_updated_at DESC, imported_at DESC, version_number DESC LIMIT ")
            .push_bind(query.limit() as i64)
            .push(" OFFSET ")
            .push_bind(query.offset() as i64);
        let rows = qb.build().fetch_all(&self.pool).await?;

        Ok(LeadPage {
            leads: rows.iter().map(lead_from_row).collect::<StoreResult<Vec<_>>>()?,
            pagination: Pagination::new(query, count_from_db(total)),
        })
    }

    async fn export_leads(&self) -> StoreResult<Vec<LeadRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {LIST_COLUMNS} FROM leads ORDER BY proposal_number, version_number"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(lead_from_row).collect()
    }

    async fn stats(&self) -> StoreResult<LeadStats> {
        let totals = sqlx::query(
            r#"
            SELECT COUNT(*) AS total_records,
                   COUNT(DISTINCT proposal_number) AS distinct_proposals,
                   COUNT(*) FILTER (WHERE is_duplicate_version) AS duplicate_versions
              FROM leads
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let status_rows = sqlx::query(
            r#"
            SELECT COALESCE(fields->>'policyStatus', '') AS status, COUNT(*) AS count
              FROM leads
             GROUP BY 1
             ORDER BY 2 DESC, 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        let mut status_counts = Vec::with_capacity(status_rows.len());
        for row in status_rows {
            let count: i64 = row.try_get("count")?;
            status_counts.push(StatusCount {
                status: row.try_get("status")?,
                count: count_from_db(count),
            });
        }

        let recent_rows = sqlx::query(&format!(
            "SELECT {LIST_COLUMNS} FROM leads ORDER BY last_updated_at DESC, imported_at DESC LIMIT $1"
        ))
        .bind(RECENT_LEADS as i64)
        .fetch_all(&self.pool)
        .await?;

        let total_records: i64 = totals.try_get("total_records")?;
        let distinct_proposals: i64 = totals.try_get("distinct_proposals")?;
        let duplicate_versions: i64 = totals.try_get("duplicate_versions")?;
        Ok(LeadStats {
            total_records: count_from_db(total_records),
            distinct_proposals: count_from_db(distinct_proposals),
            duplicate_versions: count_from_db(duplicate_versions),
            status_counts,
            recent: recent_rows.iter().map(lead_from_row).collect::<StoreResult<Vec<_>>>()?,
            last_run: self.recent_run_logs(1).await?.into_iter().next(),
        })
    }

    async fn duplicate_summary(&self, limit: usize) -> StoreResult<Vec<DuplicateGroup>> {
        let rows = sqlx::query(
            r#"
            SELECT proposal_number,
                   COUNT(*) AS versions,
                   MIN(imported_at) AS first_imported_at,
                   MAX(imported_at) AS last_imported_at
              FROM leads
             GROUP BY proposal_number
            HAVING COUNT(*) > 1
             ORDER BY versions DESC, proposal_number
             LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let versions: i64 = row.try_get("versions")?;
            out.push(DuplicateGroup {
                proposal_number: row.try_get("proposal_number")?,
                versions: u32::try_from(versions).unwrap_or(u32::MAX),
                first_imported_at: row.try_get("first_imported_at")?,
                last_imported_at: row.try_get("last_imported_at")?,
            });
        }
        Ok(out)
    }

    async fn append_run_log(&self, log: &SyncRunLog) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_runs (run_id, run_time, finished_at, policy, messages_scanned,
                                   records_created, records_updated, records_unchanged,
                                   duplicate_versions, rows_skipped, status, errors, files_processed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(log.run_id)
        .bind(log.run_time)
        .bind(log.finished_at)
        .bind(log.policy.as_str())
        .bind(log.messages_scanned as i64)
        .bind(log.records_created as i64)
        .bind(log.records_updated as i64)
        .bind(log.records_unchanged as i64)
        .bind(log.duplicate_versions as i64)
        .bind(log.rows_skipped as i64)
        .bind(log.status.as_str())
        .bind(Json(&log.errors))
        .bind(Json(&log.files_processed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_run_logs(&self, limit: usize) -> StoreResult<Vec<SyncRunLog>> {
        let rows = sqlx::query(&format!(
            "SELECT {RUN_COLUMNS} FROM sync_runs ORDER BY run_time DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(run_log_from_row).collect()
    }

    async fn purge(&self) -> StoreResult<PurgeCounts> {
        let mut tx = self.pool.begin().await?;
        let leads = sqlx::query("DELETE FROM leads").execute(&mut *tx).await?;
        let runs = sqlx::query("DELETE FROM sync_runs").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(PurgeCounts {
            leads: leads.rows_affected(),
            run_logs: runs.rows_affected(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_patterns_escape_wildcards() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("P-100"), "P-100");
    }
}
