//! In-process lead store used by tests and offline runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use leadsync_core::{LeadRecord, SyncRunLog};
use tokio::sync::Mutex;

use crate::leads::{
    DuplicateGroup, LeadPage, LeadQuery, LeadStats, LeadStore, LeadWrite, Pagination, PurgeCounts,
    StatusCount, StoreError, StoreResult, RECENT_LEADS,
};

#[derive(Debug, Default)]
struct MemoryState {
    leads: Vec<LeadRecord>,
    runs: Vec<SyncRunLog>,
    write_calls: usize,
    failing_writes: HashSet<usize>,
}

#[derive(Debug, Default)]
pub struct MemoryLeadStore {
    state: Mutex<MemoryState>,
}

impl MemoryLeadStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the given `write_chunk` calls (0-based, counted from now on) fail.
    pub async fn fail_write_calls(&self, calls: impl IntoIterator<Item = usize>) {
        let mut state = self.state.lock().await;
        let base = state.write_calls;
        state.failing_writes = calls.into_iter().map(|c| base + c).collect();
    }

    pub async fn all_records(&self) -> Vec<LeadRecord> {
        self.state.lock().await.leads.clone()
    }

    pub async fn run_log_count(&self) -> usize {
        self.state.lock().await.runs.len()
    }
}

fn matches_query(record: &LeadRecord, query: &LeadQuery) -> bool {
    if let Some(status) = query.status_filter() {
        if record.fields.policy_status != status {
            return false;
        }
    }
    if let Some(term) = query.search_term() {
        let needle = term.to_lowercase();
        let hit = [
            &record.fields.proposal_number,
            &record.fields.proposer_name,
            &record.fields.intermediary_name,
        ]
        .iter()
        .any(|value| value.to_lowercase().contains(&needle));
        if !hit {
            return false;
        }
    }
    if let Some(from) = query.date_from.as_deref() {
        if record.fields.created_date.as_str() < from {
            return false;
        }
    }
    if let Some(to) = query.date_to.as_deref() {
        if record.fields.created_date.as_str() > to {
            return false;
        }
    }
    true
}

fn newest_first(records: &mut [LeadRecord]) {
    records.sort_by(|a, b| {
        b.last_updated_at
            .cmp(&a.last_updated_at)
            .then(b.imported_at.cmp(&a.imported_at))
            .then(b.version_number.cmp(&a.version_number))
    });
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn current_records(&self, proposal_numbers: &[String]) -> StoreResult<HashMap<String, LeadRecord>> {
        let wanted: HashSet<&str> = proposal_numbers.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        let mut out: HashMap<String, LeadRecord> = HashMap::new();
        for record in state.leads.iter().filter(|r| wanted.contains(r.proposal_number())) {
            let newer = out
                .get(record.proposal_number())
                .map_or(true, |current| record.version_number > current.version_number);
            if newer {
                out.insert(record.proposal_number().to_string(), record.clone());
            }
        }
        Ok(out)
    }

    async fn latest_versions(&self, proposal_numbers: &[String]) -> StoreResult<HashMap<String, u32>> {
        let wanted: HashSet<&str> = proposal_numbers.iter().map(String::as_str).collect();
        let state = self.state.lock().await;
        let mut out = HashMap::new();
        for record in state.leads.iter().filter(|r| wanted.contains(r.proposal_number())) {
            let latest = out.entry(record.proposal_number().to_string()).or_insert(0);
            *latest = (*latest).max(record.version_number);
        }
        Ok(out)
    }

    async fn write_chunk(&self, writes: &[LeadWrite]) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        let call = state.write_calls;
        state.write_calls += 1;
        if state.failing_writes.remove(&call) {
            return Err(StoreError::Unavailable(format!("injected failure on write {call}")));
        }

        // All-or-nothing: validate replaces before touching anything.
        let mut staged = state.leads.clone();
        for write in writes {
            match write {
                LeadWrite::Insert(record) => staged.push(record.clone()),
                LeadWrite::Replace(record) => {
                    let slot = staged
                        .iter_mut()
                        .find(|r| r.id == record.id)
                        .ok_or_else(|| StoreError::Corrupt(format!("no record with id {}", record.id)))?;
                    *slot = record.clone();
                }
            }
        }
        state.leads = staged;
        Ok(())
    }

    async fn lead_versions(&self, proposal_number: &str) -> StoreResult<Vec<LeadRecord>> {
        let state = self.state.lock().await;
        let mut out: Vec<LeadRecord> = state
            .leads
            .iter()
            .filter(|r| r.proposal_number() == proposal_number)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.version_number);
        Ok(out)
    }

    async fn list_leads(&self, query: &LeadQuery) -> StoreResult<LeadPage> {
        let state = self.state.lock().await;
        let mut filtered: Vec<LeadRecord> = state
            .leads
            .iter()
            .filter(|r| matches_query(r, query))
            .map(LeadRecord::without_history)
            .collect();
        newest_first(&mut filtered);
        let total = filtered.len() as u64;
        let leads = filtered
            .into_iter()
            .skip(query.offset())
            .take(query.limit())
            .collect();
        Ok(LeadPage {
            leads,
            pagination: Pagination::new(query, total),
        })
    }

    async fn export_leads(&self) -> StoreResult<Vec<LeadRecord>> {
        let state = self.state.lock().await;
        let mut out: Vec<LeadRecord> = state.leads.iter().map(LeadRecord::without_history).collect();
        out.sort_by(|a, b| {
            a.fields
                .proposal_number
                .cmp(&b.fields.proposal_number)
                .then(a.version_number.cmp(&b.version_number))
        });
        Ok(out)
    }

    async fn stats(&self) -> StoreResult<LeadStats> {
        let state = self.state.lock().await;
        let distinct: HashSet<&str> = state.leads.iter().map(|r| r.proposal_number()).collect();
        let mut statuses: BTreeMap<String, u64> = BTreeMap::new();
        for record in &state.leads {
            *statuses.entry(record.fields.policy_status.clone()).or_default() += 1;
        }
        let mut status_counts: Vec<StatusCount> = statuses
            .into_iter()
            .map(|(status, count)| StatusCount { status, count })
            .collect();
        status_counts.sort_by(|a, b| b.count.cmp(&a.count).then(a.status.cmp(&b.status)));

        let mut recent: Vec<LeadRecord> = state.leads.iter().map(LeadRecord::without_history).collect();
        newest_first(&mut recent);
        recent.truncate(RECENT_LEADS);

        Ok(LeadStats {
            total_records: state.leads.len() as u64,
            distinct_proposals: distinct.len() as u64,
            duplicate_versions: state.leads.iter().filter(|r| r.is_duplicate_version).count() as u64,
            status_counts,
            recent,
            last_run: state.runs.iter().max_by_key(|r| r.run_time).cloned(),
        })
    }

    async fn duplicate_summary(&self, limit: usize) -> StoreResult<Vec<DuplicateGroup>> {
        let state = self.state.lock().await;
        let mut groups: BTreeMap<&str, DuplicateGroup> = BTreeMap::new();
        for record in &state.leads {
            groups
                .entry(record.proposal_number())
                .and_modify(|g| {
                    g.versions += 1;
                    g.first_imported_at = g.first_imported_at.min(record.imported_at);
                    g.last_imported_at = g.last_imported_at.max(record.imported_at);
                })
                .or_insert_with(|| DuplicateGroup {
                    proposal_number: record.proposal_number().to_string(),
                    versions: 1,
                    first_imported_at: record.imported_at,
                    last_imported_at: record.imported_at,
                });
        }
        let mut out: Vec<DuplicateGroup> = groups.into_values().filter(|g| g.versions > 1).collect();
        out.sort_by(|a, b| b.versions.cmp(&a.versions).then(a.proposal_number.cmp(&b.proposal_number)));
        out.truncate(limit);
        Ok(out)
    }

    async fn append_run_log(&self, log: &SyncRunLog) -> StoreResult<()> {
        self.state.lock().await.runs.push(log.clone());
        Ok(())
    }

    async fn recent_run_logs(&self, limit: usize) -> StoreResult<Vec<SyncRunLog>> {
        let state = self.state.lock().await;
        let mut runs = state.runs.clone();
        runs.sort_by(|a, b| b.run_time.cmp(&a.run_time));
        runs.truncate(limit);
        Ok(runs)
    }

    async fn purge(&self) -> StoreResult<PurgeCounts> {
        let mut state = self.state.lock().await;
        let counts = PurgeCounts {
            leads: state.leads.len() as u64,
            run_logs: state.runs.len() as u64,
        };
        state.leads.clear();
        state.runs.clear();
        Ok(counts)
    }
}
