//! Reconciliation of normalized rows against the lead store.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use leadsync_core::{LeadFields, LeadRecord, MergeAction, ReconcilePolicy, RunError};
use leadsync_storage::{LeadStore, LeadWrite};
use serde::Serialize;
use tracing::{debug, info, warn};

pub const DEFAULT_CHUNK_SIZE: usize = 100;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    /// Records written with `is_duplicate_version` set.
    pub duplicates: usize,
    pub errors: Vec<RunError>,
}

impl ReconcileOutcome {
    fn add_counts(&mut self, other: &ReconcileOutcome) {
        self.created += other.created;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.duplicates += other.duplicates;
    }
}

/// Keys in first-seen order, without repeats.
fn distinct_keys(records: &[LeadFields]) -> Vec<String> {
    let mut seen = HashSet::new();
    records
        .iter()
        .map(|r| r.proposal_number.clone())
        .filter(|key| seen.insert(key.clone()))
        .collect()
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn LeadStore>,
    policy: ReconcilePolicy,
    chunk_size: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn LeadStore>, policy: ReconcilePolicy, chunk_size: usize) -> Self {
        Self {
            store,
            policy,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn policy(&self) -> ReconcilePolicy {
        self.policy
    }

    /// Apply one file's rows. Store failures are collected, never raised.
    pub async fn reconcile(&self, records: Vec<LeadFields>, context: &str) -> ReconcileOutcome {
        let outcome = match self.policy {
            ReconcilePolicy::Merge => self.merge(&records, context).await,
            ReconcilePolicy::InsertAll => self.insert_all(records, context).await,
        };
        info!(
            policy = %self.policy,
            context,
            created = outcome.created,
            updated = outcome.updated,
            unchanged = outcome.unchanged,
            duplicates = outcome.duplicates,
            errors = outcome.errors.len(),
            "reconciled batch"
        );
        outcome
    }

    async fn merge(&self, records: &[LeadFields], context: &str) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        for (index, chunk) in records.chunks(self.chunk_size).enumerate() {
            let chunk_no = index + 1;
            let keys = distinct_keys(chunk);
            let mut current = match self.store.current_records(&keys).await {
                Ok(current) => current,
                Err(err) => {
                    warn!(context, chunk = chunk_no, error = %err, "lookup of current records failed");
                    outcome.errors.push(RunError::new(
                        context,
                        format!("chunk {chunk_no}: reading current records failed: {err}"),
                    ));
                    continue;
                }
            };

            let now = Utc::now();
            let mut counts = ReconcileOutcome::default();
            let mut created: HashSet<String> = HashSet::new();
            let mut touched: Vec<String> = Vec::new();
            for fields in chunk {
                let key = &fields.proposal_number;
                match current.get_mut(key) {
                    None => {
                        current.insert(key.clone(), LeadRecord::new_version(fields.clone(), 1, now));
                        created.insert(key.clone());
                        touched.push(key.clone());
                        counts.created += 1;
                    }
                    Some(record) => match record.apply_incoming(fields, now) {
                        MergeAction::Unchanged => counts.unchanged += 1,
                        MergeAction::Updated => {
                            counts.updated += 1;
                            counts.duplicates += 1;
                            if !touched.contains(key) {
                                touched.push(key.clone());
                            }
                        }
                    },
                }
            }

            // Repeats within the chunk collapse into one write per key.
            let writes: Vec<LeadWrite> = touched
                .iter()
                .filter_map(|key| {
                    current.remove(key).map(|record| {
                        if created.contains(key) {
                            LeadWrite::Insert(record)
                        } else {
                            LeadWrite::Replace(record)
                        }
                    })
                })
                .collect();
            if writes.is_empty() {
                outcome.add_counts(&counts);
                continue;
            }

            match self.store.write_chunk(&writes).await {
                Ok(()) => {
                    debug!(context, chunk = chunk_no, writes = writes.len(), "merge chunk written");
                    outcome.add_counts(&counts);
                }
                Err(err) => {
                    warn!(context, chunk = chunk_no, error = %err, "merge chunk write failed");
                    outcome.errors.push(RunError::new(
                        context,
                        format!("chunk {chunk_no}: writing {} records failed: {err}", writes.len()),
                    ));
                }
            }
        }
        outcome
    }

    async fn insert_all(&self, records: Vec<LeadFields>, context: &str) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        let keys = distinct_keys(&records);
        let mut next_version: HashMap<String, u32> = HashMap::with_capacity(keys.len());
        for (index, chunk) in keys.chunks(self.chunk_size).enumerate() {
            match self.store.latest_versions(chunk).await {
                Ok(found) => {
                    for key in chunk {
                        next_version.insert(key.clone(), found.get(key).copied().unwrap_or(0));
                    }
                }
                Err(err) => {
                    warn!(context, chunk = index + 1, error = %err, "version lookup failed");
                    outcome.errors.push(RunError::new(
                        context,
                        format!("version lookup {} failed: {err}", index + 1),
                    ));
                }
            }
        }

        let now = Utc::now();
        let mut pending = Vec::with_capacity(records.len());
        let mut unresolved = 0usize;
        for fields in records {
            let Some(latest) = next_version.get_mut(&fields.proposal_number) else {
                unresolved += 1;
                continue;
            };
            *latest += 1;
            pending.push(LeadRecord::new_version(fields, *latest, now));
        }
        if unresolved > 0 {
            outcome.errors.push(RunError::new(
                context,
                format!("{unresolved} rows not inserted because their version lookup failed"),
            ));
        }

        // Once a key's chunk fails, its later versions are withheld so the
        // stored sequence never skips the missing version.
        let mut failed_keys: HashSet<String> = HashSet::new();
        let mut withheld = 0usize;
        for (index, chunk) in pending.chunks(self.chunk_size).enumerate() {
            let writes: Vec<LeadWrite> = chunk
                .iter()
                .filter(|record| {
                    let blocked = failed_keys.contains(record.proposal_number());
                    withheld += usize::from(blocked);
                    !blocked
                })
                .cloned()
                .map(LeadWrite::Insert)
                .collect();
            if writes.is_empty() {
                continue;
            }
            match self.store.write_chunk(&writes).await {
                Ok(()) => {
                    outcome.created += writes.len();
                    outcome.duplicates += writes
                        .iter()
                        .filter(|w| matches!(w, LeadWrite::Insert(r) if r.is_duplicate_version))
                        .count();
                }
                Err(err) => {
                    warn!(context, chunk = index + 1, error = %err, "insert chunk failed");
                    outcome.errors.push(RunError::new(
                        context,
                        format!("chunk {}: inserting {} records failed: {err}", index + 1, writes.len()),
                    ));
                    for write in &writes {
                        if let LeadWrite::Insert(record) = write {
                            failed_keys.insert(record.proposal_number().to_string());
                        }
                    }
                }
            }
        }
        if withheld > 0 {
            outcome.errors.push(RunError::new(
                context,
                format!("{withheld} rows not inserted because an earlier version failed to write"),
            ));
        }
        outcome
    }
}
