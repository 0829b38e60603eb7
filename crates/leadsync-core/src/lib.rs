//! Core domain model for partner lead sync.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "leadsync-core";

macro_rules! canonical_fields {
    ($($variant:ident => $field:ident : $key:literal),+ $(,)?) => {
        /// Canonical lead/policy fields as received from the partner.
        ///
        /// Every field is a verbatim string; a field missing from the source
        /// sheet is an empty string, never absent. Equality over this struct is
        /// the change-detection contract used by the merge policy.
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase", default)]
        pub struct LeadFields {
            $(pub $field: String,)+
        }

        /// Name of one canonical field.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub enum LeadField {
            $($variant,)+
        }

        impl LeadField {
            /// All canonical fields in declaration order.
            pub const ALL: &'static [LeadField] = &[$(LeadField::$variant,)+];

            /// Wire/storage key (camelCase).
            pub fn key(self) -> &'static str {
                match self {
                    $(LeadField::$variant => $key,)+
                }
            }

            pub fn from_key(key: &str) -> Option<Self> {
                match key {
                    $($key => Some(LeadField::$variant),)+
                    _ => None,
                }
            }
        }

        impl LeadFields {
            pub fn get(&self, field: LeadField) -> &str {
                match field {
                    $(LeadField::$variant => &self.$field,)+
                }
            }

            pub fn set(&mut self, field: LeadField, value: String) {
                match field {
                    $(LeadField::$variant => self.$field = value,)+
                }
            }
        }
    };
}

canonical_fields! {
    ProposalNumber => proposal_number: "proposalNumber",
    ProposerCode => proposer_code: "proposerCode",
    ProposerName => proposer_name: "proposerName",
    BusinessType => business_type: "businessType",
    SourceCode => source_code: "sourceCode",
    CreatedDate => created_date: "createdDate",
    InwardingUserCode => inwarding_user_code: "inwardingUserCode",
    ProposalIntimationDate => proposal_intimation_date: "proposalIntimationDate",
    IntimationAgeing => intimation_ageing: "intimationAgeing",
    IntimationSubAgeing => intimation_sub_ageing: "intimationSubAgeing",
    PolicyIssueDate => policy_issue_date: "policyIssueDate",
    PolicyStatus => policy_status: "policyStatus",
    SubStatus => sub_status: "subStatus",
    DiscrepancyRemark => discrepancy_remark: "discrepancyRemark",
    LatestSubStatusDate => latest_sub_status_date: "latestSubStatusDate",
    SubStatusAgeing => sub_status_ageing: "subStatusAgeing",
    SubStatusSubAgeing => sub_status_sub_ageing: "subStatusSubAgeing",
    BranchCode => branch_code: "branchCode",
    IntermediaryCode => intermediary_code: "intermediaryCode",
    Channel => channel: "channel",
    GoGreen => go_green: "goGreen",
    CombiFlag => combi_flag: "combiFlag",
    ApplicableSumInsured => applicable_sum_insured: "applicableSumInsured",
    ProductName => product_name: "productName",
    ReceiptTag => receipt_tag: "receiptTag",
    LatestFollowupDate => latest_followup_date: "latestFollowupDate",
    LatestTeamName => latest_team_name: "latestTeamName",
    IntermediaryName => intermediary_name: "intermediaryName",
    IntermediaryClassification => intermediary_classification: "intermediaryClassification",
    InwardingBranchName => inwarding_branch_name: "inwardingBranchName",
    EmployeeDiscount => employee_discount: "employeeDiscount",
    CoverType => cover_type: "coverType",
    LgCode => lg_code: "lgCode",
    LeadId => lead_id: "leadId",
    PartnerSpCode => partner_sp_code: "partnerSpCode",
    SalesManagerCode => sales_manager_code: "salesManagerCode",
    SalesManagerName => sales_manager_name: "salesManagerName",
    PolicyExpiryDate => policy_expiry_date: "policyExpiryDate",
    Nationality => nationality: "nationality",
    GstExemption => gst_exemption: "gstExemption",
    PremiumMode => premium_mode: "premiumMode",
    NetPremium => net_premium: "netPremium",
    GrossPremium => gross_premium: "grossPremium",
}

impl LeadFields {
    /// Fields with only the identity set; handy for building test rows.
    pub fn with_proposal_number(proposal_number: impl Into<String>) -> Self {
        Self {
            proposal_number: proposal_number.into(),
            ..Self::default()
        }
    }
}

/// Pre-change snapshot appended whenever the merge policy overwrites a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub snapshot: LeadFields,
}

/// Result of applying an incoming row to an existing record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeAction {
    Unchanged,
    Updated,
}

/// One stored lead/policy record at one point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeadRecord {
    pub id: Uuid,
    pub version_number: u32,
    pub is_duplicate_version: bool,
    #[serde(flatten)]
    pub fields: LeadFields,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<HistoryEntry>,
    pub imported_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
}

impl LeadRecord {
    /// Fresh record for the given version; only version 1 is not a duplicate.
    pub fn new_version(fields: LeadFields, version_number: u32, at: DateTime<Utc>) -> Self {
        let version_number = version_number.max(1);
        Self {
            id: Uuid::new_v4(),
            version_number,
            is_duplicate_version: version_number > 1,
            fields,
            history: Vec::new(),
            imported_at: at,
            created_at: at,
            last_updated_at: at,
        }
    }

    pub fn proposal_number(&self) -> &str {
        &self.fields.proposal_number
    }

    /// Merge an incoming row into this record.
    ///
    /// Unchanged rows leave the record untouched, `last_updated_at` included.
    /// A changed row pushes the previous field set onto `history`, overwrites
    /// the fields and advances the version.
    pub fn apply_incoming(&mut self, incoming: &LeadFields, at: DateTime<Utc>) -> MergeAction {
        if self.fields == *incoming {
            return MergeAction::Unchanged;
        }
        let previous = std::mem::replace(&mut self.fields, incoming.clone());
        self.history.push(HistoryEntry {
            timestamp: at,
            snapshot: previous,
        });
        self.version_number = self.version_number.saturating_add(1);
        self.is_duplicate_version = true;
        self.imported_at = at;
        self.last_updated_at = at;
        MergeAction::Updated
    }

    /// Copy without the history payload, as used by list views and exports.
    pub fn without_history(&self) -> Self {
        Self {
            history: Vec::new(),
            ..self.clone()
        }
    }
}

/// How incoming rows are reconciled against the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReconcilePolicy {
    /// One current record per proposal number plus a change history.
    Merge,
    /// Every ingested row becomes its own immutable, versioned record.
    #[default]
    InsertAll,
}

impl ReconcilePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconcilePolicy::Merge => "merge",
            ReconcilePolicy::InsertAll => "insert-all",
        }
    }
}

impl fmt::Display for ReconcilePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReconcilePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "merge" | "upsert" => Ok(ReconcilePolicy::Merge),
            "insert-all" | "insert_all" | "insertall" => Ok(ReconcilePolicy::InsertAll),
            other => Err(format!("unknown reconcile policy `{other}` (expected merge or insert-all)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Partial,
    Failed,
}

impl RunStatus {
    /// Classify a finished cycle from its error list and processed files.
    pub fn classify(errors: &[RunError], files_processed: &[String]) -> Self {
        if errors.is_empty() {
            RunStatus::Success
        } else if files_processed.is_empty() {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Partial => "partial",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunStatus::Success),
            "partial" => Ok(RunStatus::Partial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

/// Structured failure captured into a run log instead of being raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub context: String,
    pub message: String,
}

impl RunError {
    pub fn new(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            message: message.into(),
        }
    }
}

/// Append-only record of one executed sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRunLog {
    pub run_id: Uuid,
    pub run_time: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub policy: ReconcilePolicy,
    pub messages_scanned: usize,
    pub records_created: usize,
    pub records_updated: usize,
    pub records_unchanged: usize,
    pub duplicate_versions: usize,
    pub rows_skipped: usize,
    pub status: RunStatus,
    pub errors: Vec<RunError>,
    pub files_processed: Vec<String>,
}
