//! Spreadsheet header discovery and mapping of partner columns to canonical fields.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use chrono::Timelike;
use leadsync_core::{LeadField, LeadFields};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Rows scanned per sheet when looking for the header row.
pub const HEADER_SCAN_ROWS: usize = 10;
/// Case-insensitive token that marks the header row.
pub const HEADER_MARKER: &str = "proposal";

const CELL_DATE_FORMAT: &str = "%Y-%m-%d";
const CELL_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One data row keyed by trimmed header label.
pub type RawRow = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum WorkbookError {
    #[error("cannot open workbook {path}: {message}")]
    Open { path: PathBuf, message: String },
    #[error("workbook {0} has no sheets")]
    NoSheets(PathBuf),
    #[error("cannot read sheet `{sheet}` of {path}: {message}")]
    Sheet {
        path: PathBuf,
        sheet: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum RowRejection {
    #[error("PROPOSAL NUMBER field is missing or empty")]
    MissingProposalNumber,
}

/// A sheet loaded as cell text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetGrid {
    pub name: String,
    /// Zero-based worksheet row of `rows[0]`.
    pub first_row: usize,
    pub rows: Vec<Vec<String>>,
}

impl SheetGrid {
    pub fn new(name: impl Into<String>, rows: Vec<Vec<String>>) -> Self {
        Self {
            name: name.into(),
            first_row: 0,
            rows,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLocation {
    pub sheet: usize,
    pub row: usize,
    /// False when the marker was not found and the fallback was used.
    pub detected: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRow {
    /// 1-based worksheet row number.
    pub row_number: usize,
    pub reason: RowRejection,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    pub sheet_name: String,
    /// 1-based worksheet row number of the header.
    pub header_row: usize,
    pub records: Vec<LeadFields>,
    pub skipped: Vec<SkippedRow>,
}

/// Column labels accepted for each canonical field, in preference order.
pub fn aliases(field: LeadField) -> &'static [&'static str] {
    use LeadField::*;
    match field {
        ProposalNumber => &["PROPOSAL NUMBER", "ProposalNumber", "Proposal Number", "proposal_number"],
        ProposerCode => &["PROPOSER CODE", "ProposerCode", "Proposer Code"],
        ProposerName => &["PROPOSER NAME", "ProposerName", "Proposer Name"],
        BusinessType => &["Business Type", "BusinessType", "BUSINESS TYPE"],
        SourceCode => &["SOURCECODE", "SourceCode", "Source Code"],
        CreatedDate => &["CREATED DATE", "CreatedDate", "Created Date"],
        InwardingUserCode => &["Inwarding User Code", "InwardingUserCode", "INWARDING USER CODE"],
        ProposalIntimationDate => &[
            "PROPOSAL INTIMATION DATE",
            "ProposalIntimationDate",
            "Proposal Intimation Date",
        ],
        IntimationAgeing => &["Intimation Ageing", "IntimationAgeing", "INTIMATION AGEING"],
        IntimationSubAgeing => &["Intimation Sub Ageing", "IntimationSubAgeing", "INTIMATION SUB AGEING"],
        PolicyIssueDate => &["Policy Issue date", "PolicyIssueDate", "POLICY ISSUE DATE"],
        PolicyStatus => &["POLICY STATUS", "PolicyStatus", "Policy Status"],
        SubStatus => &["SUBSTATUS", "SubStatus", "Sub Status"],
        DiscrepancyRemark => &["Discrepancy Remark", "DiscrepancyRemark", "DISCREPANCY REMARK"],
        LatestSubStatusDate => &["Latest Sub Status Date", "LatestSubStatusDate", "LATEST SUB STATUS DATE"],
        SubStatusAgeing => &["Sub Status Ageing", "SubStatusAgeing", "SUB STATUS AGEING"],
        SubStatusSubAgeing => &["Sub Status Sub Ageing", "SubStatusSubAgeing", "SUB STATUS SUB AGEING"],
        BranchCode => &["Branch Code", "BranchCode", "BRANCH CODE"],
        IntermediaryCode => &["Intermediary CODE", "IntermediaryCode", "INTERMEDIARY CODE"],
        Channel => &["Channel", "CHANNEL"],
        GoGreen => &["GO GREEN", "GoGreen", "Go Green"],
        CombiFlag => &["combi Flag", "CombiFlag", "COMBI FLAG"],
        // The partner's export misspells this header.
        ApplicableSumInsured => &["APPLICABLE SUMINUSRED", "ApplicableSumInsured", "Applicable Sum Insured"],
        ProductName => &["PRODUCT NAME", "ProductName", "Product Name"],
        ReceiptTag => &["RECEIPT TAG", "ReceiptTag", "Receipt Tag"],
        LatestFollowupDate => &["Latest Followup Date", "LatestFollowupDate", "LATEST FOLLOWUP DATE"],
        LatestTeamName => &["Latest Team Name", "LatestTeamName", "LATEST TEAM NAME"],
        IntermediaryName => &["Intermediary Name", "IntermediaryName", "INTERMEDIARY NAME"],
        IntermediaryClassification => &[
            "INTERMEDIARY CLASFICATION",
            "IntermediaryClassification",
            "Intermediary Classification",
        ],
        InwardingBranchName => &["INWARDING BRANCH NAME", "InwardingBranchName", "Inwarding Branch Name"],
        EmployeeDiscount => &["EMPLOYEE DISCOUNT", "EmployeeDiscount", "Employee Discount"],
        CoverType => &["Cover Type", "CoverType", "COVER TYPE"],
        LgCode => &["LG CODE", "LgCode", "LG Code"],
        LeadId => &["LEAD ID", "LeadId", "Lead ID"],
        PartnerSpCode => &["PARTNER SP CODE", "PartnerSpCode", "Partner SP Code"],
        SalesManagerCode => &["Sales Manager Code", "SalesManagerCode", "SALES MANAGER CODE"],
        SalesManagerName => &["Sales Manager Name", "SalesManagerName", "SALES MANAGER NAME"],
        PolicyExpiryDate => &["Policy Expiry Date", "PolicyExpiryDate", "POLICY EXPIRY DATE"],
        Nationality => &["Nationality", "NATIONALITY"],
        GstExemption => &["GST Exemption", "GstExemption", "GST EXEMPTION"],
        PremiumMode => &["PREMIUM MODE", "PremiumMode", "Premium Mode"],
        NetPremium => &["Net Premium", "NetPremium", "NET PREMIUM"],
        GrossPremium => &["Gross Premium", "GrossPremium", "GROSS PREMIUM"],
    }
}

fn is_header_row(row: &[String]) -> bool {
    row.iter()
        .any(|cell| cell.to_ascii_lowercase().contains(HEADER_MARKER))
}

/// First sheet/row within the scan window carrying the header marker.
///
/// Without a marker the second sheet is used when there is more than one,
/// otherwise the first, with the header on its first row.
pub fn locate_header(sheets: &[SheetGrid]) -> Option<HeaderLocation> {
    if sheets.is_empty() {
        return None;
    }
    for (sheet, grid) in sheets.iter().enumerate() {
        if let Some(row) = grid
            .rows
            .iter()
            .take(HEADER_SCAN_ROWS)
            .position(|r| is_header_row(r))
        {
            return Some(HeaderLocation {
                sheet,
                row,
                detected: true,
            });
        }
    }
    Some(HeaderLocation {
        sheet: if sheets.len() > 1 { 1 } else { 0 },
        row: 0,
        detected: false,
    })
}

/// Map data rows under `header` to label-keyed rows, paired with their grid index.
///
/// Blank header cells are ignored, the leftmost of duplicate labels wins and
/// rows with no non-empty value are dropped.
pub fn rows_to_maps(header: &[String], rows: &[Vec<String>]) -> Vec<(usize, RawRow)> {
    let mut columns: Vec<(usize, &str)> = Vec::new();
    for (col, label) in header.iter().enumerate() {
        let label = label.trim();
        if label.is_empty() || columns.iter().any(|(_, seen)| *seen == label) {
            continue;
        }
        columns.push((col, label));
    }

    rows.iter()
        .enumerate()
        .filter_map(|(index, row)| {
            let mapped: RawRow = columns
                .iter()
                .map(|(col, label)| {
                    (
                        (*label).to_string(),
                        row.get(*col).cloned().unwrap_or_default(),
                    )
                })
                .collect();
            mapped
                .values()
                .any(|v| !v.trim().is_empty())
                .then_some((index, mapped))
        })
        .collect()
}

/// Canonical fields for one row; the first alias present wins.
pub fn normalize_row(row: &RawRow) -> Result<LeadFields, RowRejection> {
    let mut fields = LeadFields::default();
    for field in LeadField::ALL {
        if let Some(value) = aliases(*field).iter().find_map(|alias| row.get(*alias)) {
            fields.set(*field, value.trim().to_string());
        }
    }
    if fields.proposal_number.is_empty() {
        return Err(RowRejection::MissingProposalNumber);
    }
    Ok(fields)
}

/// Header discovery, row mapping and normalization over loaded sheets.
pub fn extract_from_grids(sheets: &[SheetGrid]) -> Option<Extraction> {
    let location = locate_header(sheets)?;
    let grid = &sheets[location.sheet];
    if !location.detected {
        warn!(sheet = %grid.name, "no header marker found; using fallback sheet and first row");
    }

    let header_row = grid.first_row + location.row + 1;
    let (header, data) = match grid.rows.get(location.row) {
        Some(header) => (header.as_slice(), &grid.rows[location.row + 1..]),
        None => (&[][..], &[][..]),
    };

    let mut extraction = Extraction {
        sheet_name: grid.name.clone(),
        header_row,
        records: Vec::new(),
        skipped: Vec::new(),
    };
    for (index, row) in rows_to_maps(header, data) {
        let row_number = header_row + index + 1;
        match normalize_row(&row) {
            Ok(fields) => extraction.records.push(fields),
            Err(reason) => {
                warn!(sheet = %grid.name, row_number, %reason, "skipping row");
                extraction.skipped.push(SkippedRow { row_number, reason });
            }
        }
    }
    Some(extraction)
}

/// Cell as text. Date cells render as `YYYY-MM-DD` (with `HH:MM:SS` when
/// the time is not midnight) instead of their serial number.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::DateTime(value) if !value.is_duration() => match value.as_datetime() {
            Some(at) if at.num_seconds_from_midnight() == 0 => at.format(CELL_DATE_FORMAT).to_string(),
            Some(at) => at.format(CELL_DATETIME_FORMAT).to_string(),
            None => cell.to_string(),
        },
        Data::DateTimeIso(text) | Data::DurationIso(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Load every sheet of a workbook as cell text.
pub fn load_workbook(path: &Path) -> Result<Vec<SheetGrid>, WorkbookError> {
    let mut workbook = open_workbook_auto(path).map_err(|e| WorkbookError::Open {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let mut sheets = Vec::new();
    for name in workbook.sheet_names() {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| WorkbookError::Sheet {
                path: path.to_path_buf(),
                sheet: name.clone(),
                message: e.to_string(),
            })?;
        let first_row = range.start().map(|(row, _)| row as usize).unwrap_or(0);
        let rows = range
            .rows()
            .map(|row| row.iter().map(cell_text).collect())
            .collect();
        debug!(sheet = %name, first_row, "loaded sheet");
        sheets.push(SheetGrid {
            name,
            first_row,
            rows,
        });
    }
    Ok(sheets)
}

/// Parse a staged workbook into canonical records. Blocking.
pub fn extract_records(path: &Path) -> Result<Extraction, WorkbookError> {
    let sheets = load_workbook(path)?;
    let extraction =
        extract_from_grids(&sheets).ok_or_else(|| WorkbookError::NoSheets(path.to_path_buf()))?;
    info!(
        path = %path.display(),
        sheet = %extraction.sheet_name,
        header_row = extraction.header_row,
        records = extraction.records.len(),
        skipped = extraction.skipped.len(),
        "extracted workbook"
    );
    Ok(extraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::{ExcelDateTime, Format, Workbook};
    use tempfile::tempdir;

    fn row(cells: &[&str]) -> Vec<String> {
        cells.iter().map(|c| c.to_string()).collect()
    }

    fn raw(pairs: &[(&str, &str)]) -> RawRow {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn every_canonical_field_has_aliases() {
        for field in LeadField::ALL {
            assert!(!aliases(*field).is_empty(), "{} has no aliases", field.key());
        }
    }

    #[test]
    fn header_below_title_rows_is_found_on_a_later_sheet() {
        let sheets = vec![
            SheetGrid::new("Summary", vec![row(&["Total", "12"])]),
            SheetGrid::new(
                "Data",
                vec![
                    row(&["Daily MIS"]),
                    row(&[]),
                    row(&["PROPOSAL NUMBER", "POLICY STATUS"]),
                    row(&["P-1", "Issued"]),
                ],
            ),
        ];
        assert_eq!(
            locate_header(&sheets),
            Some(HeaderLocation {
                sheet: 1,
                row: 2,
                detected: true
            })
        );

        let extraction = extract_from_grids(&sheets).unwrap();
        assert_eq!(extraction.sheet_name, "Data");
        assert_eq!(extraction.header_row, 3);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.records[0].policy_status, "Issued");
    }

    #[test]
    fn marker_outside_scan_window_falls_back() {
        let mut rows = vec![row(&["filler"]); HEADER_SCAN_ROWS];
        rows.push(row(&["Proposal Number"]));
        let one_sheet = vec![SheetGrid::new("Only", rows.clone())];
        assert_eq!(
            locate_header(&one_sheet),
            Some(HeaderLocation {
                sheet: 0,
                row: 0,
                detected: false
            })
        );

        let two_sheets = vec![SheetGrid::new("A", rows.clone()), SheetGrid::new("B", rows)];
        assert_eq!(locate_header(&two_sheets).map(|l| l.sheet), Some(1));
        assert_eq!(locate_header(&[]), None);
    }

    #[test]
    fn row_mapping_trims_labels_and_drops_empty_rows() {
        let header = row(&[" PROPOSAL NUMBER ", "", "Channel", "Channel"]);
        let rows = vec![
            row(&["P-1", "ignored", "Agency", "Bank"]),
            row(&["", "only-in-blank-column", "", ""]),
            row(&["P-2"]),
        ];

        let mapped = rows_to_maps(&header, &rows);
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].0, 0);
        assert_eq!(
            mapped[0].1,
            raw(&[("PROPOSAL NUMBER", "P-1"), ("Channel", "Agency")])
        );
        assert_eq!(mapped[1].0, 2);
        assert_eq!(mapped[1].1["Channel"], "");
    }

    #[test]
    fn first_declared_alias_wins_and_values_are_trimmed() {
        let fields = normalize_row(&raw(&[
            ("ProposalNumber", " P-9 "),
            ("NetPremium", "100"),
            ("Net Premium", "200"),
        ]))
        .unwrap();
        assert_eq!(fields.proposal_number, "P-9");
        assert_eq!(fields.net_premium, "200");
        assert_eq!(fields.gross_premium, "");
    }

    #[test]
    fn declared_alias_order_beats_column_order() {
        let fields = normalize_row(&raw(&[
            ("Proposal Number", "title-case"),
            ("PROPOSAL NUMBER", "P-7"),
            ("Policy Status", "Pending"),
            ("POLICY STATUS", "Issued"),
        ]))
        .unwrap();
        assert_eq!(fields.proposal_number, "P-7");
        assert_eq!(fields.policy_status, "Issued");
    }

    #[test]
    fn missing_proposal_number_is_rejected() {
        assert_eq!(
            normalize_row(&raw(&[("PROPOSAL NUMBER", "  "), ("Channel", "Agency")])),
            Err(RowRejection::MissingProposalNumber)
        );
        assert_eq!(
            normalize_row(&raw(&[("Channel", "Agency")])),
            Err(RowRejection::MissingProposalNumber)
        );
    }

    #[test]
    fn skipped_rows_report_worksheet_row_numbers() {
        let sheets = vec![SheetGrid::new(
            "MIS",
            vec![
                row(&["PROPOSAL NUMBER", "Channel"]),
                row(&["P-1", "Agency"]),
                row(&["", "Bank"]),
                row(&["P-3", "Direct"]),
            ],
        )];
        let extraction = extract_from_grids(&sheets).unwrap();
        assert_eq!(extraction.records.len(), 2);
        assert_eq!(
            extraction.skipped,
            vec![SkippedRow {
                row_number: 3,
                reason: RowRejection::MissingProposalNumber
            }]
        );
    }

    #[test]
    fn reads_a_real_workbook() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("mis.xlsx");

        let mut workbook = Workbook::new();
        let cover = workbook.add_worksheet();
        cover.set_name("Cover").unwrap();
        cover.write_string(0, 0, "Partner MIS extract").unwrap();
        let data = workbook.add_worksheet();
        data.set_name("Proposals").unwrap();
        data.write_string(0, 0, "Report generated daily").unwrap();
        for (col, label) in ["PROPOSAL NUMBER", "PROPOSER NAME", "Net Premium"].iter().enumerate() {
            data.write_string(2, col as u16, *label).unwrap();
        }
        data.write_string(3, 0, "P-100").unwrap();
        data.write_string(3, 1, "Asha Rao").unwrap();
        data.write_number(3, 2, 1200).unwrap();
        data.write_string(4, 1, "No proposal here").unwrap();
        workbook.save(&path).unwrap();

        let extraction = extract_records(&path).unwrap();
        assert_eq!(extraction.sheet_name, "Proposals");
        assert_eq!(extraction.header_row, 3);
        assert_eq!(extraction.records.len(), 1);
        let record = &extraction.records[0];
        assert_eq!(record.proposal_number, "P-100");
        assert_eq!(record.proposer_name, "Asha Rao");
        assert_eq!(record.net_premium, "1200");
        assert_eq!(extraction.skipped[0].row_number, 5);
    }

    #[test]
    fn date_cells_keep_their_calendar_date() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("dates.xlsx");

        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        let date_format = Format::new().set_num_format("dd-mm-yyyy");
        sheet.write_string(0, 0, "PROPOSAL NUMBER").unwrap();
        sheet.write_string(0, 1, "CREATED DATE").unwrap();
        sheet.write_string(0, 2, "Latest Followup Date").unwrap();
        sheet.write_string(1, 0, "P-1").unwrap();
        let created = ExcelDateTime::from_ymd(2025, 10, 6).unwrap();
        sheet.write_datetime_with_format(1, 1, &created, &date_format).unwrap();
        let followup = ExcelDateTime::from_ymd(2025, 10, 7)
            .unwrap()
            .and_hms(14, 30, 0)
            .unwrap();
        sheet.write_datetime_with_format(1, 2, &followup, &date_format).unwrap();
        workbook.save(&path).unwrap();

        let extraction = extract_records(&path).unwrap();
        let record = &extraction.records[0];
        assert_eq!(record.created_date, "2025-10-06");
        assert_eq!(record.latest_followup_date, "2025-10-07 14:30:00");
    }

    #[test]
    fn header_marker_is_found_in_any_column() {
        let sheets = vec![SheetGrid::new(
            "MIS",
            vec![
                row(&["Daily extract"]),
                row(&["Branch Code", "Channel", "Proposal Number"]),
                row(&["B-9", "Agency", "P-5"]),
            ],
        )];
        let extraction = extract_from_grids(&sheets).unwrap();
        assert_eq!(extraction.header_row, 2);
        assert_eq!(extraction.records.len(), 1);
        assert_eq!(extraction.records[0].proposal_number, "P-5");
        assert_eq!(extraction.records[0].branch_code, "B-9");
    }

    #[test]
    fn unreadable_file_is_a_workbook_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.xlsx");
        std::fs::write(&path, b"not a zip archive").unwrap();
        assert!(matches!(
            extract_records(&path),
            Err(WorkbookError::Open { .. })
        ));
    }
}
